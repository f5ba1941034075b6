use crate::transform::input_map;
use async_trait::async_trait;
use meshcore::assertions::check_resolved;
use meshcore::{Action, ActionContext, ActionMetadata, ActionOutput, ConfigField, Step, StepError, ValidationError};
use serde_json::Value;
use tracing::{debug, info};

/// Standalone assertions over `data`
pub struct AssertAction;

fn expressions(value: Option<&Value>) -> Result<Vec<&str>, String> {
    let Some(Value::Array(items)) = value else {
        return Err("assertions must be a list of strings".to_string());
    };
    let list = items
        .iter()
        .map(|item| item.as_str().ok_or_else(|| "assertions must be a list of strings".to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    if list.is_empty() {
        return Err("at least one assertion is required".to_string());
    }
    Ok(list)
}

#[async_trait]
impl Action for AssertAction {
    fn action_type(&self) -> &str {
        "assert"
    }

    fn raw_config_keys(&self) -> &[&str] {
        &["assertions"]
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, StepError> {
        let data = input_map(ctx, "data");
        let list = expressions(ctx.get("assertions")).map_err(StepError::Configuration)?;
        debug!(step_id = %ctx.step.id, fields = data.len(), "Evaluating assertions");

        let resolved = list
            .iter()
            .map(|expr| Ok((*expr, ctx.vars.interpolate_text(expr, Some(&data))?)))
            .collect::<Result<Vec<_>, StepError>>()?;
        check_resolved(&resolved, &data)?;

        info!(step_id = %ctx.step.id, count = resolved.len(), "All assertions passed");
        Ok(ActionOutput::new()
            .with_output("assertions_count", resolved.len())
            .with_output("passed", true)
            .with_output("data", Value::Object(data)))
    }

    fn validate(&self, step: &Step) -> Result<(), ValidationError> {
        expressions(step.config.get("assertions"))
            .map(|_| ())
            .map_err(|e| ValidationError::step(&step.id, e))
    }

    fn metadata(&self) -> ActionMetadata {
        ActionMetadata {
            description: "Check boolean expressions against data".to_string(),
            category: "assert".to_string(),
            config: vec![
                ConfigField::optional("data", "Map, record or JSON string; defaults to the last output"),
                ConfigField::required("assertions", "Expressions that must all hold"),
            ],
        }
    }
}
