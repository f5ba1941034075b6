use async_trait::async_trait;
use meshcore::{
    canonicalize, Action, ActionContext, ActionMetadata, ActionOutput, ConfigField, OutputMap, Step, StepError,
    ValidationError,
};
use serde_json::Value;
use tracing::debug;

/// Builds a new flat map from `transforms{name: rule}` applied to `input`.
///
/// String rules that look like references are resolved against the input
/// (`$field`, `$.path`) or the execution context (`${...}`). Everything else
/// is copied through as a literal.
pub struct TransformAction;

/// Canonical input for data-shaping actions: the `key` config entry, or the
/// most recent step output when absent.
pub(crate) fn input_map(ctx: &ActionContext<'_>, key: &str) -> OutputMap {
    match ctx.get(key) {
        Some(value) => canonicalize(value),
        None => ctx.vars.last_output().cloned().unwrap_or_default(),
    }
}

fn is_rule(text: &str) -> bool {
    text.starts_with('$') || text.contains("${") || text.contains("{{")
}

#[async_trait]
impl Action for TransformAction {
    fn action_type(&self) -> &str {
        "transform"
    }

    fn raw_config_keys(&self) -> &[&str] {
        &["transforms"]
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, StepError> {
        let input = input_map(ctx, "input");
        let Some(Value::Object(transforms)) = ctx.get("transforms") else {
            return Err(StepError::Configuration("transforms is required and must be a map".to_string()));
        };

        let mut result = OutputMap::new();
        for (name, rule) in transforms {
            let value = match rule {
                Value::String(text) if is_rule(text) => ctx.vars.interpolate_str(text, Some(&input))?,
                literal => literal.clone(),
            };
            result.insert(name.clone(), value);
        }

        debug!(step_id = %ctx.step.id, fields = result.len(), "Data transformed");
        Ok(result.into())
    }

    fn validate(&self, step: &Step) -> Result<(), ValidationError> {
        match step.config.get("transforms") {
            Some(Value::Object(_)) => Ok(()),
            _ => Err(ValidationError::step(&step.id, "transforms is required and must be a map")),
        }
    }

    fn metadata(&self) -> ActionMetadata {
        ActionMetadata {
            description: "Reshape data with extraction rules".to_string(),
            category: "transform".to_string(),
            config: vec![
                ConfigField::optional("input", "Map, record or JSON string; defaults to the last output"),
                ConfigField::required("transforms", "Output field name to extraction rule or literal"),
            ],
        }
    }
}
