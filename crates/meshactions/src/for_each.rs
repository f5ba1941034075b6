use async_trait::async_trait;
use meshcore::{
    Action, ActionContext, ActionMetadata, ActionOutput, BlockFailure, ConfigField, FailurePolicy, Step, StepError,
    ValidationError,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Runs the `steps` block once per item, in order, with the item and its
/// index bound as variables.
pub struct ForEachAction;

fn items(value: &Value) -> Result<Vec<Value>, StepError> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(items)) => Ok(items),
            _ => Err(StepError::Configuration(
                "items must resolve to a list".to_string(),
            )),
        },
        _ => Err(StepError::Configuration("items must resolve to a list".to_string())),
    }
}

#[async_trait]
impl Action for ForEachAction {
    fn action_type(&self) -> &str {
        "for_each"
    }

    fn observes_cancellation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, StepError> {
        let items = items(ctx.require("items")?)?;
        let item_name = ctx.get_str_or("item_name", "item").to_string();
        let index_name = ctx.get_str_or("index_name", "index").to_string();
        let policy = FailurePolicy::from_config(&ctx.config)?;
        let step = ctx.step;

        info!(step_id = %step.id, items = items.len(), item_name = %item_name, "Starting for_each loop");

        let previous_item = ctx.vars.variable(&item_name).cloned();
        let previous_index = ctx.vars.variable(&index_name).cloned();

        let mut results = Vec::with_capacity(items.len());
        let mut failures: Vec<BlockFailure> = Vec::new();
        let mut cancelled = false;

        for (index, item) in items.iter().enumerate() {
            if ctx.cancellation.is_cancelled() {
                cancelled = true;
                break;
            }
            debug!(step_id = %step.id, index, "Processing item");
            ctx.vars.set_variable(item_name.as_str(), item.clone());
            ctx.vars.set_variable(index_name.as_str(), json!(index));

            let outcome = ctx.runner.run_steps(&step.steps, ctx.vars, &ctx.cancellation).await;
            ctx.children.extend(outcome.records.iter().cloned().map(|mut record| {
                record.iteration = Some(index);
                record
            }));

            results.push(json!({
                "index": index,
                "item": item,
                "success": outcome.is_success(),
                "error": outcome.failure.as_ref().map(|f| f.message.clone()),
            }));

            if outcome.cancelled {
                cancelled = true;
                break;
            }
            if let Some(failure) = outcome.failure {
                warn!(step_id = %step.id, index, failed_step = %failure.step_id, "Iteration failed");
                failures.push(failure);
                if policy == FailurePolicy::Abort {
                    break;
                }
            }
        }

        ctx.vars.restore_variable(&item_name, previous_item);
        ctx.vars.restore_variable(&index_name, previous_index);

        if let Some(first) = failures.first() {
            return Err(StepError::ChildFailed {
                step_id: first.step_id.clone(),
                message: format!(
                    "{} of {} iterations failed, first: {}",
                    failures.len(),
                    items.len(),
                    first.message
                ),
            });
        }
        if cancelled {
            return Err(StepError::Cancelled);
        }

        info!(step_id = %step.id, processed = results.len(), "Completed for_each loop");
        Ok(ActionOutput::new()
            .with_output("items_processed", results.len())
            .with_output("results", Value::Array(results)))
    }

    fn validate(&self, step: &Step) -> Result<(), ValidationError> {
        if !step.config.contains_key("items") {
            return Err(ValidationError::step(&step.id, "for_each needs items"));
        }
        if step.steps.is_empty() {
            return Err(ValidationError::step(&step.id, "for_each needs a steps block"));
        }
        FailurePolicy::from_config(&step.config).map_err(|e| ValidationError::step(&step.id, e.to_string()))?;
        Ok(())
    }

    fn metadata(&self) -> ActionMetadata {
        ActionMetadata {
            description: "Run a block once per item".to_string(),
            category: "control".to_string(),
            config: vec![
                ConfigField::required("items", "List or reference to a list"),
                ConfigField::optional("item_name", "Variable bound to the current item, default item"),
                ConfigField::optional("index_name", "Variable bound to the current index, default index"),
                ConfigField::optional("failure_policy", "aggregate (default) or abort"),
            ],
        }
    }
}
