use async_trait::async_trait;
use meshcore::{
    Action, ActionContext, ActionMetadata, ActionOutput, ConfigField, OutputMap, Step, StepError, ValidationError,
};
use serde_json::Value;
use tracing::info;

/// Invokes another registered flow in an isolated scope.
///
/// `inputs` become the sub-flow's variables on top of its own `env`. The
/// sub-flow's declared `outputs` become this step's output.
pub struct RunFlowAction;

fn target(step: &Step) -> Option<&str> {
    step.config.get("flow").and_then(Value::as_str)
}

#[async_trait]
impl Action for RunFlowAction {
    fn action_type(&self) -> &str {
        "run_flow"
    }

    fn observes_cancellation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, StepError> {
        let name = ctx.require_str("flow")?.to_string();
        let inputs = match ctx.get("inputs") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(StepError::Configuration("inputs must be a map".to_string())),
            None => OutputMap::new(),
        };

        info!(step_id = %ctx.step.id, flow = %name, inputs = inputs.len(), "Invoking sub-flow");
        let outcome = ctx.runner.run_flow(&name, inputs, ctx.vars, &ctx.cancellation).await?;
        ctx.children.extend(outcome.block.records.iter().cloned());

        if let Some(err) = outcome.block.error() {
            return Err(err);
        }
        Ok(outcome.outputs.into())
    }

    fn validate(&self, step: &Step) -> Result<(), ValidationError> {
        match target(step) {
            Some(name) if !name.trim().is_empty() && !name.contains('$') => Ok(()),
            _ => Err(ValidationError::step(&step.id, "run_flow needs a literal flow name")),
        }
    }

    fn subflow<'s>(&self, step: &'s Step) -> Option<&'s str> {
        target(step)
    }

    fn metadata(&self) -> ActionMetadata {
        ActionMetadata {
            description: "Run another flow".to_string(),
            category: "control".to_string(),
            config: vec![
                ConfigField::required("flow", "Name of a registered flow"),
                ConfigField::optional("inputs", "Variables passed to the sub-flow"),
            ],
        }
    }
}
