use async_trait::async_trait;
use meshcore::assertions::Expression;
use meshcore::{Action, ActionContext, ActionMetadata, ActionOutput, ConfigField, Step, StepError, ValidationError};
use tracing::info;

/// Evaluates one expression and runs either `then` or `else`, never both.
///
/// The expression sees the flow variables, the last step output's fields and
/// every earlier step's output under its id.
pub struct ConditionAction;

#[async_trait]
impl Action for ConditionAction {
    fn action_type(&self) -> &str {
        "condition"
    }

    fn raw_config_keys(&self) -> &[&str] {
        &["condition"]
    }

    fn observes_cancellation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, StepError> {
        let written = ctx.require_str("condition")?.to_string();
        let source = ctx.vars.interpolate_text(&written, None)?;
        let expression = Expression::parse(&source)
            .map_err(|e| StepError::Configuration(format!("invalid condition '{}': {}", written, e)))?;
        let result = expression
            .test(&ctx.vars.snapshot())
            .map_err(|e| ctx.action_error(format!("failed to evaluate '{}': {}", written, e)))?;

        let step = ctx.step;
        let (label, branch) = if result {
            ("then", &step.then)
        } else {
            ("else", &step.otherwise)
        };
        info!(step_id = %step.id, condition = %written, result, branch = label, "Condition evaluated");

        let outcome = ctx.runner.run_steps(branch, ctx.vars, &ctx.cancellation).await;
        ctx.children.extend(outcome.records.iter().cloned());
        if let Some(err) = outcome.error() {
            return Err(err);
        }

        Ok(ActionOutput::new()
            .with_output("condition", written)
            .with_output("result", result)
            .with_output("branch", label))
    }

    fn validate(&self, step: &Step) -> Result<(), ValidationError> {
        let Some(source) = step.config.get("condition").and_then(|v| v.as_str()) else {
            return Err(ValidationError::step(&step.id, "condition must be a string expression"));
        };
        if !source.contains("${") && !source.contains("{{") {
            Expression::parse(source).map_err(|e| ValidationError::step(&step.id, e))?;
        }
        if step.then.is_empty() && step.otherwise.is_empty() {
            return Err(ValidationError::step(&step.id, "condition needs a then or else block"));
        }
        Ok(())
    }

    fn metadata(&self) -> ActionMetadata {
        ActionMetadata {
            description: "Branch on a boolean expression".to_string(),
            category: "control".to_string(),
            config: vec![ConfigField::required("condition", "Expression deciding between then and else")],
        }
    }
}
