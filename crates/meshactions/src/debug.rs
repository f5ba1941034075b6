use async_trait::async_trait;
use meshcore::value::display;
use meshcore::{Action, ActionContext, ActionMetadata, ActionOutput, ConfigField, Step, StepError, ValidationError};

const LEVELS: &[&str] = &["debug", "info", "warn", "error"];

/// Writes a message through `tracing` at the configured level
pub struct LogAction;

#[async_trait]
impl Action for LogAction {
    fn action_type(&self) -> &str {
        "log"
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, StepError> {
        let message = display(ctx.require("message")?);
        let level = ctx.get_str_or("level", "info").to_lowercase();
        let step_id = ctx.step.id.as_str();

        match level.as_str() {
            "debug" => tracing::debug!(step_id, "{}", message),
            "warn" => tracing::warn!(step_id, "{}", message),
            "error" => tracing::error!(step_id, "{}", message),
            _ => tracing::info!(step_id, "{}", message),
        }

        Ok(ActionOutput::new()
            .with_output("message", message)
            .with_output("level", level))
    }

    fn validate(&self, step: &Step) -> Result<(), ValidationError> {
        if !step.config.contains_key("message") {
            return Err(ValidationError::step(&step.id, "log needs a message"));
        }
        match step.config.get("level").and_then(|v| v.as_str()) {
            Some(level) if !level.contains('$') && !LEVELS.contains(&level.to_lowercase().as_str()) => Err(
                ValidationError::step(&step.id, format!("unknown log level '{}'", level)),
            ),
            _ => Ok(()),
        }
    }

    fn metadata(&self) -> ActionMetadata {
        ActionMetadata {
            description: "Log a message".to_string(),
            category: "debug".to_string(),
            config: vec![
                ConfigField::required("message", "Text to log"),
                ConfigField::optional("level", "debug, info, warn or error"),
            ],
        }
    }
}
