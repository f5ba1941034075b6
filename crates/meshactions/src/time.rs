use async_trait::async_trait;
use meshcore::{
    parse_duration, Action, ActionContext, ActionMetadata, ActionOutput, ConfigField, Step, StepError,
    ValidationError,
};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

/// Sleep for `duration`, waking early if the step is cancelled
pub struct DelayAction;

fn read_duration(value: Option<&Value>) -> Result<Duration, String> {
    match value {
        Some(Value::String(text)) => parse_duration(text).map_err(|e| e.to_string()),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Duration::from_millis)
            .ok_or_else(|| "duration_ms must be a positive integer".to_string()),
        Some(_) => Err("duration must be a string like \"500ms\"".to_string()),
        None => Err("duration is required".to_string()),
    }
}

impl DelayAction {
    fn duration(config: &meshcore::OutputMap) -> Result<Duration, String> {
        read_duration(config.get("duration").or_else(|| config.get("duration_ms")))
    }
}

#[async_trait]
impl Action for DelayAction {
    fn action_type(&self) -> &str {
        "delay"
    }

    fn observes_cancellation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, StepError> {
        let duration = Self::duration(&ctx.config).map_err(StepError::Configuration)?;

        info!(step_id = %ctx.step.id, duration_ms = duration.as_millis() as u64, "Delaying");

        tokio::select! {
            _ = sleep(duration) => {}
            _ = ctx.cancellation.cancelled() => return Err(StepError::Cancelled),
        }

        Ok(ActionOutput::new()
            .with_output("duration_ms", duration.as_millis() as u64)
            .with_output("completed", true))
    }

    fn validate(&self, step: &Step) -> Result<(), ValidationError> {
        let literal = match step.config.get("duration") {
            Some(Value::String(text)) => !text.contains('$'),
            _ => true,
        };
        if literal {
            Self::duration(&step.config).map_err(|e| ValidationError::step(&step.id, e))?;
        }
        Ok(())
    }

    fn metadata(&self) -> ActionMetadata {
        ActionMetadata {
            description: "Pause for a duration".to_string(),
            category: "time".to_string(),
            config: vec![
                ConfigField::required("duration", "How long to wait, e.g. 500ms or 2s"),
                ConfigField::optional("duration_ms", "Alternative to duration, in milliseconds"),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_string_and_millisecond_forms() {
        assert_eq!(read_duration(Some(&json!("2s"))), Ok(Duration::from_secs(2)));
        assert_eq!(read_duration(Some(&json!(250))), Ok(Duration::from_millis(250)));
        assert!(read_duration(Some(&json!(true))).is_err());
        assert!(read_duration(None).is_err());
    }
}
