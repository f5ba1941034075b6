use crate::database::{params, DatabaseClient};
use crate::wait_for::duration_or;
use async_trait::async_trait;
use meshcore::value::display;
use meshcore::{Action, ActionContext, ActionMetadata, ActionOutput, ConfigField, OutputMap, Step, StepError, ValidationError};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_ATTEMPTS: u64 = 100;

/// What the rows returned by one poll must satisfy.
#[derive(Debug, Clone, PartialEq)]
enum PollCondition {
    RowExists,
    RowCount(usize),
    ValueEquals { column: String, value: Value },
    ValueNotNull { column: String },
}

impl PollCondition {
    fn from_config(value: Option<&Value>) -> Result<Self, String> {
        let Some(value) = value else {
            return Ok(PollCondition::RowExists);
        };
        let Value::Object(map) = value else {
            return Err("condition must be a mapping".to_string());
        };
        let column = || {
            map.get("column")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| "condition needs a column".to_string())
        };
        match map.get("type").and_then(Value::as_str).unwrap_or("row_exists") {
            "row_exists" => Ok(PollCondition::RowExists),
            "row_count" => {
                let min = map.get("min_count").and_then(Value::as_u64).unwrap_or(1).max(1);
                Ok(PollCondition::RowCount(min as usize))
            }
            "value_equals" => Ok(PollCondition::ValueEquals {
                column: column()?,
                value: map.get("value").cloned().unwrap_or(Value::Null),
            }),
            "value_not_null" => Ok(PollCondition::ValueNotNull { column: column()? }),
            other => Err(format!("unsupported condition type: {}", other)),
        }
    }

    fn holds(&self, rows: &[OutputMap]) -> bool {
        match self {
            PollCondition::RowExists => !rows.is_empty(),
            PollCondition::RowCount(min) => rows.len() >= *min,
            PollCondition::ValueEquals { column, value } => rows
                .iter()
                .filter_map(|row| row.get(column))
                .any(|found| display(found) == display(value)),
            PollCondition::ValueNotNull { column } => {
                rows.iter().filter_map(|row| row.get(column)).any(|found| !found.is_null())
            }
        }
    }
}

/// Re-runs a query through a [`DatabaseClient`] until its rows satisfy a
/// condition. A failing query ends the poll at once.
pub struct DbPollAction {
    client: Arc<dyn DatabaseClient>,
}

impl DbPollAction {
    pub fn new(client: Arc<dyn DatabaseClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Action for DbPollAction {
    fn action_type(&self) -> &str {
        "db_poll"
    }

    fn observes_cancellation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, StepError> {
        let ctx: &ActionContext<'_> = ctx;
        let query = ctx.require_str("query")?;
        let params = params(ctx.get("params"))?;
        let condition = PollCondition::from_config(ctx.get("condition")).map_err(StepError::Configuration)?;
        let timeout = duration_or(ctx, "timeout", DEFAULT_TIMEOUT)?;
        let interval = duration_or(ctx, "interval", DEFAULT_INTERVAL)?;
        let max_attempts = ctx.get_u64("max_attempts")?.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1);

        info!(step_id = %ctx.step.id, ?condition, ?timeout, ?interval, "Starting db_poll");
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;

        let mut attempts = 0;
        let mut timed_out = false;
        while attempts < max_attempts {
            attempts += 1;
            let result = tokio::select! {
                result = self.client.query(query, &params) => {
                    result.map_err(|e| ctx.action_error(format!("query failed: {}", e)))?
                }
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
                _ = ctx.cancellation.cancelled() => return Err(StepError::Cancelled),
            };

            if condition.holds(&result.rows) {
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(step_id = %ctx.step.id, attempts, row_count = result.rows.len(), duration_ms, "db_poll condition satisfied");
                let first_row = result.rows.first().cloned().map(Value::Object);
                let row_count = result.rows.len();
                let rows: Vec<Value> = result.rows.into_iter().map(Value::Object).collect();
                let mut output = ActionOutput::new()
                    .with_output("success", true)
                    .with_output("attempts", attempts)
                    .with_output("duration_ms", duration_ms)
                    .with_output("row_count", row_count)
                    .with_output("rows", Value::Array(rows));
                if let Some(first_row) = first_row {
                    output = output.with_output("first_row", first_row);
                }
                return Ok(output);
            }
            debug!(step_id = %ctx.step.id, attempts, row_count = result.rows.len(), "Condition not met yet");

            if attempts >= max_attempts {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
                _ = ctx.cancellation.cancelled() => return Err(StepError::Cancelled),
            }
        }

        let reason = if timed_out {
            format!("timeout after {:?} waiting for condition", timeout)
        } else {
            "max attempts reached".to_string()
        };
        Err(ctx.action_error(format!(
            "db_poll condition not satisfied after {} attempts: {}",
            attempts, reason
        )))
    }

    fn validate(&self, step: &Step) -> Result<(), ValidationError> {
        match step.config.get("query").and_then(Value::as_str) {
            Some(query) if !query.trim().is_empty() => {}
            _ => return Err(ValidationError::step(&step.id, "db_poll needs a query")),
        }
        PollCondition::from_config(step.config.get("condition"))
            .map(|_| ())
            .map_err(|e| ValidationError::step(&step.id, e))
    }

    fn metadata(&self) -> ActionMetadata {
        ActionMetadata {
            description: "Poll a query until its rows satisfy a condition".to_string(),
            category: "database".to_string(),
            config: vec![
                ConfigField::required("query", "SQL statement"),
                ConfigField::optional("params", "Positional parameters"),
                ConfigField::optional(
                    "condition",
                    "type: row_exists (default), row_count (min_count), value_equals (column, value) or value_not_null (column)",
                ),
                ConfigField::optional("timeout", "Overall limit, default 60s"),
                ConfigField::optional("interval", "Pause between attempts, default 1s"),
                ConfigField::optional("max_attempts", "Attempt limit, default 100"),
            ],
        }
    }
}
