use crate::http::{build_request, read_response};
use async_trait::async_trait;
use meshcore::value::{display, get_path};
use meshcore::{
    parse_duration, Action, ActionContext, ActionMetadata, ActionOutput, ConfigField, OutputMap, Step, StepError,
    ValidationError,
};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_ATTEMPTS: u64 = 100;

/// Polls until an HTTP endpoint (or TCP port) looks ready
pub struct WaitForAction {
    client: reqwest::Client,
}

impl WaitForAction {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WaitForAction {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a single probe. `Err` carries the reason it is not ready yet.
type Probe = Result<OutputMap, (String, OutputMap)>;

impl WaitForAction {
    async fn probe_http(&self, ctx: &ActionContext<'_>) -> Result<Probe, StepError> {
        let request = build_request(&self.client, ctx, "GET")?;
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Ok(Err((format!("request failed: {}", e), OutputMap::new()))),
        };
        let seen = match read_response(response).await {
            Ok(seen) => seen,
            Err(e) => return Ok(Err((format!("failed to read response: {}", e), OutputMap::new()))),
        };

        let expected_status = ctx.get_u64("status_code")?.unwrap_or(200);
        let status = seen.get("status").and_then(Value::as_u64).unwrap_or_default();
        if status != expected_status {
            return Ok(Err((format!("status {} != {}", status, expected_status), seen)));
        }

        if let Some(needle) = ctx.get_str("body_contains") {
            let body = seen.get("body").map(|b| match b {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            });
            if !body.unwrap_or_default().contains(needle) {
                return Ok(Err((format!("body does not contain '{}'", needle), seen)));
            }
        }

        if let (Some(path), Some(expected)) = (ctx.get_str("json_path"), ctx.get("json_value")) {
            let actual = match seen.get("body") {
                Some(Value::Object(body)) => get_path(body, path.trim_start_matches("$.")).cloned(),
                _ => None,
            };
            if actual.as_ref().map(display) != Some(display(expected)) {
                return Ok(Err((format!("{} did not match", path), seen)));
            }
        }

        Ok(Ok(seen))
    }

    async fn probe_tcp(&self, ctx: &ActionContext<'_>) -> Result<Probe, StepError> {
        let host = ctx.require_str("host")?;
        let port = ctx
            .get_u64("port")?
            .ok_or_else(|| StepError::Configuration("Missing config: port".to_string()))?;
        let address = format!("{}:{}", host, port);
        let mut seen = OutputMap::new();
        seen.insert("address".to_string(), json!(address));

        Ok(match TcpStream::connect(&address).await {
            Ok(_) => {
                seen.insert("connected".to_string(), json!(true));
                Ok(seen)
            }
            Err(e) => Err((format!("connect failed: {}", e), seen)),
        })
    }
}

pub(crate) fn duration_or(ctx: &ActionContext<'_>, key: &str, default: Duration) -> Result<Duration, StepError> {
    match ctx.get_str(key) {
        Some(text) => parse_duration(text).map_err(|e| StepError::Configuration(e.to_string())),
        None => Ok(default),
    }
}

#[async_trait]
impl Action for WaitForAction {
    fn action_type(&self) -> &str {
        "wait_for"
    }

    fn observes_cancellation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, StepError> {
        let ctx: &ActionContext<'_> = ctx;
        let kind = ctx.get_str_or("type", "http").to_string();
        let timeout = duration_or(ctx, "timeout", DEFAULT_TIMEOUT)?;
        let interval = duration_or(ctx, "interval", DEFAULT_INTERVAL)?;
        let max_attempts = ctx.get_u64("max_attempts")?.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1);

        info!(step_id = %ctx.step.id, kind = %kind, ?timeout, ?interval, "Starting wait_for");
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;

        let mut attempts = 0;
        let mut last = (String::from("no attempt made"), OutputMap::new());
        while attempts < max_attempts {
            attempts += 1;
            let probe = async {
                match kind.as_str() {
                    "http" => self.probe_http(ctx).await,
                    "tcp" => self.probe_tcp(ctx).await,
                    other => Err(StepError::Configuration(format!("unsupported wait type: {}", other))),
                }
            };

            let result = tokio::select! {
                result = probe => result?,
                _ = tokio::time::sleep_until(deadline) => break,
                _ = ctx.cancellation.cancelled() => return Err(StepError::Cancelled),
            };

            match result {
                Ok(seen) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    info!(step_id = %ctx.step.id, attempts, duration_ms, "wait_for condition satisfied");
                    return Ok(ActionOutput::new()
                        .with_output("success", true)
                        .with_output("attempts", attempts)
                        .with_output("duration_ms", duration_ms)
                        .with_output("last_result", Value::Object(seen)));
                }
                Err((reason, seen)) => {
                    debug!(step_id = %ctx.step.id, attempts, reason = %reason, "Not ready yet");
                    last = (reason, seen);
                }
            }

            if attempts >= max_attempts {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = tokio::time::sleep_until(deadline) => break,
                _ = ctx.cancellation.cancelled() => return Err(StepError::Cancelled),
            }
        }

        let reason = if tokio::time::Instant::now() >= deadline {
            format!("timed out after {:?}, last: {}", timeout, last.0)
        } else {
            last.0
        };
        Err(ctx.action_error(format!("wait_for failed after {} attempts: {}", attempts, reason)))
    }

    fn validate(&self, step: &Step) -> Result<(), ValidationError> {
        match step.config.get("type").and_then(Value::as_str).unwrap_or("http") {
            "http" if step.config.contains_key("url") => Ok(()),
            "http" => Err(ValidationError::step(&step.id, "wait_for needs a url")),
            "tcp" if step.config.contains_key("host") && step.config.contains_key("port") => Ok(()),
            "tcp" => Err(ValidationError::step(&step.id, "wait_for tcp needs host and port")),
            other => Err(ValidationError::step(&step.id, format!("unsupported wait type: {}", other))),
        }
    }

    fn metadata(&self) -> ActionMetadata {
        ActionMetadata {
            description: "Poll until an endpoint is ready".to_string(),
            category: "time".to_string(),
            config: vec![
                ConfigField::optional("type", "http (default) or tcp"),
                ConfigField::optional("url", "Endpoint to poll"),
                ConfigField::optional("status_code", "Expected status, default 200"),
                ConfigField::optional("body_contains", "Text the body must contain"),
                ConfigField::optional("json_path", "Body field to compare with json_value"),
                ConfigField::optional("json_value", "Expected value at json_path"),
                ConfigField::optional("host", "TCP host"),
                ConfigField::optional("port", "TCP port"),
                ConfigField::optional("timeout", "Overall limit, default 60s"),
                ConfigField::optional("interval", "Pause between attempts, default 1s"),
                ConfigField::optional("max_attempts", "Attempt limit, default 100"),
            ],
        }
    }
}
