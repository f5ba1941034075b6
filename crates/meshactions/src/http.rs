use crate::cancellable;
use async_trait::async_trait;
use meshcore::value::display;
use meshcore::{
    parse_duration, Action, ActionContext, ActionMetadata, ActionOutput, ConfigField, OutputMap, StepError,
};
use reqwest::Method;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP request action
pub struct HttpRequestAction {
    client: reqwest::Client,
}

impl HttpRequestAction {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpRequestAction {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a request from the common `method`/`url`/`headers`/`query`/`body`
/// config keys.
pub(crate) fn build_request(
    client: &reqwest::Client,
    ctx: &ActionContext<'_>,
    default_method: &str,
) -> Result<reqwest::RequestBuilder, StepError> {
    let method_name = ctx.get_str_or("method", default_method).to_uppercase();
    let method = Method::from_bytes(method_name.as_bytes())
        .map_err(|_| StepError::Configuration(format!("Unsupported method: {}", method_name)))?;
    let url = ctx.require_str("url")?;

    let mut request = client.request(method, url);

    if let Some(headers) = ctx.get("headers") {
        let Value::Object(headers) = headers else {
            return Err(StepError::Configuration("Config 'headers' must be a map".to_string()));
        };
        for (name, value) in headers {
            request = request.header(name.as_str(), display(value));
        }
    }

    if let Some(query) = ctx.get("query") {
        let Value::Object(query) = query else {
            return Err(StepError::Configuration("Config 'query' must be a map".to_string()));
        };
        let pairs: Vec<(String, String)> = query.iter().map(|(k, v)| (k.clone(), display(v))).collect();
        request = request.query(&pairs);
    }

    request = match ctx.get("body") {
        Some(Value::String(text)) => request.body(text.clone()),
        Some(json) => request.json(json),
        None => request,
    };

    let timeout = match ctx.get_str("timeout") {
        Some(text) => parse_duration(text).map_err(|e| StepError::Configuration(e.to_string()))?,
        None => DEFAULT_TIMEOUT,
    };
    Ok(request.timeout(timeout))
}

/// Response fields shared by `http_request` and `wait_for`.
pub(crate) async fn read_response(response: reqwest::Response) -> Result<OutputMap, reqwest::Error> {
    let status = response.status().as_u16();
    let mut headers = OutputMap::new();
    for (name, value) in response.headers() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match headers.get_mut(name.as_str()) {
            Some(Value::String(existing)) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            _ => {
                headers.insert(name.as_str().to_string(), Value::String(value));
            }
        }
    }
    let content_type = headers
        .get("content-type")
        .cloned()
        .unwrap_or_else(|| Value::String(String::new()));

    let text = response.text().await?;
    let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

    let mut output = OutputMap::new();
    output.insert("status".to_string(), status.into());
    output.insert("body".to_string(), body);
    output.insert("headers".to_string(), Value::Object(headers));
    output.insert("content_type".to_string(), content_type);
    Ok(output)
}

#[async_trait]
impl Action for HttpRequestAction {
    fn action_type(&self) -> &str {
        "http_request"
    }

    fn observes_cancellation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, StepError> {
        let request = build_request(&self.client, ctx, "GET")?;
        let method = ctx.get_str_or("method", "GET").to_uppercase();
        let url = ctx.require_str("url")?.to_string();

        info!(step_id = %ctx.step.id, method = %method, url = %url, "Executing HTTP request");
        let started = Instant::now();

        let response = cancellable(&ctx.cancellation, request.send())
            .await?
            .map_err(|e| ctx.action_error(format!("request failed: {}", e)))?;
        let mut output = cancellable(&ctx.cancellation, read_response(response))
            .await?
            .map_err(|e| ctx.action_error(format!("failed to read response: {}", e)))?;

        let duration_ms = started.elapsed().as_millis() as u64;
        output.insert("duration_ms".to_string(), duration_ms.into());

        debug!(
            step_id = %ctx.step.id,
            status = ?output.get("status"),
            duration_ms,
            "HTTP request completed"
        );
        Ok(output.into())
    }

    fn metadata(&self) -> ActionMetadata {
        ActionMetadata {
            description: "Make HTTP requests".to_string(),
            category: "http".to_string(),
            config: vec![
                ConfigField::required("url", "Target URL"),
                ConfigField::optional("method", "HTTP method, default GET"),
                ConfigField::optional("headers", "Request headers"),
                ConfigField::optional("query", "Query string parameters"),
                ConfigField::optional("body", "JSON value or raw string body"),
                ConfigField::optional("timeout", "Request timeout, default 30s"),
            ],
        }
    }
}
