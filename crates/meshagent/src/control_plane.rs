use crate::error::{AgentError, Result};
use crate::job::{AgentInfo, HeartbeatPayload, Job, JobReport};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

/// The agent's view of the control plane.
///
/// The agent is always the client: it pulls jobs and pushes results,
/// registration and liveness.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Next queued job for this agent, `None` when the queue is empty
    async fn fetch_next_job(&self, agent_id: &str) -> Result<Option<Job>>;

    async fn report_result(&self, agent_id: &str, report: &JobReport) -> Result<()>;

    async fn register(&self, info: &AgentInfo) -> Result<()>;

    async fn heartbeat(&self, agent_id: &str, payload: &HeartbeatPayload) -> Result<()>;

    async fn deregister(&self, agent_id: &str) -> Result<()>;
}

/// REST client for the control plane's `/api/v1/agents` endpoints
pub struct HttpControlPlane {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self::with_client(client, base_url, token))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let request = self.client.post(format!("{}/api/v1/agents{}", self.base_url, path));
        if self.token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.token)
        }
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(AgentError::ControlPlane {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn fetch_next_job(&self, agent_id: &str) -> Result<Option<Job>> {
        let response = self.post(&format!("/{}/jobs/next", agent_id)).send().await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let job: Job = ensure_success(response).await?.json().await?;
        debug!(job_id = %job.id, "Fetched job");
        Ok(Some(job))
    }

    async fn report_result(&self, agent_id: &str, report: &JobReport) -> Result<()> {
        let response = self
            .post(&format!("/{}/jobs/{}/result", agent_id, report.job_id))
            .header("Idempotency-Key", &report.idempotency_key)
            .json(report)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn register(&self, info: &AgentInfo) -> Result<()> {
        let response = self.post("/register").json(info).send().await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn heartbeat(&self, agent_id: &str, payload: &HeartbeatPayload) -> Result<()> {
        let response = self.post(&format!("/{}/heartbeat", agent_id)).json(payload).send().await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn deregister(&self, agent_id: &str) -> Result<()> {
        let response = self.post(&format!("/{}/deregister", agent_id)).send().await?;
        ensure_success(response).await?;
        Ok(())
    }
}
