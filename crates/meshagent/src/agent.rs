use crate::config::AgentConfig;
use crate::control_plane::{ControlPlane, HttpControlPlane};
use crate::error::Result;
use crate::heartbeat::HeartbeatManager;
use crate::job::AgentInfo;
use crate::runner::{JobRunner, RunnerSettings};
use meshruntime::{ActionRegistry, FlowRuntime, RuntimeConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// A fleet agent: one job runner plus its heartbeat
pub struct Agent {
    runner: JobRunner,
    heartbeat: HeartbeatManager,
}

impl Agent {
    pub fn new(config: &AgentConfig, runtime: Arc<FlowRuntime>, control_plane: Arc<dyn ControlPlane>) -> Result<Self> {
        config.validate()?;
        let agent_id = config
            .agent_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let runner = JobRunner::new(
            agent_id.clone(),
            runtime,
            control_plane.clone(),
            RunnerSettings::from(config),
        );
        let heartbeat = HeartbeatManager::new(
            AgentInfo::detect(agent_id, config.tag_list()),
            control_plane,
            runner.clone(),
            config.heartbeat_interval,
        );
        Ok(Self { runner, heartbeat })
    }

    /// Agent talking to the control plane over HTTP, with the built-in actions
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let mut registry = ActionRegistry::new();
        meshactions::register_all(&mut registry);
        let runtime = Arc::new(FlowRuntime::with_registry(registry, RuntimeConfig::default()));
        let control_plane = Arc::new(HttpControlPlane::new(config.api_url.clone(), config.token.clone())?);
        Self::new(config, runtime, control_plane)
    }

    pub fn agent_id(&self) -> &str {
        self.heartbeat.agent_id()
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    /// Register, then run jobs and heartbeats until `shutdown` fires.
    ///
    /// Heartbeats continue while running jobs drain, and deregistration
    /// is attempted last. Only a failed registration is an error.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.heartbeat.register().await?;

        let beats = CancellationToken::new();
        let heartbeat = self.heartbeat.clone();
        let heartbeat_stop = beats.clone();
        let heartbeat_task = tokio::spawn(async move { heartbeat.run(heartbeat_stop).await });

        self.runner.run(shutdown).await;

        beats.cancel();
        if let Err(e) = heartbeat_task.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }
        self.heartbeat.deregister().await;
        info!(agent_id = %self.agent_id(), "Agent stopped");
        Ok(())
    }
}
