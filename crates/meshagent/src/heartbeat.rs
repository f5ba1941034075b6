use crate::control_plane::ControlPlane;
use crate::error::Result;
use crate::job::{AgentInfo, HeartbeatPayload};
use crate::runner::JobRunner;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Registers the agent and keeps reporting liveness and load.
///
/// Failures are logged and retried on the next tick. Nothing here can stop
/// the job runner.
#[derive(Clone)]
pub struct HeartbeatManager {
    info: AgentInfo,
    control_plane: Arc<dyn ControlPlane>,
    runner: JobRunner,
    interval: Duration,
    started: Instant,
}

impl HeartbeatManager {
    pub fn new(info: AgentInfo, control_plane: Arc<dyn ControlPlane>, runner: JobRunner, interval: Duration) -> Self {
        Self {
            info,
            control_plane,
            runner,
            interval,
            started: Instant::now(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.info.id
    }

    pub async fn register(&self) -> Result<()> {
        self.control_plane.register(&self.info).await?;
        info!(agent_id = %self.info.id, tags = ?self.info.tags, "Agent registered");
        Ok(())
    }

    pub fn payload(&self) -> HeartbeatPayload {
        let running_jobs = self.runner.running_count();
        let max_concurrent = self.runner.max_concurrent();
        let load = if max_concurrent == 0 {
            0.0
        } else {
            running_jobs as f64 / max_concurrent as f64
        };
        HeartbeatPayload {
            agent_id: self.info.id.clone(),
            timestamp: Utc::now(),
            status: if running_jobs >= max_concurrent { "busy" } else { "healthy" }.to_string(),
            running_jobs,
            max_concurrent,
            load,
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }

    pub async fn send_heartbeat(&self) -> Result<()> {
        let payload = self.payload();
        self.control_plane.heartbeat(&self.info.id, &payload).await?;
        debug!(running_jobs = payload.running_jobs, load = payload.load, "Heartbeat sent");
        Ok(())
    }

    /// Beat every `interval` until `shutdown` fires. The first beat goes
    /// out one interval after start, registration covers time zero.
    pub async fn run(&self, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.send_heartbeat().await {
                        warn!(error = %e, "Heartbeat failed");
                    }
                }
            }
        }
        debug!("Heartbeat loop stopped");
    }

    /// Best effort: errors and timeouts are logged, never returned.
    pub async fn deregister(&self) {
        match tokio::time::timeout(DEREGISTER_TIMEOUT, self.control_plane.deregister(&self.info.id)).await {
            Ok(Ok(())) => info!(agent_id = %self.info.id, "Agent deregistered"),
            Ok(Err(e)) => warn!(error = %e, "Failed to deregister agent"),
            Err(_) => warn!("Deregistration timed out"),
        }
    }
}
