#![allow(dead_code)]

use async_trait::async_trait;
use meshagent::{AgentError, AgentInfo, ControlPlane, HeartbeatPayload, Job, JobReport, Result, RunnerSettings};
use meshcore::{Action, ActionContext, ActionOutput, StepError};
use meshruntime::{ActionRegistry, FlowRuntime, RuntimeConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

/// Control plane that serves a fixed queue and keeps everything it is sent.
#[derive(Default)]
pub struct QueueControlPlane {
    jobs: Mutex<VecDeque<Job>>,
    reports: Mutex<Vec<JobReport>>,
    report_calls: AtomicUsize,
    /// Status codes returned by the next report calls, in order
    report_failures: Mutex<VecDeque<u16>>,
    heartbeats: Mutex<Vec<HeartbeatPayload>>,
    registered: Mutex<Option<AgentInfo>>,
    reject_registration: AtomicBool,
    deregistered: AtomicBool,
}

impl QueueControlPlane {
    pub fn with_jobs(jobs: Vec<Job>) -> Arc<Self> {
        let plane = Self::default();
        plane.jobs.lock().unwrap().extend(jobs);
        Arc::new(plane)
    }

    pub fn fail_reports(&self, statuses: &[u16]) {
        self.report_failures.lock().unwrap().extend(statuses.iter().copied());
    }

    pub fn reject_registration(&self) {
        self.reject_registration.store(true, Ordering::SeqCst);
    }

    pub fn reports(&self) -> Vec<JobReport> {
        self.reports.lock().unwrap().clone()
    }

    pub fn report_calls(&self) -> usize {
        self.report_calls.load(Ordering::SeqCst)
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatPayload> {
        self.heartbeats.lock().unwrap().clone()
    }

    pub fn registered(&self) -> Option<AgentInfo> {
        self.registered.lock().unwrap().clone()
    }

    pub fn deregistered(&self) -> bool {
        self.deregistered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for QueueControlPlane {
    async fn fetch_next_job(&self, _agent_id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.lock().unwrap().pop_front())
    }

    async fn report_result(&self, _agent_id: &str, report: &JobReport) -> Result<()> {
        self.report_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.report_failures.lock().unwrap().pop_front() {
            return Err(AgentError::ControlPlane {
                status,
                message: "injected".to_string(),
            });
        }
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }

    async fn register(&self, info: &AgentInfo) -> Result<()> {
        if self.reject_registration.load(Ordering::SeqCst) {
            return Err(AgentError::ControlPlane {
                status: 401,
                message: "bad token".to_string(),
            });
        }
        *self.registered.lock().unwrap() = Some(info.clone());
        Ok(())
    }

    async fn heartbeat(&self, _agent_id: &str, payload: &HeartbeatPayload) -> Result<()> {
        self.heartbeats.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn deregister(&self, _agent_id: &str) -> Result<()> {
        self.deregistered.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Counts how many probe steps are inside `execute` at once.
#[derive(Default)]
pub struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Holds for `hold_ms` (default 150) unless cancelled first.
pub struct ProbeAction {
    pub gauge: Arc<Gauge>,
}

#[async_trait]
impl Action for ProbeAction {
    fn action_type(&self) -> &str {
        "probe"
    }

    fn observes_cancellation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> std::result::Result<ActionOutput, StepError> {
        let hold = ctx.get_u64("hold_ms")?.unwrap_or(150);
        let now = self.gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);

        let cancelled = tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(hold)) => false,
            _ = ctx.cancellation.cancelled() => true,
        };

        self.gauge.active.fetch_sub(1, Ordering::SeqCst);
        if cancelled {
            return Err(StepError::Cancelled);
        }
        Ok(ActionOutput::new().with_output("held_ms", hold))
    }
}

/// Panics on every call.
pub struct ExplodeAction;

#[async_trait]
impl Action for ExplodeAction {
    fn action_type(&self) -> &str {
        "explode"
    }

    async fn execute(&self, _ctx: &mut ActionContext<'_>) -> std::result::Result<ActionOutput, StepError> {
        panic!("explode action called");
    }
}

pub fn probe_runtime(gauge: Arc<Gauge>) -> Arc<FlowRuntime> {
    let mut registry = ActionRegistry::new();
    meshactions::register_all(&mut registry);
    registry.register(Arc::new(ProbeAction { gauge }));
    registry.register(Arc::new(ExplodeAction));
    Arc::new(FlowRuntime::with_registry(registry, RuntimeConfig::default()))
}

pub fn probe_job(id: &str, hold_ms: u64) -> Job {
    let yaml = format!(
        r#"
flow:
  name: probe-{id}
steps:
  - id: hold
    action: probe
    config:
      hold_ms: {hold_ms}
"#
    );
    Job::new(id, yaml)
}

pub fn fast_settings(max_concurrent: usize) -> RunnerSettings {
    RunnerSettings {
        max_concurrent,
        poll_interval: Duration::from_millis(10),
        shutdown_grace: Duration::from_secs(5),
        report_attempts: 3,
        report_backoff: Duration::from_millis(10),
        report_backoff_cap: Duration::from_millis(50),
    }
}

/// Poll `check` every few milliseconds until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
