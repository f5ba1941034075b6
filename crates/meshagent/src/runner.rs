use crate::config::AgentConfig;
use crate::control_plane::ControlPlane;
use crate::error::{AgentError, Result};
use crate::job::{Job, JobReport, RunningJob};
use chrono::Utc;
use meshruntime::FlowRuntime;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub report_attempts: u32,
    /// First report retry delay, doubled per attempt
    pub report_backoff: Duration,
    pub report_backoff_cap: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            poll_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            report_attempts: 5,
            report_backoff: Duration::from_millis(500),
            report_backoff_cap: Duration::from_secs(10),
        }
    }
}

impl From<&AgentConfig> for RunnerSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            poll_interval: config.poll_interval,
            shutdown_grace: config.shutdown_grace,
            report_attempts: config.report_attempts,
            ..Self::default()
        }
    }
}

struct JobHandle {
    info: RunningJob,
    cancellation: CancellationToken,
}

type RunningSet = Arc<Mutex<HashMap<String, JobHandle>>>;

fn lock_running(running: &RunningSet) -> MutexGuard<'_, HashMap<String, JobHandle>> {
    running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owned by a job's task. Dropping it removes the running entry and then
/// frees the slot, whether the task returned, panicked or was aborted.
struct JobSlot {
    job_id: String,
    running: RunningSet,
    finished: bool,
    _permit: OwnedSemaphorePermit,
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        lock_running(&self.running).remove(&self.job_id);
        if !self.finished {
            error!(job_id = %self.job_id, "Job task ended before its result was reported");
        }
    }
}

/// Pulls jobs from the control plane and runs them, at most
/// `max_concurrent` at a time.
///
/// Cloning is cheap; clones share the same slots and running set.
#[derive(Clone)]
pub struct JobRunner {
    agent_id: String,
    runtime: Arc<FlowRuntime>,
    control_plane: Arc<dyn ControlPlane>,
    settings: RunnerSettings,
    slots: Arc<Semaphore>,
    running: RunningSet,
}

impl JobRunner {
    pub fn new(
        agent_id: impl Into<String>,
        runtime: Arc<FlowRuntime>,
        control_plane: Arc<dyn ControlPlane>,
        settings: RunnerSettings,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_concurrent));
        Self {
            agent_id: agent_id.into(),
            runtime,
            control_plane,
            settings,
            slots,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.settings.max_concurrent
    }

    pub fn running_count(&self) -> usize {
        self.lock().len()
    }

    pub fn running_jobs(&self) -> Vec<RunningJob> {
        let mut jobs: Vec<RunningJob> = self.lock().values().map(|handle| handle.info.clone()).collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        jobs
    }

    /// Cancel one running job. Returns false if it is not running here.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        match self.lock().get(job_id) {
            Some(handle) => {
                handle.cancellation.cancel();
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JobHandle>> {
        lock_running(&self.running)
    }

    /// Poll until `shutdown` fires, then cancel and drain in-flight jobs.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            agent_id = %self.agent_id,
            max_concurrent = self.settings.max_concurrent,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Job runner started"
        );

        let mut tasks: JoinSet<String> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.poll_once(&mut tasks, &shutdown).await,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
            }
        }

        self.drain(tasks).await;
    }

    async fn poll_once(&self, tasks: &mut JoinSet<String>, shutdown: &CancellationToken) {
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("All job slots busy, skipping poll");
                return;
            }
        };

        let fetched = tokio::select! {
            _ = shutdown.cancelled() => return,
            fetched = self.control_plane.fetch_next_job(&self.agent_id) => fetched,
        };

        match fetched {
            Ok(Some(job)) => self.spawn_job(tasks, job, permit),
            Ok(None) => debug!("No job available"),
            Err(e) => warn!(error = %e, "Failed to fetch job"),
        }
    }

    fn spawn_job(&self, tasks: &mut JoinSet<String>, job: Job, permit: OwnedSemaphorePermit) {
        let cancellation = CancellationToken::new();
        let info = RunningJob {
            job_id: job.id.clone(),
            flow_id: job.flow_id.clone(),
            started_at: Utc::now(),
        };
        self.lock().insert(
            job.id.clone(),
            JobHandle {
                info,
                cancellation: cancellation.clone(),
            },
        );

        let mut slot = JobSlot {
            job_id: job.id.clone(),
            running: self.running.clone(),
            finished: false,
            _permit: permit,
        };
        let runner = self.clone();
        tasks.spawn(async move {
            let report = runner.execute_job(&job, cancellation).await;
            if let Err(e) = runner.report_with_retry(&report).await {
                error!(job_id = %job.id, error = %e, "Job result was not delivered");
            }
            slot.finished = true;
            drop(slot);
            job.id
        });
    }

    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn execute_job(&self, job: &Job, cancellation: CancellationToken) -> JobReport {
        info!(flow_id = ?job.flow_id, "Executing job");

        let mut flow = match job.flow() {
            Ok(flow) => flow,
            Err(e) => {
                warn!(error = %e, "Rejecting job");
                return JobReport::rejected(job, e.to_string());
            }
        };

        if job.flow_id.is_some() {
            flow.meta.id = job.flow_id.clone();
        }

        match self
            .runtime
            .execute_with_cancel(&flow, job.inputs(), cancellation)
            .await
        {
            Ok(record) => {
                info!(
                    status = ?record.status,
                    passed = record.passed,
                    failed = record.failed,
                    skipped = record.skipped,
                    "Job finished"
                );
                JobReport::from_record(job, record)
            }
            Err(e) => {
                warn!(error = %e, "Job flow failed validation");
                JobReport::rejected(job, e.to_string())
            }
        }
    }

    /// Deliver a report, retrying transient failures with exponential
    /// backoff. The control plane dedupes on the report's idempotency key.
    pub async fn report_with_retry(&self, report: &JobReport) -> Result<()> {
        let attempts = self.settings.report_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.control_plane.report_result(&self.agent_id, report).await {
                Ok(()) => {
                    debug!(job_id = %report.job_id, attempt, "Result reported");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.report_delay(attempt);
                    warn!(
                        job_id = %report.job_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Reporting failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(AgentError::Reporting {
                        job_id: report.job_id.clone(),
                        attempts: attempt,
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    fn report_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.settings
            .report_backoff
            .saturating_mul(factor)
            .min(self.settings.report_backoff_cap)
    }

    fn cancel_all(&self) -> usize {
        let running = self.lock();
        for handle in running.values() {
            handle.cancellation.cancel();
        }
        running.len()
    }

    async fn drain(&self, mut tasks: JoinSet<String>) {
        let in_flight = self.cancel_all();
        info!(in_flight, "Job runner stopping, waiting for running jobs");

        let grace = tokio::time::sleep(self.settings.shutdown_grace);
        tokio::pin!(grace);

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(joined) => log_join(joined),
                    None => break,
                },
                _ = &mut grace => {
                    warn!(remaining = tasks.len(), "Shutdown grace period elapsed, aborting jobs");
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next().await {
                        log_join(joined);
                    }
                    break;
                }
            }
        }

        info!("Job runner stopped");
    }
}

fn log_join(joined: std::result::Result<String, JoinError>) {
    match joined {
        Ok(job_id) => debug!(job_id = %job_id, "Job task finished"),
        Err(e) if e.is_cancelled() => debug!("Job task aborted"),
        Err(e) => error!(error = %e, "Job task panicked"),
    }
}
