#![allow(dead_code)]

use async_trait::async_trait;
use meshcore::{Action, ActionContext, ActionOutput, ExecutionRecord, StepError, StepRecord, StepStatus};
use meshruntime::{ActionRegistry, FlowRuntime, RuntimeConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

/// Returns its interpolated config as output.
pub struct EchoAction;

#[async_trait]
impl Action for EchoAction {
    fn action_type(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, StepError> {
        Ok(ctx.config.clone().into())
    }
}

/// Fails the first `failures` calls, then succeeds. Remembers when each
/// call started.
pub struct FlakyAction {
    failures: usize,
    calls: AtomicUsize,
    started: Mutex<Vec<Instant>>,
}

impl FlakyAction {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn start_times(&self) -> Vec<Instant> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl Action for FlakyAction {
    fn action_type(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, StepError> {
        self.started.lock().unwrap().push(Instant::now());
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(ctx.action_error(format!("boom #{}", call + 1)));
        }
        Ok(ActionOutput::new().with_output("calls", call + 1))
    }
}

pub fn runtime_with(extra: Vec<Arc<dyn Action>>) -> FlowRuntime {
    runtime_with_config(extra, RuntimeConfig::default())
}

pub fn runtime_with_config(extra: Vec<Arc<dyn Action>>, config: RuntimeConfig) -> FlowRuntime {
    let mut registry = ActionRegistry::new();
    meshactions::register_all(&mut registry);
    registry.register(Arc::new(EchoAction));
    for action in extra {
        registry.register(action);
    }
    FlowRuntime::with_registry(registry, config)
}

/// Every record in the tree, depth first.
pub fn flatten(records: &[StepRecord]) -> Vec<&StepRecord> {
    let mut out = Vec::new();
    for record in records {
        out.push(record);
        out.extend(flatten(&record.children));
    }
    out
}

pub fn assert_all_terminal(record: &ExecutionRecord) {
    for step in flatten(&record.steps) {
        assert!(
            step.status.is_terminal(),
            "step {} left in {:?}",
            step.step_id,
            step.status
        );
        assert_ne!(step.status, StepStatus::Running);
    }
    let counts = record.counts();
    assert_eq!(counts.unfinished, 0);
    assert_eq!(
        record.passed + record.failed + record.skipped,
        flatten(&record.steps).len()
    );
}
