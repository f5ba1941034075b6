use crate::{ActionRegistry, FlowLibrary, FlowValidator, StepExecutor};
use meshcore::{EventBus, ExecutionRecord, Flow, FlowError, OutputMap, Subscription};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Main runtime for executing flows
pub struct FlowRuntime {
    registry: Arc<ActionRegistry>,
    executor: StepExecutor,
    event_bus: Arc<EventBus>,
    library: Arc<FlowLibrary>,
}

impl FlowRuntime {
    /// Create a runtime with an empty registry and default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(ActionRegistry::new(), config)
    }

    /// Create a runtime around a fully populated registry
    pub fn with_registry(registry: ActionRegistry, config: RuntimeConfig) -> Self {
        let registry = Arc::new(registry);
        let library = Arc::new(FlowLibrary::new());
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let executor = StepExecutor::new(registry.clone(), library.clone(), event_bus.clone(), config);

        Self {
            registry,
            executor,
            event_bus,
            library,
        }
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    pub fn library(&self) -> &Arc<FlowLibrary> {
        &self.library
    }

    /// Make a flow available to `run_flow` steps
    pub fn register_flow(&self, mut flow: Flow) {
        flow.assign_ids();
        self.library.register(flow);
    }

    /// Static checks only; no step runs.
    pub fn validate(&self, flow: &Flow) -> Result<(), FlowError> {
        FlowValidator::new(&self.registry, &self.library)
            .validate(flow)
            .map_err(FlowError::from)
    }

    /// Validate and run a flow to completion.
    ///
    /// Validation problems are returned as errors before anything runs.
    /// Everything that goes wrong at run time ends up in the returned
    /// record instead.
    pub async fn execute(&self, flow: &Flow, variables: OutputMap) -> Result<ExecutionRecord, FlowError> {
        self.execute_with_cancel(flow, variables, CancellationToken::new())
            .await
    }

    pub async fn execute_with_cancel(
        &self,
        flow: &Flow,
        variables: OutputMap,
        cancellation: CancellationToken,
    ) -> Result<ExecutionRecord, FlowError> {
        let mut flow = flow.clone();
        flow.assign_ids();
        self.validate(&flow)?;
        Ok(self.executor.execute(&flow, variables, cancellation).await)
    }

    /// Run a flow previously added with [`FlowRuntime::register_flow`]
    pub async fn execute_registered(
        &self,
        name: &str,
        variables: OutputMap,
        cancellation: CancellationToken,
    ) -> Result<ExecutionRecord, FlowError> {
        let flow = self
            .library
            .get(name)
            .ok_or_else(|| FlowError::Validation(meshcore::ValidationError::FlowNotFound(name.to_string())))?;
        self.execute_with_cancel(&flow, variables, cancellation).await
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> Subscription {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub event_buffer_size: usize,
    pub max_parallel_branches: usize,
    pub max_subflow_depth: usize,
    /// Applied to steps that declare no `timeout` of their own
    pub default_step_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            max_parallel_branches: 10,
            max_subflow_depth: 8,
            default_step_timeout: None,
        }
    }
}
