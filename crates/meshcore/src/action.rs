use crate::{
    ExecutionContext, ExecutionId, OutputMap, Phase, Step, StepError, StepRecord, ValidationError,
};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Core trait every step handler implements
#[async_trait]
pub trait Action: Send + Sync {
    /// Identifier used in a step's `action` field (e.g. "http", "for_each")
    fn action_type(&self) -> &str;

    /// Run one attempt of a step
    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, StepError>;

    /// Config keys handed to the action verbatim instead of interpolated
    /// up front. Used by actions that resolve references themselves.
    fn raw_config_keys(&self) -> &[&str] {
        &[]
    }

    /// Whether the action watches its cancellation token itself. Actions
    /// that return `false` are dropped mid-flight when the token fires.
    fn observes_cancellation(&self) -> bool {
        false
    }

    /// Optional: static checks run before any step executes
    fn validate(&self, _step: &Step) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Name of another flow this step invokes, if any
    fn subflow<'s>(&self, _step: &'s Step) -> Option<&'s str> {
        None
    }

    fn metadata(&self) -> ActionMetadata {
        ActionMetadata::default()
    }
}

/// Runs nested blocks on behalf of control-flow actions.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run `steps` in order against `vars`, honoring each step's policies.
    async fn run_steps(
        &self,
        steps: &[Step],
        vars: &mut ExecutionContext,
        cancellation: &CancellationToken,
    ) -> BlockOutcome;

    /// Run a registered flow with its own variable scope.
    async fn run_flow(
        &self,
        name: &str,
        inputs: OutputMap,
        vars: &ExecutionContext,
        cancellation: &CancellationToken,
    ) -> Result<SubflowOutcome, StepError>;

    /// Upper bound on concurrently running branches.
    fn max_concurrency(&self) -> usize;

    /// Phase the running block belongs to.
    fn phase(&self) -> Phase;
}

/// First unhandled failure inside a block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockFailure {
    pub step_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct BlockOutcome {
    pub records: Vec<StepRecord>,
    pub failure: Option<BlockFailure>,
    pub cancelled: bool,
}

impl BlockOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && !self.cancelled
    }

    /// The error a parent step should report for this block, if any.
    pub fn error(&self) -> Option<StepError> {
        if let Some(failure) = &self.failure {
            return Some(StepError::ChildFailed {
                step_id: failure.step_id.clone(),
                message: failure.message.clone(),
            });
        }
        self.cancelled.then_some(StepError::Cancelled)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubflowOutcome {
    pub block: BlockOutcome,
    /// The sub-flow's declared `outputs`, resolved in its own scope.
    pub outputs: OutputMap,
}

/// Everything a handler sees for one attempt
pub struct ActionContext<'a> {
    pub execution_id: ExecutionId,
    pub step: &'a Step,
    /// Step config after interpolation (except `raw_config_keys`)
    pub config: OutputMap,
    pub vars: &'a mut ExecutionContext,
    pub cancellation: CancellationToken,
    pub runner: &'a dyn StepRunner,
    /// 1-based attempt number
    pub attempt: u32,
    /// Records of nested steps run by control-flow actions
    pub children: Vec<StepRecord>,
}

impl ActionContext<'_> {
    pub fn action_error(&self, message: impl Into<String>) -> StepError {
        StepError::action(self.step.action.clone(), message)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.config.get(name).filter(|v| !v.is_null())
    }

    /// Get config value or return error
    pub fn require(&self, name: &str) -> Result<&Value, StepError> {
        self.get(name)
            .ok_or_else(|| StepError::Configuration(format!("Missing config: {}", name)))
    }

    pub fn require_str(&self, name: &str) -> Result<&str, StepError> {
        self.require(name)?
            .as_str()
            .ok_or_else(|| StepError::Configuration(format!("Config '{}' must be a string", name)))
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Get config with default
    pub fn get_str_or<'s>(&'s self, name: &str, default: &'s str) -> &'s str {
        self.get_str(name).unwrap_or(default)
    }

    pub fn get_u64(&self, name: &str) -> Result<Option<u64>, StepError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| StepError::Configuration(format!("Config '{}' must be a positive integer", name))),
            Some(Value::String(s)) => s
                .parse()
                .map(Some)
                .map_err(|_| StepError::Configuration(format!("Config '{}' must be a positive integer", name))),
            Some(_) => Err(StepError::Configuration(format!(
                "Config '{}' must be a positive integer",
                name
            ))),
        }
    }

    pub fn get_bool_or(&self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "yes" | "1"),
            _ => default,
        }
    }
}

/// Output from one successful attempt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutput {
    pub fields: OutputMap,
}

impl ActionOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn into_map(self) -> OutputMap {
        self.fields
    }
}

impl From<OutputMap> for ActionOutput {
    fn from(fields: OutputMap) -> Self {
        Self { fields }
    }
}

/// Describes an action type for listings and documentation
#[derive(Debug, Clone)]
pub struct ActionMetadata {
    pub description: String,
    pub category: String,
    pub config: Vec<ConfigField>,
}

impl Default for ActionMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            config: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigField {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl ConfigField {
    pub fn required(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            required: true,
        }
    }

    pub fn optional(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            required: false,
        }
    }
}
