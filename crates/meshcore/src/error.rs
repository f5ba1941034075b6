use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors raised while a single step runs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unresolved reference '{reference}': {reason}")]
    VariableResolution { reference: String, reason: String },

    #[error("{}", describe_assertions(.0))]
    Assertion(Vec<AssertionError>),

    #[error("{action} failed: {message}")]
    ActionExecution { action: String, message: String },

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Step '{step_id}' failed: {message}")]
    ChildFailed { step_id: String, message: String },
}

impl StepError {
    pub fn action(action: impl Into<String>, message: impl Into<String>) -> Self {
        StepError::ActionExecution {
            action: action.into(),
            message: message.into(),
        }
    }

    pub fn unresolved(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        StepError::VariableResolution {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    /// Whether a step retry policy may re-run the step after this error.
    ///
    /// Configuration and resolution failures are deterministic, and a
    /// cancelled run must not be resumed by the retry loop.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StepError::Configuration(_) | StepError::VariableResolution { .. } | StepError::Cancelled
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepError::Cancelled)
    }

    /// Innermost step id for nested failures, if this error came from a child.
    pub fn failing_child(&self) -> Option<&str> {
        match self {
            StepError::ChildFailed { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}

/// A failed or unevaluable assertion.
///
/// Carries the expression text and the top-level field names that were
/// available, never their values.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("assertion `{expression}` failed: {reason} (available fields: {})", .available_fields.join(", "))]
pub struct AssertionError {
    pub expression: String,
    pub reason: String,
    pub available_fields: Vec<String>,
}

fn describe_assertions(failures: &[AssertionError]) -> String {
    match failures {
        [single] => single.to_string(),
        many => {
            let lines: Vec<String> = many.iter().map(|f| format!("  - {}", f)).collect();
            format!("{} assertions failed:\n{}", many.len(), lines.join("\n"))
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid flow: {0}")]
    Invalid(String),

    #[error("Unknown action '{action}' in step '{step_id}'")]
    UnknownAction { step_id: String, action: String },

    #[error("Duplicate step id: {0}")]
    DuplicateStepId(String),

    #[error("Invalid step '{step_id}': {message}")]
    InvalidStep { step_id: String, message: String },

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Cyclic sub-flow reference involving '{0}'")]
    CyclicFlowReference(String),

    #[error("Invalid sub-flow '{flow}': {source}")]
    InvalidSubFlow {
        flow: String,
        #[source]
        source: Box<ValidationError>,
    },
}

impl ValidationError {
    pub fn step(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError::InvalidStep {
            step_id: step_id.into(),
            message: message.into(),
        }
    }
}
