//! Core abstractions for the test-flow engine
//!
//! Flow definitions, the execution context and its interpolation rules,
//! the assertion language, execution records, events and the `Action`
//! trait every step handler implements. Nothing here knows how steps are
//! scheduled; that lives in `meshruntime`.

mod action;
pub mod assertions;
mod context;
mod duration;
mod error;
pub mod events;
mod flow;
mod record;
mod taskgroup;
pub mod value;

pub use action::{
    Action, ActionContext, ActionMetadata, ActionOutput, BlockFailure, BlockOutcome, ConfigField, StepRunner,
    SubflowOutcome,
};
pub use context::{ExecutionContext, BUILTINS};
pub use duration::parse_duration;
pub use error::{AssertionError, FlowError, StepError, ValidationError};
pub use events::*;
pub use flow::{Backoff, Branch, Flow, FlowMeta, FlowSettings, OnError, Phase, RetryPolicy, Step};
pub use record::{AttemptResult, ExecutionRecord, ExecutionStatus, StepCounts, StepRecord, StepStatus};
pub use taskgroup::{FailurePolicy, TaskGroup};
pub use value::{canonicalize, canonicalize_record, OutputMap};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
