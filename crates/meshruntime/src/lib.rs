//! Flow execution runtime
//!
//! This crate provides the engine that runs flows: the action registry,
//! the library of named flows, static validation and the step executor.

mod executor;
mod library;
mod registry;
mod runtime;
mod validate;

pub use executor::StepExecutor;
pub use library::FlowLibrary;
pub use registry::ActionRegistry;
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use validate::FlowValidator;
