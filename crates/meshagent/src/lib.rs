//! Fleet agent for the test-flow engine
//!
//! Pulls jobs from a control plane, runs their flows through
//! `meshruntime` under a bounded number of slots, reports results back and
//! keeps the control plane informed of its liveness.

mod agent;
pub mod config;
mod control_plane;
mod error;
mod heartbeat;
mod job;
mod runner;

pub use agent::Agent;
pub use config::AgentConfig;
pub use control_plane::{ControlPlane, HttpControlPlane};
pub use error::{AgentError, Result};
pub use heartbeat::HeartbeatManager;
pub use job::{AgentInfo, HeartbeatPayload, Job, JobReport, RunningJob};
pub use runner::{JobRunner, RunnerSettings};
