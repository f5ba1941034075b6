//! Standard action library
//!
//! Built-in handlers for flow steps: I/O actions, data shaping and the
//! control-flow constructs that recurse back into the executor.

mod assert;
mod condition;
mod database;
mod db_poll;
mod debug;
mod for_each;
mod http;
mod parallel;
mod subflow;
mod time;
mod transform;
mod wait_for;

pub use assert::AssertAction;
pub use condition::ConditionAction;
pub use database::{DatabaseClient, DatabaseQueryAction, QueryResult};
pub use db_poll::DbPollAction;
pub use debug::LogAction;
pub use for_each::ForEachAction;
pub use http::HttpRequestAction;
pub use parallel::ParallelAction;
pub use subflow::RunFlowAction;
pub use time::DelayAction;
pub use transform::TransformAction;
pub use wait_for::WaitForAction;

use meshcore::StepError;
use meshruntime::ActionRegistry;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Register every built-in action that needs no external collaborator
pub fn register_all(registry: &mut ActionRegistry) {
    registry.register(Arc::new(HttpRequestAction::new()));
    registry.register(Arc::new(LogAction));
    registry.register(Arc::new(DelayAction));
    registry.register(Arc::new(TransformAction));
    registry.register(Arc::new(AssertAction));
    registry.register(Arc::new(ConditionAction));
    registry.register(Arc::new(ForEachAction));
    registry.register(Arc::new(ParallelAction));
    registry.register(Arc::new(RunFlowAction));
    registry.register(Arc::new(WaitForAction::new()));
}

/// Register `database_query` and `db_poll` backed by `client`
pub fn register_database(registry: &mut ActionRegistry, client: Arc<dyn DatabaseClient>) {
    registry.register(Arc::new(DatabaseQueryAction::new(client.clone())));
    registry.register(Arc::new(DbPollAction::new(client)));
}

/// Race `fut` against the token.
pub(crate) async fn cancellable<F: Future>(token: &CancellationToken, fut: F) -> Result<F::Output, StepError> {
    tokio::select! {
        out = fut => Ok(out),
        _ = token.cancelled() => Err(StepError::Cancelled),
    }
}
