use crate::{OutputMap, StepError};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a multi-task construct reacts when one member fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Run everything, then report every failure.
    #[default]
    Aggregate,
    /// Stop at the first failure and cancel what is still running.
    Abort,
}

impl FailurePolicy {
    /// Read `failure_policy` from a step config; absent means aggregate.
    pub fn from_config(config: &OutputMap) -> Result<Self, StepError> {
        match config.get("failure_policy").and_then(|v| v.as_str()) {
            None => Ok(FailurePolicy::Aggregate),
            Some("aggregate") => Ok(FailurePolicy::Aggregate),
            Some("abort") => Ok(FailurePolicy::Abort),
            Some(other) => Err(StepError::Configuration(format!(
                "Unknown failure_policy '{}', expected 'aggregate' or 'abort'",
                other
            ))),
        }
    }
}

/// Bounded concurrent runner for the members of one construct.
///
/// Members get child tokens of the group token, so cancelling the parent
/// reaches all of them and an abort never touches siblings of the group.
pub struct TaskGroup {
    policy: FailurePolicy,
    max_concurrency: usize,
    token: CancellationToken,
}

impl TaskGroup {
    pub fn new(policy: FailurePolicy, max_concurrency: usize, parent: &CancellationToken) -> Self {
        Self {
            policy,
            max_concurrency: max_concurrency.max(1),
            token: parent.child_token(),
        }
    }

    /// Token for members to observe.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run every future, at most `max_concurrency` at a time.
    ///
    /// Results come back in input order. `None` marks members that were
    /// never started because the group aborted or was cancelled first.
    pub async fn run<T, Fut>(self, tasks: Vec<Fut>, is_failure: impl Fn(&T) -> bool) -> Vec<Option<T>>
    where
        Fut: Future<Output = T>,
    {
        let total = tasks.len();
        let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
        let mut pending = tasks.into_iter().enumerate();
        let mut running = FuturesUnordered::new();
        let mut stop = false;

        loop {
            while !stop && running.len() < self.max_concurrency {
                match pending.next() {
                    Some((index, task)) => running.push(async move { (index, task.await) }),
                    None => break,
                }
            }

            let Some((index, result)) = running.next().await else {
                break;
            };

            if is_failure(&result) && self.policy == FailurePolicy::Abort && !stop {
                debug!(member = index, "Task group aborting after failure");
                stop = true;
                self.token.cancel();
            }
            if self.token.is_cancelled() {
                stop = true;
            }
            results[index] = Some(result);
        }

        results
    }
}
