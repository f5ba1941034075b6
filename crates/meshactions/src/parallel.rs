use async_trait::async_trait;
use meshcore::{
    Action, ActionContext, ActionMetadata, ActionOutput, BlockFailure, BlockOutcome, ConfigField, ExecutionContext,
    FailurePolicy, Step, StepError, StepRecord, TaskGroup, ValidationError,
};
use serde_json::{json, Value};
use tracing::{info, warn};

/// Runs each branch concurrently on its own fork of the context.
///
/// Branches read the parent's variables and outputs but write only to their
/// fork. Forks are merged back once every branch has joined.
pub struct ParallelAction;

#[async_trait]
impl Action for ParallelAction {
    fn action_type(&self) -> &str {
        "parallel"
    }

    fn observes_cancellation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, StepError> {
        let policy = FailurePolicy::from_config(&ctx.config)?;
        let step = ctx.step;
        let runner = ctx.runner;
        let group = TaskGroup::new(policy, runner.max_concurrency(), &ctx.cancellation);

        info!(step_id = %step.id, branches = step.branches.len(), ?policy, "Starting parallel block");

        let tasks: Vec<_> = step
            .branches
            .iter()
            .map(|branch| {
                let mut fork = ctx.vars.fork();
                let token = group.token();
                async move {
                    let outcome = runner.run_steps(&branch.steps, &mut fork, &token).await;
                    (outcome, fork)
                }
            })
            .collect();

        let joined = group
            .run(tasks, |(outcome, _): &(BlockOutcome, ExecutionContext)| outcome.failure.is_some())
            .await;

        let phase = runner.phase();
        let mut results = serde_json::Map::new();
        let mut failures: Vec<BlockFailure> = Vec::new();
        let mut cancelled = false;

        for (index, (branch, joined)) in step.branches.iter().zip(joined).enumerate() {
            let label = branch.label(index);
            let (records, summary) = match joined {
                Some((outcome, fork)) => {
                    ctx.vars.absorb(fork);
                    cancelled |= outcome.cancelled && outcome.failure.is_none();
                    let summary = json!({
                        "success": outcome.is_success(),
                        "error": outcome.failure.as_ref().map(|f| f.message.clone()),
                    });
                    if let Some(failure) = outcome.failure {
                        warn!(step_id = %step.id, branch = %label, failed_step = %failure.step_id, "Branch failed");
                        failures.push(failure);
                    }
                    (outcome.records, summary)
                }
                None => {
                    let skipped: Vec<StepRecord> = branch.steps.iter().map(|s| StepRecord::skipped(s, phase)).collect();
                    (skipped, json!({"success": false, "skipped": true}))
                }
            };
            ctx.children.extend(records.into_iter().map(|mut record| {
                record.branch = Some(label.clone());
                record
            }));
            results.insert(label, summary);
        }

        if let Some(first) = failures.first() {
            return Err(StepError::ChildFailed {
                step_id: first.step_id.clone(),
                message: format!(
                    "{} of {} branches failed, first: {}",
                    failures.len(),
                    step.branches.len(),
                    first.message
                ),
            });
        }
        if cancelled || ctx.cancellation.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        info!(step_id = %step.id, "Parallel block completed");
        Ok(ActionOutput::new()
            .with_output("branches", step.branches.len())
            .with_output("results", Value::Object(results)))
    }

    fn validate(&self, step: &Step) -> Result<(), ValidationError> {
        if step.branches.is_empty() {
            return Err(ValidationError::step(&step.id, "parallel needs at least one branch"));
        }
        FailurePolicy::from_config(&step.config).map_err(|e| ValidationError::step(&step.id, e.to_string()))?;
        Ok(())
    }

    fn metadata(&self) -> ActionMetadata {
        ActionMetadata {
            description: "Run branches concurrently".to_string(),
            category: "control".to_string(),
            config: vec![ConfigField::optional("failure_policy", "aggregate (default) or abort")],
        }
    }
}
