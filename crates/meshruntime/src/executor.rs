use crate::{ActionRegistry, FlowLibrary, RuntimeConfig};
use async_trait::async_trait;
use meshcore::assertions::check_resolved;
use meshcore::value::get_path;
use meshcore::{
    Action, ActionContext, ActionOutput, AttemptResult, BlockFailure, BlockOutcome, EventBus, EventEmitter, EventType,
    ExecutionContext, ExecutionRecord, ExecutionStatus, Flow, OnError, OutputMap, Phase, Step, StepError, StepRecord,
    StepRunner, StepStatus, SubflowOutcome,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Walks a flow's step tree: retries, error policies, control-flow
/// recursion, events and the execution record.
pub struct StepExecutor {
    registry: Arc<ActionRegistry>,
    library: Arc<FlowLibrary>,
    events: Arc<EventBus>,
    config: RuntimeConfig,
}

/// What a finished step means for the block it sits in.
enum Disposition {
    Passed,
    /// Failed, but `on_error` let the block carry on.
    Handled,
    Fatal(BlockFailure),
    Cancelled,
}

/// Result of running one flow's phases.
#[derive(Default)]
struct FlowRun {
    records: Vec<StepRecord>,
    failure: Option<BlockFailure>,
    cancelled: bool,
    timed_out: Option<Duration>,
    outputs: OutputMap,
}

impl StepExecutor {
    pub fn new(
        registry: Arc<ActionRegistry>,
        library: Arc<FlowLibrary>,
        events: Arc<EventBus>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            library,
            events,
            config,
        }
    }

    /// Execute an already validated flow and return its record.
    #[instrument(skip_all, fields(flow = %flow.name()))]
    pub async fn execute(&self, flow: &Flow, variables: OutputMap, cancellation: CancellationToken) -> ExecutionRecord {
        let mut record = ExecutionRecord::new(flow.name());
        record.flow_id = flow.meta.id.clone();
        let emitter = self.events.create_emitter(record.id);
        advance(&mut record, ExecutionStatus::Running);

        info!(execution_id = %record.id, "Starting flow execution");
        emitter.execution(
            EventType::ExecutionStarted,
            json!({
                "flow": flow.name(),
                "setup": flow.setup.len(),
                "steps": flow.steps.len(),
                "teardown": flow.teardown.len(),
            }),
        );

        let mut vars = ExecutionContext::for_flow(flow, variables);
        let run = self.run_flow_phases(flow, &mut vars, &cancellation, &emitter, 0).await;

        record.steps = run.records;
        record.outputs = run.outputs;
        record.tally();

        let status = if let Some(failure) = run.failure {
            record.error = Some(failure.message);
            record.failed_step = Some(failure.step_id);
            ExecutionStatus::Failed
        } else if let Some(limit) = run.timed_out {
            record.error = Some(format!("Execution timed out after {}ms", limit.as_millis()));
            ExecutionStatus::Failed
        } else if run.cancelled {
            record.error = Some("Execution cancelled".to_string());
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Completed
        };
        advance(&mut record, status);

        let summary = json!({
            "status": status.as_str(),
            "passed": record.passed,
            "failed": record.failed,
            "skipped": record.skipped,
            "duration_ms": record.duration_ms,
            "error": record.error,
            "failed_step": record.failed_step,
        });
        if status == ExecutionStatus::Completed {
            info!(
                execution_id = %record.id,
                passed = record.passed,
                duration_ms = record.duration_ms,
                "Flow execution completed"
            );
            emitter.execution(EventType::ExecutionCompleted, summary);
        } else {
            warn!(
                execution_id = %record.id,
                status = status.as_str(),
                error = ?record.error,
                "Flow execution did not complete"
            );
            emitter.execution(EventType::ExecutionFailed, summary);
        }

        record
    }

    /// Setup, main and (always) teardown for one flow.
    async fn run_flow_phases(
        &self,
        flow: &Flow,
        vars: &mut ExecutionContext,
        cancellation: &CancellationToken,
        emitter: &EventEmitter,
        depth: usize,
    ) -> FlowRun {
        let token = cancellation.child_token();
        let mut run = FlowRun::default();
        let limit = match flow.timeout() {
            Ok(limit) => limit,
            Err(err) => {
                run.failure = Some(BlockFailure {
                    step_id: "timeout".to_string(),
                    message: err.to_string(),
                });
                return run;
            }
        };

        let (setup, main) = {
            let body = self.run_setup_and_main(flow, vars, &token, emitter, depth);
            tokio::pin!(body);
            match limit {
                Some(limit) => tokio::select! {
                    out = &mut body => out,
                    _ = tokio::time::sleep(limit) => {
                        warn!(flow = %flow.name(), timeout_ms = limit.as_millis() as u64, "Flow timed out, cancelling");
                        run.timed_out = Some(limit);
                        token.cancel();
                        body.await
                    }
                },
                None => body.await,
            }
        };

        run.failure = setup.failure.clone().or_else(|| main.failure.clone());
        run.cancelled = setup.cancelled || main.cancelled;
        run.records.extend(setup.records);
        run.records.extend(main.records);

        if run.failure.is_none() && !run.cancelled {
            match resolve_flow_outputs(flow, vars) {
                Ok(outputs) => run.outputs = outputs,
                Err(err) => {
                    run.failure = Some(BlockFailure {
                        step_id: "outputs".to_string(),
                        message: err.to_string(),
                    })
                }
            }
        }

        if !flow.teardown.is_empty() {
            let teardown_token = CancellationToken::new();
            let scope = self.scope(Phase::Teardown, emitter, depth);
            let teardown = scope.run_block(&flow.teardown, vars, &teardown_token).await;
            if let Some(failure) = &teardown.failure {
                error!(
                    flow = %flow.name(),
                    step_id = %failure.step_id,
                    error = %failure.message,
                    "Teardown step failed"
                );
            }
            run.records.extend(teardown.records);
        }

        run
    }

    async fn run_setup_and_main(
        &self,
        flow: &Flow,
        vars: &mut ExecutionContext,
        token: &CancellationToken,
        emitter: &EventEmitter,
        depth: usize,
    ) -> (BlockOutcome, BlockOutcome) {
        let setup = self
            .scope(Phase::Setup, emitter, depth)
            .run_block(&flow.setup, vars, token)
            .await;

        if !setup.is_success() {
            if let Some(failure) = &setup.failure {
                warn!(step_id = %failure.step_id, "Setup failed, skipping main steps");
            }
            let main = BlockOutcome {
                records: flow.steps.iter().map(|s| StepRecord::skipped(s, Phase::Main)).collect(),
                failure: None,
                cancelled: setup.cancelled,
            };
            return (setup, main);
        }

        let main = self
            .scope(Phase::Main, emitter, depth)
            .run_block(&flow.steps, vars, token)
            .await;
        (setup, main)
    }

    fn scope<'e>(&'e self, phase: Phase, emitter: &'e EventEmitter, depth: usize) -> ExecutionScope<'e> {
        ExecutionScope {
            executor: self,
            emitter,
            phase,
            depth,
        }
    }
}

fn advance(record: &mut ExecutionRecord, status: ExecutionStatus) {
    if let Err(err) = record.transition(status) {
        error!(execution_id = %record.id, "{}", err);
    }
}

fn mark(record: &mut StepRecord, status: StepStatus) {
    if let Err(err) = record.transition(status) {
        error!(step_id = %record.step_id, "{}", err);
    }
}

fn resolve_flow_outputs(flow: &Flow, vars: &ExecutionContext) -> Result<OutputMap, StepError> {
    let mut outputs = OutputMap::new();
    for (name, rule) in &flow.meta.outputs {
        outputs.insert(name.clone(), vars.interpolate_str(rule, None)?);
    }
    Ok(outputs)
}

/// Apply a step's `output` rules to one attempt's raw result.
fn extract_outputs(step: &Step, raw: &OutputMap, vars: &ExecutionContext) -> Result<OutputMap, StepError> {
    if step.output.is_empty() {
        return Ok(raw.clone());
    }
    let mut extracted = OutputMap::new();
    for (name, rule) in &step.output {
        let value = if rule.starts_with('$') || rule.contains("${") || rule.contains("{{") {
            vars.interpolate_str(rule, Some(raw))?
        } else {
            get_path(raw, rule)
                .cloned()
                .ok_or_else(|| StepError::unresolved(rule.as_str(), "field not found in step result"))?
        };
        extracted.insert(name.clone(), value);
    }
    Ok(extracted)
}

/// One phase of one (sub-)flow run. Implements [`StepRunner`] so control-flow
/// actions can recurse back into the executor.
struct ExecutionScope<'e> {
    executor: &'e StepExecutor,
    emitter: &'e EventEmitter,
    phase: Phase,
    depth: usize,
}

impl ExecutionScope<'_> {
    /// Run steps in order. Once a step fails fatally or the token fires,
    /// every remaining step is recorded as skipped.
    async fn run_block(&self, steps: &[Step], vars: &mut ExecutionContext, token: &CancellationToken) -> BlockOutcome {
        let mut outcome = BlockOutcome::default();

        for step in steps {
            if outcome.failure.is_some() || outcome.cancelled || token.is_cancelled() {
                outcome.cancelled |= token.is_cancelled();
                debug!(step_id = %step.id, "Skipping step");
                outcome.records.push(StepRecord::skipped(step, self.phase));
                continue;
            }

            let (record, disposition) = self.run_step(step, vars, token).await;
            outcome.records.push(record);
            match disposition {
                Disposition::Passed | Disposition::Handled => {}
                Disposition::Fatal(failure) => outcome.failure = Some(failure),
                Disposition::Cancelled => outcome.cancelled = true,
            }
        }

        outcome
    }

    #[instrument(skip_all, fields(step_id = %step.id, action = %step.action))]
    async fn run_step(
        &self,
        step: &Step,
        vars: &mut ExecutionContext,
        token: &CancellationToken,
    ) -> (StepRecord, Disposition) {
        let mut record = StepRecord::new(step, self.phase);
        mark(&mut record, StepStatus::Running);
        self.emitter.step(
            EventType::StepStarted,
            &step.id,
            json!({
                "name": step.display_name(),
                "action": step.action,
                "phase": self.phase,
            }),
        );
        debug!("Step started");

        match self.run_attempts(step, vars, token, &mut record).await {
            Ok(output) => {
                vars.set_step_output(step.id.clone(), output.clone());
                record.output = output;
                mark(&mut record, StepStatus::Completed);
                info!(duration_ms = record.duration_ms, attempts = record.attempts_made(), "Step completed");
                self.emitter.step(
                    EventType::StepCompleted,
                    &step.id,
                    json!({
                        "name": step.display_name(),
                        "action": step.action,
                        "duration_ms": record.duration_ms,
                        "attempts": record.attempts_made(),
                    }),
                );
                (record, Disposition::Passed)
            }
            Err(err) => {
                record.error = Some(err.to_string());
                mark(&mut record, StepStatus::Failed);
                warn!(error = %err, attempts = record.attempts_made(), "Step failed");
                self.emitter.step(
                    EventType::StepFailed,
                    &step.id,
                    json!({
                        "name": step.display_name(),
                        "action": step.action,
                        "duration_ms": record.duration_ms,
                        "attempts": record.attempts_made(),
                        "error": err.to_string(),
                    }),
                );

                if err.is_cancelled() {
                    return (record, Disposition::Cancelled);
                }
                let disposition = self.apply_on_error(step, &err, vars, token, &mut record).await;
                (record, disposition)
            }
        }
    }

    async fn apply_on_error(
        &self,
        step: &Step,
        err: &StepError,
        vars: &mut ExecutionContext,
        token: &CancellationToken,
        record: &mut StepRecord,
    ) -> Disposition {
        let failure = BlockFailure {
            step_id: err.failing_child().unwrap_or(&step.id).to_string(),
            message: err.to_string(),
        };

        match step.on_error {
            OnError::Abort => Disposition::Fatal(failure),
            OnError::Continue => {
                info!("Continuing after failure (on_error: continue)");
                Disposition::Handled
            }
            OnError::Handle => {
                let previous = vars.set_variable(
                    "error",
                    json!({"step_id": failure.step_id, "message": failure.message}),
                );
                let handled = StepRunner::run_steps(self, &step.error_handler, vars, token).await;
                vars.restore_variable("error", previous);
                record.children.extend(handled.records.iter().cloned());

                if handled.cancelled {
                    Disposition::Cancelled
                } else if let Some(handler_failure) = handled.failure {
                    error!(handler_step = %handler_failure.step_id, "Error handler failed");
                    Disposition::Fatal(handler_failure)
                } else {
                    info!("Failure handled by error_handler");
                    Disposition::Handled
                }
            }
        }
    }

    /// Retry loop. Returns the extracted output of the first successful
    /// attempt, or the last error.
    async fn run_attempts(
        &self,
        step: &Step,
        vars: &mut ExecutionContext,
        token: &CancellationToken,
        record: &mut StepRecord,
    ) -> Result<OutputMap, StepError> {
        let action = self
            .executor
            .registry
            .get(&step.action)
            .ok_or_else(|| StepError::Configuration(format!("Unknown action '{}'", step.action)))?;
        let base_delay = match &step.retry {
            Some(retry) => retry
                .base_delay()
                .map_err(|e| StepError::Configuration(e.to_string()))?,
            None => Duration::ZERO,
        };
        let timeout = step
            .step_timeout()
            .map_err(|e| StepError::Configuration(e.to_string()))?
            .or(self.executor.config.default_step_timeout);
        let max_attempts = step.max_attempts();

        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let (result, children) = self.attempt(step, action.as_ref(), vars, token, attempt, timeout).await;
            record.children = children;

            let raw = result.map(ActionOutput::into_map);
            let outcome = raw.as_ref().map_err(Clone::clone).and_then(|raw| {
                let expressions = step
                    .assertions
                    .iter()
                    .map(|e| Ok((e.as_str(), vars.interpolate_text(e, Some(raw))?)))
                    .collect::<Result<Vec<_>, StepError>>()?;
                check_resolved(&expressions, raw)?;
                extract_outputs(step, raw, vars)
            });

            record.attempts.push(AttemptResult {
                attempt,
                success: outcome.is_ok(),
                output: raw.unwrap_or_default(),
                error: outcome.as_ref().err().map(|e| e.to_string()),
                duration_ms: started.elapsed().as_millis() as u64,
            });

            let err = match outcome {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };
            if attempt >= max_attempts || !err.is_retryable() || token.is_cancelled() {
                return Err(err);
            }

            let delay = step
                .retry
                .as_ref()
                .map(|r| r.delay_after(base_delay, attempt))
                .unwrap_or_default();
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return Err(StepError::Cancelled),
                }
            }
            attempt += 1;
        }
    }

    /// One try of the action, bounded by the step timeout and the token.
    async fn attempt(
        &self,
        step: &Step,
        action: &dyn Action,
        vars: &mut ExecutionContext,
        token: &CancellationToken,
        attempt: u32,
        timeout: Option<Duration>,
    ) -> (Result<ActionOutput, StepError>, Vec<StepRecord>) {
        let config = match vars.interpolate_map(&step.config, None, action.raw_config_keys()) {
            Ok(config) => config,
            Err(err) => return (Err(err), Vec::new()),
        };

        let attempt_token = token.child_token();
        let cooperative = action.observes_cancellation();
        let mut ctx = ActionContext {
            execution_id: self.emitter.execution_id(),
            step,
            config,
            vars,
            cancellation: attempt_token.clone(),
            runner: self,
            attempt,
            children: Vec::new(),
        };

        let result = {
            let fut = action.execute(&mut ctx);
            tokio::pin!(fut);
            let deadline = async {
                match timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                result = &mut fut => result,
                _ = deadline => {
                    attempt_token.cancel();
                    if cooperative {
                        let _ = fut.await;
                    }
                    let millis = timeout.map(|t| t.as_millis() as u64).unwrap_or_default();
                    Err(StepError::Timeout { millis })
                }
                _ = token.cancelled(), if !cooperative => Err(StepError::Cancelled),
            }
        };

        (result, ctx.children)
    }
}

#[async_trait]
impl StepRunner for ExecutionScope<'_> {
    async fn run_steps(
        &self,
        steps: &[Step],
        vars: &mut ExecutionContext,
        cancellation: &CancellationToken,
    ) -> BlockOutcome {
        self.run_block(steps, vars, cancellation).await
    }

    async fn run_flow(
        &self,
        name: &str,
        inputs: OutputMap,
        vars: &ExecutionContext,
        cancellation: &CancellationToken,
    ) -> Result<SubflowOutcome, StepError> {
        let max_depth = self.executor.config.max_subflow_depth;
        if self.depth + 1 > max_depth {
            return Err(StepError::Configuration(format!(
                "Sub-flow nesting deeper than {} levels",
                max_depth
            )));
        }
        let flow = self
            .executor
            .library
            .get(name)
            .ok_or_else(|| StepError::Configuration(format!("Flow not found: {}", name)))?;

        info!(subflow = %name, depth = self.depth + 1, "Running sub-flow");
        let mut variables = flow.meta.env.clone();
        variables.extend(inputs);
        let mut child_vars = vars.isolated(variables);

        let run = self
            .executor
            .run_flow_phases(&flow, &mut child_vars, cancellation, self.emitter, self.depth + 1)
            .await;

        let failure = match (run.failure, run.timed_out) {
            (Some(failure), _) => Some(failure),
            (None, Some(limit)) => Some(BlockFailure {
                step_id: name.to_string(),
                message: format!("Sub-flow timed out after {}ms", limit.as_millis()),
            }),
            (None, None) => None,
        };

        Ok(SubflowOutcome {
            block: BlockOutcome {
                records: run.records,
                failure,
                cancelled: run.cancelled && run.timed_out.is_none(),
            },
            outputs: run.outputs,
        })
    }

    fn max_concurrency(&self) -> usize {
        self.executor.config.max_parallel_branches
    }

    fn phase(&self) -> Phase {
        self.phase
    }
}
