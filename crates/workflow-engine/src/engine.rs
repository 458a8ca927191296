//! Workflow engine
//!
//! Drives one run of a workflow: validates the graph, walks the steps in
//! dependency order, resolves each step's input, runs it through the retry
//! handler under its timeout and records what it produced.
//!
//! Steps run one at a time by default. When a workflow asks for
//! `concurrency > 1`, independent branches run side by side in batches;
//! all bookkeeping still happens on the driving task between batches.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::{ContextManager, ExecutionContext, RunState, StepResultRecord};
use crate::error::{Result, WorkflowError};
use crate::events::{EventSink, NullEventSink, WorkflowEvent};
use crate::graph::{execution_order, ReadyQueue};
use crate::registry::{NodeRegistry, StepExecutor};
use crate::retry::RetryHandler;
use crate::state::StateStore;
use crate::types::{NodeId, Step, StepOutcome, Workflow};
use crate::validation::{validate_graph, GraphValidation};

/// Shared flag for cancelling a run from outside
///
/// Checked before every step; a step that is already running is not
/// interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-run options
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Run ID to use instead of a generated one
    pub run_id: Option<String>,
    pub user_id: Option<String>,
    /// Credentials handed to every step context
    pub credentials: Map<String, Value>,
    pub cancellation: Option<CancellationFlag>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_credentials(mut self, credentials: Map<String, Value>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancellation = Some(flag);
        self
    }
}

/// Result of a run that was not halted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub workflow_id: String,
    /// Step ID -> output, for every successful step
    pub outputs: Map<String, Value>,
    pub variables: Map<String, Value>,
    /// One record per step in the order they settled
    pub results: Vec<StepResultRecord>,
    /// False when any step failed under continue-on-error
    pub success: bool,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }

    pub fn result(&self, node_id: &str) -> Option<&StepResultRecord> {
        self.results.iter().find(|r| r.node_id == node_id)
    }

    /// Records of steps that failed
    pub fn failed_steps(&self) -> Vec<&StepResultRecord> {
        self.results.iter().filter(|r| !r.success).collect()
    }
}

/// Runs workflows against a registry of step executors
pub struct WorkflowEngine {
    registry: Arc<NodeRegistry>,
    config: EngineConfig,
    retry: RetryHandler,
    contexts: ContextManager,
    event_sink: Arc<dyn EventSink>,
    state_store: Option<Arc<dyn StateStore>>,
}

/// Mutable bookkeeping of one run, owned by the driving task
struct Run<'a> {
    workflow: &'a Workflow,
    base: ExecutionContext,
    state: RunState,
    cancellation: Option<CancellationFlag>,
    continue_on_error: bool,
    failures: usize,
}

/// A step that is ready to execute
struct StepJob<'a> {
    step: &'a Step,
    executor: Arc<dyn StepExecutor>,
    context: ExecutionContext,
    timeout_ms: Option<u64>,
}

/// What preparing a step produced
enum Prepared<'a> {
    /// Disabled; already recorded as skipped
    Skipped,
    Ready(StepJob<'a>),
    /// Cannot run at all; settles without being started
    Rejected(FinishedStep<'a>),
}

/// A step that has settled, not yet recorded
struct FinishedStep<'a> {
    step: &'a Step,
    outcome: Result<StepOutcome>,
    attempts: u32,
    duration: Duration,
}

impl WorkflowEngine {
    pub fn new(registry: Arc<NodeRegistry>, config: EngineConfig) -> Self {
        let retry = RetryHandler::new(config.retry.clone());
        let contexts =
            ContextManager::new().with_ai_providers(config.ai_providers.iter().cloned());
        Self {
            registry,
            config,
            retry,
            contexts,
            event_sink: Arc::new(NullEventSink),
            state_store: None,
        }
    }

    pub fn with_event_sink(mut self, event_sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = event_sink;
        self
    }

    pub fn with_state_store(mut self, state_store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(state_store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Replace the configuration between runs
    pub fn set_config(&mut self, config: EngineConfig) {
        self.retry.set_config(config.retry.clone());
        self.contexts =
            ContextManager::new().with_ai_providers(config.ai_providers.iter().cloned());
        self.config = config;
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Check a workflow's structure without running it
    pub fn validate(&self, workflow: &Workflow) -> GraphValidation {
        validate_graph(&workflow.steps, &workflow.connections)
    }

    /// Execute a workflow once
    ///
    /// Returns a report when every step ran (or failed under
    /// continue-on-error). A structurally invalid graph is refused before
    /// any step runs.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let validation = self.validate(workflow);
        for warning in validation.warning_messages() {
            log::warn!("Workflow '{}': {}", workflow.id, warning);
        }
        if !validation.valid {
            let err = WorkflowError::InvalidGraph(validation.messages());
            log::error!("Refusing to run workflow '{}': {}", workflow.id, err);
            self.emit(WorkflowEvent::WorkflowFailed {
                workflow_id: workflow.id.clone(),
                run_id,
                error: err.to_string(),
            });
            return Err(err);
        }

        let mut base = self.contexts.create_initial_context(
            run_id.clone(),
            workflow.id.clone(),
            &input,
            options.user_id.as_deref(),
        );
        base.credentials = options.credentials;

        let mut run = Run {
            workflow,
            state: RunState::from_context(&base),
            base,
            cancellation: options.cancellation,
            continue_on_error: workflow
                .settings
                .continue_on_error
                .unwrap_or(self.config.continue_on_error),
            failures: 0,
        };

        let concurrency = self.concurrency_for(workflow);
        log::info!(
            "Starting workflow '{}' (run {}, {} steps, concurrency {})",
            workflow.id,
            run_id,
            workflow.steps.len(),
            concurrency
        );
        self.emit(WorkflowEvent::WorkflowStarted {
            workflow_id: workflow.id.clone(),
            run_id: run_id.clone(),
        });

        let result = if concurrency > 1 {
            self.run_concurrent(&mut run, concurrency).await
        } else {
            self.run_sequential(&mut run).await
        };

        match result {
            Ok(()) => {}
            Err(WorkflowError::Cancelled) => {
                log::info!("Workflow '{}' (run {}) cancelled", workflow.id, run_id);
                self.emit(WorkflowEvent::WorkflowCancelled {
                    workflow_id: workflow.id.clone(),
                    run_id: run_id.clone(),
                });
                self.persist_status(&run, "cancelled", None).await;
                return Err(WorkflowError::Cancelled);
            }
            Err(err) => {
                log::error!("Workflow '{}' (run {}) failed: {}", workflow.id, run_id, err);
                self.emit(WorkflowEvent::WorkflowFailed {
                    workflow_id: workflow.id.clone(),
                    run_id: run_id.clone(),
                    error: err.to_string(),
                });
                self.persist_status(&run, "failed", Some(&err)).await;
                return Err(err);
            }
        }

        let success = run.failures == 0;
        let duration_ms = started.elapsed().as_millis() as u64;
        log::info!(
            "Workflow '{}' (run {}) completed in {}ms ({} failed steps)",
            workflow.id,
            run_id,
            duration_ms,
            run.failures
        );
        self.emit(WorkflowEvent::WorkflowCompleted {
            workflow_id: workflow.id.clone(),
            run_id: run_id.clone(),
            success,
            duration_ms,
        });

        if let Some(store) = &self.state_store {
            if let Err(e) = store.clear_state(&run_id).await {
                log::warn!("Failed to clear state of run {}: {}", run_id, e);
            }
        }

        Ok(RunReport {
            run_id,
            workflow_id: workflow.id.clone(),
            outputs: run.state.node_outputs,
            variables: run.state.variables,
            results: run.state.results,
            success,
            duration_ms,
        })
    }

    fn concurrency_for(&self, workflow: &Workflow) -> usize {
        workflow
            .settings
            .concurrency
            .unwrap_or(1)
            .min(self.config.max_concurrency)
            .max(1)
    }

    async fn run_sequential(&self, run: &mut Run<'_>) -> Result<()> {
        let workflow = run.workflow;
        let run_id = run.base.run_id.clone();

        for node_id in execution_order(&workflow.steps, &workflow.connections) {
            let Some(step) = workflow.find_step(&node_id) else {
                continue;
            };
            self.check_cancelled(run)?;

            let finished = match self.prepare_step(run, step).await {
                Prepared::Skipped => continue,
                Prepared::Ready(job) => self.run_step(&run_id, job).await,
                Prepared::Rejected(finished) => finished,
            };
            if let Some(err) = self.settle(run, finished).await {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn run_concurrent(&self, run: &mut Run<'_>, concurrency: usize) -> Result<()> {
        let workflow = run.workflow;
        let run_id = run.base.run_id.clone();
        let mut queue = ReadyQueue::new(&workflow.steps, &workflow.connections);
        let mut pending: VecDeque<NodeId> = queue.ready().into();

        while !queue.is_finished() {
            if pending.is_empty() {
                return Err(WorkflowError::failed(format!(
                    "No runnable steps left with {} step(s) remaining",
                    queue.remaining()
                )));
            }
            self.check_cancelled(run)?;

            let mut jobs = Vec::with_capacity(concurrency);
            let mut rejected = None;
            while jobs.len() < concurrency {
                let Some(node_id) = pending.pop_front() else {
                    break;
                };
                let Some(step) = workflow.find_step(&node_id) else {
                    queue.complete(&node_id);
                    continue;
                };
                match self.prepare_step(run, step).await {
                    Prepared::Skipped => queue.complete(&node_id),
                    Prepared::Ready(job) => jobs.push(job),
                    Prepared::Rejected(finished) => {
                        rejected = Some(finished);
                        break;
                    }
                }
            }

            log::debug!("Running batch of {} step(s)", jobs.len());
            let mut finished =
                join_all(jobs.into_iter().map(|job| self.run_step(&run_id, job))).await;
            finished.extend(rejected);

            let mut halt = None;
            for step_result in finished {
                let node_id = step_result.step.id.clone();
                if let Some(err) = self.settle(run, step_result).await {
                    halt.get_or_insert(err);
                }
                queue.complete(&node_id);
            }
            if let Some(err) = halt {
                return Err(err);
            }

            pending.extend(queue.ready());
        }
        Ok(())
    }

    fn check_cancelled(&self, run: &Run<'_>) -> Result<()> {
        match &run.cancellation {
            Some(flag) if flag.is_cancelled() => Err(WorkflowError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Resolve a step's executor and context
    async fn prepare_step<'a>(&self, run: &mut Run<'a>, step: &'a Step) -> Prepared<'a> {
        let run_id = run.base.run_id.clone();

        if step.data.disabled {
            log::debug!("Skipping disabled step '{}'", step.id);
            run.state
                .results
                .push(self.contexts.create_skipped_record(step));
            self.emit(WorkflowEvent::NodeSkipped {
                node_id: step.id.clone(),
                run_id,
            });
            self.persist_progress(run, &step.id).await;
            return Prepared::Skipped;
        }

        let Some(executor) = self.registry.get(&step.node_type) else {
            return Prepared::Rejected(FinishedStep {
                step,
                outcome: Err(WorkflowError::UnknownNodeType {
                    node_id: step.id.clone(),
                    node_type: step.node_type.clone(),
                }),
                attempts: 0,
                duration: Duration::ZERO,
            });
        };

        let context = self.contexts.context_for_step(
            &run.base,
            step,
            &run.workflow.connections,
            &run.state,
        );
        let timeout_ms = step
            .data
            .timeout_ms
            .or(run.workflow.settings.timeout_ms)
            .or(self.config.default_timeout_ms)
            .filter(|ms| *ms > 0);

        log::debug!("Starting step '{}' ({})", step.id, step.node_type);
        self.emit(WorkflowEvent::NodeStarted {
            node_id: step.id.clone(),
            run_id,
            node_type: step.node_type.clone(),
        });

        Prepared::Ready(StepJob {
            step,
            executor,
            context,
            timeout_ms,
        })
    }

    /// Execute a prepared step; touches no run state
    async fn run_step<'a>(&self, run_id: &str, job: StepJob<'a>) -> FinishedStep<'a> {
        let started = Instant::now();
        let step = job.step;

        if let Some(definition) = job.executor.definition() {
            let problems = definition.check_config(&step.data.config);
            if !problems.is_empty() {
                return FinishedStep {
                    step,
                    outcome: Err(WorkflowError::failed(format!(
                        "Invalid config for node '{}': {}",
                        step.id,
                        problems.join("; ")
                    ))),
                    attempts: 0,
                    duration: started.elapsed(),
                };
            }
        }

        let retries = AtomicU32::new(0);
        let on_retry = |attempt: u32, err: &WorkflowError| {
            retries.store(attempt, Ordering::SeqCst);
            self.emit(WorkflowEvent::NodeRetrying {
                node_id: step.id.clone(),
                run_id: run_id.to_string(),
                attempt,
                error: err.to_string(),
            });
        };

        let outcome = match job.timeout_ms {
            Some(timeout_ms) => {
                let timed = TimedExecutor {
                    inner: job.executor.as_ref(),
                    timeout_ms,
                };
                self.retry
                    .execute_with_retry(step, &job.context, &timed, Some(&on_retry))
                    .await
            }
            None => {
                self.retry
                    .execute_with_retry(step, &job.context, job.executor.as_ref(), Some(&on_retry))
                    .await
            }
        };

        let tried = retries.load(Ordering::SeqCst) + 1;
        let attempts = match &outcome {
            Err(err) => err.attempts().unwrap_or(tried),
            Ok(_) => tried,
        };

        FinishedStep {
            step,
            outcome,
            attempts,
            duration: started.elapsed(),
        }
    }

    /// Record a settled step; returns the error that halts the run, if any
    async fn settle(&self, run: &mut Run<'_>, finished: FinishedStep<'_>) -> Option<WorkflowError> {
        let FinishedStep {
            step,
            outcome,
            attempts,
            duration,
        } = finished;
        let run_id = run.base.run_id.clone();
        let duration_ms = duration.as_millis() as u64;

        match outcome {
            Ok(outcome) => {
                self.contexts
                    .record_step_output(&mut run.state, &step.id, &outcome);
                run.state
                    .results
                    .push(self.contexts.create_result_record(step, &outcome, duration, attempts));

                log::debug!("Step '{}' completed in {}ms", step.id, duration_ms);
                self.emit(WorkflowEvent::NodeCompleted {
                    node_id: step.id.clone(),
                    run_id,
                    output: outcome.output().cloned(),
                    duration_ms,
                });
                self.persist_progress(run, &step.id).await;
                None
            }
            Err(err) => {
                let message = err.to_string();
                run.failures += 1;
                run.state.results.push(self.contexts.create_result_record(
                    step,
                    &StepOutcome::failure(message.clone()),
                    duration,
                    attempts,
                ));

                log::warn!(
                    "Step '{}' failed after {} attempt(s): {}",
                    step.id,
                    attempts,
                    message
                );
                self.emit(WorkflowEvent::NodeFailed {
                    node_id: step.id.clone(),
                    run_id,
                    error: message,
                    attempts,
                });
                self.persist_progress(run, &step.id).await;

                if matches!(
                    err,
                    WorkflowError::Cancelled | WorkflowError::UnknownNodeType { .. }
                ) {
                    return Some(err);
                }
                if run.continue_on_error {
                    log::info!("Continuing after failure of step '{}'", step.id);
                    return None;
                }

                let message = match err {
                    WorkflowError::RetriesExhausted { message, .. } => message,
                    other => other.to_string(),
                };
                Some(WorkflowError::StepFailed {
                    node_id: step.id.clone(),
                    attempts,
                    message,
                })
            }
        }
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Err(e) = self.event_sink.send(event) {
            log::warn!("Failed to deliver workflow event: {}", e);
        }
    }

    async fn persist_progress(&self, run: &Run<'_>, last_node_id: &str) {
        let mut partial = self.snapshot(run, "running");
        partial.insert(
            "lastNodeId".to_string(),
            Value::String(last_node_id.to_string()),
        );
        self.persist(&run.base.run_id, partial).await;
    }

    async fn persist_status(&self, run: &Run<'_>, status: &str, error: Option<&WorkflowError>) {
        let mut partial = self.snapshot(run, status);
        if let Some(err) = error {
            partial.insert("error".to_string(), Value::String(err.to_string()));
        }
        self.persist(&run.base.run_id, partial).await;
    }

    fn snapshot(&self, run: &Run<'_>, status: &str) -> Map<String, Value> {
        let mut partial = Map::new();
        partial.insert(
            "workflowId".to_string(),
            Value::String(run.workflow.id.clone()),
        );
        partial.insert("status".to_string(), Value::String(status.to_string()));
        partial.insert(
            "nodeOutputs".to_string(),
            Value::Object(run.state.node_outputs.clone()),
        );
        partial.insert(
            "variables".to_string(),
            Value::Object(run.state.variables.clone()),
        );
        match serde_json::to_value(&run.state.results) {
            Ok(results) => {
                partial.insert("results".to_string(), results);
            }
            Err(e) => log::warn!("Failed to serialize step results: {}", e),
        }
        partial
    }

    async fn persist(&self, run_id: &str, partial: Map<String, Value>) {
        let Some(store) = &self.state_store else {
            return;
        };
        if let Err(e) = store.set_state(run_id, partial).await {
            log::warn!("Failed to persist state of run {}: {}", run_id, e);
        }
    }
}

/// Bounds every attempt of a step by its timeout
struct TimedExecutor<'a> {
    inner: &'a dyn StepExecutor,
    timeout_ms: u64,
}

#[async_trait]
impl<'a> StepExecutor for TimedExecutor<'a> {
    async fn execute(&self, step: &Step, context: &ExecutionContext) -> Result<StepOutcome> {
        let limit = Duration::from_millis(self.timeout_ms);
        match tokio::time::timeout(limit, self.inner.execute(step, context)).await {
            Ok(result) => result,
            Err(_) => Err(WorkflowError::Timeout {
                node_id: step.id.clone(),
                timeout_ms: self.timeout_ms,
            }),
        }
    }
}
