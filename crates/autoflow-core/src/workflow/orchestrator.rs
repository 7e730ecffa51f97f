//! Orchestrator: graph traversal state machine.
//!
//! One traversal runs per `execute_workflow` (or `resume_workflow`) call.
//! Each step is resolved, dispatched through the retry controller, escalated
//! to the fallback coordinator if retries run out, and checked by the approval
//! gate. A step's `parallel_steps` are spawned on a `JoinSet` and joined before
//! its `next_steps` run one at a time, in order.
//!
//! A join whose branches paused for approval is held: its shared
//! `next_steps` are stored on the context as a [`HeldJoin`] and run only once
//! every paused branch below it has been resumed to completion.
//!
//! All branches of one execution share a single `ExecutionContext` behind a
//! `tokio::sync::Mutex`. Handlers never see the live context, only a snapshot
//! taken when their step started.
//!
//! Failures stay local to their branch: the context is marked `Failed`, the
//! branch stops, and siblings already in flight run to completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use autoflow_types::config::EngineConfig;
use autoflow_types::event::ExecutionEvent;
use autoflow_types::execution::{
    ExecutionContext, HeldJoin, JoinBlocker, StepExecutionRecord, StepResult, StepStatus,
    WorkflowStatus,
};
use autoflow_types::workflow::{WorkflowDefinition, WorkflowStep};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::execution::ExecutionPersister;

use super::approval::{ApprovalDecision, ApprovalGate};
use super::condition;
use super::definition::WorkflowError;
use super::dispatcher::HandlerRegistry;
use super::fallback::FallbackCoordinator;
use super::handler::StepInvocation;
use super::planner::{BoxPlanner, build_definition};
use super::resolver::resolve_parameters;
use super::retry::{RetryController, RetryOutcome};
use super::store::WorkflowStore;

/// Variable set on executions started by `trigger_event`.
pub const EVENT_TYPE_VARIABLE: &str = "event_type";

// ---------------------------------------------------------------------------
// Active executions
// ---------------------------------------------------------------------------

/// In-memory state of an execution that is running or paused.
struct ActiveExecution {
    context: Mutex<ExecutionContext>,
    cancel: CancellationToken,
    /// Steps visited by the current traversal.
    hops: AtomicUsize,
    /// A traversal currently owns this execution.
    traversing: AtomicBool,
}

impl ActiveExecution {
    fn new(context: ExecutionContext, traversing: bool) -> Self {
        Self {
            context: Mutex::new(context),
            cancel: CancellationToken::new(),
            hops: AtomicUsize::new(0),
            traversing: AtomicBool::new(traversing),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct Inner<P> {
    store: Arc<WorkflowStore>,
    registry: Arc<HandlerRegistry>,
    retry: RetryController,
    fallback: Arc<FallbackCoordinator>,
    persister: P,
    planner: Option<BoxPlanner>,
    event_bus: EventBus,
    default_step_timeout_secs: f64,
    max_traversal_hops: usize,
    active: DashMap<Uuid, Arc<ActiveExecution>>,
    tracker: TaskTracker,
}

/// Workflow execution engine.
///
/// Cheap to clone: all clones share the same store, registry, persister and
/// active-execution index.
pub struct Orchestrator<P: ExecutionPersister + 'static> {
    inner: Arc<Inner<P>>,
}

impl<P: ExecutionPersister + 'static> Clone for Orchestrator<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: ExecutionPersister + 'static> Orchestrator<P> {
    pub fn builder(persister: P) -> OrchestratorBuilder<P> {
        OrchestratorBuilder::new(persister)
    }

    pub fn store(&self) -> &Arc<WorkflowStore> {
        &self.inner.store
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    pub fn persister(&self) -> &P {
        &self.inner.persister
    }

    /// Ids of executions currently running or paused in this process.
    pub fn active_executions(&self) -> Vec<Uuid> {
        self.inner.active.iter().map(|e| *e.key()).collect()
    }

    // ----- Public operations -----

    /// Run a registered workflow until it reaches a terminal status or pauses
    /// for approval.
    ///
    /// Errors only for an unknown `workflow_id`; step failures are reported
    /// through the returned context's `status` and `error_message`.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        input_data: Value,
        context: Option<ExecutionContext>,
    ) -> Result<ExecutionContext, WorkflowError> {
        let def = self.inner.store.get(workflow_id).await?;

        let mut ctx = match context {
            Some(mut ctx) => {
                ctx.workflow_id = def.id.clone();
                if !input_data.is_null() {
                    ctx.seed_input(input_data);
                }
                ctx
            }
            None => ExecutionContext::new(def.id.clone(), input_data),
        };
        ctx.status = WorkflowStatus::Running;
        let execution_id = ctx.execution_id;

        let active = Arc::new(ActiveExecution::new(ctx, true));
        self.inner.active.insert(execution_id, Arc::clone(&active));

        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %def.id,
            start_step = %def.start_step,
            "workflow execution started"
        );
        self.inner.event_bus.publish(ExecutionEvent::RunStarted {
            execution_id,
            workflow_id: def.id.clone(),
        });

        let start = def.start_step.clone();
        self.clone()
            .run_branch(Arc::clone(&active), def, start)
            .await;

        Ok(self.finalize(&active).await)
    }

    /// Approve a paused step and continue traversal from it.
    ///
    /// Returns the context unchanged when `step_id` is not awaiting approval.
    pub async fn resume_workflow(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<ExecutionContext, WorkflowError> {
        let active = self.load_active(execution_id).await?;

        let (def, step, next) = {
            let mut ctx = active.context.lock().await;
            if active.traversing.load(Ordering::SeqCst) {
                return Err(WorkflowError::ExecutionBusy(execution_id));
            }
            if !ApprovalGate::is_awaiting(&ctx, step_id) {
                tracing::debug!(
                    execution_id = %execution_id,
                    step_id,
                    status = %ctx.status,
                    "resume ignored, step is not awaiting approval"
                );
                return Ok(ctx.clone());
            }

            let def = self.inner.store.get(&ctx.workflow_id).await?;
            let step = def.step(step_id).cloned().ok_or_else(|| {
                WorkflowError::Validation(format!(
                    "step '{step_id}' no longer exists in workflow '{}'",
                    def.id
                ))
            })?;

            ctx.status = WorkflowStatus::Running;
            ctx.current_step = Some(step_id.to_string());
            let next = match ctx.results.get_mut(step_id) {
                Some(result) => {
                    result.status = StepStatus::Completed;
                    result.next_steps.clone()
                }
                None => None,
            }
            .unwrap_or_else(|| step.next_steps.clone());

            active.hops.store(0, Ordering::SeqCst);
            active.traversing.store(true, Ordering::SeqCst);
            (def, step, next)
        };

        tracing::info!(execution_id = %execution_id, step_id, "execution resumed");
        self.inner.event_bus.publish(ExecutionEvent::RunResumed {
            execution_id,
            step_id: step_id.to_string(),
        });

        let blockers = self.continue_from(&active, &def, &step, next).await;
        self.release_held_joins(&active, &def, JoinBlocker::Step(step_id.to_string()), blockers)
            .await;
        Ok(self.finalize(&active).await)
    }

    /// Start one background execution per definition triggered by
    /// `event_type`. Returns how many were started.
    pub async fn trigger_event(&self, event_type: &str, data: Value) -> usize {
        let matches = self.inner.store.find_by_trigger(event_type).await;

        for def in &matches {
            let mut ctx = ExecutionContext::new(def.id.clone(), data.clone());
            ctx.variables
                .insert(EVENT_TYPE_VARIABLE.to_string(), json!(event_type));

            let orchestrator = self.clone();
            let workflow_id = def.id.clone();
            let event_type = event_type.to_string();
            self.inner.tracker.spawn(async move {
                match orchestrator
                    .execute_workflow(&workflow_id, Value::Null, Some(ctx))
                    .await
                {
                    Ok(ctx) => tracing::info!(
                        execution_id = %ctx.execution_id,
                        workflow_id = %workflow_id,
                        event_type = %event_type,
                        status = %ctx.status,
                        "triggered execution finished"
                    ),
                    Err(e) => tracing::warn!(
                        workflow_id = %workflow_id,
                        event_type = %event_type,
                        error = %e,
                        "triggered execution could not start"
                    ),
                }
            });
        }

        tracing::info!(event_type, matched = matches.len(), "event triggered workflows");
        matches.len()
    }

    /// Wait for every background execution started by `trigger_event`.
    pub async fn drain_background(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Stop accepting tracked work and wait for in-flight triggered runs.
    pub async fn shutdown(&self) {
        self.inner.tracker.close();
        let pending = self.inner.tracker.len();
        if pending > 0 {
            tracing::info!(pending, "waiting for triggered executions to finish");
        }
        self.inner.tracker.wait().await;
    }

    /// Cancel a running or paused execution. Terminal executions are returned
    /// unchanged.
    pub async fn cancel_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<ExecutionContext, WorkflowError> {
        let active = self
            .inner
            .active
            .get(&execution_id)
            .map(|e| Arc::clone(e.value()));

        let Some(active) = active else {
            let mut ctx = self
                .inner
                .persister
                .load(&execution_id)
                .await?
                .ok_or(WorkflowError::ExecutionNotFound(execution_id))?;
            if ctx.status.is_terminal() {
                return Ok(ctx);
            }
            ctx.status = WorkflowStatus::Cancelled;
            ctx.current_step = None;
            ctx.completed_at = Some(Utc::now());
            self.inner.persister.save(&ctx).await?;
            tracing::info!(execution_id = %execution_id, "stored execution cancelled");
            self.inner
                .event_bus
                .publish(ExecutionEvent::RunCancelled { execution_id });
            return Ok(ctx);
        };

        let idle = {
            let mut ctx = active.context.lock().await;
            if ctx.status.is_terminal() {
                return Ok(ctx.clone());
            }
            active.cancel.cancel();
            ctx.status = WorkflowStatus::Cancelled;
            tracing::info!(execution_id = %execution_id, "execution cancelled");
            !active.traversing.load(Ordering::SeqCst)
        };

        if idle {
            Ok(self.finalize(&active).await)
        } else {
            Ok(active.context.lock().await.clone())
        }
    }

    /// Current state of an execution, live if it is active here, else from
    /// the persister.
    pub async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionContext>, WorkflowError> {
        let active = self
            .inner
            .active
            .get(&execution_id)
            .map(|e| Arc::clone(e.value()));
        if let Some(active) = active {
            return Ok(Some(active.context.lock().await.clone()));
        }
        Ok(self.inner.persister.load(&execution_id).await?)
    }

    /// Executions paused for approval, newest first.
    pub async fn list_waiting_approvals(
        &self,
        limit: u32,
    ) -> Result<Vec<ExecutionContext>, WorkflowError> {
        Ok(self
            .inner
            .persister
            .list_by_status(WorkflowStatus::WaitingApproval, limit)
            .await?)
    }

    /// Ask the planner to decompose `query`, then register the resulting
    /// definition.
    pub async fn generate_workflow(
        &self,
        query: &str,
        provider_hint: Option<&str>,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        let planner = self
            .inner
            .planner
            .as_ref()
            .ok_or_else(|| WorkflowError::Planner("no planner configured".to_string()))?;

        let plan = planner
            .decompose(query, provider_hint)
            .await
            .map_err(|e| WorkflowError::Planner(e.to_string()))?;
        let def = build_definition(plan, query)?;
        self.inner.store.register(def.clone()).await?;

        tracing::info!(
            workflow_id = %def.id,
            steps = def.steps.len(),
            "generated workflow from request"
        );
        Ok(def)
    }

    // ----- Traversal -----

    /// Execute one step and everything downstream of it.
    ///
    /// Resolves to whatever in this subtree is still waiting for approval:
    /// paused steps and held joins. Empty when the subtree ran to the end or
    /// failed.
    fn run_branch(
        self,
        active: Arc<ActiveExecution>,
        def: Arc<WorkflowDefinition>,
        step_id: String,
    ) -> BoxFuture<'static, Vec<JoinBlocker>> {
        Box::pin(async move {
            if active.cancel.is_cancelled() {
                return Vec::new();
            }

            let hops = active.hops.fetch_add(1, Ordering::SeqCst) + 1;
            if hops > self.inner.max_traversal_hops {
                let message = format!(
                    "traversal exceeded {} step visits at '{step_id}'",
                    self.inner.max_traversal_hops
                );
                self.fail_execution(&active, &step_id, message).await;
                return Vec::new();
            }

            let Some(step) = def.step(&step_id).cloned() else {
                let message = format!("unknown step '{step_id}' in workflow '{}'", def.id);
                self.fail_execution(&active, &step_id, message).await;
                return Vec::new();
            };

            let (execution_id, parameters, snapshot) = {
                let mut ctx = active.context.lock().await;
                ctx.current_step = Some(step_id.clone());
                // Guard conditions are evaluated for visibility only; branch
                // selection belongs to conditional_logic steps.
                if let Some(expression) = &step.condition {
                    let passed = condition::evaluate(expression, &ctx);
                    tracing::debug!(
                        step_id = %step_id,
                        condition = %expression,
                        passed,
                        "step guard evaluated"
                    );
                }
                let parameters = resolve_parameters(&step.parameters, &ctx);
                (ctx.execution_id, parameters, ctx.clone())
            };

            tracing::debug!(execution_id = %execution_id, step_id = %step_id, "step started");
            self.inner.event_bus.publish(ExecutionEvent::StepStarted {
                execution_id,
                step_id: step_id.clone(),
                step_type: step.step_type.to_string(),
            });

            let started_at = Utc::now();
            let start = tokio::time::Instant::now();

            let registry = &self.inner.registry;
            let (step_ref, params_ref, snapshot_ref) = (&step, &parameters, &snapshot);
            let RetryOutcome { result, attempts } = self
                .inner
                .retry
                .run(
                    execution_id,
                    &step,
                    step.timeout(self.inner.default_step_timeout_secs),
                    &active.cancel,
                    move |attempt| {
                        registry.dispatch(StepInvocation {
                            execution_id,
                            step: step_ref,
                            parameters: params_ref,
                            context: snapshot_ref,
                            attempt,
                        })
                    },
                )
                .await;

            let (result, recovered) = match result {
                Ok(result) => (Ok(result), false),
                Err(failure) if active.cancel.is_cancelled() => (Err(failure), false),
                Err(failure) => match self
                    .inner
                    .fallback
                    .recover(execution_id, &step, &parameters, failure)
                    .await
                {
                    Ok(result) => (Ok(result), true),
                    Err(exhausted) => (Err(exhausted.original), false),
                },
            };

            let duration_ms = start.elapsed().as_millis() as u64;
            let mut record = StepExecutionRecord {
                step_id: step_id.clone(),
                step_type: step.step_type.clone(),
                status: StepStatus::Completed,
                attempts,
                started_at,
                completed_at: Utc::now(),
                duration_ms,
                error: None,
                recovered_by_fallback: recovered,
            };

            let mut result = match result {
                Ok(result) => result,
                Err(failure) => {
                    record.status = StepStatus::Failed;
                    record.error = Some(failure.message.clone());
                    active.context.lock().await.history.push(record);
                    self.fail_execution(&active, &step_id, failure.message).await;
                    return Vec::new();
                }
            };
            result.duration_ms = duration_ms;

            match ApprovalGate::check(&step, &result) {
                ApprovalDecision::Pause {
                    confidence,
                    threshold,
                } => {
                    self.pause_branch(&active, &step_id, result, record, confidence, threshold)
                        .await;
                    vec![JoinBlocker::Step(step_id)]
                }
                ApprovalDecision::Proceed => {
                    let next = {
                        let mut ctx = active.context.lock().await;
                        ctx.variables
                            .extend(result.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
                        let next = result
                            .next_steps
                            .clone()
                            .unwrap_or_else(|| step.next_steps.clone());
                        ctx.results.insert(step_id.clone(), result);
                        ctx.history.push(record);
                        next
                    };

                    tracing::debug!(
                        execution_id = %execution_id,
                        step_id = %step_id,
                        duration_ms,
                        attempts,
                        "step completed"
                    );
                    self.inner.event_bus.publish(ExecutionEvent::StepCompleted {
                        execution_id,
                        step_id: step_id.clone(),
                        duration_ms,
                    });

                    self.continue_from(&active, &def, &step, next).await
                }
            }
        })
    }

    /// Run `step`'s parallel fan-out, join it, then walk `next` in order.
    ///
    /// When a parallel branch paused, `next` is held on the context instead
    /// and the held join is reported to the caller as the only blocker.
    async fn continue_from(
        &self,
        active: &Arc<ActiveExecution>,
        def: &Arc<WorkflowDefinition>,
        step: &WorkflowStep,
        next: Vec<String>,
    ) -> Vec<JoinBlocker> {
        let mut blockers = Vec::new();

        if !step.parallel_steps.is_empty() {
            let mut join_set = JoinSet::new();
            for branch in &step.parallel_steps {
                join_set.spawn(self.clone().run_branch(
                    Arc::clone(active),
                    Arc::clone(def),
                    branch.clone(),
                ));
            }
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(waiting) => blockers.extend(waiting),
                    Err(e) => {
                        let message =
                            format!("parallel branch of '{}' aborted: {e}", step.step_id);
                        self.fail_execution(active, &step.step_id, message).await;
                    }
                }
            }

            if !blockers.is_empty() && !next.is_empty() {
                return vec![self.hold_join(active, step, blockers, next).await];
            }
        }

        blockers.extend(self.run_sequence(active, def, next).await);
        blockers
    }

    /// Run `steps` one after another, collecting what each leaves waiting.
    async fn run_sequence(
        &self,
        active: &Arc<ActiveExecution>,
        def: &Arc<WorkflowDefinition>,
        steps: Vec<String>,
    ) -> Vec<JoinBlocker> {
        let mut blockers = Vec::new();
        for next_id in steps {
            if active.cancel.is_cancelled() {
                break;
            }
            let waiting = self
                .clone()
                .run_branch(Arc::clone(active), Arc::clone(def), next_id)
                .await;
            blockers.extend(waiting);
        }
        blockers
    }

    async fn hold_join(
        &self,
        active: &ActiveExecution,
        fork: &WorkflowStep,
        waiting_on: Vec<JoinBlocker>,
        next_steps: Vec<String>,
    ) -> JoinBlocker {
        let join_id = Uuid::now_v7();
        let mut ctx = active.context.lock().await;
        tracing::info!(
            execution_id = %ctx.execution_id,
            fork_step = %fork.step_id,
            waiting = waiting_on.len(),
            held = ?next_steps,
            "parallel join held until paused branches are approved"
        );
        ctx.held_joins.push(HeldJoin {
            join_id,
            fork_step: fork.step_id.clone(),
            waiting_on,
            next_steps,
        });
        JoinBlocker::Join(join_id)
    }

    /// `resolved` has finished, leaving `replacement` waiting in its place.
    /// Substitute it in the held join that was waiting on it; a join left with
    /// nothing to wait for runs its `next_steps` and resolves in turn.
    async fn release_held_joins(
        &self,
        active: &Arc<ActiveExecution>,
        def: &Arc<WorkflowDefinition>,
        mut resolved: JoinBlocker,
        mut replacement: Vec<JoinBlocker>,
    ) {
        loop {
            let released = {
                let mut ctx = active.context.lock().await;
                let Some(pos) = ctx
                    .held_joins
                    .iter()
                    .position(|join| join.waiting_on.contains(&resolved))
                else {
                    return;
                };
                let join = &mut ctx.held_joins[pos];
                join.waiting_on.retain(|b| b != &resolved);
                join.waiting_on.append(&mut replacement);
                if !join.waiting_on.is_empty() {
                    return;
                }
                ctx.held_joins.remove(pos)
            };

            if active.cancel.is_cancelled() {
                return;
            }
            tracing::info!(
                fork_step = %released.fork_step,
                next = ?released.next_steps,
                "held parallel join released"
            );
            replacement = self.run_sequence(active, def, released.next_steps).await;
            resolved = JoinBlocker::Join(released.join_id);
        }
    }

    /// Record a result that needs approval and persist before the branch
    /// stops.
    async fn pause_branch(
        &self,
        active: &ActiveExecution,
        step_id: &str,
        mut result: StepResult,
        mut record: StepExecutionRecord,
        confidence: f64,
        threshold: f64,
    ) {
        result.status = StepStatus::WaitingApproval;
        record.status = StepStatus::WaitingApproval;

        let mut ctx = active.context.lock().await;
        ctx.variables
            .extend(result.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        ctx.results.insert(step_id.to_string(), result);
        ctx.history.push(record);
        if ctx.status == WorkflowStatus::Running {
            ctx.status = WorkflowStatus::WaitingApproval;
        }
        let execution_id = ctx.execution_id;

        if let Err(e) = self.inner.persister.save(&ctx).await {
            tracing::error!(
                execution_id = %execution_id,
                step_id,
                error = %e,
                "failed to persist execution before approval pause"
            );
            if ctx.status != WorkflowStatus::Cancelled {
                ctx.status = WorkflowStatus::Failed;
            }
            if ctx.error_message.is_none() {
                ctx.error_message = Some(format!(
                    "failed to persist execution before approval pause: {e}"
                ));
            }
            return;
        }

        if ctx.status == WorkflowStatus::WaitingApproval {
            tracing::info!(
                execution_id = %execution_id,
                step_id,
                confidence,
                threshold,
                "step awaiting approval"
            );
            self.inner.event_bus.publish(ExecutionEvent::RunPaused {
                execution_id,
                step_id: step_id.to_string(),
                confidence,
                threshold,
            });
        }
    }

    async fn fail_execution(&self, active: &ActiveExecution, step_id: &str, message: String) {
        let mut ctx = active.context.lock().await;
        tracing::error!(
            execution_id = %ctx.execution_id,
            step_id,
            error = %message,
            "branch failed"
        );
        if ctx.status != WorkflowStatus::Cancelled {
            ctx.status = WorkflowStatus::Failed;
        }
        if ctx.error_message.is_none() {
            ctx.error_message = Some(message);
        }
    }

    /// Settle the status once a traversal returns, persist, and publish the
    /// outcome.
    async fn finalize(&self, active: &ActiveExecution) -> ExecutionContext {
        let snapshot = {
            let mut ctx = active.context.lock().await;
            ctx.current_step = None;
            match ctx.status {
                WorkflowStatus::Pending | WorkflowStatus::Running => {
                    if ctx.has_pending_approval() {
                        ctx.status = WorkflowStatus::WaitingApproval;
                    } else {
                        ctx.status = WorkflowStatus::Completed;
                        ctx.completed_at = Some(Utc::now());
                    }
                }
                WorkflowStatus::Failed | WorkflowStatus::Cancelled => {
                    if ctx.completed_at.is_none() {
                        ctx.completed_at = Some(Utc::now());
                    }
                }
                WorkflowStatus::Completed | WorkflowStatus::WaitingApproval => {}
            }

            if let Err(e) = self.inner.persister.save(&ctx).await {
                tracing::error!(
                    execution_id = %ctx.execution_id,
                    status = %ctx.status,
                    error = %e,
                    "failed to persist execution"
                );
            }
            active.traversing.store(false, Ordering::SeqCst);
            ctx.clone()
        };

        let execution_id = snapshot.execution_id;
        match snapshot.status {
            WorkflowStatus::Completed => {
                let duration_ms = snapshot
                    .completed_at
                    .map(|done| (done - snapshot.started_at).num_milliseconds().max(0) as u64)
                    .unwrap_or(0);
                tracing::info!(
                    execution_id = %execution_id,
                    steps = snapshot.history.len(),
                    duration_ms,
                    "workflow execution completed"
                );
                self.inner.event_bus.publish(ExecutionEvent::RunCompleted {
                    execution_id,
                    duration_ms,
                });
            }
            WorkflowStatus::Failed => {
                let error = snapshot
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                tracing::warn!(execution_id = %execution_id, error = %error, "workflow execution failed");
                self.inner
                    .event_bus
                    .publish(ExecutionEvent::RunFailed { execution_id, error });
            }
            WorkflowStatus::Cancelled => {
                self.inner
                    .event_bus
                    .publish(ExecutionEvent::RunCancelled { execution_id });
            }
            WorkflowStatus::WaitingApproval => {
                tracing::info!(
                    execution_id = %execution_id,
                    pending = ?snapshot.pending_approvals(),
                    "workflow execution paused"
                );
            }
            WorkflowStatus::Pending | WorkflowStatus::Running => {}
        }

        if snapshot.status.is_terminal() {
            self.inner.active.remove(&execution_id);
        }
        snapshot
    }

    /// Active handle for an execution, loading it from the persister when
    /// this process does not hold it.
    async fn load_active(
        &self,
        execution_id: Uuid,
    ) -> Result<Arc<ActiveExecution>, WorkflowError> {
        if let Some(active) = self.inner.active.get(&execution_id) {
            return Ok(Arc::clone(active.value()));
        }

        let ctx = self
            .inner
            .persister
            .load(&execution_id)
            .await?
            .ok_or(WorkflowError::ExecutionNotFound(execution_id))?;
        let terminal = ctx.status.is_terminal();
        let loaded = Arc::new(ActiveExecution::new(ctx, false));
        if terminal {
            return Ok(loaded);
        }
        let entry = self.inner.active.entry(execution_id).or_insert(loaded);
        Ok(Arc::clone(entry.value()))
    }
}

impl<P: ExecutionPersister + 'static> std::fmt::Debug for Orchestrator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.inner.registry)
            .field("fallback", &self.inner.fallback)
            .field("active", &self.inner.active.len())
            .field("max_traversal_hops", &self.inner.max_traversal_hops)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Wires an [`Orchestrator`] from explicitly injected collaborators.
pub struct OrchestratorBuilder<P> {
    persister: P,
    store: Option<Arc<WorkflowStore>>,
    registry: Option<Arc<HandlerRegistry>>,
    fallback: Option<FallbackCoordinator>,
    event_bus: Option<EventBus>,
    planner: Option<BoxPlanner>,
    event_bus_capacity: usize,
    default_step_timeout_secs: f64,
    max_traversal_hops: usize,
}

impl<P: ExecutionPersister + 'static> OrchestratorBuilder<P> {
    fn new(persister: P) -> Self {
        let defaults = EngineConfig::default();
        Self {
            persister,
            store: None,
            registry: None,
            fallback: None,
            event_bus: None,
            planner: None,
            event_bus_capacity: defaults.event_bus_capacity,
            default_step_timeout_secs: defaults.default_step_timeout_secs,
            max_traversal_hops: defaults.max_traversal_hops,
        }
    }

    /// Apply engine limits from configuration.
    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.event_bus_capacity = config.event_bus_capacity;
        self.default_step_timeout_secs = config.default_step_timeout_secs;
        self.max_traversal_hops = config.max_traversal_hops;
        self
    }

    pub fn store(mut self, store: Arc<WorkflowStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to a registry holding only the built-in handlers.
    pub fn registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn fallback(mut self, fallback: FallbackCoordinator) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn planner(mut self, planner: BoxPlanner) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn max_traversal_hops(mut self, hops: usize) -> Self {
        self.max_traversal_hops = hops;
        self
    }

    pub fn build(self) -> Orchestrator<P> {
        let event_bus = self
            .event_bus
            .unwrap_or_else(|| EventBus::new(self.event_bus_capacity));
        let fallback = self
            .fallback
            .unwrap_or_default()
            .with_event_bus(event_bus.clone());

        Orchestrator {
            inner: Arc::new(Inner {
                store: self.store.unwrap_or_default(),
                registry: self
                    .registry
                    .unwrap_or_else(|| Arc::new(HandlerRegistry::with_builtins())),
                retry: RetryController::new(event_bus.clone()),
                fallback: Arc::new(fallback),
                persister: self.persister,
                planner: self.planner,
                event_bus,
                default_step_timeout_secs: self.default_step_timeout_secs,
                max_traversal_hops: self.max_traversal_hops.max(1),
                active: DashMap::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::execution::InMemoryPersister;
    use crate::workflow::definition::parse_workflow_yaml;
    use crate::workflow::fallback::{FallbackAgent, FallbackError, SELF_HEALED_STATUS};
    use crate::workflow::handler::{FnStepHandler, HandlerError, StepHandler};
    use crate::workflow::planner::{Planner, PlannerError};
    use autoflow_types::fallback::FallbackOutcome;
    use autoflow_types::planner::{PlannedStep, PlannedWorkflow};
    use autoflow_types::workflow::StepType;
    use std::collections::HashMap;
    use std::time::Duration;

    type TestOrchestrator = Orchestrator<Arc<InMemoryPersister>>;

    fn setup() -> (TestOrchestrator, Arc<InMemoryPersister>) {
        let persister = Arc::new(InMemoryPersister::new());
        let orchestrator = Orchestrator::builder(Arc::clone(&persister)).build();
        (orchestrator, persister)
    }

    async fn register(orchestrator: &TestOrchestrator, yaml: &str) {
        let def = parse_workflow_yaml(yaml).unwrap();
        orchestrator.store().register(def).await.unwrap();
    }

    /// Handler that always completes with `output`.
    fn echo(
        output: Value,
    ) -> FnStepHandler<impl Fn(StepInvocation<'_>) -> Result<StepResult, HandlerError> + Send + Sync>
    {
        FnStepHandler::new(move |_: StepInvocation<'_>| Ok(StepResult::completed(output.clone())))
    }

    const TWO_STEP: &str = r#"
id: two-step
name: Two step
start_step: s1
steps:
  - id: s1
    type: slack
    next_steps: [s2]
  - id: s2
    type: gmail
"#;

    #[tokio::test]
    async fn sequential_workflow_completes() {
        let (orchestrator, persister) = setup();
        register(&orchestrator, TWO_STEP).await;
        orchestrator
            .registry()
            .register_handler(StepType::Slack, echo(json!({"ts": "1"})));
        orchestrator
            .registry()
            .register_handler(StepType::Gmail, echo(json!({"sent": true})));

        let ctx = orchestrator
            .execute_workflow("two-step", json!({"user": "ana"}), None)
            .await
            .unwrap();

        assert_eq!(ctx.status, WorkflowStatus::Completed);
        assert_eq!(ctx.history.len(), 2);
        assert!(ctx.results.contains_key("s1"));
        assert!(ctx.results.contains_key("s2"));
        assert!(ctx.completed_at.is_some());
        assert_eq!(ctx.variables["user"], json!("ana"));
        assert!(orchestrator.active_executions().is_empty());

        let stored = persister.load(&ctx.execution_id).await.unwrap().unwrap();
        assert_eq!(stored, ctx);
    }

    #[tokio::test]
    async fn unknown_workflow_is_an_error() {
        let (orchestrator, _) = setup();
        let err = orchestrator
            .execute_workflow("missing", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn templates_read_earlier_outputs() {
        let (orchestrator, _) = setup();
        register(
            &orchestrator,
            r#"
id: tickets
name: Tickets
start_step: create
steps:
  - id: create
    type: notion
    next_steps: [announce]
  - id: announce
    type: slack
    parameters:
      text: "Ticket {{create.ticket}} opened by {{user}}"
      ticket: "{{create.ticket}}"
"#,
        )
        .await;
        orchestrator
            .registry()
            .register_handler(StepType::Notion, echo(json!({"ticket": 42})));
        orchestrator.registry().register_handler(
            StepType::Slack,
            FnStepHandler::new(|inv: StepInvocation<'_>| {
                Ok(StepResult::completed(json!({
                    "text": inv.parameters["text"].clone(),
                    "ticket": inv.parameters["ticket"].clone(),
                })))
            }),
        );

        let ctx = orchestrator
            .execute_workflow("tickets", json!({"user": "ana"}), None)
            .await
            .unwrap();
        let output = &ctx.results["announce"].output;
        assert_eq!(output["text"], json!("Ticket 42 opened by ana"));
        assert_eq!(output["ticket"], json!(42));

        let def = orchestrator.store().get("tickets").await.unwrap();
        assert_eq!(
            def.step("announce").unwrap().parameters["ticket"],
            json!("{{create.ticket}}")
        );
    }

    #[tokio::test]
    async fn low_confidence_pauses_until_resumed() {
        let (orchestrator, persister) = setup();
        register(
            &orchestrator,
            r#"
id: review
name: Review
start_step: draft
steps:
  - id: draft
    type: ai_analysis
    confidence_threshold: 0.9
"#,
        )
        .await;
        orchestrator.registry().register_handler(
            StepType::AiAnalysis,
            FnStepHandler::new(|_: StepInvocation<'_>| {
                Ok(StepResult::completed(json!({"summary": "..."})).with_confidence(0.5))
            }),
        );
        let mut events = orchestrator.event_bus().subscribe();

        let paused = orchestrator
            .execute_workflow("review", Value::Null, None)
            .await
            .unwrap();
        assert_eq!(paused.status, WorkflowStatus::WaitingApproval);
        assert_eq!(paused.results["draft"].status, StepStatus::WaitingApproval);
        assert_eq!(
            persister
                .load(&paused.execution_id)
                .await
                .unwrap()
                .unwrap()
                .status,
            WorkflowStatus::WaitingApproval
        );
        let waiting = orchestrator.list_waiting_approvals(10).await.unwrap();
        assert_eq!(waiting.len(), 1);

        let resumed = orchestrator
            .resume_workflow(paused.execution_id, "draft")
            .await
            .unwrap();
        assert_eq!(resumed.status, WorkflowStatus::Completed);
        assert_eq!(resumed.results["draft"].status, StepStatus::Completed);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let resumed_at = seen
            .iter()
            .position(|e| matches!(e, ExecutionEvent::RunResumed { .. }))
            .unwrap();
        let completed_at = seen
            .iter()
            .position(|e| matches!(e, ExecutionEvent::RunCompleted { .. }))
            .unwrap();
        assert!(resumed_at < completed_at);

        let again = orchestrator
            .resume_workflow(paused.execution_id, "draft")
            .await
            .unwrap();
        assert_eq!(again, resumed);
    }

    #[tokio::test]
    async fn resume_continues_into_next_steps() {
        let (orchestrator, _) = setup();
        register(
            &orchestrator,
            r#"
id: approve-then-send
name: Approve then send
start_step: draft
steps:
  - id: draft
    type: ai_analysis
    confidence_threshold: 0.8
    next_steps: [send]
  - id: send
    type: gmail
"#,
        )
        .await;
        orchestrator.registry().register_handler(
            StepType::AiAnalysis,
            FnStepHandler::new(|_: StepInvocation<'_>| {
                Ok(StepResult::completed(json!("draft")).with_confidence(0.2))
            }),
        );
        orchestrator
            .registry()
            .register_handler(StepType::Gmail, echo(json!("sent")));

        let paused = orchestrator
            .execute_workflow("approve-then-send", Value::Null, None)
            .await
            .unwrap();
        assert!(!paused.results.contains_key("send"));

        let ignored = orchestrator
            .resume_workflow(paused.execution_id, "send")
            .await
            .unwrap();
        assert_eq!(ignored.status, WorkflowStatus::WaitingApproval);

        let done = orchestrator
            .resume_workflow(paused.execution_id, "draft")
            .await
            .unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.results["send"].output, json!("sent"));
    }

    #[tokio::test]
    async fn resume_unknown_execution_is_not_found() {
        let (orchestrator, _) = setup();
        let err = orchestrator
            .resume_workflow(Uuid::now_v7(), "draft")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ExecutionNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_then_fail() {
        let (orchestrator, _) = setup();
        register(
            &orchestrator,
            r#"
id: flaky
name: Flaky
start_step: call
steps:
  - id: call
    type: http_request
    retry_policy:
      max_retries: 2
      initial_delay_secs: 1.0
      exponential_base: 2.0
"#,
        )
        .await;
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&calls);
        orchestrator.registry().register_handler(
            StepType::HttpRequest,
            FnStepHandler::new(move |_: StepInvocation<'_>| {
                recorded.lock().unwrap().push(tokio::time::Instant::now());
                Err(HandlerError::Failed("connection timeout".into()))
            }),
        );

        let ctx = orchestrator
            .execute_workflow("flaky", Value::Null, None)
            .await
            .unwrap();

        assert_eq!(ctx.status, WorkflowStatus::Failed);
        assert_eq!(ctx.error_message.as_deref(), Some("connection timeout"));
        assert_eq!(ctx.history.len(), 1);
        assert_eq!(ctx.history[0].attempts, 3);
        assert_eq!(ctx.history[0].status, StepStatus::Failed);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1] - calls[0], Duration::from_secs(1));
        assert_eq!(calls[2] - calls[1], Duration::from_secs(2));
    }

    #[tokio::test]
    async fn parallel_branches_join_before_next_step() {
        let (orchestrator, _) = setup();
        register(
            &orchestrator,
            r#"
id: fan
name: Fan out
start_step: start
steps:
  - id: start
    type: data_transform
    parallel_steps: [a, b, c]
    next_steps: [d]
  - id: a
    type: slack
  - id: b
    type: notion
  - id: c
    type: hubspot
  - id: d
    type: gmail
"#,
        )
        .await;
        for step_type in [StepType::Slack, StepType::Notion, StepType::Hubspot, StepType::Gmail] {
            orchestrator
                .registry()
                .register_handler(step_type, echo(json!("ok")));
        }

        for _ in 0..5 {
            let ctx = orchestrator
                .execute_workflow("fan", Value::Null, None)
                .await
                .unwrap();
            assert_eq!(ctx.status, WorkflowStatus::Completed);
            assert_eq!(ctx.history.len(), 5);
            let d = ctx.history_index("d").unwrap();
            for branch in ["a", "b", "c"] {
                assert!(ctx.history_index(branch).unwrap() < d);
            }
        }
    }

    #[tokio::test]
    async fn failing_branch_does_not_stop_siblings() {
        let (orchestrator, _) = setup();
        register(
            &orchestrator,
            r#"
id: partial
name: Partial failure
start_step: start
steps:
  - id: start
    type: data_transform
    parallel_steps: [bad, good]
  - id: bad
    type: salesforce
    next_steps: [after_bad]
  - id: after_bad
    type: slack
  - id: good
    type: notion
"#,
        )
        .await;
        orchestrator.registry().register_handler(
            StepType::Salesforce,
            FnStepHandler::new(|_: StepInvocation<'_>| {
                Err(HandlerError::Permanent("invalid credentials".into()))
            }),
        );
        orchestrator
            .registry()
            .register_handler(StepType::Notion, echo(json!("page")));
        orchestrator
            .registry()
            .register_handler(StepType::Slack, echo(json!("msg")));

        let ctx = orchestrator
            .execute_workflow("partial", Value::Null, None)
            .await
            .unwrap();
        assert_eq!(ctx.status, WorkflowStatus::Failed);
        assert_eq!(ctx.error_message.as_deref(), Some("invalid credentials"));
        assert!(ctx.results.contains_key("good"));
        assert!(!ctx.results.contains_key("after_bad"));
    }

    struct RecoveringAgent;

    impl FallbackAgent for RecoveringAgent {
        fn name(&self) -> &str {
            "browser"
        }

        fn should_fallback(&self, _error: &str) -> bool {
            true
        }

        async fn execute_fallback(
            &self,
            service_key: &str,
            _goal: &str,
            _parameters: &HashMap<String, Value>,
        ) -> Result<FallbackOutcome, FallbackError> {
            Ok(FallbackOutcome::success("browser", json!({"service": service_key})))
        }
    }

    #[tokio::test]
    async fn fallback_recovers_failed_step() {
        let persister = Arc::new(InMemoryPersister::new());
        let orchestrator = Orchestrator::builder(Arc::clone(&persister))
            .fallback(FallbackCoordinator::new().with_agent(RecoveringAgent))
            .build();
        register(
            &orchestrator,
            r#"
id: crm
name: CRM sync
start_step: lead
steps:
  - id: lead
    type: salesforce
    description: Create the lead
    next_steps: [notify]
  - id: notify
    type: slack
"#,
        )
        .await;
        orchestrator.registry().register_handler(
            StepType::Salesforce,
            FnStepHandler::new(|_: StepInvocation<'_>| {
                Err(HandlerError::Permanent("API quota exceeded".into()))
            }),
        );
        orchestrator
            .registry()
            .register_handler(StepType::Slack, echo(json!("posted")));

        let ctx = orchestrator
            .execute_workflow("crm", Value::Null, None)
            .await
            .unwrap();
        assert_eq!(ctx.status, WorkflowStatus::Completed);
        assert_eq!(ctx.results["lead"].output["status"], json!(SELF_HEALED_STATUS));
        assert!(ctx.history[0].recovered_by_fallback);
        assert!(ctx.results.contains_key("notify"));
    }

    #[tokio::test]
    async fn unregistered_step_type_passes_through() {
        let (orchestrator, _) = setup();
        register(
            &orchestrator,
            r#"
id: experimental
name: Experimental
start_step: x
steps:
  - id: x
    type: quantum_widget
"#,
        )
        .await;
        let ctx = orchestrator
            .execute_workflow("experimental", Value::Null, None)
            .await
            .unwrap();
        assert_eq!(ctx.status, WorkflowStatus::Completed);
        assert_eq!(ctx.results["x"].output["skipped"], json!(true));
    }

    #[tokio::test]
    async fn conditional_logic_selects_branch() {
        let (orchestrator, _) = setup();
        register(
            &orchestrator,
            r#"
id: routing
name: Routing
start_step: route
steps:
  - id: route
    type: conditional_logic
    parameters:
      condition: "amount > 1000"
      true_steps: [escalate]
      false_steps: [archive]
  - id: escalate
    type: data_transform
    parameters:
      set: { path: escalated }
  - id: archive
    type: data_transform
    parameters:
      set: { path: archived }
"#,
        )
        .await;

        let high = orchestrator
            .execute_workflow("routing", json!({"amount": 5000}), None)
            .await
            .unwrap();
        assert_eq!(high.variables["path"], json!("escalated"));
        assert!(!high.results.contains_key("archive"));

        let low = orchestrator
            .execute_workflow("routing", json!({"amount": 10}), None)
            .await
            .unwrap();
        assert_eq!(low.variables["path"], json!("archived"));
    }

    #[tokio::test]
    async fn dynamic_loops_hit_the_hop_ceiling() {
        let persister = Arc::new(InMemoryPersister::new());
        let orchestrator = Orchestrator::builder(persister).max_traversal_hops(5).build();
        register(
            &orchestrator,
            r#"
id: looping
name: Looping
start_step: again
steps:
  - id: again
    type: custom_loop
"#,
        )
        .await;
        orchestrator.registry().register_handler(
            StepType::Custom("custom_loop".into()),
            FnStepHandler::new(|_: StepInvocation<'_>| {
                Ok(StepResult::completed(Value::Null).with_next_steps(vec!["again".into()]))
            }),
        );

        let ctx = orchestrator
            .execute_workflow("looping", Value::Null, None)
            .await
            .unwrap();
        assert_eq!(ctx.status, WorkflowStatus::Failed);
        assert!(ctx.error_message.unwrap().contains("exceeded 5 step visits"));
        assert_eq!(ctx.history.len(), 5);
    }

    #[tokio::test]
    async fn trigger_event_starts_matching_workflows() {
        let (orchestrator, persister) = setup();
        register(
            &orchestrator,
            r#"
id: orders
name: Orders
start_step: notify
triggers: [SHOPIFY_ORDER_CREATED]
steps:
  - id: notify
    type: slack
"#,
        )
        .await;
        register(&orchestrator, TWO_STEP).await;
        orchestrator
            .registry()
            .register_handler(StepType::Slack, echo(json!("ok")));

        let started = orchestrator
            .trigger_event("SHOPIFY_ORDER_CREATED", json!({"order_id": 7}))
            .await;
        assert_eq!(started, 1);
        assert_eq!(orchestrator.trigger_event("NOTHING", Value::Null).await, 0);

        orchestrator.drain_background().await;
        let done = persister
            .list_by_status(WorkflowStatus::Completed, 10)
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].workflow_id, "orders");
        assert_eq!(done[0].variables["order_id"], json!(7));
        assert_eq!(
            done[0].variables[EVENT_TYPE_VARIABLE],
            json!("SHOPIFY_ORDER_CREATED")
        );
    }

    struct SlowHandler;

    impl StepHandler for SlowHandler {
        async fn execute(&self, _: StepInvocation<'_>) -> Result<StepResult, HandlerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(StepResult::completed(json!("slow")))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_traversal_after_current_step() {
        let (orchestrator, persister) = setup();
        register(
            &orchestrator,
            r#"
id: slow
name: Slow
start_step: wait
steps:
  - id: wait
    type: http_request
    next_steps: [after]
  - id: after
    type: slack
"#,
        )
        .await;
        orchestrator
            .registry()
            .register_handler(StepType::HttpRequest, SlowHandler);
        orchestrator
            .registry()
            .register_handler(StepType::Slack, echo(json!("ok")));

        let runner = orchestrator.clone();
        let handle =
            tokio::spawn(async move { runner.execute_workflow("slow", Value::Null, None).await });

        let execution_id = loop {
            if let Some(id) = orchestrator.active_executions().first().copied() {
                break id;
            }
            tokio::task::yield_now().await;
        };
        let cancelled = orchestrator.cancel_execution(execution_id).await.unwrap();
        assert_eq!(cancelled.status, WorkflowStatus::Cancelled);

        let ctx = handle.await.unwrap().unwrap();
        assert_eq!(ctx.status, WorkflowStatus::Cancelled);
        assert!(!ctx.results.contains_key("after"));
        assert_eq!(
            persister
                .load(&execution_id)
                .await
                .unwrap()
                .unwrap()
                .status,
            WorkflowStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn cancel_paused_execution() {
        let (orchestrator, _) = setup();
        register(
            &orchestrator,
            r#"
id: review
name: Review
start_step: draft
steps:
  - id: draft
    type: ai_analysis
    confidence_threshold: 0.9
"#,
        )
        .await;
        orchestrator.registry().register_handler(
            StepType::AiAnalysis,
            FnStepHandler::new(|_: StepInvocation<'_>| {
                Ok(StepResult::completed(Value::Null).with_confidence(0.1))
            }),
        );
        let paused = orchestrator
            .execute_workflow("review", Value::Null, None)
            .await
            .unwrap();

        let cancelled = orchestrator
            .cancel_execution(paused.execution_id)
            .await
            .unwrap();
        assert_eq!(cancelled.status, WorkflowStatus::Cancelled);
        assert!(orchestrator.active_executions().is_empty());

        let after = orchestrator
            .resume_workflow(paused.execution_id, "draft")
            .await
            .unwrap();
        assert_eq!(after.status, WorkflowStatus::Cancelled);
    }

    struct FixedPlanner;

    impl Planner for FixedPlanner {
        async fn decompose(
            &self,
            _query: &str,
            _provider_hint: Option<&str>,
        ) -> Result<PlannedWorkflow, PlannerError> {
            let step = |step_type: StepType| PlannedStep {
                step_id: None,
                step_type,
                description: String::new(),
                parameters: HashMap::new(),
                next_steps: vec![],
                parallel_steps: vec![],
                confidence_threshold: None,
            };
            Ok(PlannedWorkflow {
                name: Some("Order alerts".into()),
                steps: vec![step(StepType::Shopify), step(StepType::Slack)],
                trigger: Some("SHOPIFY_ORDER_CREATED".into()),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn generated_workflow_is_registered_and_runnable() {
        let persister = Arc::new(InMemoryPersister::new());
        let orchestrator = Orchestrator::builder(persister)
            .planner(BoxPlanner::new(FixedPlanner))
            .build();

        let def = orchestrator
            .generate_workflow("Alert Slack on new orders", None)
            .await
            .unwrap();
        assert_eq!(def.steps.len(), 2);
        assert!(orchestrator.store().get(&def.id).await.is_ok());

        let ctx = orchestrator
            .execute_workflow(&def.id, Value::Null, None)
            .await
            .unwrap();
        assert_eq!(ctx.status, WorkflowStatus::Completed);
        assert_eq!(ctx.history.len(), 2);
    }

    #[tokio::test]
    async fn generate_without_planner_fails() {
        let (orchestrator, _) = setup();
        let err = orchestrator.generate_workflow("anything", None).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Planner(_)));
    }

    const FAN_WITH_REVIEW: &str = r#"
id: fan-review
name: Fan out with review
start_step: s
steps:
  - id: s
    type: data_transform
    parallel_steps: [a, b]
    next_steps: [d]
  - id: a
    type: ai_analysis
    confidence_threshold: 0.9
  - id: b
    type: notion
  - id: d
    type: gmail
"#;

    fn register_review_handlers(orchestrator: &TestOrchestrator) {
        orchestrator.registry().register_handler(
            StepType::AiAnalysis,
            FnStepHandler::new(|_: StepInvocation<'_>| {
                Ok(StepResult::completed(json!("draft")).with_confidence(0.2))
            }),
        );
        for step_type in [StepType::Notion, StepType::Slack, StepType::Gmail] {
            orchestrator
                .registry()
                .register_handler(step_type, echo(json!("ok")));
        }
    }

    #[tokio::test]
    async fn paused_branch_holds_shared_next_steps() {
        let (orchestrator, persister) = setup();
        register(&orchestrator, FAN_WITH_REVIEW).await;
        register_review_handlers(&orchestrator);

        let paused = orchestrator
            .execute_workflow("fan-review", Value::Null, None)
            .await
            .unwrap();
        assert_eq!(paused.status, WorkflowStatus::WaitingApproval);
        assert!(paused.results.contains_key("b"));
        assert!(!paused.results.contains_key("d"));
        assert_eq!(paused.held_joins.len(), 1);
        assert_eq!(paused.held_joins[0].fork_step, "s");
        assert_eq!(
            paused.held_joins[0].waiting_on,
            vec![JoinBlocker::Step("a".into())]
        );
        let stored = persister.load(&paused.execution_id).await.unwrap().unwrap();
        assert_eq!(stored.held_joins, paused.held_joins);

        let done = orchestrator
            .resume_workflow(paused.execution_id, "a")
            .await
            .unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert!(done.held_joins.is_empty());
        assert_eq!(done.history.len(), 4);
        let d = done.history_index("d").unwrap();
        assert!(done.history_index("a").unwrap() < d);
        assert!(done.history_index("b").unwrap() < d);
    }

    #[tokio::test]
    async fn nested_held_joins_release_inner_first() {
        let (orchestrator, _) = setup();
        register(
            &orchestrator,
            r#"
id: nested-fan
name: Nested fan out
start_step: s
steps:
  - id: s
    type: data_transform
    parallel_steps: [p, q]
    next_steps: [z]
  - id: p
    type: data_transform
    parallel_steps: [a]
    next_steps: [c]
  - id: a
    type: ai_analysis
    confidence_threshold: 0.9
  - id: q
    type: notion
  - id: c
    type: slack
  - id: z
    type: gmail
"#,
        )
        .await;
        register_review_handlers(&orchestrator);

        let paused = orchestrator
            .execute_workflow("nested-fan", Value::Null, None)
            .await
            .unwrap();
        assert_eq!(paused.status, WorkflowStatus::WaitingApproval);
        assert!(!paused.results.contains_key("c"));
        assert!(!paused.results.contains_key("z"));
        assert_eq!(paused.held_joins.len(), 2);

        let done = orchestrator
            .resume_workflow(paused.execution_id, "a")
            .await
            .unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert!(done.held_joins.is_empty());
        assert!(done.history_index("c").unwrap() < done.history_index("z").unwrap());
    }

    #[tokio::test]
    async fn join_waits_for_every_paused_branch() {
        let (orchestrator, _) = setup();
        register(
            &orchestrator,
            r#"
id: double-review
name: Double review
start_step: s
steps:
  - id: s
    type: data_transform
    parallel_steps: [a1, a2]
    next_steps: [d]
  - id: a1
    type: ai_analysis
    confidence_threshold: 0.9
  - id: a2
    type: ai_analysis
    confidence_threshold: 0.9
  - id: d
    type: gmail
"#,
        )
        .await;
        register_review_handlers(&orchestrator);

        let paused = orchestrator
            .execute_workflow("double-review", Value::Null, None)
            .await
            .unwrap();
        assert_eq!(paused.pending_approvals(), vec!["a1", "a2"]);

        let half = orchestrator
            .resume_workflow(paused.execution_id, "a2")
            .await
            .unwrap();
        assert_eq!(half.status, WorkflowStatus::WaitingApproval);
        assert!(!half.results.contains_key("d"));

        let done = orchestrator
            .resume_workflow(paused.execution_id, "a1")
            .await
            .unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.results["d"].output, json!("ok"));
    }

    #[tokio::test]
    async fn resume_loads_execution_from_persister() {
        let persister = Arc::new(InMemoryPersister::new());
        let store = Arc::new(WorkflowStore::new());
        let registry = Arc::new(HandlerRegistry::with_builtins());
        let build = || {
            Orchestrator::builder(Arc::clone(&persister))
                .store(Arc::clone(&store))
                .registry(Arc::clone(&registry))
                .build()
        };
        let first = build();
        register(&first, FAN_WITH_REVIEW).await;
        register_review_handlers(&first);

        let paused = first
            .execute_workflow("fan-review", Value::Null, None)
            .await
            .unwrap();
        assert_eq!(paused.status, WorkflowStatus::WaitingApproval);

        let second = build();
        assert!(second.active_executions().is_empty());
        let done = second
            .resume_workflow(paused.execution_id, "a")
            .await
            .unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        let mut ran: Vec<_> = done.results.keys().cloned().collect();
        ran.sort();
        assert_eq!(ran, vec!["a", "b", "d", "s"]);
        assert!(second.active_executions().is_empty());
        assert_eq!(
            persister.load(&paused.execution_id).await.unwrap().unwrap().status,
            WorkflowStatus::Completed
        );
    }

    #[tokio::test]
    async fn unrepresentable_timeout_is_rejected_at_registration() {
        let (orchestrator, _) = setup();
        let def = parse_workflow_yaml(
            r#"
id: forever
name: Forever
start_step: wait
steps:
  - id: wait
    type: slack
    timeout_secs: 1e20
"#,
        )
        .unwrap();
        let err = orchestrator.store().register(def).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(msg) if msg.contains("timeout_secs")));
    }

    #[tokio::test(start_paused = true)]
    async fn longest_allowed_backoff_fails_cleanly() {
        let (orchestrator, _) = setup();
        register(
            &orchestrator,
            r#"
id: slow-retry
name: Slow retry
start_step: call
steps:
  - id: call
    type: http_request
    timeout_secs: 604800
    retry_policy:
      max_retries: 1
      initial_delay_secs: 604800
      max_delay_secs: 604800
      exponential_base: 100
"#,
        )
        .await;
        orchestrator.registry().register_handler(
            StepType::HttpRequest,
            FnStepHandler::new(|_: StepInvocation<'_>| {
                Err(HandlerError::Failed("connection reset".into()))
            }),
        );

        let ctx = orchestrator
            .execute_workflow("slow-retry", Value::Null, None)
            .await
            .unwrap();
        assert_eq!(ctx.status, WorkflowStatus::Failed);
        assert_eq!(ctx.history[0].attempts, 2);
        assert!(orchestrator.active_executions().is_empty());
    }
}
