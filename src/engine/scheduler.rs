//! DAG Scheduler (§4.F) — the heart of the orchestrator.
//!
//! Generalizes the teacher's single-token, single-transition Petri-net
//! execution idiom (`Resource::execute_activity`,
//! `engine::events::ResourceEvents`) to multi-step DAG dispatch under a
//! concurrency cap. A `tokio::sync::Semaphore`-style cap (enforced here via
//! a plain running-set length check, since we also need step-mode to
//! override it to exactly one in-flight dispatch) bounds `max_concurrency`
//! the same way `AgentEngineConfig::max_concurrent_executions` bounds the
//! teacher's agent engine. One `tokio::spawn`ed control loop owns a job's
//! transitions end to end (teacher idiom: one long-running task per unit of
//! work, e.g. `ConnectionManager::start_cleanup_task`), and
//! `tokio::task::JoinSet` lets that loop await "any running step finishes"
//! directly instead of polling.
//!
//! The Job Manager / Scheduler cyclic reference from §9 is broken here: the
//! scheduler depends only on the `JobControlSink` trait (implemented by the
//! Job Manager) to report status, and returns a concrete `RunHandle` the
//! Job Manager holds to send control signals back. Neither module imports
//! the other's concrete type.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::collaborators::{ArtifactSink, Clock, EmbeddingService, TextGenerator, VectorStore};
use crate::error::{OrchestratorError, Result};
use crate::models::{
    AgentId, CompiledTemplate, Contract, Event, EventType, ExecutionContext, FieldType, JobId,
    JobStatus, StepId,
};

use super::events::EventBus;
use super::checkpoint_store::CheckpointStore;
use super::registry::AgentRegistry;

/// Bundle of out-of-scope collaborators a step's call handle exposes (§6).
#[derive(Clone)]
pub struct AgentCollaborators {
    pub vector_store: Arc<dyn VectorStore>,
    pub embedding_service: Arc<dyn EmbeddingService>,
    pub artifact_sink: Arc<dyn ArtifactSink>,
    pub llm: Arc<dyn TextGenerator>,
}

/// The per-step handle an `AgentExecutor` is invoked with (§4.F dispatch
/// contract step 4). Exposes collaborators, a structured log sink that
/// re-emits as `NODE.STDOUT`, and cooperative cancellation.
pub struct AgentCallContext {
    pub job_id: JobId,
    pub step_id: StepId,
    pub attempt: u32,
    collaborators: AgentCollaborators,
    event_bus: Arc<EventBus>,
    control: watch::Receiver<ControlFlags>,
}

impl AgentCallContext {
    /// Re-emits as `NODE.STDOUT` (§4.F dispatch contract step 4).
    pub fn stdout(&self, line: impl Into<String>) {
        self.event_bus.publish(Event::new(
            EventType::NodeStdout,
            self.job_id,
            Some(self.step_id.clone()),
            serde_json::json!({"line": line.into()}),
        ));
    }

    /// Cooperative cancellation check (§5 "agents observe via their call
    /// handle").
    pub fn is_cancelled(&self) -> bool {
        self.control.borrow().cancelled
    }

    pub fn vector_store(&self) -> &Arc<dyn VectorStore> {
        &self.collaborators.vector_store
    }

    pub fn embedding_service(&self) -> &Arc<dyn EmbeddingService> {
        &self.collaborators.embedding_service
    }

    pub fn artifact_sink(&self) -> &Arc<dyn ArtifactSink> {
        &self.collaborators.artifact_sink
    }

    pub fn llm(&self) -> &Arc<dyn TextGenerator> {
        &self.collaborators.llm
    }
}

/// An agent invocation's outcome, distinguishing transient from permanent
/// failure so the scheduler's retry policy (§4.F) knows which to apply.
#[derive(Debug, Clone)]
pub enum AgentInvokeError {
    Transient(String),
    Permanent(String),
}

/// The typed dispatcher replacing dynamic-dispatch-by-string-id (§9 "Dynamic
/// dispatch of agents"): a concrete agent body implements this trait and is
/// looked up by `AgentId` through `AgentDispatch`. Concrete bodies are out
/// of scope for this crate (§1); only the interface lives here.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn invoke(
        &self,
        ctx: &AgentCallContext,
        input: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, AgentInvokeError>;
}

/// Resolves an `AgentId` to its executor. A thin seam so the scheduler never
/// needs to know how executors are constructed or configured.
pub trait AgentDispatch: Send + Sync {
    fn executor(&self, agent_id: &AgentId) -> Option<Arc<dyn AgentExecutor>>;
}

/// Map-backed `AgentDispatch` good enough for tests and for embedding a
/// fixed set of agent bodies at startup.
#[derive(Default)]
pub struct StaticAgentDispatch {
    executors: HashMap<AgentId, Arc<dyn AgentExecutor>>,
}

impl StaticAgentDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, agent_id: AgentId, executor: Arc<dyn AgentExecutor>) -> Self {
        self.executors.insert(agent_id, executor);
        self
    }
}

impl AgentDispatch for StaticAgentDispatch {
    fn executor(&self, agent_id: &AgentId) -> Option<Arc<dyn AgentExecutor>> {
        self.executors.get(agent_id).cloned()
    }
}

/// The Job Manager side of the §9 interface split: the scheduler reports
/// status/progress/error through this trait without ever importing
/// `job_manager`.
pub trait JobControlSink: Send + Sync {
    fn report_started(&self, job_id: JobId);
    fn report_progress(&self, job_id: JobId, progress: u8, current_step: Option<StepId>);
    fn report_retrying(&self, job_id: JobId, retrying: bool);
    fn report_terminal(&self, job_id: JobId, status: JobStatus, error: Option<String>);
}

#[derive(Debug, Clone, Default)]
struct ControlFlags {
    paused: bool,
    cancelled: bool,
    step_mode: bool,
    /// Set by `RunHandle::step`, cleared by the control loop once consumed
    /// — "latches ... then unlatches for exactly one further dispatch. Not
    /// stackable" (§4.F): setting it while already set is a no-op.
    step_pulse: bool,
}

/// The Job Manager's handle onto a running job's control channel (§9
/// "RunHandle"). Pause/resume/cancel/step are plain latches on shared state
/// — cheap, idempotent, and observable from both the control loop and any
/// in-flight `AgentCallContext`.
#[derive(Clone)]
pub struct RunHandle {
    control: watch::Sender<ControlFlags>,
    pub job_id: JobId,
}

impl RunHandle {
    pub fn pause(&self) {
        self.control.send_if_modified(|s| {
            let changed = !s.paused;
            s.paused = true;
            changed
        });
    }

    pub fn resume(&self) {
        self.control.send_if_modified(|s| {
            let changed = s.paused;
            s.paused = false;
            changed
        });
    }

    pub fn cancel(&self) {
        self.control.send_if_modified(|s| {
            let changed = !s.cancelled;
            s.cancelled = true;
            changed
        });
    }

    pub fn enable_step_mode(&self) {
        let _ = self.control.send_modify(|s| s.step_mode = true);
    }

    /// No-op if step mode is not enabled (§4.F "issuing step without
    /// step-mode is a no-op").
    pub fn step(&self) {
        self.control.send_if_modified(|s| {
            if s.step_mode && !s.step_pulse {
                s.step_pulse = true;
                true
            } else {
                false
            }
        });
    }

    pub fn is_paused(&self) -> bool {
        self.control.borrow().paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.borrow().cancelled
    }
}

/// Errors raised constructing or spawning a scheduler run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("max_concurrency must be at least 1")]
    InvalidConcurrency,
}

/// Grace period awaited after a cancel signal before remaining running
/// steps are considered abandoned (§5 "awaits them for a bounded grace
/// period").
const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Base delay for the exponential backoff applied between retry attempts
/// (§4.F "retry with exponential backoff").
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Maximum attempts per step before a transient failure is treated as
/// exhausted and becomes permanent (§4.F "up to `max_attempts` (e.g. 3)").
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Fallback deadline for a step whose agent has no registered definition to
/// derive `resources.max_runtime_seconds` from (§5). Such a step fails with
/// `UnknownAgent` before the timeout is ever reached; this constant only
/// exists so `dispatch_step` always has a concrete deadline to race against.
const DEFAULT_STEP_DEADLINE: Duration = Duration::from_secs(300);

pub struct Scheduler;

struct StepSuccess {
    output: serde_json::Value,
    started_at: chrono::DateTime<chrono::Utc>,
    finished_at: chrono::DateTime<chrono::Utc>,
    input: serde_json::Value,
}

struct StepFailure {
    error: OrchestratorError,
    started_at: chrono::DateTime<chrono::Utc>,
    finished_at: chrono::DateTime<chrono::Utc>,
    input: serde_json::Value,
}

enum StepOutcome {
    Success(StepSuccess),
    Failure(StepFailure),
}

impl Scheduler {
    /// Spawn the control loop for one job. Returns a `RunHandle` for the Job
    /// Manager to signal pause/resume/step/cancel, plus the `JoinHandle`
    /// that resolves to the final execution context (or the terminating
    /// error) once the job reaches a terminal status.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        job_id: JobId,
        compiled: Arc<CompiledTemplate>,
        context: ExecutionContext,
        max_concurrency: usize,
        dispatch: Arc<dyn AgentDispatch>,
        agents: Arc<dyn AgentRegistry>,
        event_bus: Arc<EventBus>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        control_sink: Arc<dyn JobControlSink>,
        collaborators: AgentCollaborators,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<(RunHandle, tokio::task::JoinHandle<Result<ExecutionContext>>), SchedulerError>
    {
        if max_concurrency == 0 {
            return Err(SchedulerError::InvalidConcurrency);
        }
        let (control_tx, control_rx) = watch::channel(ControlFlags::default());
        let handle = RunHandle {
            control: control_tx.clone(),
            job_id,
        };
        let join = tokio::spawn(run(
            job_id,
            compiled,
            context,
            max_concurrency,
            dispatch,
            agents,
            event_bus,
            checkpoint_store,
            control_sink,
            collaborators,
            clock,
            control_tx,
            control_rx,
        ));
        Ok((handle, join))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    job_id: JobId,
    compiled: Arc<CompiledTemplate>,
    mut context: ExecutionContext,
    max_concurrency: usize,
    dispatch: Arc<dyn AgentDispatch>,
    agents: Arc<dyn AgentRegistry>,
    event_bus: Arc<EventBus>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    control_sink: Arc<dyn JobControlSink>,
    collaborators: AgentCollaborators,
    clock: Arc<dyn Clock>,
    control_tx: watch::Sender<ControlFlags>,
    mut control_rx: watch::Receiver<ControlFlags>,
) -> Result<ExecutionContext> {
    let total_steps = compiled.template.steps.len();
    // Seed `completed` from whatever `context.shared` already holds so a run
    // resumed from a checkpoint (§4.G retry) doesn't re-dispatch steps that
    // already froze their output before the restore (§8 scenario S6: "retry
    // ... replays only B").
    let mut completed: HashSet<StepId> = compiled
        .template
        .steps
        .iter()
        .map(|s| s.step_id.clone())
        .filter(|step_id| context.has_output(step_id))
        .collect();
    let mut running: HashSet<StepId> = HashSet::new();
    let mut join_set: JoinSet<(StepId, StepOutcome)> = JoinSet::new();
    // Steps currently mid-retry-backoff. Fed by `dispatch_step` over
    // `retry_tx` so the control loop — the only task allowed to call
    // `JobControlSink::report_retrying` — learns of a transient failure it
    // never directly awaits (§4.F "the job's status becomes `retrying` if
    // any step is retrying").
    let mut retrying: HashSet<StepId> = HashSet::new();
    let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<StepId>();

    event_bus.publish(Event::new(EventType::RunStarted, job_id, None, serde_json::json!({})));
    control_sink.report_started(job_id);

    let mut job_failure: Option<(StepId, OrchestratorError)> = None;

    'main: loop {
        if completed.len() == total_steps {
            break;
        }
        let flags = control_rx.borrow().clone();
        if flags.cancelled {
            break;
        }

        if !flags.paused && (!flags.step_mode || flags.step_pulse) {
            let ready = ready_steps(&compiled, &completed, &running);
            let mut dispatched_any = false;
            for step_id in ready {
                if running.len() >= max_concurrency {
                    break;
                }
                if flags.step_mode && dispatched_any {
                    break;
                }
                event_bus.publish(Event::new(
                    EventType::RunStepReady,
                    job_id,
                    Some(step_id.clone()),
                    serde_json::json!({}),
                ));
                let step_def = compiled
                    .step(&step_id)
                    .expect("ready step exists in compiled template")
                    .clone();
                let input = match build_step_input(&compiled, &step_def, &context, &agents) {
                    Ok(input) => input,
                    Err(message) => {
                        job_failure = Some((
                            step_id.clone(),
                            OrchestratorError::ContractViolation(message),
                        ));
                        break;
                    }
                };
                let ctx_for_task = AgentCallContext {
                    job_id,
                    step_id: step_id.clone(),
                    attempt: 0,
                    collaborators: collaborators.clone(),
                    event_bus: event_bus.clone(),
                    control: control_rx.clone(),
                };
                let executor = dispatch.executor(&step_def.agent_id);
                let agent_def = agents.get(&step_def.agent_id);
                let output_contract = agent_def
                    .as_ref()
                    .map(|def| def.output_contract.clone())
                    .unwrap_or_default();
                // §5: "each dispatched step runs under a deadline derived
                // from `resources.max-runtime-seconds`". An unregistered
                // agent has no definition to derive one from; `dispatch_step`
                // already fails that case with `UnknownAgent` before the
                // timeout would ever matter, so fall back to the default.
                let step_deadline = agent_def
                    .map(|def| Duration::from_secs(def.resources.max_runtime_seconds))
                    .unwrap_or(DEFAULT_STEP_DEADLINE);
                let event_bus_task = event_bus.clone();
                let clock_task = clock.clone();
                let agent_id = step_def.agent_id.clone();
                let retry_tx_task = retry_tx.clone();
                running.insert(step_id.clone());
                join_set.spawn(dispatch_step(
                    ctx_for_task,
                    executor,
                    agent_id,
                    input,
                    output_contract,
                    event_bus_task,
                    clock_task,
                    step_deadline,
                    retry_tx_task,
                ));
                dispatched_any = true;
            }
            if job_failure.is_some() {
                break;
            }
            if flags.step_mode && dispatched_any {
                control_tx.send_modify(|s| s.step_pulse = false);
            }
        }

        if running.is_empty() {
            if control_rx.changed().await.is_err() {
                break;
            }
            continue;
        }

        tokio::select! {
            Some(res) = join_set.join_next() => {
                if let Some(failure) = settle(
                    res,
                    &compiled,
                    &mut context,
                    &mut completed,
                    &mut running,
                    &mut retrying,
                    &event_bus,
                    &checkpoint_store,
                    &control_sink,
                    job_id,
                ).await {
                    job_failure = Some(failure);
                    break 'main;
                }
            }
            Some(step_id) = retry_rx.recv() => {
                let was_empty = retrying.is_empty();
                retrying.insert(step_id);
                if was_empty {
                    control_sink.report_retrying(job_id, true);
                }
            }
            _ = control_rx.changed() => {}
        }
    }

    let flags = control_rx.borrow().clone();

    if let Some((_, err)) = job_failure {
        drain_running(&mut join_set, &compiled, &mut context, &mut completed, &mut running, &mut retrying, &event_bus, &checkpoint_store, &control_sink, job_id).await;
        let message = err.to_string();
        event_bus.publish(Event::new(
            EventType::RunFailed,
            job_id,
            None,
            serde_json::json!({"error": crate::error::redact_secrets(&message)}),
        ));
        control_sink.report_terminal(job_id, JobStatus::Failed, Some(message));
        return Err(err);
    }

    if flags.cancelled {
        let _ = tokio::time::timeout(CANCEL_GRACE_PERIOD, drain_running(
            &mut join_set,
            &compiled,
            &mut context,
            &mut completed,
            &mut running,
            &mut retrying,
            &event_bus,
            &checkpoint_store,
            &control_sink,
            job_id,
        )).await;
        event_bus.publish(Event::new(EventType::RunCancelled, job_id, None, serde_json::json!({})));
        control_sink.report_terminal(job_id, JobStatus::Cancelled, None);
        return Err(OrchestratorError::Cancelled);
    }

    event_bus.publish(Event::new(EventType::RunFinished, job_id, None, serde_json::json!({})));
    control_sink.report_terminal(job_id, JobStatus::Completed, None);
    Ok(context)
}

/// Drain whatever remains in the `JoinSet`, applying the same `settle` logic
/// used in the main loop so every in-flight step still produces its
/// terminal `NODE.OUTPUT`/`NODE.ERROR` (§8 scenario S5). Any steps that
/// never settle are dropped — and therefore aborted — when `join_set` goes
/// out of scope, which is how a cancelled-but-unyielding step becomes
/// "abandoned" (§5).
#[allow(clippy::too_many_arguments)]
async fn drain_running(
    join_set: &mut JoinSet<(StepId, StepOutcome)>,
    compiled: &Arc<CompiledTemplate>,
    context: &mut ExecutionContext,
    completed: &mut HashSet<StepId>,
    running: &mut HashSet<StepId>,
    retrying: &mut HashSet<StepId>,
    event_bus: &Arc<EventBus>,
    checkpoint_store: &Arc<dyn CheckpointStore>,
    control_sink: &Arc<dyn JobControlSink>,
    job_id: JobId,
) {
    while let Some(res) = join_set.join_next().await {
        let _ = settle(
            res,
            compiled,
            context,
            completed,
            running,
            retrying,
            event_bus,
            checkpoint_store,
            control_sink,
            job_id,
        )
        .await;
    }
}

/// Apply one settled step's outcome to the shared context (§4.F dispatch
/// contract steps 5-6). Returns `Some((step_id, error))` if the outcome is a
/// permanent failure that should end the job.
#[allow(clippy::too_many_arguments)]
async fn settle(
    res: std::result::Result<(StepId, StepOutcome), tokio::task::JoinError>,
    compiled: &Arc<CompiledTemplate>,
    context: &mut ExecutionContext,
    completed: &mut HashSet<StepId>,
    running: &mut HashSet<StepId>,
    retrying: &mut HashSet<StepId>,
    event_bus: &Arc<EventBus>,
    checkpoint_store: &Arc<dyn CheckpointStore>,
    control_sink: &Arc<dyn JobControlSink>,
    job_id: JobId,
) -> Option<(StepId, OrchestratorError)> {
    let (step_id, outcome) = match res {
        Ok(pair) => pair,
        Err(join_err) => {
            // A step task panicked. Treat as an internal invariant breach.
            return Some((
                StepId::from("unknown"),
                OrchestratorError::Internal(format!("step task panicked: {join_err}")),
            ));
        }
    };
    running.remove(&step_id);
    // A step settling — success or failure — is no longer retrying. Clear it
    // and, if no step anywhere in the job is still retrying, tell the
    // control sink to drop the job out of `JobStatus::Retrying`.
    if retrying.remove(&step_id) && retrying.is_empty() {
        control_sink.report_retrying(job_id, false);
    }

    match outcome {
        StepOutcome::Success(success) => {
            let step_def = compiled.step(&step_id).expect("settled step exists");
            context.agent_io.insert(
                step_id.as_str().to_string(),
                crate::models::AgentIoRecord {
                    input: success.input,
                    output: Some(success.output.clone()),
                    status: "completed".to_string(),
                    duration_ms: Some(
                        (success.finished_at - success.started_at).num_milliseconds().max(0) as u64,
                    ),
                    started_at: success.started_at,
                    finished_at: Some(success.finished_at),
                },
            );
            if let Err(already_frozen) = context.freeze_step_output(&step_id, success.output) {
                return Some((step_id, OrchestratorError::Internal(already_frozen.to_string())));
            }
            completed.insert(step_id.clone());

            for downstream in compiled
                .template
                .steps
                .iter()
                .filter(|s| s.depends_on.contains(&step_id))
            {
                event_bus.publish(Event::new(
                    EventType::FlowEdge,
                    job_id,
                    Some(step_id.clone()),
                    serde_json::json!({"to": downstream.step_id.as_str()}),
                ));
            }

            event_bus.publish(Event::new(
                EventType::NodeOutput,
                job_id,
                Some(step_id.clone()),
                serde_json::json!({}),
            ));

            if step_def.checkpoint_boundary {
                match checkpoint_store
                    .write(
                        job_id,
                        step_id.clone(),
                        compiled.template.id.as_str().to_string(),
                        context.deep_copy(),
                        true,
                    )
                    .await
                {
                    Ok(checkpoint_id) => {
                        event_bus.publish(Event::new(
                            EventType::CpWritten,
                            job_id,
                            Some(step_id.clone()),
                            serde_json::json!({"checkpoint_id": checkpoint_id.as_str()}),
                        ));
                        event_bus.publish(Event::new(
                            EventType::NodeCheckpoint,
                            job_id,
                            Some(step_id.clone()),
                            serde_json::json!({"checkpoint_id": checkpoint_id.as_str()}),
                        ));
                    }
                    Err(err) => {
                        return Some((step_id, err));
                    }
                }
            }

            let progress_pct = ((100 * completed.len()) as f64 / compiled.template.steps.len().max(1) as f64)
                .round() as u8;
            let current_step = running.iter().min_by_key(|s| compiled.topo_position(s)).cloned();
            control_sink.report_progress(job_id, progress_pct, current_step);
            None
        }
        StepOutcome::Failure(failure) => {
            let step_def = compiled.step(&step_id).expect("settled step exists");
            context.agent_io.insert(
                step_id.as_str().to_string(),
                crate::models::AgentIoRecord {
                    input: failure.input,
                    output: None,
                    status: "failed".to_string(),
                    duration_ms: Some(
                        (failure.finished_at - failure.started_at).num_milliseconds().max(0) as u64,
                    ),
                    started_at: failure.started_at,
                    finished_at: Some(failure.finished_at),
                },
            );
            let _ = step_def;
            Some((step_id, failure.error))
        }
    }
}

/// Compute the ready set, ordered by the template's cached topological
/// position for deterministic dispatch under a fixed cap (§4.F).
fn ready_steps(
    compiled: &CompiledTemplate,
    completed: &HashSet<StepId>,
    running: &HashSet<StepId>,
) -> Vec<StepId> {
    compiled
        .topo_order
        .iter()
        .filter(|step_id| {
            !completed.contains(*step_id)
                && !running.contains(*step_id)
                && compiled
                    .step(step_id)
                    .map(|s| s.depends_on.iter().all(|dep| completed.contains(dep)))
                    .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Build a step's agent input by merging static params, the job's entry
/// inputs, and upstream steps' frozen outputs, restricted to the agent's
/// declared input contract (§4.F dispatch contract step 2).
fn build_step_input(
    compiled: &CompiledTemplate,
    step_def: &crate::models::StepDefinition,
    context: &ExecutionContext,
    agents: &Arc<dyn AgentRegistry>,
) -> std::result::Result<serde_json::Value, String> {
    let mut merged = serde_json::Map::new();

    if let Some(entry_obj) = context.config.template_config.as_object() {
        for (k, v) in entry_obj {
            merged.insert(k.clone(), v.clone());
        }
    }

    for dep in &step_def.depends_on {
        if let Some(upstream_output) = context.shared.get(dep.as_str()) {
            if let Some(obj) = upstream_output.as_object() {
                for (k, v) in obj {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
    }

    if let Some(static_obj) = step_def.static_params.as_object() {
        for (k, v) in static_obj {
            merged.insert(k.clone(), v.clone());
        }
    }

    let value = serde_json::Value::Object(merged);
    let contract = agents
        .get(&step_def.agent_id)
        .map(|def| def.input_contract)
        .unwrap_or_default();
    validate_contract(&value, &contract, &step_def.step_id)?;
    let _ = compiled;
    Ok(value)
}

/// Validate a built JSON object against a contract's required fields and
/// rough shape (§4.F dispatch contract step 3 / step 5).
fn validate_contract(value: &serde_json::Value, contract: &Contract, step_id: &StepId) -> std::result::Result<(), String> {
    let obj = value.as_object().ok_or_else(|| {
        format!("step '{}': expected an object, got {}", step_id, value)
    })?;
    for (field, descriptor) in contract {
        match obj.get(field) {
            None if descriptor.required => {
                return Err(format!("step '{}': missing required field '{}'", step_id, field));
            }
            None => {}
            Some(v) => {
                if !field_type_matches(&descriptor.field_type, v) {
                    return Err(format!(
                        "step '{}': field '{}' has the wrong shape",
                        step_id, field
                    ));
                }
            }
        }
    }
    Ok(())
}

fn field_type_matches(expected: &FieldType, value: &serde_json::Value) -> bool {
    match expected {
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Object => value.is_object(),
        FieldType::List => value.is_array(),
    }
}

/// Invoke an agent with bounded exponential retry and a deadline, returning
/// the final outcome for the control loop to settle (§4.F retry/failure
/// policy). Runs entirely off the control loop's task so one slow agent
/// never blocks dispatch of other ready steps.
async fn dispatch_step(
    ctx: AgentCallContext,
    executor: Option<Arc<dyn AgentExecutor>>,
    agent_id: AgentId,
    input: serde_json::Value,
    output_contract: Contract,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    deadline: Duration,
    retry_tx: mpsc::UnboundedSender<StepId>,
) -> (StepId, StepOutcome) {
    let step_id = ctx.step_id.clone();
    let job_id = ctx.job_id;
    let started_at = clock.now();

    event_bus.publish(Event::new(
        EventType::NodeStart,
        job_id,
        Some(step_id.clone()),
        serde_json::json!({"agent_id": agent_id.as_str()}),
    ));

    let Some(executor) = executor else {
        let finished_at = clock.now();
        return (
            step_id.clone(),
            StepOutcome::Failure(StepFailure {
                error: OrchestratorError::UnknownAgent(agent_id.as_str().to_string()),
                started_at,
                finished_at,
                input,
            }),
        );
    };

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let mut call_ctx = AgentCallContext {
            job_id,
            step_id: step_id.clone(),
            attempt,
            collaborators: ctx.collaborators.clone(),
            event_bus: event_bus.clone(),
            control: ctx.control.clone(),
        };
        call_ctx.attempt = attempt;

        let invocation = executor.invoke(&call_ctx, input.clone());
        let outcome = match tokio::time::timeout(deadline, invocation).await {
            Ok(result) => result,
            Err(_) => Err(AgentInvokeError::Transient("step deadline exceeded".to_string())),
        };

        match outcome {
            Ok(output) => {
                if let Err(message) = validate_contract(&output, &output_contract, &step_id) {
                    let finished_at = clock.now();
                    return (
                        step_id.clone(),
                        StepOutcome::Failure(StepFailure {
                            error: OrchestratorError::ContractViolation(message),
                            started_at,
                            finished_at,
                            input,
                        }),
                    );
                }
                let finished_at = clock.now();
                return (
                    step_id.clone(),
                    StepOutcome::Success(StepSuccess {
                        output,
                        started_at,
                        finished_at,
                        input,
                    }),
                );
            }
            Err(AgentInvokeError::Permanent(message)) => {
                let finished_at = clock.now();
                return (
                    step_id.clone(),
                    StepOutcome::Failure(StepFailure {
                        error: OrchestratorError::ContractViolation(message),
                        started_at,
                        finished_at,
                        input,
                    }),
                );
            }
            Err(AgentInvokeError::Transient(message)) => {
                event_bus.publish(Event::new(
                    EventType::NodeError,
                    job_id,
                    Some(step_id.clone()),
                    serde_json::json!({"transient": true, "message": message, "attempt": attempt}),
                ));
                if attempt >= DEFAULT_MAX_ATTEMPTS {
                    let finished_at = clock.now();
                    return (
                        step_id.clone(),
                        StepOutcome::Failure(StepFailure {
                            error: OrchestratorError::LLMUnavailable(message),
                            started_at,
                            finished_at,
                            input,
                        }),
                    );
                }
                // Tell the control loop this step is about to retry so it
                // can surface `JobStatus::Retrying` (§4.F, §8 scenario S3).
                // The control loop, not this task, owns that transition.
                let _ = retry_tx.send(step_id.clone());
                let backoff = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        GenerateOptions, InMemoryArtifactSink, InMemoryVectorStore, NullEmbeddingService,
    };
    use crate::engine::checkpoint_store::InMemoryCheckpointStore;
    use crate::engine::registry::InMemoryAgentRegistry;
    use crate::models::{
        compile, AgentCapabilities, AgentCategory, AgentDefinition, AgentId, FieldDescriptor,
        ResourceLimits, StepDefinition, WorkflowId, WorkflowTemplate,
    };
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Every agent in `ids` registered with an empty (fully permissive)
    /// input/output contract — these tests exercise dispatch, retry, and
    /// cancellation, not contract validation.
    fn test_agent_registry(ids: &[&str]) -> Arc<dyn AgentRegistry> {
        let defs = ids
            .iter()
            .map(|id| AgentDefinition {
                id: AgentId::from(*id),
                category: AgentCategory::Content,
                version: "1.0.0".to_string(),
                input_contract: StdHashMap::new(),
                output_contract: StdHashMap::new(),
                capabilities: AgentCapabilities::default(),
                resources: ResourceLimits {
                    max_runtime_seconds: 30,
                    max_tokens: 1000,
                    max_memory_mb: 128,
                },
            })
            .collect();
        Arc::new(InMemoryAgentRegistry::load(defs).unwrap())
    }

    struct NullGenerator;
    #[async_trait]
    impl TextGenerator for NullGenerator {
        async fn generate(&self, _prompt: &str, _options: GenerateOptions) -> Result<String> {
            Ok(String::new())
        }
    }

    fn collaborators() -> AgentCollaborators {
        AgentCollaborators {
            vector_store: Arc::new(InMemoryVectorStore::new()),
            embedding_service: Arc::new(NullEmbeddingService::default()),
            artifact_sink: Arc::new(InMemoryArtifactSink::new()),
            llm: Arc::new(NullGenerator),
        }
    }

    struct RecordingSink {
        terminal: StdMutex<Option<JobStatus>>,
        retrying_transitions: StdMutex<Vec<bool>>,
    }
    impl JobControlSink for RecordingSink {
        fn report_started(&self, _job_id: JobId) {}
        fn report_progress(&self, _job_id: JobId, _progress: u8, _current_step: Option<StepId>) {}
        fn report_retrying(&self, _job_id: JobId, retrying: bool) {
            self.retrying_transitions.lock().unwrap().push(retrying);
        }
        fn report_terminal(&self, _job_id: JobId, status: JobStatus, _error: Option<String>) {
            *self.terminal.lock().unwrap() = Some(status);
        }
    }

    struct EchoAgent {
        output: serde_json::Value,
    }
    #[async_trait]
    impl AgentExecutor for EchoAgent {
        async fn invoke(
            &self,
            _ctx: &AgentCallContext,
            _input: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, AgentInvokeError> {
            Ok(self.output.clone())
        }
    }

    struct FlakyAgent {
        failures_remaining: AtomicU8,
    }
    #[async_trait]
    impl AgentExecutor for FlakyAgent {
        async fn invoke(
            &self,
            _ctx: &AgentCallContext,
            _input: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, AgentInvokeError> {
            if self.failures_remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            }).is_ok() {
                Err(AgentInvokeError::Transient("not yet".to_string()))
            } else {
                Ok(serde_json::json!({"ok": true}))
            }
        }
    }

    fn step(id: &str, deps: &[&str]) -> StepDefinition {
        StepDefinition {
            step_id: StepId::from(id),
            agent_id: AgentId::from(id),
            static_params: serde_json::json!({}),
            depends_on: deps.iter().map(|d| StepId::from(*d)).collect(),
            checkpoint_boundary: true,
        }
    }

    #[tokio::test]
    async fn two_step_happy_path_completes_in_order() {
        let template = WorkflowTemplate {
            id: WorkflowId::from("two_step"),
            name: "two step".to_string(),
            description: String::new(),
            steps: vec![step("A", &[]), step("B", &["A"])],
            entry_inputs: StdHashMap::new(),
        };
        let agents: HashSet<AgentId> = [AgentId::from("A"), AgentId::from("B")].into_iter().collect();
        let compiled = Arc::new(compile(template, &agents).unwrap());

        let dispatch = Arc::new(
            StaticAgentDispatch::new()
                .register(
                    AgentId::from("A"),
                    Arc::new(EchoAgent {
                        output: serde_json::json!({"keywords": ["x", "y"]}),
                    }),
                )
                .register(
                    AgentId::from("B"),
                    Arc::new(EchoAgent {
                        output: serde_json::json!({"summary": "x,y"}),
                    }),
                ),
        );

        let event_bus = Arc::new(EventBus::new(64));
        let checkpoint_store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
        let sink = Arc::new(RecordingSink {
            terminal: StdMutex::new(None),
            retrying_transitions: StdMutex::new(Vec::new()),
        });
        let job_id = JobId::new();
        let mut sub = event_bus.subscribe(job_id);

        let (_, join) = Scheduler::spawn(
            job_id,
            compiled,
            ExecutionContext::default(),
            3,
            dispatch,
            test_agent_registry(&["A", "B"]),
            event_bus.clone(),
            checkpoint_store,
            sink.clone(),
            collaborators(),
            Arc::new(crate::collaborators::SystemClock),
        )
        .unwrap();

        let context = join.await.unwrap().unwrap();
        assert_eq!(context.shared["A"], serde_json::json!({"keywords": ["x", "y"]}));
        assert_eq!(context.shared["B"], serde_json::json!({"summary": "x,y"}));
        assert_eq!(*sink.terminal.lock().unwrap(), Some(JobStatus::Completed));

        let mut node_outputs = Vec::new();
        while let Some(event) = sub.recv().await {
            if matches!(event.event_type, EventType::NodeOutput) {
                node_outputs.push(event.step_id.unwrap());
            }
            if matches!(event.event_type, EventType::RunFinished) {
                break;
            }
        }
        assert_eq!(node_outputs, vec![StepId::from("A"), StepId::from("B")]);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let template = WorkflowTemplate {
            id: WorkflowId::from("flaky"),
            name: "flaky".to_string(),
            description: String::new(),
            steps: vec![step("A", &[])],
            entry_inputs: StdHashMap::new(),
        };
        let agents: HashSet<AgentId> = [AgentId::from("A")].into_iter().collect();
        let compiled = Arc::new(compile(template, &agents).unwrap());

        let dispatch = Arc::new(StaticAgentDispatch::new().register(
            AgentId::from("A"),
            Arc::new(FlakyAgent {
                failures_remaining: AtomicU8::new(2),
            }),
        ));

        let event_bus = Arc::new(EventBus::new(64));
        let checkpoint_store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
        let sink = Arc::new(RecordingSink {
            terminal: StdMutex::new(None),
            retrying_transitions: StdMutex::new(Vec::new()),
        });
        let job_id = JobId::new();

        let (_, join) = Scheduler::spawn(
            job_id,
            compiled,
            ExecutionContext::default(),
            3,
            dispatch,
            test_agent_registry(&["A"]),
            event_bus,
            checkpoint_store,
            sink.clone(),
            collaborators(),
            Arc::new(crate::collaborators::SystemClock),
        )
        .unwrap();

        let context = join.await.unwrap().unwrap();
        assert_eq!(context.shared["A"], serde_json::json!({"ok": true}));
        assert_eq!(*sink.terminal.lock().unwrap(), Some(JobStatus::Completed));
        // §4.F / §8 scenario S3: the control loop must observe the step
        // retrying (a `true` transition) and clear it once the step finally
        // succeeds (a `false` transition), not just find out the job
        // completed.
        assert_eq!(*sink.retrying_transitions.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn cancel_stops_future_dispatch() {
        let template = WorkflowTemplate {
            id: WorkflowId::from("chain"),
            name: "chain".to_string(),
            description: String::new(),
            steps: vec![step("A", &[]), step("B", &["A"]), step("C", &["B"])],
            entry_inputs: StdHashMap::new(),
        };
        let agents: HashSet<AgentId> = [AgentId::from("A"), AgentId::from("B"), AgentId::from("C")]
            .into_iter()
            .collect();
        let compiled = Arc::new(compile(template, &agents).unwrap());

        let dispatch = Arc::new(
            StaticAgentDispatch::new()
                .register(AgentId::from("A"), Arc::new(EchoAgent { output: serde_json::json!({}) }))
                .register(AgentId::from("B"), Arc::new(EchoAgent { output: serde_json::json!({}) }))
                .register(AgentId::from("C"), Arc::new(EchoAgent { output: serde_json::json!({}) })),
        );

        let event_bus = Arc::new(EventBus::new(64));
        let checkpoint_store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
        let sink = Arc::new(RecordingSink {
            terminal: StdMutex::new(None),
            retrying_transitions: StdMutex::new(Vec::new()),
        });
        let job_id = JobId::new();

        let (handle, join) = Scheduler::spawn(
            job_id,
            compiled,
            ExecutionContext::default(),
            3,
            dispatch,
            test_agent_registry(&["A", "B", "C"]),
            event_bus,
            checkpoint_store,
            sink.clone(),
            collaborators(),
            Arc::new(crate::collaborators::SystemClock),
        )
        .unwrap();

        handle.cancel();
        let result = join.await.unwrap();
        assert!(result.is_err());
        assert_eq!(*sink.terminal.lock().unwrap(), Some(JobStatus::Cancelled));
    }
}
