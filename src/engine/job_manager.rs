//! Job Manager (§4.G).
//!
//! Owns the `job_id -> job record + control handle` directory. Grounded on
//! the teacher's `engine::agents::AgentStorage` + `AgentEngine` pairing — a
//! storage side (the directory) and an engine side (lifecycle operations)
//! kept together in one struct, generalized per §5: structural directory
//! operations (insert/remove/archive) serialize through one lock per entry,
//! while per-job control signaling goes through the Scheduler's own
//! `RunHandle` channel, never through the directory lock.
//!
//! Breaks the §9 Job Manager/Scheduler cyclic reference the same way
//! `engine::scheduler` documents: this module implements `JobControlSink`
//! and hands the Scheduler a `RunHandle` back, with no concrete dependency
//! in either direction.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::collaborators::Clock;
use crate::engine::checkpoint_store::CheckpointStore;
use crate::engine::events::EventBus;
use crate::engine::registry::AgentRegistry;
use crate::engine::scheduler::{
    AgentCollaborators, AgentDispatch, JobControlSink, RunHandle, Scheduler, SchedulerError,
};
use crate::engine::templates::TemplateRegistry;
use crate::error::{redact_secrets, OrchestratorError, Result as OrchestratorResult};
use crate::models::{
    ConfigSnapshot, Event, EventType, ExecutionContext, FieldType, Job, JobId, JobStatus, StepId,
    WorkflowId,
};

/// Filter applied by `list` (§4.G). Archived jobs are excluded from the
/// default list and only returned when explicitly asked for.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub include_archived: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// What the submitter supplies at `create` (§4.G, §6 `POST /jobs` body).
#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub workflow_id: WorkflowId,
    pub inputs: serde_json::Value,
    pub metadata: HashMap<String, serde_json::Value>,
    pub tone: Option<String>,
    pub perf: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobManagerError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("rejected control command: {0}")]
    RejectedCommand(String),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// One directory entry: the job record, its live control handle (`None`
/// once terminal), and the archive flag (§4.G "archived jobs are listable
/// with a filter but hidden from the default list").
struct JobEntry {
    job: Job,
    run_handle: Option<RunHandle>,
    archived: bool,
}

/// The Job Manager (§4.G). Constructed once at startup and shared behind an
/// `Arc` by the HTTP control surface and the embedded CLI driver.
pub struct JobManager {
    directory: DashMap<JobId, Mutex<JobEntry>>,
    templates: Arc<dyn TemplateRegistry>,
    agents: Arc<dyn AgentRegistry>,
    dispatch: Arc<dyn AgentDispatch>,
    event_bus: Arc<EventBus>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    collaborators: AgentCollaborators,
    clock: Arc<dyn Clock>,
    max_concurrency: usize,
}

impl JobManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        templates: Arc<dyn TemplateRegistry>,
        agents: Arc<dyn AgentRegistry>,
        dispatch: Arc<dyn AgentDispatch>,
        event_bus: Arc<EventBus>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        collaborators: AgentCollaborators,
        clock: Arc<dyn Clock>,
        max_concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            directory: DashMap::new(),
            templates,
            agents,
            dispatch,
            event_bus,
            checkpoint_store,
            collaborators,
            clock,
            max_concurrency,
        })
    }

    /// `create(workflow_id, inputs, metadata) -> job_id` (§4.G).
    ///
    /// Validates `inputs` against the template's entry schema, snapshots
    /// configuration into the job's context, emits `RUN.QUEUED`, and
    /// schedules execution under a fresh control handle.
    pub fn create(self: &Arc<Self>, submission: JobSubmission) -> Result<JobId, JobManagerError> {
        let compiled = self.templates.get(&submission.workflow_id).ok_or_else(|| {
            JobManagerError::Orchestrator(OrchestratorError::TemplateNotFound(
                submission.workflow_id.as_str().to_string(),
            ))
        })?;

        validate_entry_inputs(&compiled.template.entry_inputs, &submission.inputs)
            .map_err(|msg| JobManagerError::Orchestrator(OrchestratorError::InvalidInputs(msg)))?;

        let mut job = Job::new(
            submission.workflow_id.clone(),
            submission.inputs.clone(),
            submission.metadata,
        );
        job.context.config = ConfigSnapshot {
            tone: submission.tone,
            perf: submission.perf,
            template_config: submission.inputs,
        };
        let job_id = job.job_id;

        self.directory.insert(
            job_id,
            Mutex::new(JobEntry {
                job: job.clone(),
                run_handle: None,
                archived: false,
            }),
        );
        self.event_bus.publish(Event::new(
            EventType::RunQueued,
            job_id,
            None,
            serde_json::json!({"workflow_id": submission.workflow_id.as_str()}),
        ));

        self.spawn_run(job_id, Arc::new(compiled), job.context)?;
        Ok(job_id)
    }

    /// Spawn (or re-spawn, for `retry`) a Scheduler run for `job_id` against
    /// `context`, wiring this manager in as the `JobControlSink` and storing
    /// the returned `RunHandle` in the directory.
    fn spawn_run(
        self: &Arc<Self>,
        job_id: JobId,
        compiled: Arc<crate::models::CompiledTemplate>,
        context: ExecutionContext,
    ) -> Result<(), JobManagerError> {
        let control_sink: Arc<dyn JobControlSink> = self.clone();
        let (run_handle, join) = Scheduler::spawn(
            job_id,
            compiled,
            context,
            self.max_concurrency,
            self.dispatch.clone(),
            self.agents.clone(),
            self.event_bus.clone(),
            self.checkpoint_store.clone(),
            control_sink,
            self.collaborators.clone(),
            self.clock.clone(),
        )
        .map_err(|err: SchedulerError| JobManagerError::RejectedCommand(err.to_string()))?;

        if let Some(entry) = self.directory.get(&job_id) {
            entry.lock().unwrap().run_handle = Some(run_handle);
        }

        // The scheduler reports every transition through `JobControlSink`
        // as it happens; this task exists only to keep the join handle from
        // being dropped (which would abort the run) and to surface panics.
        tokio::spawn(async move {
            if let Err(join_err) = join.await {
                tracing::error!(%job_id, error = %join_err, "scheduler task panicked");
            }
        });
        Ok(())
    }

    pub fn list(&self, filter: JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .directory
            .iter()
            .filter_map(|entry| {
                let guard = entry.value().lock().unwrap();
                if guard.archived && !filter.include_archived {
                    return None;
                }
                if let Some(status) = filter.status {
                    if guard.job.status != status {
                        return None;
                    }
                }
                Some(guard.job.clone())
            })
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        let jobs = jobs.into_iter().skip(filter.offset);
        match filter.limit {
            Some(limit) => jobs.take(limit).collect(),
            None => jobs.collect(),
        }
    }

    pub fn get(&self, job_id: JobId) -> Result<Job, JobManagerError> {
        self.entry(job_id).map(|entry| entry.lock().unwrap().job.clone())
    }

    pub fn pause(&self, job_id: JobId) -> Result<(), JobManagerError> {
        let entry = self.entry(job_id)?;
        let mut guard = entry.lock().unwrap();
        if let Some(handle) = &guard.run_handle {
            let was_paused = handle.is_paused();
            handle.pause();
            if !was_paused {
                guard.job.status = JobStatus::Paused;
                guard.job.touch();
                self.event_bus
                    .publish(Event::new(EventType::RunPaused, job_id, None, serde_json::json!({})));
            }
        }
        Ok(())
    }

    pub fn resume(&self, job_id: JobId) -> Result<(), JobManagerError> {
        let entry = self.entry(job_id)?;
        let mut guard = entry.lock().unwrap();
        if let Some(handle) = &guard.run_handle {
            let was_paused = handle.is_paused();
            handle.resume();
            if was_paused {
                guard.job.status = JobStatus::Running;
                guard.job.touch();
                self.event_bus
                    .publish(Event::new(EventType::RunResumed, job_id, None, serde_json::json!({})));
            }
        }
        Ok(())
    }

    /// Enables step mode on first use, then issues one step pulse (§4.F
    /// "issuing step without step-mode is a no-op" — we lift that
    /// restriction at the Job Manager boundary so `step` is always
    /// meaningful from the control surface's point of view).
    pub fn step(&self, job_id: JobId) -> Result<(), JobManagerError> {
        let entry = self.entry(job_id)?;
        let guard = entry.lock().unwrap();
        if let Some(handle) = &guard.run_handle {
            handle.enable_step_mode();
            handle.step();
        }
        Ok(())
    }

    pub fn cancel(&self, job_id: JobId) -> Result<(), JobManagerError> {
        let entry = self.entry(job_id)?;
        let guard = entry.lock().unwrap();
        if let Some(handle) = &guard.run_handle {
            handle.cancel();
        }
        Ok(())
    }

    /// `retry` is defined only on `failed` jobs (§4.G): restores the most
    /// recent resumable checkpoint (or starts from scratch if none exist),
    /// increments `retry_count`, and re-enters `running`.
    pub async fn retry(self: &Arc<Self>, job_id: JobId) -> Result<(), JobManagerError> {
        let (workflow_id, base_context) = {
            let entry = self.entry(job_id)?;
            let guard = entry.lock().unwrap();
            if guard.job.status != JobStatus::Failed {
                return Err(JobManagerError::RejectedCommand(
                    "retry is only valid on a failed job".to_string(),
                ));
            }
            (guard.job.workflow_id.clone(), guard.job.context.clone())
        };

        let compiled = self.templates.get(&workflow_id).ok_or_else(|| {
            JobManagerError::Orchestrator(OrchestratorError::TemplateNotFound(workflow_id.as_str().to_string()))
        })?;

        let checkpoints = self
            .checkpoint_store
            .list(job_id)
            .await
            .map_err(JobManagerError::Orchestrator)?;
        let context = match checkpoints.iter().rev().find(|cp| cp.resumable) {
            Some(latest) => self
                .checkpoint_store
                .restore(&latest.checkpoint_id)
                .await
                .map_err(JobManagerError::Orchestrator)?,
            None => base_context,
        };

        {
            let entry = self.entry(job_id)?;
            let mut guard = entry.lock().unwrap();
            guard.job.retry_count += 1;
            guard.job.status = JobStatus::Running;
            guard.job.error = None;
            guard.job.context = context.clone();
            guard.job.touch();
        }

        self.spawn_run(job_id, Arc::new(compiled), context)
    }

    /// `archive` is defined on terminal jobs only (§4.G).
    pub fn archive(&self, job_id: JobId) -> Result<(), JobManagerError> {
        let entry = self.entry(job_id)?;
        let mut guard = entry.lock().unwrap();
        if !guard.job.status.is_terminal() {
            return Err(JobManagerError::RejectedCommand(
                "archive is only valid on a terminal job".to_string(),
            ));
        }
        guard.archived = true;
        Ok(())
    }

    pub fn unarchive(&self, job_id: JobId) -> Result<(), JobManagerError> {
        let entry = self.entry(job_id)?;
        entry.lock().unwrap().archived = false;
        Ok(())
    }

    /// `delete` is defined on terminal jobs only (§4.G, implied by "only
    /// when terminal" in the operation list).
    pub fn delete(&self, job_id: JobId) -> Result<(), JobManagerError> {
        {
            let entry = self.entry(job_id)?;
            if !entry.lock().unwrap().job.status.is_terminal() {
                return Err(JobManagerError::RejectedCommand(
                    "delete is only valid on a terminal job".to_string(),
                ));
            }
        }
        self.directory.remove(&job_id);
        self.event_bus.close(&job_id);
        Ok(())
    }

    fn entry(&self, job_id: JobId) -> Result<dashmap::mapref::one::Ref<'_, JobId, Mutex<JobEntry>>, JobManagerError> {
        self.directory
            .get(&job_id)
            .ok_or_else(|| JobManagerError::NotFound(job_id.to_string()))
    }
}

impl JobControlSink for JobManager {
    fn report_started(&self, job_id: JobId) {
        if let Some(entry) = self.directory.get(&job_id) {
            let mut guard = entry.lock().unwrap();
            guard.job.status = JobStatus::Running;
            guard.job.touch();
        }
    }

    fn report_progress(&self, job_id: JobId, progress: u8, current_step: Option<StepId>) {
        if let Some(entry) = self.directory.get(&job_id) {
            let mut guard = entry.lock().unwrap();
            guard.job.progress = progress;
            guard.job.current_step = current_step;
            guard.job.touch();
        }
    }

    fn report_retrying(&self, job_id: JobId, retrying: bool) {
        if let Some(entry) = self.directory.get(&job_id) {
            let mut guard = entry.lock().unwrap();
            if retrying {
                guard.job.status = JobStatus::Retrying;
            } else if guard.job.status == JobStatus::Retrying {
                guard.job.status = JobStatus::Running;
            }
            guard.job.touch();
        }
    }

    fn report_terminal(&self, job_id: JobId, status: JobStatus, error: Option<String>) {
        if let Some(entry) = self.directory.get(&job_id) {
            let mut guard = entry.lock().unwrap();
            guard.job.status = status;
            guard.job.error = error.map(|message| redact_secrets(&message));
            guard.run_handle = None;
            guard.job.touch();
        }
    }
}

/// Validate `inputs` against a template's entry schema (§3, §4.G `create`).
/// Deliberately permissive about extra fields — only declared-required
/// fields and declared-present fields' shapes are checked.
fn validate_entry_inputs(
    schema: &crate::models::EntrySchema,
    inputs: &serde_json::Value,
) -> std::result::Result<(), String> {
    let obj = inputs
        .as_object()
        .ok_or_else(|| "inputs must be a JSON object".to_string())?;
    for (field, descriptor) in schema {
        match obj.get(field) {
            None if descriptor.required => {
                return Err(format!("missing required input field '{field}'"));
            }
            None => {}
            Some(value) => {
                let matches = match descriptor.field_type {
                    FieldType::String => value.is_string(),
                    FieldType::Number => value.is_number(),
                    FieldType::Boolean => value.is_boolean(),
                    FieldType::Object => value.is_object(),
                    FieldType::List => value.is_array(),
                };
                if !matches {
                    return Err(format!("input field '{field}' has the wrong shape"));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        GenerateOptions, InMemoryArtifactSink, InMemoryVectorStore, NullEmbeddingService,
        SystemClock, TextGenerator,
    };
    use crate::engine::checkpoint_store::InMemoryCheckpointStore;
    use crate::engine::registry::InMemoryAgentRegistry;
    use crate::engine::scheduler::{AgentCallContext, AgentExecutor, AgentInvokeError, StaticAgentDispatch};
    use crate::engine::templates::InMemoryTemplateRegistry;
    use crate::models::{
        AgentCapabilities, AgentCategory, AgentDefinition, AgentId, FieldDescriptor, ResourceLimits,
        StepDefinition, StepId, WorkflowTemplate,
    };
    use async_trait::async_trait;
    use std::collections::{HashMap as StdHashMap, HashSet};

    struct NullGenerator;
    #[async_trait]
    impl TextGenerator for NullGenerator {
        async fn generate(&self, _prompt: &str, _options: GenerateOptions) -> OrchestratorResult<String> {
            Ok(String::new())
        }
    }

    struct EchoAgent;
    #[async_trait]
    impl AgentExecutor for EchoAgent {
        async fn invoke(
            &self,
            _ctx: &AgentCallContext,
            input: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, AgentInvokeError> {
            Ok(input)
        }
    }

    fn agent_def(id: &str) -> AgentDefinition {
        AgentDefinition {
            id: AgentId::from(id),
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
        }
    }

    fn manager_with_template() -> (Arc<JobManager>, WorkflowId) {
        let agents = Arc::new(InMemoryAgentRegistry::load(vec![agent_def("writer")]).unwrap());
        let template = WorkflowTemplate {
            id: WorkflowId::from("greet"),
            name: "greet".to_string(),
            description: String::new(),
            steps: vec![StepDefinition {
                step_id: StepId::from("A"),
                agent_id: AgentId::from("writer"),
                static_params: serde_json::json!({}),
                depends_on: HashSet::new(),
                checkpoint_boundary: true,
            }],
            entry_inputs: {
                let mut schema = StdHashMap::new();
                schema.insert(
                    "topic".to_string(),
                    FieldDescriptor {
                        field_type: FieldType::String,
                        required: true,
                    },
                );
                schema
            },
        };
        let templates: Arc<dyn TemplateRegistry> =
            Arc::new(InMemoryTemplateRegistry::load(vec![template], agents.as_ref()).unwrap());
        let dispatch: Arc<dyn AgentDispatch> =
            Arc::new(StaticAgentDispatch::new().register(AgentId::from("writer"), Arc::new(EchoAgent)));
        let collaborators = AgentCollaborators {
            vector_store: Arc::new(InMemoryVectorStore::new()),
            embedding_service: Arc::new(NullEmbeddingService::default()),
            artifact_sink: Arc::new(InMemoryArtifactSink::new()),
            llm: Arc::new(NullGenerator),
        };
        let manager = JobManager::new(
            templates,
            agents,
            dispatch,
            Arc::new(EventBus::new(64)),
            Arc::new(InMemoryCheckpointStore::new()),
            collaborators,
            Arc::new(SystemClock),
            3,
        );
        (manager, WorkflowId::from("greet"))
    }

    #[tokio::test]
    async fn create_rejects_missing_required_input() {
        let (manager, workflow_id) = manager_with_template();
        let err = manager
            .create(JobSubmission {
                workflow_id,
                inputs: serde_json::json!({}),
                metadata: StdHashMap::new(),
                tone: None,
                perf: None,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            JobManagerError::Orchestrator(OrchestratorError::InvalidInputs(_))
        ));
    }

    #[tokio::test]
    async fn create_runs_to_completion_and_is_listable() {
        let (manager, workflow_id) = manager_with_template();
        let job_id = manager
            .create(JobSubmission {
                workflow_id,
                inputs: serde_json::json!({"topic": "rust"}),
                metadata: StdHashMap::new(),
                tone: None,
                perf: None,
            })
            .unwrap();

        for _ in 0..50 {
            if manager.get(job_id).unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let job = manager.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(manager.list(JobFilter::default()).len(), 1);
    }

    #[tokio::test]
    async fn pause_on_unknown_job_is_not_found() {
        let (manager, _workflow_id) = manager_with_template();
        let err = manager.pause(JobId::new()).unwrap_err();
        assert!(matches!(err, JobManagerError::NotFound(_)));
    }

    #[tokio::test]
    async fn archive_is_rejected_on_a_non_terminal_job() {
        let (manager, workflow_id) = manager_with_template();
        let job_id = manager
            .create(JobSubmission {
                workflow_id,
                inputs: serde_json::json!({"topic": "rust"}),
                metadata: StdHashMap::new(),
                tone: None,
                perf: None,
            })
            .unwrap();
        // Very likely still running/queued immediately after submission.
        let result = manager.archive(job_id);
        if manager.get(job_id).unwrap().status.is_terminal() {
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(JobManagerError::RejectedCommand(_))));
        }
    }
}
