//! End-to-end scenario coverage driven entirely through the public
//! `JobManager` surface, the same way a control-surface handler would drive
//! it. These exercise the multi-step interactions unit tests inside
//! `engine::scheduler`/`engine::job_manager` don't reach on their own: a
//! concurrent fan-out/fan-in under a concurrency cap, pausing mid-run and
//! resuming, cancelling with steps in flight, and restoring a checkpoint
//! after deleting the in-memory context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout, Duration};

use workflow_orchestrator::collaborators::{
    GenerateOptions, InMemoryArtifactSink, InMemoryVectorStore, NullEmbeddingService, SystemClock,
    TextGenerator,
};
use workflow_orchestrator::engine::checkpoint_store::{CheckpointStore, InMemoryCheckpointStore};
use workflow_orchestrator::engine::events::EventBus;
use workflow_orchestrator::engine::job_manager::{JobFilter, JobManager, JobSubmission};
use workflow_orchestrator::engine::registry::InMemoryAgentRegistry;
use workflow_orchestrator::engine::scheduler::{
    AgentCallContext, AgentCollaborators, AgentExecutor, AgentInvokeError, StaticAgentDispatch,
};
use workflow_orchestrator::engine::templates::InMemoryTemplateRegistry;
use workflow_orchestrator::engine::{AgentRegistry, TemplateRegistry};
use workflow_orchestrator::models::{
    AgentCapabilities, AgentCategory, AgentDefinition, AgentId, FieldDescriptor, FieldType,
    JobStatus, ResourceLimits, StepDefinition, StepId, WorkflowId, WorkflowTemplate,
};

fn agent_def(id: &str) -> AgentDefinition {
    AgentDefinition {
        id: AgentId::from(id),
        category: AgentCategory::Content,
        version: "1.0.0".to_string(),
        input_contract: HashMap::new(),
        output_contract: HashMap::new(),
        capabilities: AgentCapabilities::default(),
        resources: ResourceLimits {
            max_runtime_seconds: 30,
            max_tokens: 1000,
            max_memory_mb: 128,
        },
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

fn required_topic() -> HashMap<String, FieldDescriptor> {
    let mut schema = HashMap::new();
    schema.insert(
        "topic".to_string(),
        FieldDescriptor {
            field_type: FieldType::String,
            required: true,
        },
    );
    schema
}

struct NullGenerator;
#[async_trait]
impl TextGenerator for NullGenerator {
    async fn generate(
        &self,
        _prompt: &str,
        _options: GenerateOptions,
    ) -> workflow_orchestrator::Result<String> {
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

/// Build a `JobManager` over `template`, whose steps are all named after
/// entries in `dispatch`. `max_concurrency` and the checkpoint store are
/// passed in so scenarios can inspect checkpoints directly after the run.
fn manager_for(
    template: WorkflowTemplate,
    dispatch: StaticAgentDispatch,
    max_concurrency: usize,
    checkpoint_store: Arc<dyn CheckpointStore>,
) -> (Arc<JobManager>, Arc<EventBus>) {
    let agent_ids: Vec<AgentId> = template.steps.iter().map(|s| s.agent_id.clone()).collect();
    let agents: Arc<dyn AgentRegistry> = Arc::new(
        InMemoryAgentRegistry::load(agent_ids.iter().map(|id| agent_def(id.as_str())).collect())
            .unwrap(),
    );
    let templates: Arc<dyn TemplateRegistry> =
        Arc::new(InMemoryTemplateRegistry::load(vec![template], agents.as_ref()).unwrap());
    let event_bus = Arc::new(EventBus::new(128));
    let manager = JobManager::new(
        templates,
        agents,
        Arc::new(dispatch),
        event_bus.clone(),
        checkpoint_store,
        collaborators(),
        Arc::new(SystemClock),
        max_concurrency,
    );
    (manager, event_bus)
}

async fn await_status(manager: &JobManager, job_id: workflow_orchestrator::models::JobId, pred: impl Fn(JobStatus) -> bool) {
    timeout(Duration::from_secs(5), async {
        loop {
            if pred(manager.get(job_id).unwrap().status) {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("status condition never reached")
}

/// S2: a diamond (`ingest -> {seo, code} -> publish`) under a concurrency
/// cap of 2 — `seo_pass` and `code_pass` both dispatch once `ingest`
/// completes, both run concurrently, and `publish` waits for both.
#[tokio::test]
async fn s2_diamond_fans_out_and_back_in_under_the_concurrency_cap() {
    struct EchoAgent(serde_json::Value);
    #[async_trait]
    impl AgentExecutor for EchoAgent {
        async fn invoke(
            &self,
            _ctx: &AgentCallContext,
            _input: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, AgentInvokeError> {
            Ok(self.0.clone())
        }
    }

    struct ConcurrentAgent {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }
    #[async_trait]
    impl AgentExecutor for ConcurrentAgent {
        async fn invoke(
            &self,
            _ctx: &AgentCallContext,
            _input: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, AgentInvokeError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(40)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(serde_json::json!({}))
        }
    }

    let template = WorkflowTemplate {
        id: WorkflowId::from("review_diamond"),
        name: "diamond".to_string(),
        description: String::new(),
        steps: vec![
            step("ingest", &[]),
            step("seo_pass", &["ingest"]),
            step("code_pass", &["ingest"]),
            step("publish", &["seo_pass", "code_pass"]),
        ],
        entry_inputs: required_topic(),
    };

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let dispatch = StaticAgentDispatch::new()
        .register(AgentId::from("ingest"), Arc::new(EchoAgent(serde_json::json!({}))))
        .register(
            AgentId::from("seo_pass"),
            Arc::new(ConcurrentAgent {
                current: current.clone(),
                peak: peak.clone(),
            }),
        )
        .register(
            AgentId::from("code_pass"),
            Arc::new(ConcurrentAgent {
                current: current.clone(),
                peak: peak.clone(),
            }),
        )
        .register(AgentId::from("publish"), Arc::new(EchoAgent(serde_json::json!({"published": true}))));

    let (manager, _events) = manager_for(template, dispatch, 2, Arc::new(InMemoryCheckpointStore::new()));
    let job_id = manager
        .create(JobSubmission {
            workflow_id: WorkflowId::from("review_diamond"),
            inputs: serde_json::json!({"topic": "rust"}),
            metadata: HashMap::new(),
            tone: None,
            perf: None,
        })
        .unwrap();

    await_status(&manager, job_id, JobStatus::is_terminal).await;
    let job = manager.get(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(peak.load(Ordering::SeqCst), 2, "seo_pass and code_pass must overlap");
}

/// S3: `A` fails transiently twice then succeeds (`max_attempts = 3`). A
/// client polling `GET /jobs/{id}` must be able to observe the job's status
/// pass through `retrying` between two `running` periods before it
/// completes — the scheduler's retry loop runs entirely inside a spawned
/// step task, so this also exercises the signal that tells the control loop
/// a step is mid-retry.
#[tokio::test]
async fn s3_transient_failure_surfaces_a_retrying_status_before_completing() {
    struct FlakyAgent {
        failures_remaining: AtomicU8,
        output: serde_json::Value,
    }
    #[async_trait]
    impl AgentExecutor for FlakyAgent {
        async fn invoke(
            &self,
            _ctx: &AgentCallContext,
            _input: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, AgentInvokeError> {
            let failed = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    if n > 0 {
                        Some(n - 1)
                    } else {
                        None
                    }
                })
                .is_ok();
            if failed {
                Err(AgentInvokeError::Transient("not yet".to_string()))
            } else {
                Ok(self.output.clone())
            }
        }
    }

    let template = WorkflowTemplate {
        id: WorkflowId::from("flaky_single"),
        name: "flaky".to_string(),
        description: String::new(),
        steps: vec![step("A", &[])],
        entry_inputs: required_topic(),
    };

    let dispatch = StaticAgentDispatch::new().register(
        AgentId::from("A"),
        Arc::new(FlakyAgent {
            failures_remaining: AtomicU8::new(2),
            output: serde_json::json!({"ok": true}),
        }),
    );

    let (manager, _events) = manager_for(template, dispatch, 3, Arc::new(InMemoryCheckpointStore::new()));
    let job_id = manager
        .create(JobSubmission {
            workflow_id: WorkflowId::from("flaky_single"),
            inputs: serde_json::json!({"topic": "rust"}),
            metadata: HashMap::new(),
            tone: None,
            perf: None,
        })
        .unwrap();

    // Sample the job's status on a tight poll until it reaches a terminal
    // state, recording every distinct transition observed along the way —
    // the same view an external client polling `GET /jobs/{id}` would get.
    let observed = timeout(Duration::from_secs(5), async {
        let mut transitions = vec![manager.get(job_id).unwrap().status];
        loop {
            let status = manager.get(job_id).unwrap().status;
            if transitions.last() != Some(&status) {
                transitions.push(status);
            }
            if status.is_terminal() {
                return transitions;
            }
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("job never reached a terminal status");

    assert_eq!(
        *observed.last().unwrap(),
        JobStatus::Completed,
        "status transitions observed: {observed:?}"
    );
    let retry_idx = observed
        .iter()
        .position(|s| *s == JobStatus::Retrying)
        .unwrap_or_else(|| panic!("job must pass through Retrying: {observed:?}"));
    assert_eq!(
        observed[retry_idx - 1],
        JobStatus::Running,
        "retrying must be entered from running: {observed:?}"
    );
    assert_eq!(
        observed[retry_idx + 1],
        JobStatus::Running,
        "retrying must clear back to running before completion: {observed:?}"
    );
}

/// S4: pausing while a step is mid-run lets that step finish and checkpoint,
/// but holds back dispatch of the next step until resumed.
#[tokio::test]
async fn s4_pause_holds_the_next_step_until_resume() {
    struct EchoAgent(serde_json::Value);
    #[async_trait]
    impl AgentExecutor for EchoAgent {
        async fn invoke(
            &self,
            _ctx: &AgentCallContext,
            _input: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, AgentInvokeError> {
            Ok(self.0.clone())
        }
    }

    struct BlockingAgent {
        started: Arc<Notify>,
        go: Arc<Notify>,
    }
    #[async_trait]
    impl AgentExecutor for BlockingAgent {
        async fn invoke(
            &self,
            _ctx: &AgentCallContext,
            _input: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, AgentInvokeError> {
            self.started.notify_one();
            self.go.notified().await;
            Ok(serde_json::json!({}))
        }
    }

    let template = WorkflowTemplate {
        id: WorkflowId::from("sequential"),
        name: "sequential".to_string(),
        description: String::new(),
        steps: vec![
            step("A", &[]),
            step("B", &["A"]),
            step("C", &["B"]),
            step("D", &["C"]),
        ],
        entry_inputs: required_topic(),
    };

    let started = Arc::new(Notify::new());
    let go = Arc::new(Notify::new());
    let dispatch = StaticAgentDispatch::new()
        .register(AgentId::from("A"), Arc::new(EchoAgent(serde_json::json!({}))))
        .register(
            AgentId::from("B"),
            Arc::new(BlockingAgent {
                started: started.clone(),
                go: go.clone(),
            }),
        )
        .register(AgentId::from("C"), Arc::new(EchoAgent(serde_json::json!({}))))
        .register(AgentId::from("D"), Arc::new(EchoAgent(serde_json::json!({}))));

    let checkpoint_store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (manager, _events) = manager_for(template, dispatch, 3, checkpoint_store.clone());
    let job_id = manager
        .create(JobSubmission {
            workflow_id: WorkflowId::from("sequential"),
            inputs: serde_json::json!({"topic": "rust"}),
            metadata: HashMap::new(),
            tone: None,
            perf: None,
        })
        .unwrap();

    timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("B never started");
    manager.pause(job_id).unwrap();
    await_status(&manager, job_id, |s| s == JobStatus::Paused).await;
    go.notify_one();

    // B settles and checkpoints while the job stays paused; C never starts.
    sleep(Duration::from_millis(100)).await;
    let checkpoints = checkpoint_store.list(job_id).await.unwrap();
    assert!(checkpoints.iter().any(|cp| cp.step_id == StepId::from("B")));
    let job = manager.get(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Paused);
    assert_ne!(job.current_step, Some(StepId::from("D")));

    manager.resume(job_id).unwrap();
    await_status(&manager, job_id, JobStatus::is_terminal).await;
    assert_eq!(manager.get(job_id).unwrap().status, JobStatus::Completed);
}

/// S5: cancelling with several steps in flight stops further dispatch
/// immediately; the in-flight steps are still awaited (within the grace
/// period) and the steps that never got to run, never do.
#[tokio::test]
async fn s5_cancel_mid_run_settles_in_flight_steps_and_drops_the_rest() {
    struct SlowAgent {
        ran: Arc<std::sync::atomic::AtomicBool>,
    }
    #[async_trait]
    impl AgentExecutor for SlowAgent {
        async fn invoke(
            &self,
            _ctx: &AgentCallContext,
            _input: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, AgentInvokeError> {
            sleep(Duration::from_millis(80)).await;
            self.ran.store(true, Ordering::SeqCst);
            Ok(serde_json::json!({}))
        }
    }

    // Five independent steps (no edges) so all become ready at once; the cap
    // of 3 keeps exactly three running when we cancel.
    let ids = ["s1", "s2", "s3", "s4", "s5"];
    let template = WorkflowTemplate {
        id: WorkflowId::from("fan"),
        name: "fan".to_string(),
        description: String::new(),
        steps: ids.iter().map(|id| step(id, &[])).collect(),
        entry_inputs: required_topic(),
    };

    let mut dispatch = StaticAgentDispatch::new();
    let mut flags = Vec::new();
    for id in ids {
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        flags.push((id, ran.clone()));
        dispatch = dispatch.register(AgentId::from(id), Arc::new(SlowAgent { ran }));
    }

    let (manager, _events) = manager_for(template, dispatch, 3, Arc::new(InMemoryCheckpointStore::new()));
    let job_id = manager
        .create(JobSubmission {
            workflow_id: WorkflowId::from("fan"),
            inputs: serde_json::json!({"topic": "rust"}),
            metadata: HashMap::new(),
            tone: None,
            perf: None,
        })
        .unwrap();

    // Give the scheduler a moment to dispatch the first three steps, then
    // cancel while they're still sleeping.
    sleep(Duration::from_millis(20)).await;
    manager.cancel(job_id).unwrap();

    await_status(&manager, job_id, JobStatus::is_terminal).await;
    let job = manager.get(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    let ran_count = flags.iter().filter(|(_, ran)| ran.load(Ordering::SeqCst)).count();
    assert_eq!(ran_count, 3, "exactly the three in-flight steps should settle");
}

/// S6: checkpoint restore returns an independent, byte-for-byte-equivalent
/// copy of the context as of the checkpointed step, and retrying a failed
/// job replays only the step that failed.
#[tokio::test]
async fn s6_checkpoint_restore_and_retry_replays_only_the_failed_step() {
    struct EchoAgent(serde_json::Value);
    #[async_trait]
    impl AgentExecutor for EchoAgent {
        async fn invoke(
            &self,
            _ctx: &AgentCallContext,
            _input: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, AgentInvokeError> {
            Ok(self.0.clone())
        }
    }

    struct CountingAgent {
        calls: Arc<AtomicU8>,
        fail_first: bool,
        output: serde_json::Value,
    }
    #[async_trait]
    impl AgentExecutor for CountingAgent {
        async fn invoke(
            &self,
            _ctx: &AgentCallContext,
            _input: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, AgentInvokeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                Err(AgentInvokeError::Permanent("induced failure".to_string()))
            } else {
                Ok(self.output.clone())
            }
        }
    }

    let template = WorkflowTemplate {
        id: WorkflowId::from("two_step"),
        name: "two step".to_string(),
        description: String::new(),
        steps: vec![step("A", &[]), step("B", &["A"])],
        entry_inputs: required_topic(),
    };

    let a_calls = Arc::new(AtomicU8::new(0));
    let b_calls = Arc::new(AtomicU8::new(0));
    let dispatch = StaticAgentDispatch::new()
        .register(
            AgentId::from("A"),
            Arc::new(CountingAgent {
                calls: a_calls.clone(),
                fail_first: false,
                output: serde_json::json!({"keywords": ["x", "y"]}),
            }),
        )
        .register(
            AgentId::from("B"),
            Arc::new(CountingAgent {
                calls: b_calls.clone(),
                fail_first: true,
                output: serde_json::json!({"summary": "x,y"}),
            }),
        );

    let checkpoint_store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let (manager, _events) = manager_for(template, dispatch, 3, checkpoint_store.clone());
    let job_id = manager
        .create(JobSubmission {
            workflow_id: WorkflowId::from("two_step"),
            inputs: serde_json::json!({"topic": "rust"}),
            metadata: HashMap::new(),
            tone: None,
            perf: None,
        })
        .unwrap();

    // B's first attempt is a permanent failure, so the job runs to `failed`
    // with A's checkpoint already on disk.
    await_status(&manager, job_id, JobStatus::is_terminal).await;
    assert_eq!(manager.get(job_id).unwrap().status, JobStatus::Failed);
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);

    let checkpoints = checkpoint_store.list(job_id).await.unwrap();
    let a_checkpoint = checkpoints
        .iter()
        .find(|cp| cp.step_id == StepId::from("A"))
        .expect("A's checkpoint must exist");
    let restored = checkpoint_store.restore(&a_checkpoint.checkpoint_id).await.unwrap();
    assert!(restored.has_output(&StepId::from("A")));
    assert!(!restored.has_output(&StepId::from("B")));
    assert_eq!(restored.shared["A"], serde_json::json!({"keywords": ["x", "y"]}));

    manager.retry(job_id).await.unwrap();
    await_status(&manager, job_id, JobStatus::is_terminal).await;
    assert_eq!(manager.get(job_id).unwrap().status, JobStatus::Completed);

    // Retrying from A's checkpoint must not re-invoke A.
    assert_eq!(a_calls.load(Ordering::SeqCst), 1, "A must not be replayed");
    assert_eq!(b_calls.load(Ordering::SeqCst), 2, "B replays exactly once");

    let job = manager.get(job_id).unwrap();
    assert_eq!(job.retry_count, 1);
    assert_eq!(manager.list(JobFilter::default()).len(), 1);
}
