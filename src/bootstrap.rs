//! Process bootstrap: wires a [`Config`](crate::config::Config) into a
//! running [`Runtime`] — the Agent Registry and Template Registry catalogs,
//! the LLM Gateway's provider chain, the Checkpoint Store backend, and the
//! Job Manager they all feed into.
//!
//! Grounded on the teacher's `GraphQLServerBuilder::add_default_workflows`
//! (`server/graphql.rs`): a handful of hardcoded example workflows built in
//! code at startup rather than loaded from an external file, because this
//! crate's concrete agent catalog is a fixture for the core to run against,
//! not a production integration surface (§1 "concrete agent bodies ...
//! out of scope"). Shared by both `bin/server.rs` and `bin/cli.rs` so the
//! two entry points never drift apart on what "the default catalog" means.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::collaborators::{
    ArtifactSink, Clock, GenerateOptions, InMemoryArtifactSink, InMemoryVectorStore,
    NullEmbeddingService, SystemClock,
};
use crate::config::Config;
use crate::engine::checkpoint_store::{CheckpointStore, FileCheckpointStore};
use crate::engine::job_manager::JobManager;
use crate::engine::registry::InMemoryAgentRegistry;
use crate::engine::scheduler::{
    AgentCallContext, AgentCollaborators, AgentDispatch, AgentExecutor, AgentInvokeError,
    StaticAgentDispatch,
};
use crate::engine::templates::InMemoryTemplateRegistry;
use crate::engine::{AgentRegistry, EventBus, StreamGateway, TemplateRegistry};
use crate::llm::gateway::ProviderSlot;
use crate::llm::providers::{AnthropicClient, OllamaClient, OpenAIClient};
use crate::llm::{ApiKey, LLMGateway, ProviderKey};
use crate::models::{
    AgentCapabilities, AgentCategory, AgentDefinition, AgentId, FieldDescriptor, FieldType,
    ResourceLimits, StepDefinition, StepId, WorkflowId, WorkflowTemplate,
};

/// Everything a running process needs, assembled once at startup and shared
/// behind `Arc`s by both the HTTP server and the embedded CLI driver.
pub struct Runtime {
    pub job_manager: Arc<JobManager>,
    pub templates: Arc<dyn TemplateRegistry>,
    pub agents: Arc<dyn AgentRegistry>,
    pub checkpoint_store: Arc<dyn CheckpointStore>,
    pub artifact_sink: Arc<dyn ArtifactSink>,
    pub event_bus: Arc<EventBus>,
    pub stream_gateway: Arc<StreamGateway>,
}

/// Build the full runtime from a resolved [`Config`] (§6 "Environment
/// recognized by the core").
pub fn build_runtime(config: &Config) -> Runtime {
    let agents: Arc<dyn AgentRegistry> =
        Arc::new(InMemoryAgentRegistry::load(default_agent_catalog()).expect("default catalog is valid"));
    let templates: Arc<dyn TemplateRegistry> = Arc::new(
        InMemoryTemplateRegistry::load(default_template_catalog(), agents.as_ref())
            .expect("default templates compile"),
    );

    let event_bus = Arc::new(EventBus::new(config.event_buffer));
    let checkpoint_store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(&config.checkpoint_dir));
    let stream_gateway = StreamGateway::new(event_bus.clone(), config.event_buffer);

    let llm_gateway = Arc::new(build_llm_gateway(config));
    let dispatch: Arc<dyn AgentDispatch> = Arc::new(default_agent_dispatch());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let artifact_sink: Arc<dyn ArtifactSink> = Arc::new(InMemoryArtifactSink::new());

    let collaborators = AgentCollaborators {
        vector_store: Arc::new(InMemoryVectorStore::new()),
        embedding_service: Arc::new(NullEmbeddingService::default()),
        artifact_sink: artifact_sink.clone(),
        llm: llm_gateway,
    };

    let job_manager = JobManager::new(
        templates.clone(),
        agents.clone(),
        dispatch,
        event_bus.clone(),
        checkpoint_store.clone(),
        collaborators,
        clock,
        config.max_concurrency,
    );

    Runtime {
        job_manager,
        templates,
        agents,
        checkpoint_store,
        artifact_sink,
        event_bus,
        stream_gateway,
    }
}

/// The provider fallback chain (§4.C "example ordering: Local -> Hosted-A ->
/// Hosted-B"): Ollama is always registered since it needs no key, then
/// OpenAI/Anthropic are appended only when their API keys are configured —
/// an unconfigured hosted provider is simply absent from the chain rather
/// than a runtime error.
fn build_llm_gateway(config: &Config) -> LLMGateway {
    let mut providers = vec![ProviderSlot::new(
        ProviderKey::Local,
        Arc::new(OllamaClient::with_base_url(config.ollama_base_url.clone())),
        60,
        None,
    )];
    if let Some(key) = &config.openai_api_key {
        providers.push(ProviderSlot::new(
            ProviderKey::HostedA,
            Arc::new(OpenAIClient::new(ApiKey::new(key.clone()))),
            60,
            Some(ApiKey::new(key.clone())),
        ));
    }
    if let Some(key) = &config.anthropic_api_key {
        providers.push(ProviderSlot::new(
            ProviderKey::HostedB,
            Arc::new(AnthropicClient::new(ApiKey::new(key.clone()))),
            60,
            Some(ApiKey::new(key.clone())),
        ));
    }
    LLMGateway::new(providers)
}

fn agent_def(id: &str, category: AgentCategory) -> AgentDefinition {
    AgentDefinition {
        id: AgentId::from(id),
        category,
        version: "1.0.0".to_string(),
        input_contract: HashMap::new(),
        output_contract: HashMap::new(),
        capabilities: AgentCapabilities {
            async_safe: true,
            stateful: false,
            model_switchable: true,
        },
        resources: ResourceLimits {
            max_runtime_seconds: 120,
            max_tokens: 4000,
            max_memory_mb: 512,
        },
    }
}

/// A handful of fixture agents covering the categories named in §3, enough
/// to exercise the default templates below. Real agent bodies are a
/// collaborator concern (§1); these are transparent pass-through stand-ins.
fn default_agent_catalog() -> Vec<AgentDefinition> {
    vec![
        agent_def("source_ingestor", AgentCategory::Ingestion),
        agent_def("topic_researcher", AgentCategory::Research),
        agent_def("content_writer", AgentCategory::Content),
        agent_def("code_validator", AgentCategory::Code),
        agent_def("seo_optimizer", AgentCategory::Seo),
        agent_def("publisher", AgentCategory::Publishing),
    ]
}

fn required_field() -> FieldDescriptor {
    FieldDescriptor {
        field_type: FieldType::String,
        required: true,
    }
}

fn step(id: &str, agent: &str, deps: &[&str]) -> StepDefinition {
    StepDefinition {
        step_id: StepId::from(id),
        agent_id: AgentId::from(agent),
        static_params: serde_json::json!({}),
        depends_on: deps.iter().map(|d| StepId::from(*d)).collect(),
        checkpoint_boundary: true,
    }
}

/// Two templates grounded on the teacher's `add_default_workflows` pair
/// (`document_review`, `software_deployment`): a linear pipeline and a
/// diamond, both exercising real dependency edges instead of the teacher's
/// Petri-net place/activity shape.
fn default_template_catalog() -> Vec<WorkflowTemplate> {
    let mut content_pipeline_inputs = HashMap::new();
    content_pipeline_inputs.insert("topic".to_string(), required_field());

    let content_pipeline = WorkflowTemplate {
        id: WorkflowId::from("content_pipeline"),
        name: "Content Pipeline".to_string(),
        description: "Research a topic, draft content, then validate and publish it.".to_string(),
        steps: vec![
            step("research", "topic_researcher", &[]),
            step("draft", "content_writer", &["research"]),
            step("validate", "code_validator", &["draft"]),
            step("publish", "publisher", &["validate"]),
        ],
        entry_inputs: content_pipeline_inputs,
    };

    let mut review_diamond_inputs = HashMap::new();
    review_diamond_inputs.insert("topic".to_string(), required_field());

    let review_diamond = WorkflowTemplate {
        id: WorkflowId::from("review_diamond"),
        name: "Review Diamond".to_string(),
        description: "Ingest a source, then fan out into SEO and code review before publishing."
            .to_string(),
        steps: vec![
            step("ingest", "source_ingestor", &[]),
            step("seo_pass", "seo_optimizer", &["ingest"]),
            step("code_pass", "code_validator", &["ingest"]),
            step("publish", "publisher", &["seo_pass", "code_pass"]),
        ],
        entry_inputs: review_diamond_inputs,
    };

    vec![content_pipeline, review_diamond]
}

/// A pass-through agent body: echoes its validated input back out, merged
/// with a marker naming the agent that ran. Good enough to drive the
/// scheduler's dispatch/retry/checkpoint machinery end to end without
/// depending on a real content-generation implementation (§1 non-goal).
struct PassThroughAgent {
    agent_id: AgentId,
}

#[async_trait]
impl AgentExecutor for PassThroughAgent {
    async fn invoke(
        &self,
        ctx: &AgentCallContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, AgentInvokeError> {
        ctx.stdout(format!("{} processing input", self.agent_id));
        let _ = ctx
            .llm()
            .generate(
                &format!("summarize for {}", self.agent_id),
                GenerateOptions {
                    model: "fast".to_string(),
                    deterministic_params: serde_json::json!({}),
                },
            )
            .await;
        let mut output = input;
        if let serde_json::Value::Object(ref mut map) = output {
            map.insert("processed_by".to_string(), serde_json::json!(self.agent_id.as_str()));
        }
        Ok(output)
    }
}

fn default_agent_dispatch() -> StaticAgentDispatch {
    let ids: HashSet<&str> = [
        "source_ingestor",
        "topic_researcher",
        "content_writer",
        "code_validator",
        "seo_optimizer",
        "publisher",
    ]
    .into_iter()
    .collect();
    ids.into_iter().fold(StaticAgentDispatch::new(), |dispatch, id| {
        dispatch.register(
            AgentId::from(id),
            Arc::new(PassThroughAgent {
                agent_id: AgentId::from(id),
            }),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_catalog_and_templates_are_internally_consistent() {
        let config = Config::default();
        let runtime = build_runtime(&config);
        assert!(runtime.templates.get(&WorkflowId::from("content_pipeline")).is_some());
        assert!(runtime.templates.get(&WorkflowId::from("review_diamond")).is_some());
        assert!(runtime.agents.get(&AgentId::from("publisher")).is_some());
    }
}
