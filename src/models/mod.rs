//! Core domain models for the workflow orchestration engine.
//!
//! These are the generic, language-agnostic data structures described in
//! the data model: agent definitions, workflow templates, jobs, execution
//! context, checkpoints, and events. Module layout mirrors the teacher's
//! `models/` directory: one submodule per concept, re-exported flat from
//! here so callers write `workflow_orchestrator::models::Job` instead of
//! `workflow_orchestrator::models::job::Job`.

pub mod agent;
pub mod checkpoint;
pub mod context;
pub mod event;
pub mod ids;
pub mod job;
pub mod template;

pub use agent::{
    AgentCapabilities, AgentCategory, AgentDefinition, Contract, FieldDescriptor, FieldType,
    ResourceLimits,
};
pub use checkpoint::{CheckpointMetadata, CheckpointRecord, CHECKPOINT_SCHEMA_VERSION};
pub use context::{AgentIoRecord, ArtifactRef, ConfigSnapshot, ExecutionContext};
pub use event::{Event, EventType};
pub use ids::{AgentId, CheckpointId, JobId, StepId, WorkflowId};
pub use job::{Job, JobStatus};
pub use template::{
    compile, CompiledTemplate, EntrySchema, StepDefinition, TemplateCompileError, WorkflowTemplate,
};
