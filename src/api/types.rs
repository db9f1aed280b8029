//! Request/response DTOs and WebSocket control-frame types for the HTTP/WS
//! control surface (§6).
//!
//! Grounded on the teacher's `api::types` module: thin `serde`-derived
//! wrappers around query/body payloads. Responses reuse the domain model
//! types directly wherever they are already the right wire shape — `Job`
//! already skips its `context` field in `Serialize`, so it doubles as its
//! own DTO without another layer of mapping.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::{
    AgentDefinition, CheckpointId, CheckpointMetadata, Event, ExecutionContext, Job, JobId,
    JobStatus, WorkflowTemplate,
};

/// `POST /jobs` body (§6, mirrors §4.G's `JobSubmission`).
#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    pub workflow_id: String,
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub tone: Option<String>,
    pub perf: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// `GET /jobs?status=&limit=&offset=` query parameters. `archived=true`
/// additionally opts into seeing archived jobs (§4.G "hidden from the
/// default list").
#[derive(Debug, Clone, Deserialize, Default)]
pub struct JobListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    #[serde(default)]
    pub archived: bool,
}

impl JobListQuery {
    pub fn parse_status(&self) -> Result<Option<JobStatus>, String> {
        match &self.status {
            None => Ok(None),
            Some(raw) => serde_json::from_value(serde_json::Value::String(raw.clone()))
                .map(Some)
                .map_err(|_| format!("unknown job status '{raw}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentListResponse {
    pub agents: Vec<AgentDefinition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowListResponse {
    pub workflows: Vec<WorkflowTemplate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactDescriptor {
    pub name: String,
    pub reference: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactListResponse {
    pub artifacts: Vec<ArtifactDescriptor>,
}

/// `GET /checkpoints?job_id=`.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointListQuery {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointListResponse {
    pub checkpoints: Vec<CheckpointMetadata>,
}

/// `POST /checkpoints/{id}/restore` — exposes the Checkpoint Store's
/// `restore` operation directly (§4.E "returns a deep copy"), rather than
/// folding it into job control; a caller that wants to resume a job from a
/// specific checkpoint uses this to inspect the snapshot it would resume
/// into.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreCheckpointResponse {
    pub checkpoint_id: CheckpointId,
    pub context: ExecutionContext,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Client-to-server WebSocket control frames (§6 "client-to-server control
/// frames mirror the POST endpoints above"). Grounded on the teacher's
/// `ClientMessage`/`ServerMessage` serde-tagged enum pair in
/// `websocket_handlers.rs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StreamClientMessage {
    Subscribe { job_id: JobId },
    Pause { job_id: JobId },
    Resume { job_id: JobId },
    Step { job_id: JobId },
    Cancel { job_id: JobId },
    Retry { job_id: JobId },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamServerMessage {
    Event(Event),
    Missed { job_id: JobId, count: u64 },
    Ack { action: String, job_id: JobId },
    Error { message: String },
}
