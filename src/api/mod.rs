//! The HTTP/JSON control surface's request types and handler functions
//! (§6), assembled into a router by [`crate::server`].
//!
//! Grounded on the teacher's `api` module: a flat `types` + `handlers` pair
//! sharing one `AppState`, the same shape `server::graphql` wires into an
//! axum `Router` via `.with_state(...)`.

pub mod handlers;
pub mod types;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

use crate::collaborators::ArtifactSink;
use crate::engine::{AgentRegistry, CheckpointStore, JobManager, JobManagerError, StreamGateway, TemplateRegistry};
use crate::error::OrchestratorError;
use crate::models::WorkflowId;

/// Shared state behind every handler (§6). One instance per process,
/// constructed once at startup and cloned cheaply (every field is an `Arc`).
#[derive(Clone)]
pub struct AppState {
    pub job_manager: Arc<JobManager>,
    pub templates: Arc<dyn TemplateRegistry>,
    pub agents: Arc<dyn AgentRegistry>,
    pub checkpoint_store: Arc<dyn CheckpointStore>,
    pub artifact_sink: Arc<dyn ArtifactSink>,
    pub stream_gateway: Arc<StreamGateway>,
}

impl AppState {
    pub fn known_workflow(&self, id: &str) -> Option<WorkflowId> {
        let workflow_id = WorkflowId::from(id);
        self.templates.get(&workflow_id).map(|_| workflow_id)
    }
}

/// Maps the closed error taxonomy (§7) onto HTTP status codes. Every
/// handler funnels its failures through this single conversion so the
/// status-code/error-kind mapping lives in exactly one place.
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(types::ErrorResponse { error: self.1 })).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::InvalidInputs(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::TemplateNotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::JobNotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::CheckpointNotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::UnknownAgent(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::ContractViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            OrchestratorError::Cancelled => StatusCode::CONFLICT,
            OrchestratorError::RejectedCommand(_) => StatusCode::CONFLICT,
            OrchestratorError::LLMUnavailable(_)
            | OrchestratorError::Timeout(_)
            | OrchestratorError::Internal(_)
            | OrchestratorError::Storage(_)
            | OrchestratorError::Serialization(_)
            | OrchestratorError::TemplateCompileError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, crate::error::redact_secrets(&err.to_string()))
    }
}

impl From<JobManagerError> for ApiError {
    fn from(err: JobManagerError) -> Self {
        match err {
            JobManagerError::NotFound(id) => ApiError(StatusCode::NOT_FOUND, format!("job not found: {id}")),
            JobManagerError::RejectedCommand(msg) => ApiError(StatusCode::CONFLICT, msg),
            JobManagerError::Orchestrator(inner) => inner.into(),
        }
    }
}
