//! Handler functions backing the HTTP/JSON control surface and the `/ws`
//! live stream (§6).
//!
//! Grounded on the teacher's `api::handlers` module for the HTTP side and
//! `api::agents::websocket_handlers::{ws_handler, handle_socket}` for the
//! WebSocket side: a forwarding task drains an `mpsc` channel into the
//! socket while the read loop dispatches incoming control frames, the same
//! split the teacher uses to keep outbound writes single-writer.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{Stream, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::collaborators::ArtifactSink;
use crate::engine::job_manager::{JobFilter, JobSubmission};
use crate::engine::{AgentRegistry, CheckpointStore, TemplateRegistry};
use crate::models::{CheckpointId, Event, JobId, WorkflowId};

use super::types::{
    AgentListResponse, ArtifactDescriptor, ArtifactListResponse, CheckpointListQuery,
    CheckpointListResponse, CreateJobRequest, CreateJobResponse, JobListQuery, JobListResponse,
    RestoreCheckpointResponse, StreamClientMessage, StreamServerMessage, WorkflowListResponse,
};
use super::{ApiError, AppState};

pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    let job_id = state.job_manager.create(JobSubmission {
        workflow_id: WorkflowId::from(request.workflow_id),
        inputs: request.inputs,
        metadata: request.metadata,
        tone: request.tone,
        perf: request.perf,
    })?;
    state.stream_gateway.watch_job(job_id);
    let job = state.job_manager.get(job_id)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id,
            status: job.status,
        }),
    ))
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobListQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let status = query
        .parse_status()
        .map_err(|msg| ApiError::from(crate::error::OrchestratorError::InvalidInputs(msg)))?;
    let jobs = state.job_manager.list(JobFilter {
        status,
        include_archived: query.archived,
        limit: query.limit,
        offset: query.offset.unwrap_or(0),
    });
    let total = jobs.len();
    Ok(Json(JobListResponse { jobs, total }))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<crate::models::Job>, ApiError> {
    Ok(Json(state.job_manager.get(JobId::from(job_id))?))
}

pub async fn pause_job(State(state): State<Arc<AppState>>, Path(job_id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.job_manager.pause(JobId::from(job_id))?;
    Ok(StatusCode::OK)
}

pub async fn resume_job(State(state): State<Arc<AppState>>, Path(job_id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.job_manager.resume(JobId::from(job_id))?;
    Ok(StatusCode::OK)
}

pub async fn step_job(State(state): State<Arc<AppState>>, Path(job_id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.job_manager.step(JobId::from(job_id))?;
    Ok(StatusCode::OK)
}

pub async fn cancel_job(State(state): State<Arc<AppState>>, Path(job_id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.job_manager.cancel(JobId::from(job_id))?;
    Ok(StatusCode::OK)
}

pub async fn retry_job(State(state): State<Arc<AppState>>, Path(job_id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.job_manager.retry(JobId::from(job_id)).await?;
    Ok(StatusCode::OK)
}

pub async fn archive_job(State(state): State<Arc<AppState>>, Path(job_id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.job_manager.archive(JobId::from(job_id))?;
    Ok(StatusCode::OK)
}

pub async fn unarchive_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.job_manager.unarchive(JobId::from(job_id))?;
    Ok(StatusCode::OK)
}

pub async fn list_job_artifacts(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ArtifactListResponse>, ApiError> {
    let job = state.job_manager.get(JobId::from(job_id))?;
    let artifacts = job
        .context
        .artifacts
        .into_iter()
        .map(|(name, reference)| ArtifactDescriptor {
            name,
            reference: reference.path,
            size_bytes: reference.size_bytes,
        })
        .collect();
    Ok(Json(ArtifactListResponse { artifacts }))
}

pub async fn get_artifact(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> Result<Response, ApiError> {
    let bytes = state.artifact_sink.read(&reference).await?;
    Ok((StatusCode::OK, bytes).into_response())
}

pub async fn list_agents(State(state): State<Arc<AppState>>) -> Json<AgentListResponse> {
    Json(AgentListResponse {
        agents: state.agents.list(),
    })
}

pub async fn list_workflows(State(state): State<Arc<AppState>>) -> Json<WorkflowListResponse> {
    Json(WorkflowListResponse {
        workflows: state.templates.list(),
    })
}

pub async fn list_checkpoints(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckpointListQuery>,
) -> Result<Json<CheckpointListResponse>, ApiError> {
    let checkpoints = state.checkpoint_store.list(query.job_id).await?;
    Ok(Json(CheckpointListResponse { checkpoints }))
}

pub async fn restore_checkpoint(
    State(state): State<Arc<AppState>>,
    Path(checkpoint_id): Path<String>,
) -> Result<Json<RestoreCheckpointResponse>, ApiError> {
    let checkpoint_id = CheckpointId::from(checkpoint_id);
    let context = state.checkpoint_store.restore(&checkpoint_id).await?;
    Ok(Json(RestoreCheckpointResponse {
        checkpoint_id,
        context,
    }))
}

pub async fn delete_checkpoint(
    State(state): State<Arc<AppState>>,
    Path(checkpoint_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.checkpoint_store.delete(&CheckpointId::from(checkpoint_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn to_sse_event(event: Event) -> Result<SseEvent, std::convert::Infallible> {
    Ok(SseEvent::default().data(serde_json::to_string(&event).unwrap_or_default()))
}

/// `GET /jobs/{id}/logs/stream` (§6 "server-pushed event stream, framed,
/// line-delimited JSON"). Replays the Stream Gateway's backlog, then tails
/// live — same replay-then-tail contract `StreamGateway::subscribe` exposes
/// to the `/ws` handler below, just rendered as SSE instead of a socket
/// frame for clients that only need one-way delivery.
pub async fn stream_job_logs(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let job_id = JobId::from(job_id);
    let session = state.stream_gateway.subscribe(job_id);
    let replay: std::collections::VecDeque<Event> = session.replay.clone().into();
    let stream = futures::stream::unfold((replay, session), |(mut replay, mut session)| async move {
        if let Some(event) = replay.pop_front() {
            return Some((event, (replay, session)));
        }
        let event = session.recv().await?;
        Some((event, (replay, session)))
    })
    .map(to_sse_event);
    Sse::new(stream)
}

/// `/ws` (§6 "bidirectional framed channel"). Grounded on the teacher's
/// `ws_handler`/`handle_socket` pair.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::channel::<StreamServerMessage>(100);

    let forward_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    while let Some(Ok(message)) = source.next().await {
        let Message::Text(text) = message else { continue };
        match serde_json::from_str::<StreamClientMessage>(&text) {
            Ok(StreamClientMessage::Subscribe { job_id }) => {
                subscriptions.push(spawn_subscription_forwarder(state.clone(), job_id, tx.clone()));
            }
            Ok(StreamClientMessage::Pause { job_id }) => {
                let _ = state.job_manager.pause(job_id);
                let _ = tx.send(ack("pause", job_id)).await;
            }
            Ok(StreamClientMessage::Resume { job_id }) => {
                let _ = state.job_manager.resume(job_id);
                let _ = tx.send(ack("resume", job_id)).await;
            }
            Ok(StreamClientMessage::Step { job_id }) => {
                let _ = state.job_manager.step(job_id);
                let _ = tx.send(ack("step", job_id)).await;
            }
            Ok(StreamClientMessage::Cancel { job_id }) => {
                let _ = state.job_manager.cancel(job_id);
                let _ = tx.send(ack("cancel", job_id)).await;
            }
            Ok(StreamClientMessage::Retry { job_id }) => {
                let manager = state.job_manager.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _ = manager.retry(job_id).await;
                    let _ = tx.send(ack("retry", job_id)).await;
                });
            }
            Err(err) => {
                let _ = tx
                    .send(StreamServerMessage::Error {
                        message: err.to_string(),
                    })
                    .await;
            }
        }
    }

    for task in subscriptions {
        task.abort();
    }
    forward_task.abort();
}

fn ack(action: &str, job_id: JobId) -> StreamServerMessage {
    StreamServerMessage::Ack {
        action: action.to_string(),
        job_id,
    }
}

fn spawn_subscription_forwarder(
    state: Arc<AppState>,
    job_id: JobId,
    tx: mpsc::Sender<StreamServerMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut session = state.stream_gateway.subscribe(job_id);
        for event in session.replay.drain(..) {
            if tx.send(StreamServerMessage::Event(event)).await.is_err() {
                return;
            }
        }
        while let Some(event) = session.recv().await {
            let missed = session.missed();
            if missed > 0
                && tx
                    .send(StreamServerMessage::Missed { job_id, count: missed })
                    .await
                    .is_err()
            {
                return;
            }
            if tx.send(StreamServerMessage::Event(event)).await.is_err() {
                return;
            }
        }
    })
}
