//! The HTTP/JSON control surface and `/ws` live stream (§6).
//!
//! Grounded on the teacher's `server::graphql::{GraphQLServerConfig,
//! GraphQLServerBuilder, GraphQLServer}` trio: a small `Config`, a builder
//! that assembles the `AppState` piece by piece, and a `run` that wires an
//! axum `Router`, optionally layers permissive CORS, and serves on the
//! configured address — same axum 0.6 `Router::new().route(...)
//! .with_state(...)` plus `Server::bind(...).serve(...)` shape as
//! `GraphQLServer::run`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::handlers;
use crate::api::AppState;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub cors_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4500".to_string(),
            cors_enabled: true,
        }
    }
}

/// Builder assembling the control surface's `AppState` and `ServerConfig`
/// (§9 "constructed once at startup"), mirroring `GraphQLServerBuilder`'s
/// `with_*` chain.
pub struct OrchestratorServerBuilder {
    config: ServerConfig,
    state: Option<AppState>,
}

impl Default for OrchestratorServerBuilder {
    fn default() -> Self {
        Self {
            config: ServerConfig::default(),
            state: None,
        }
    }
}

impl OrchestratorServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_state(mut self, state: AppState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn build(self) -> OrchestratorServer {
        OrchestratorServer {
            config: self.config,
            state: Arc::new(self.state.expect("with_state must be called before build")),
        }
    }
}

pub struct OrchestratorServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl OrchestratorServer {
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/jobs", post(handlers::create_job).get(handlers::list_jobs))
            .route("/jobs/:id", get(handlers::get_job))
            .route("/jobs/:id/pause", post(handlers::pause_job))
            .route("/jobs/:id/resume", post(handlers::resume_job))
            .route("/jobs/:id/step", post(handlers::step_job))
            .route("/jobs/:id/cancel", post(handlers::cancel_job))
            .route("/jobs/:id/retry", post(handlers::retry_job))
            .route("/jobs/:id/archive", post(handlers::archive_job))
            .route("/jobs/:id/unarchive", post(handlers::unarchive_job))
            .route("/jobs/:id/logs/stream", get(handlers::stream_job_logs))
            .route("/jobs/:id/artifacts", get(handlers::list_job_artifacts))
            .route("/artifacts/*reference", get(handlers::get_artifact))
            .route("/agents", get(handlers::list_agents))
            .route("/workflows", get(handlers::list_workflows))
            .route("/checkpoints", get(handlers::list_checkpoints))
            .route("/checkpoints/:id/restore", post(handlers::restore_checkpoint))
            .route("/checkpoints/:id", delete(handlers::delete_checkpoint))
            .route("/ws", get(handlers::ws_handler))
            .with_state(self.state.clone());

        if self.config.cors_enabled {
            router = router.layer(CorsLayer::permissive());
        }
        router
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .expect("bind_addr must be a valid socket address");
        let router = self.router();
        tracing::info!(%addr, "control surface listening");
        axum::Server::bind(&addr)
            .serve(router.into_make_service())
            .await
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        Ok(())
    }
}
