//! Workflow Orchestration Engine.
//!
//! A content-generation orchestrator: given a topic and a named DAG of
//! agents (a workflow template), it executes the graph across cooperating
//! worker tasks — ingesting source documents, embedding and retrieving from
//! a vector store, invoking one of several LLM providers, validating and
//! assembling artifacts — while streaming live execution telemetry to
//! connected observers and persisting checkpoints that let a job be paused,
//! resumed, restored, or cancelled.
//!
//! ## Layout
//!
//! - [`models`] — the data model: agent definitions, workflow templates,
//!   jobs, execution context, checkpoints, events.
//! - [`engine`] — the eight components that do the work: Agent Registry,
//!   Template Registry, Event Bus, Checkpoint Store, DAG Scheduler, Job
//!   Manager, Stream Gateway (the LLM Gateway lives in [`llm`]).
//! - [`llm`] — the LLM Gateway: an ordered provider fallback chain behind a
//!   singleflight cache and per-provider rate limiting.
//! - [`collaborators`] — trait-only interfaces for the vector store,
//!   embedding service, artifact sink, and clock the core depends on but
//!   does not implement, plus in-memory stand-ins good enough to exercise
//!   those interfaces in tests.
//! - [`server`] — the axum HTTP/JSON control surface and WebSocket live
//!   stream.
//! - [`api`] — request/response types and handlers backing the server.
//! - [`config`] — environment-driven process configuration.
//! - [`error`] — the closed error taxonomy and secret redaction.
//! - [`bootstrap`] — wires a [`config::Config`] into a running [`bootstrap::Runtime`],
//!   shared by the `server` and `cli` binaries.

pub mod api;
pub mod bootstrap;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod llm;
pub mod models;
pub mod server;

pub use error::{redact_secrets, OrchestratorError, Result};
