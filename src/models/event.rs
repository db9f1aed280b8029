//! Events published on the Event Bus (§3, §4.D).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, StepId};

/// The closed set of event types (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "RUN.QUEUED")]
    RunQueued,
    #[serde(rename = "RUN.STARTED")]
    RunStarted,
    #[serde(rename = "RUN.PAUSED")]
    RunPaused,
    #[serde(rename = "RUN.RESUMED")]
    RunResumed,
    #[serde(rename = "RUN.STEP_READY")]
    RunStepReady,
    #[serde(rename = "RUN.FINISHED")]
    RunFinished,
    #[serde(rename = "RUN.CANCELLED")]
    RunCancelled,
    #[serde(rename = "RUN.FAILED")]
    RunFailed,
    #[serde(rename = "NODE.START")]
    NodeStart,
    #[serde(rename = "NODE.STDOUT")]
    NodeStdout,
    #[serde(rename = "NODE.CHECKPOINT")]
    NodeCheckpoint,
    #[serde(rename = "NODE.OUTPUT")]
    NodeOutput,
    #[serde(rename = "NODE.ERROR")]
    NodeError,
    #[serde(rename = "FLOW.EDGE")]
    FlowEdge,
    #[serde(rename = "CP.WRITTEN")]
    CpWritten,
    #[serde(rename = "CP.RESTORED")]
    CpRestored,
}

impl EventType {
    /// Prefix used by subscriber filters (`NODE.*`, `RUN.*`, `CP.*`), §4.D.
    pub fn prefix(self) -> &'static str {
        match self {
            EventType::RunQueued
            | EventType::RunStarted
            | EventType::RunPaused
            | EventType::RunResumed
            | EventType::RunStepReady
            | EventType::RunFinished
            | EventType::RunCancelled
            | EventType::RunFailed => "RUN",
            EventType::NodeStart
            | EventType::NodeStdout
            | EventType::NodeCheckpoint
            | EventType::NodeOutput
            | EventType::NodeError => "NODE",
            EventType::FlowEdge => "FLOW",
            EventType::CpWritten | EventType::CpRestored => "CP",
        }
    }
}

/// A single structured event (§3: `(type, job_id, step_id?, timestamp,
/// payload)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub job_id: JobId,
    pub step_id: Option<StepId>,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, job_id: JobId, step_id: Option<StepId>, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            job_id,
            step_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}
