//! Job records and the job lifecycle state machine (§3, §4.F, §4.G).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::context::ExecutionContext;
use super::{JobId, StepId, WorkflowId};

/// Job lifecycle status (§3, §4.F state machine):
/// `pending -> running -> (paused <-> running) -> (retrying -> running)* ->
/// completed | failed | cancelled`, then optionally `archived`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Retrying,
    Completed,
    Failed,
    Cancelled,
    Archived,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// A job: the mutable record tracked by the Job Manager (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub workflow_id: WorkflowId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
    pub current_step: Option<StepId>,
    pub progress: u8,
    pub retry_count: u32,
    pub error: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub inputs: serde_json::Value,
    #[serde(skip)]
    pub context: ExecutionContext,
}

impl Job {
    pub fn new(
        workflow_id: WorkflowId,
        inputs: serde_json::Value,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            workflow_id,
            created_at: now,
            updated_at: now,
            status: JobStatus::Pending,
            current_step: None,
            progress: 0,
            retry_count: 0,
            error: None,
            metadata,
            inputs,
            context: ExecutionContext::default(),
        }
    }

    /// `progress = round(100 * |completed| / |steps|)` (§4.F).
    pub fn recompute_progress(&mut self, completed: usize, total_steps: usize) {
        self.progress = if total_steps == 0 {
            100
        } else {
            ((100 * completed) as f64 / total_steps as f64).round() as u8
        };
        self.updated_at = Utc::now();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_rounds_to_nearest_percent() {
        let mut job = Job::new(WorkflowId::from("t"), serde_json::json!({}), HashMap::new());
        job.recompute_progress(1, 3);
        assert_eq!(job.progress, 33);
        job.recompute_progress(2, 3);
        assert_eq!(job.progress, 67);
        job.recompute_progress(3, 3);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn terminal_statuses_are_closed_set() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
    }
}
