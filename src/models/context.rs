//! Execution context: the aggregated shared state for a single job (§3).
//!
//! `shared` is monotonically grown — keys are added once, by the scheduler
//! only, then never mutated (Invariant 3, §3). We enforce the "freeze on
//! publish" discipline at the API level: `freeze_step_output` fails if the
//! key is already present rather than silently overwriting it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::StepId;

/// Reference to a persisted artifact blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: String,
    pub size_bytes: u64,
}

/// Diagnostic record of one step's invocation (§3 `agent_io`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIoRecord {
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub status: String,
    pub duration_ms: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Static configuration snapshotted at job submission, immune to later
/// config edits (§3, §9 "Shared config mutability").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub tone: Option<String>,
    pub perf: Option<String>,
    pub template_config: serde_json::Value,
}

/// The per-job aggregated execution state (§3).
///
/// A `BTreeMap` backs `shared` rather than a `HashMap` so that serialized
/// checkpoint snapshots are byte-for-byte deterministic across runs with the
/// same inputs (§4.E "serialized deterministically").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub shared: BTreeMap<String, serde_json::Value>,
    pub artifacts: BTreeMap<String, ArtifactRef>,
    pub agent_io: BTreeMap<String, AgentIoRecord>,
    pub config: ConfigSnapshot,
}

/// Error raised when a step output would overwrite an already-frozen key.
#[derive(Debug, Clone, thiserror::Error)]
#[error("context.shared[{0}] is already frozen")]
pub struct AlreadyFrozen(pub String);

impl ExecutionContext {
    /// Freeze a step's output into `shared`. Invariant 3: never mutates an
    /// existing key.
    pub fn freeze_step_output(
        &mut self,
        step: &StepId,
        output: serde_json::Value,
    ) -> Result<(), AlreadyFrozen> {
        let key = step.as_str().to_string();
        if self.shared.contains_key(&key) {
            return Err(AlreadyFrozen(key));
        }
        self.shared.insert(key, output);
        Ok(())
    }

    pub fn has_output(&self, step: &StepId) -> bool {
        self.shared.contains_key(step.as_str())
    }

    /// Deep copy for hand-off to an agent call handle (§9 open question i:
    /// implemented as a deep copy for safety).
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freezing_the_same_step_twice_is_rejected() {
        let mut ctx = ExecutionContext::default();
        let step = StepId::from("A");
        ctx.freeze_step_output(&step, serde_json::json!({"x": 1})).unwrap();
        let err = ctx.freeze_step_output(&step, serde_json::json!({"x": 2}));
        assert!(err.is_err());
        assert_eq!(ctx.shared["A"], serde_json::json!({"x": 1}));
    }

    #[test]
    fn deep_copy_is_independent() {
        let mut ctx = ExecutionContext::default();
        ctx.freeze_step_output(&StepId::from("A"), serde_json::json!(1)).unwrap();
        let mut copy = ctx.deep_copy();
        copy.shared.insert("B".to_string(), serde_json::json!(2));
        assert!(!ctx.shared.contains_key("B"));
    }
}
