//! Checkpoint records (§3, §4.E).
//!
//! Shape grounded on the `CheckpointMetadata`/`CheckpointId` idiom common to
//! content-addressed checkpoint stores: a `cp-<uuid>` identifier, a small
//! metadata header kept separate from the (potentially large) context
//! snapshot so `list()` can page metadata without paying for deserializing
//! every snapshot body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::ExecutionContext;
use super::{CheckpointId, JobId, StepId};

/// Schema version embedded in every persisted snapshot (§6 "Snapshots are
/// self-describing; schema version is embedded").
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Metadata describing a checkpoint, independent of its (large) snapshot
/// body. This is what `list(job_id)` returns (§4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub checkpoint_id: CheckpointId,
    pub job_id: JobId,
    pub step_id: StepId,
    pub workflow_version: String,
    pub timestamp: DateTime<Utc>,
    pub resumable: bool,
    pub size_bytes: u64,
    pub schema_version: u32,
}

/// A full checkpoint record: metadata plus the context snapshot it covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub metadata: CheckpointMetadata,
    pub context_snapshot: ExecutionContext,
}
