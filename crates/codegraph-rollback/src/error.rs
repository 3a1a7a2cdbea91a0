//! Error types for rollback operations.

use crate::types::{OperationId, RollbackConflict, RollbackPointId, SnapshotId};

/// Error types for the rollback subsystem.
#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Rollback point expired: {0}")]
    Expired(RollbackPointId),

    #[error("Checksum mismatch for snapshot {snapshot_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        snapshot_id: SnapshotId,
        expected: String,
        actual: String,
    },

    /// Unresolved conflicts under the chosen strategy. Retrying with `force`
    /// overrides concurrent modifications and stale points, never a missing
    /// snapshot. Corrupted payloads surface as
    /// [`RollbackError::ChecksumMismatch`] instead.
    #[error("Restore of {rollback_point_id} blocked by {} unresolved conflict(s)", .conflicts.len())]
    Conflict {
        rollback_point_id: RollbackPointId,
        operation_id: OperationId,
        conflicts: Vec<RollbackConflict>,
    },

    #[error("Conflict: rollback point {0} already has a running operation")]
    AlreadyRunning(RollbackPointId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Snapshot capacity exceeded: {requested} bytes requested, {limit} bytes allowed per rollback point")]
    CapacityExceeded { requested: u64, limit: u64 },

    #[error("Graph store not ready: {0}")]
    DatabaseNotReady(String),

    #[error("Operation {operation_id} timed out after {after_ms}ms")]
    Timeout {
        operation_id: OperationId,
        after_ms: u64,
    },

    #[error("Restore {operation_id} failed and was reverted: {cause}")]
    RolledBack {
        operation_id: OperationId,
        cause: Box<RollbackError>,
    },

    #[error("Restore {operation_id} failed and could not be reverted ({cause}); revert error: {revert_error}")]
    Irrecoverable {
        operation_id: OperationId,
        cause: Box<RollbackError>,
        revert_error: String,
    },

    #[error("Rollback store is shut down")]
    ShutDown,

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RollbackError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        RollbackError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True for both unresolved conflicts and an already running operation.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            RollbackError::Conflict { .. } | RollbackError::AlreadyRunning(_)
        )
    }

    /// Conflicts carried by an unresolved-conflict error.
    pub fn conflicts(&self) -> &[RollbackConflict] {
        match self {
            RollbackError::Conflict { conflicts, .. } => conflicts,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for RollbackError {
    fn from(err: serde_json::Error) -> Self {
        RollbackError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RollbackError>;
