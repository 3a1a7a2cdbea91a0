//! Data model for rollback points, snapshots and restore operations.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a rollback point.
pub type RollbackPointId = String;

/// Unique identifier for a snapshot.
pub type SnapshotId = String;

/// Unique identifier for a rollback operation.
pub type OperationId = String;

/// Identifier of a graph entity (file, symbol, relationship set, ...).
pub type EntityId = String;

/// Free-form metadata attached to points and snapshots.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Version marker of a live graph entity.
///
/// Every write bumps the version, so a larger fingerprint is newer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(pub u64);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Lifecycle status of a rollback point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPointStatus {
    Active,
    /// Past its deadline while an operation holds it; removed once released
    Expired,
    /// A restore to this point has completed
    Consumed,
}

/// A named, timestamped marker before which state was captured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackPoint {
    pub id: RollbackPointId,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub session_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: RollbackPointStatus,
    /// Snapshots captured under this point, in capture order
    #[serde(default)]
    pub snapshot_ids: Vec<SnapshotId>,
}

impl RollbackPoint {
    /// Create a new active rollback point with no expiry.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            timestamp: Utc::now(),
            description: String::new(),
            metadata: Metadata::new(),
            session_id: None,
            expires_at: None,
            status: RollbackPointStatus::Active,
            snapshot_ids: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Expire `ttl` after the point's timestamp.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(self.timestamp + ttl);
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the point is unreadable at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == RollbackPointStatus::Expired
            || self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// What a snapshot captures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    Entity,
    Relationship,
    FullGraph,
    Custom(String),
}

impl SnapshotType {
    /// Label used when aggregating usage by type.
    pub fn label(&self) -> String {
        match self {
            SnapshotType::Entity => "entity".to_string(),
            SnapshotType::Relationship => "relationship".to_string(),
            SnapshotType::FullGraph => "full_graph".to_string(),
            SnapshotType::Custom(name) => format!("custom:{name}"),
        }
    }
}

/// The live graph entity a snapshot was captured from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotTarget {
    pub entity_id: EntityId,
    /// Used to look up a registered merge function
    pub entity_type: Option<String>,
    /// Fingerprint of the live entity at capture time
    pub fingerprint: Fingerprint,
}

/// Immutable captured payload for one logical unit under a rollback point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub rollback_point_id: RollbackPointId,
    pub snapshot_type: SnapshotType,
    /// Serialized JSON payload
    pub payload: Vec<u8>,
    pub size_bytes: u64,
    /// blake3 hex digest of `payload`
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Set for snapshots that can be written back to the graph
    pub target: Option<SnapshotTarget>,
    /// Creation order within the manager, used for deterministic eviction
    pub sequence: u64,
}

/// Kind of rollback operation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Validate and write the captured state back
    #[default]
    Restore,
    /// Validate integrity and conflicts without writing
    Verify,
    /// Validate and compute the diff a restore would apply
    DryRun,
}

/// Status of a rollback operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Restore failed partway and the partial writes were reverted
    RolledBack,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::RolledBack
        )
    }
}

/// How to proceed when validation finds a conflict.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Fail the operation
    #[default]
    Abort,
    /// Overwrite concurrent changes
    Force,
    /// Combine captured and live state with a registered merge function
    Merge,
}

impl From<codegraph_config::StrategySetting> for ConflictStrategy {
    fn from(setting: codegraph_config::StrategySetting) -> Self {
        match setting {
            codegraph_config::StrategySetting::Abort => ConflictStrategy::Abort,
            codegraph_config::StrategySetting::Force => ConflictStrategy::Force,
            codegraph_config::StrategySetting::Merge => ConflictStrategy::Merge,
        }
    }
}

/// A request to restore to (or inspect) a rollback point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackOperation {
    pub id: OperationId,
    pub rollback_point_id: RollbackPointId,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub strategy: ConflictStrategy,
    pub last_error: Option<String>,
    /// Every conflict detected during validation, including forced ones
    #[serde(default)]
    pub conflicts: Vec<RollbackConflict>,
    /// Graph writes issued before the operation finished
    pub writes_applied: usize,
    /// Set when a failed restore could not be reverted
    pub requires_manual_intervention: bool,
    /// Point holding live data overwritten by a forced restore
    pub audit_point_id: Option<RollbackPointId>,
}

impl RollbackOperation {
    pub fn new(
        rollback_point_id: impl Into<RollbackPointId>,
        operation_type: OperationType,
        strategy: ConflictStrategy,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            rollback_point_id: rollback_point_id.into(),
            operation_type,
            status: OperationStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            strategy,
            last_error: None,
            conflicts: Vec::new(),
            writes_applied: 0,
            requires_manual_intervention: false,
            audit_point_id: None,
        }
    }

    pub fn start(&mut self) {
        self.status = OperationStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.finish(OperationStatus::Completed, None);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.finish(OperationStatus::Failed, Some(error.into()));
    }

    pub fn mark_rolled_back(&mut self, error: impl Into<String>) {
        self.finish(OperationStatus::RolledBack, Some(error.into()));
    }

    fn finish(&mut self, status: OperationStatus, error: Option<String>) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        if error.is_some() {
            self.last_error = error;
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Classification of a detected conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// The live entity changed after capture
    ConcurrentModification,
    /// The stored snapshot failed integrity verification
    ChecksumMismatch,
    /// A snapshot recorded on the point can no longer be retrieved
    MissingSnapshot,
    /// The captured entity no longer exists
    StalePoint,
}

impl ConflictType {
    pub fn severity(&self) -> ConflictSeverity {
        match self {
            ConflictType::ConcurrentModification => ConflictSeverity::High,
            ConflictType::StalePoint => ConflictSeverity::Medium,
            ConflictType::ChecksumMismatch | ConflictType::MissingSnapshot => {
                ConflictSeverity::Critical
            }
        }
    }

    /// Integrity conflicts can never be overridden by `force` or `merge`.
    pub fn is_forceable(&self) -> bool {
        matches!(
            self,
            ConflictType::ConcurrentModification | ConflictType::StalePoint
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A detected incompatibility preventing a safe restore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackConflict {
    pub conflict_type: ConflictType,
    pub description: String,
    pub severity: ConflictSeverity,
    pub snapshot_id: Option<SnapshotId>,
    pub entity_id: Option<EntityId>,
    pub entity_type: Option<String>,
    /// Fingerprint recorded at capture time
    pub recorded: Option<Fingerprint>,
    /// Fingerprint of the live entity
    pub live: Option<Fingerprint>,
}

impl RollbackConflict {
    pub fn new(conflict_type: ConflictType, description: impl Into<String>) -> Self {
        Self {
            conflict_type,
            description: description.into(),
            severity: conflict_type.severity(),
            snapshot_id: None,
            entity_id: None,
            entity_type: None,
            recorded: None,
            live: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot_id: impl Into<SnapshotId>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    pub fn with_target(mut self, target: &SnapshotTarget) -> Self {
        self.entity_id = Some(target.entity_id.clone());
        self.entity_type = target.entity_type.clone();
        self.recorded = Some(target.fingerprint);
        self
    }

    pub fn with_live(mut self, live: Fingerprint) -> Self {
        self.live = Some(live);
        self
    }
}

/// Snapshot memory usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryUsage {
    pub total_snapshots: usize,
    pub total_size: u64,
    pub average_size: f64,
    pub size_by_type: HashMap<String, u64>,
}

/// Aggregate health and usage counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RollbackMetrics {
    pub total_points: usize,
    pub total_snapshots: usize,
    pub total_bytes: u64,
    pub total_operations: usize,
    pub average_restore_time_ms: f64,
    pub completed_restores: u64,
    pub failed_restores: u64,
    pub rolled_back_restores: u64,
    pub expired_count: u64,
    pub conflict_count: u64,
    /// Checksum mismatches observed on read
    pub corruption_count: u64,
    /// Snapshots removed to stay under the memory ceiling
    pub evicted_count: u64,
}

/// Result of a cleanup sweep.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed_points: usize,
    pub removed_operations: usize,
    pub removed_snapshots: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_expiry_is_inclusive() {
        let point = RollbackPoint::new("before-reindex").with_ttl(Duration::milliseconds(10));
        let expires_at = point.expires_at.unwrap();

        assert!(!point.is_expired_at(expires_at - Duration::milliseconds(1)));
        assert!(point.is_expired_at(expires_at));
    }

    #[test]
    fn test_point_without_ttl_never_expires() {
        let point = RollbackPoint::new("manual");
        assert!(!point.is_expired_at(Utc::now() + Duration::days(3650)));
    }

    #[test]
    fn test_operation_lifecycle() {
        let mut op = RollbackOperation::new("rp-1", OperationType::Restore, ConflictStrategy::Abort);
        assert_eq!(op.status, OperationStatus::Pending);
        assert!(!op.is_terminal());

        op.start();
        assert_eq!(op.status, OperationStatus::Running);
        assert!(op.started_at.is_some());

        op.mark_rolled_back("write failed");
        assert!(op.is_terminal());
        assert_eq!(op.last_error.as_deref(), Some("write failed"));
        assert!(op.completed_at.is_some());
    }

    #[test]
    fn test_integrity_conflicts_are_not_forceable() {
        assert!(ConflictType::ConcurrentModification.is_forceable());
        assert!(ConflictType::StalePoint.is_forceable());
        assert!(!ConflictType::ChecksumMismatch.is_forceable());
        assert!(!ConflictType::MissingSnapshot.is_forceable());
        assert_eq!(
            ConflictType::ChecksumMismatch.severity(),
            ConflictSeverity::Critical
        );
    }

    #[test]
    fn test_conflict_type_wire_names() {
        let json = serde_json::to_string(&ConflictType::ConcurrentModification).unwrap();
        assert_eq!(json, "\"concurrent-modification\"");
        let json = serde_json::to_string(&SnapshotType::FullGraph).unwrap();
        assert_eq!(json, "\"full_graph\"");
    }
}
