//! Rollback and snapshot subsystem for the codegraph knowledge graph.
//!
//! This crate lets a synchronization coordinator mark a point in time, capture
//! the graph entities it is about to touch, and later return the live graph to
//! that captured state.
//!
//! # Features
//!
//! - **Checksummed Snapshots**: Payloads are serialized at capture time and
//!   verified with blake3 on every read.
//! - **Rollback Points with TTL**: Points expire lazily on read and are swept
//!   by one background task; snapshots are evicted under memory pressure.
//! - **Conflict Detection**: Captured fingerprints are compared against the
//!   live graph, with `abort`, `force` and per-type `merge` strategies.
//! - **Safety-Net Revert**: A restore that fails halfway writes back the live
//!   state captured just before it started.
//! - **Lifecycle Events**: `rollback:*` events on a broadcast channel.
//!
//! # Usage
//!
//! Implement [`GraphStateAccess`] for your graph (or use [`MemoryGraph`]), then
//! build a [`RollbackCapabilities`] over a [`RollbackStore`]:
//!
//! ```ignore
//! use codegraph_rollback::{
//!     RestoreOptions, RollbackCapabilities, RollbackPoint, RollbackStore, RollbackStoreConfig,
//! };
//!
//! let store = Arc::new(RollbackStore::new(RollbackStoreConfig::default()));
//! store.start_background_cleanup();
//! let rollback = RollbackCapabilities::new(store, graph);
//!
//! let point = rollback.create_rollback_point(RollbackPoint::new("before-reindex")).await?;
//! rollback.capture_entity(&point.id, "file:src/lib.rs", Some("file")).await?;
//!
//! // ... later
//! let outcome = rollback.restore(&point.id, RestoreOptions::new()).await?;
//! ```

pub mod capabilities;
pub mod diff;
pub mod error;
pub mod events;
pub mod graph;
pub mod locks;
pub mod persistence;
pub mod resolver;
mod scheduler;
pub mod snapshot;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use capabilities::{RestoreOptions, RestoreOutcome, RollbackCapabilities};
pub use diff::{diff_states, DiffEntry, DiffOperation, EntityStates, RollbackDiff};
pub use error::{Result, RollbackError};
pub use events::{EventBus, RollbackEvent, RollbackEventKind};
pub use graph::{EntityState, GraphStateAccess, MemoryGraph};
pub use locks::{ExecutionGuard, ExecutionLocks};
pub use persistence::{JsonFilePersistence, NoopPersistence, RollbackPersistence};
pub use resolver::{merge_json, ConflictResolver, MergeFn, ResolutionDecision, ValidationReport};
pub use snapshot::{checksum, SnapshotLimits, SnapshotManager};
pub use store::{ConsumePolicy, RollbackStore, RollbackStoreConfig};
pub use types::{
    CleanupReport, ConflictSeverity, ConflictStrategy, ConflictType, EntityId, Fingerprint,
    MemoryUsage, Metadata, OperationId, OperationStatus, OperationType, RollbackConflict,
    RollbackMetrics, RollbackOperation, RollbackPoint, RollbackPointId, RollbackPointStatus,
    Snapshot, SnapshotId, SnapshotTarget, SnapshotType,
};
