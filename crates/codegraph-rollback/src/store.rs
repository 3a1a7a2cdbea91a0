//! Registry of rollback points and rollback operations.
//!
//! The store owns point expiry (a min-heap drained by one background sweep,
//! plus lazy checks on every read), operation retention, the per-point
//! execution locks and the lifecycle event bus. Snapshot payloads are
//! delegated to the [`SnapshotManager`].

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{Result, RollbackError};
use crate::events::{EventBus, RollbackEventKind};
use crate::locks::{ExecutionGuard, ExecutionLocks};
use crate::persistence::{JsonFilePersistence, NoopPersistence, RollbackPersistence};
use crate::scheduler::ExpiryQueue;
use crate::snapshot::{SnapshotLimits, SnapshotManager};
use crate::types::{
    CleanupReport, ConflictStrategy, OperationId, OperationStatus, RollbackMetrics,
    RollbackOperation, RollbackPoint, RollbackPointId, RollbackPointStatus,
};

/// What happens to a rollback point after a successful restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsumePolicy {
    /// Keep the point, marked as consumed
    #[default]
    Retain,
    /// Remove the point and its snapshots
    Remove,
}

impl From<codegraph_config::ConsumePolicySetting> for ConsumePolicy {
    fn from(setting: codegraph_config::ConsumePolicySetting) -> Self {
        match setting {
            codegraph_config::ConsumePolicySetting::Retain => ConsumePolicy::Retain,
            codegraph_config::ConsumePolicySetting::Remove => ConsumePolicy::Remove,
        }
    }
}

/// Runtime configuration of the rollback store.
#[derive(Debug, Clone)]
pub struct RollbackStoreConfig {
    /// How long terminal operations are kept
    pub retention_window: chrono::Duration,
    /// Period of the background sweep
    pub cleanup_interval: Duration,
    /// TTL for points created without an explicit expiry
    pub default_ttl: Option<chrono::Duration>,
    pub limits: SnapshotLimits,
    pub event_capacity: usize,
    pub consume_policy: ConsumePolicy,
    pub default_strategy: ConflictStrategy,
}

impl Default for RollbackStoreConfig {
    fn default() -> Self {
        Self::from(&codegraph_config::RollbackConfig::default())
    }
}

impl From<&codegraph_config::RollbackConfig> for RollbackStoreConfig {
    fn from(config: &codegraph_config::RollbackConfig) -> Self {
        Self {
            retention_window: chrono::Duration::seconds(
                i64::try_from(config.retention_window_secs).unwrap_or(i64::MAX / 1000),
            ),
            cleanup_interval: Duration::from_millis(config.cleanup_interval_ms.max(1)),
            default_ttl: config
                .default_ttl_secs
                .and_then(|secs| i64::try_from(secs).ok())
                .map(chrono::Duration::seconds),
            limits: SnapshotLimits {
                max_total_bytes: config.max_memory_bytes,
                max_point_bytes: config.max_point_bytes,
            },
            event_capacity: config.event_capacity,
            consume_policy: config.consume_policy.into(),
            default_strategy: config.default_strategy.into(),
        }
    }
}

#[derive(Default)]
struct StoreState {
    points: HashMap<RollbackPointId, RollbackPoint>,
    operations: HashMap<OperationId, RollbackOperation>,
    expiry: ExpiryQueue,
}

#[derive(Default)]
struct StoreCounters {
    expired: AtomicU64,
    conflicts: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rolled_back: AtomicU64,
    /// Sum of completed restore durations
    restore_time_ms: AtomicU64,
}

/// In-memory registry of rollback points and operations.
pub struct RollbackStore {
    state: RwLock<StoreState>,
    snapshots: Arc<SnapshotManager>,
    persistence: Arc<dyn RollbackPersistence>,
    events: EventBus,
    locks: ExecutionLocks,
    config: RollbackStoreConfig,
    counters: StoreCounters,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl RollbackStore {
    /// Create a purely in-memory store.
    pub fn new(config: RollbackStoreConfig) -> Self {
        Self::with_persistence(config, Arc::new(NoopPersistence))
    }

    /// Create a store that mirrors points to `persistence`.
    pub fn with_persistence(
        config: RollbackStoreConfig,
        persistence: Arc<dyn RollbackPersistence>,
    ) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            snapshots: Arc::new(SnapshotManager::new(config.limits)),
            persistence,
            events: EventBus::new(config.event_capacity),
            locks: ExecutionLocks::new(),
            config,
            counters: StoreCounters::default(),
            sweeper: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Build a store from the `[rollback]` config section, using the JSON file
    /// adapter when `persistence_dir` is set.
    pub async fn from_config(config: &codegraph_config::RollbackConfig) -> Result<Self> {
        let store_config = RollbackStoreConfig::from(config);
        match &config.persistence_dir {
            Some(dir) => {
                let persistence = JsonFilePersistence::new(dir).await?;
                Ok(Self::with_persistence(store_config, Arc::new(persistence)))
            }
            None => Ok(Self::new(store_config)),
        }
    }

    pub fn config(&self) -> &RollbackStoreConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn locks(&self) -> &ExecutionLocks {
        &self.locks
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(RollbackError::ShutDown);
        }
        Ok(())
    }

    /// Spawn the periodic expiry/cleanup sweep.
    ///
    /// The task only holds a weak reference and stops once the store is
    /// dropped or shut down.
    pub fn start_background_cleanup(self: &Arc<Self>) {
        if self.is_shut_down() {
            return;
        }

        let store = Arc::downgrade(self);
        let period = self.config.cleanup_interval;
        info!("Starting rollback cleanup sweep every {:?}", period);

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;

                let Some(store) = store.upgrade() else {
                    break;
                };
                if store.is_shut_down() {
                    break;
                }

                let report = store.cleanup().await;
                if report != CleanupReport::default() {
                    debug!(
                        removed_points = report.removed_points,
                        removed_operations = report.removed_operations,
                        removed_snapshots = report.removed_snapshots,
                        "Rollback cleanup sweep"
                    );
                }
            }
        });

        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = sweeper.replace(handle) {
            previous.abort();
        }
    }

    // ========== Rollback Points ==========

    /// Insert or replace a rollback point and schedule its expiry.
    pub async fn store_rollback_point(&self, point: RollbackPoint) -> Result<()> {
        self.ensure_running()?;
        self.insert_point(point).await;
        Ok(())
    }

    /// Store without the shutdown check, for operations already running.
    pub(crate) async fn insert_point(&self, point: RollbackPoint) {
        {
            let mut state = self.state.write().await;
            match point.expires_at {
                Some(expires_at) => state.expiry.schedule(&point.id, expires_at),
                None => {
                    state.expiry.cancel(&point.id);
                }
            }
            state.points.insert(point.id.clone(), point.clone());
        }
        self.snapshots
            .set_owner_expiry(&point.id, point.expires_at)
            .await;
        self.persist(&point).await;

        debug!(rollback_point_id = %point.id, name = %point.name, "Stored rollback point");
    }

    /// Fetch a rollback point, failing with `Expired` once its TTL has passed
    /// even if the sweep has not removed it yet.
    pub async fn get_rollback_point(&self, id: &str) -> Result<RollbackPoint> {
        let state = self.state.read().await;
        let point = state
            .points
            .get(id)
            .ok_or_else(|| RollbackError::not_found("Rollback point", id))?;
        if point.is_expired() {
            return Err(RollbackError::Expired(id.to_string()));
        }
        Ok(point.clone())
    }

    /// All readable rollback points, oldest first.
    pub async fn get_all_rollback_points(&self) -> Vec<RollbackPoint> {
        self.expire_due().await;
        self.list_points(|_| true).await
    }

    pub async fn get_rollback_points_for_session(&self, session_id: &str) -> Vec<RollbackPoint> {
        self.expire_due().await;
        self.list_points(|p| p.session_id.as_deref() == Some(session_id))
            .await
    }

    async fn list_points<F>(&self, filter: F) -> Vec<RollbackPoint>
    where
        F: Fn(&RollbackPoint) -> bool,
    {
        let now = Utc::now();
        let state = self.state.read().await;
        let mut points: Vec<RollbackPoint> = state
            .points
            .values()
            .filter(|p| !p.is_expired_at(now) && filter(p))
            .cloned()
            .collect();
        points.sort_by_key(|p| p.timestamp);
        points
    }

    /// Apply `update` to a readable point and persist the result.
    pub(crate) async fn modify_point<F>(&self, id: &str, update: F) -> Result<RollbackPoint>
    where
        F: FnOnce(&mut RollbackPoint),
    {
        let point = {
            let mut state = self.state.write().await;
            let point = state
                .points
                .get_mut(id)
                .ok_or_else(|| RollbackError::not_found("Rollback point", id))?;
            if point.is_expired() {
                return Err(RollbackError::Expired(id.to_string()));
            }
            update(point);
            point.clone()
        };
        self.persist(&point).await;
        Ok(point)
    }

    /// Remove a rollback point and its snapshots, waiting for any operation
    /// running against it to finish first.
    pub async fn remove_rollback_point(&self, id: &str) -> bool {
        let guard = self.locks.acquire(id).await;
        self.remove_point_locked(&guard).await.is_some()
    }

    /// Remove the point whose lock `guard` holds. Returns the number of
    /// snapshots deleted with it, `None` if the point did not exist.
    pub(crate) async fn remove_point_locked(&self, guard: &ExecutionGuard) -> Option<usize> {
        let id = guard.rollback_point_id();
        let removed = {
            let mut state = self.state.write().await;
            state.expiry.cancel(id);
            state.points.remove(id)
        };
        if removed.is_none() {
            return None;
        }

        let snapshots = self.snapshots.delete_snapshots_for_rollback_point(id).await;
        self.unpersist(id).await;
        debug!(rollback_point_id = id, snapshots, "Removed rollback point");
        Some(snapshots)
    }

    // ========== Expiry ==========

    /// Expire every point whose deadline has passed. Returns the number removed.
    pub async fn expire_due(&self) -> usize {
        let due = {
            let mut state = self.state.write().await;
            state.expiry.pop_due(Utc::now())
        };

        let mut expired = 0;
        for id in due {
            if self.expire_point(&id).await {
                expired += 1;
            }
        }
        expired
    }

    /// Expire `id` now if it is past its deadline. Called after an operation
    /// releases the point's lock, since expiry is deferred while it is held.
    pub async fn reevaluate_expiry(&self, id: &str) -> bool {
        let due = {
            let state = self.state.read().await;
            state.points.get(id).is_some_and(|p| p.is_expired())
        };
        due && self.expire_point(id).await
    }

    async fn expire_point(&self, id: &str) -> bool {
        let Some(guard) = self.locks.try_acquire(id).await else {
            debug!(rollback_point_id = id, "Deferring expiry while an operation holds the point");
            let mut state = self.state.write().await;
            let state = &mut *state;
            if let Some(point) = state.points.get_mut(id) {
                point.status = RollbackPointStatus::Expired;
                if let Some(expires_at) = point.expires_at {
                    state.expiry.schedule(id, expires_at);
                }
            }
            return false;
        };

        // The point may have been consumed or removed while we waited
        let still_expired = {
            let state = self.state.read().await;
            state.points.get(id).is_some_and(|p| p.is_expired())
        };
        if !still_expired {
            return false;
        }

        let Some(snapshots) = self.remove_point_locked(&guard).await else {
            return false;
        };
        self.counters.expired.fetch_add(1, Ordering::Relaxed);
        self.events.publish(
            RollbackEventKind::Expired,
            id,
            None,
            json!({ "snapshots_removed": snapshots }),
        );
        info!("Rollback point {} expired ({} snapshot(s) removed)", id, snapshots);
        true
    }

    // ========== Operations ==========

    pub async fn store_operation(&self, operation: RollbackOperation) -> Result<()> {
        let mut state = self.state.write().await;
        state.operations.insert(operation.id.clone(), operation);
        Ok(())
    }

    pub async fn get_operation(&self, id: &str) -> Result<RollbackOperation> {
        let state = self.state.read().await;
        state
            .operations
            .get(id)
            .cloned()
            .ok_or_else(|| RollbackError::not_found("Rollback operation", id))
    }

    /// Replace a stored operation.
    pub async fn update_operation(&self, operation: RollbackOperation) -> Result<()> {
        let mut state = self.state.write().await;
        let slot = state
            .operations
            .get_mut(&operation.id)
            .ok_or_else(|| RollbackError::not_found("Rollback operation", &operation.id))?;
        *slot = operation;
        Ok(())
    }

    pub async fn remove_operation(&self, id: &str) -> bool {
        self.state.write().await.operations.remove(id).is_some()
    }

    /// All operations, oldest first.
    pub async fn get_all_operations(&self) -> Vec<RollbackOperation> {
        self.list_operations(|_| true).await
    }

    pub async fn get_operations_by_status(
        &self,
        status: OperationStatus,
    ) -> Vec<RollbackOperation> {
        self.list_operations(|op| op.status == status).await
    }

    async fn list_operations<F>(&self, filter: F) -> Vec<RollbackOperation>
    where
        F: Fn(&RollbackOperation) -> bool,
    {
        let state = self.state.read().await;
        let mut operations: Vec<RollbackOperation> = state
            .operations
            .values()
            .filter(|op| filter(op))
            .cloned()
            .collect();
        operations.sort_by_key(|op| op.created_at);
        operations
    }

    // ========== Maintenance ==========

    /// Remove expired points, terminal operations older than the retention
    /// window and snapshots over the memory ceiling.
    pub async fn cleanup(&self) -> CleanupReport {
        self.cleanup_at(Utc::now()).await
    }

    async fn cleanup_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();

        // Heap first, then anything it does not know about
        report.removed_points += self.expire_due().await;
        let stragglers: Vec<RollbackPointId> = {
            let state = self.state.read().await;
            state
                .points
                .values()
                .filter(|p| p.is_expired_at(now))
                .map(|p| p.id.clone())
                .collect()
        };
        for id in stragglers {
            if self.expire_point(&id).await {
                report.removed_points += 1;
            }
        }

        let cutoff = now - self.config.retention_window;
        report.removed_operations = {
            let mut state = self.state.write().await;
            let before = state.operations.len();
            state.operations.retain(|_, op| {
                !(op.is_terminal() && op.completed_at.is_some_and(|done| done < cutoff))
            });
            before - state.operations.len()
        };

        report.removed_snapshots = self.snapshots.cleanup().await;
        self.locks.prune().await;
        report
    }

    pub async fn get_metrics(&self) -> RollbackMetrics {
        let usage = self.snapshots.get_memory_usage().await;
        let (total_points, total_operations) = {
            let state = self.state.read().await;
            (state.points.len(), state.operations.len())
        };

        let completed = self.counters.completed.load(Ordering::Relaxed);
        let restore_time_ms = self.counters.restore_time_ms.load(Ordering::Relaxed);

        RollbackMetrics {
            total_points,
            total_snapshots: usage.total_snapshots,
            total_bytes: usage.total_size,
            total_operations,
            average_restore_time_ms: if completed == 0 {
                0.0
            } else {
                restore_time_ms as f64 / completed as f64
            },
            completed_restores: completed,
            failed_restores: self.counters.failed.load(Ordering::Relaxed),
            rolled_back_restores: self.counters.rolled_back.load(Ordering::Relaxed),
            expired_count: self.counters.expired.load(Ordering::Relaxed),
            conflict_count: self.counters.conflicts.load(Ordering::Relaxed),
            corruption_count: self.snapshots.corruption_count(),
            evicted_count: self.snapshots.evicted_count(),
        }
    }

    pub(crate) fn record_restore(&self, status: OperationStatus, elapsed: Duration) {
        match status {
            OperationStatus::Completed => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .restore_time_ms
                    .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
            }
            OperationStatus::Failed => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            OperationStatus::RolledBack => {
                self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
            }
            OperationStatus::Pending | OperationStatus::Running => {}
        }
    }

    pub(crate) fn record_conflicts(&self, count: usize) {
        self.counters
            .conflicts
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Drop every point, operation and snapshot and reset the counters.
    pub async fn clear(&self) {
        let ids: Vec<RollbackPointId> = {
            let mut state = self.state.write().await;
            state.expiry.clear();
            state.operations.clear();
            state.points.drain().map(|(id, _)| id).collect()
        };
        for id in &ids {
            self.snapshots.delete_snapshots_for_rollback_point(id).await;
            self.unpersist(id).await;
        }

        let counters = &self.counters;
        for counter in [
            &counters.expired,
            &counters.conflicts,
            &counters.completed,
            &counters.failed,
            &counters.rolled_back,
            &counters.restore_time_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.snapshots.reset_counters();
        info!("Cleared rollback store ({} point(s))", ids.len());
    }

    // ========== Persistence ==========

    /// Reload outstanding points from the persistence adapter.
    ///
    /// Points that expired while the process was down are dropped. Snapshot
    /// payloads are not persisted, so a reloaded point's snapshots are
    /// reported missing when it is validated.
    pub async fn load_persisted(&self) -> usize {
        let points = match self.persistence.load_all().await {
            Ok(points) => points,
            Err(e) => {
                warn!("Failed to load persisted rollback points: {:#}", e);
                return 0;
            }
        };

        let now = Utc::now();
        let mut loaded = 0;
        for point in points {
            if point.is_expired_at(now) {
                self.unpersist(&point.id).await;
                continue;
            }
            {
                let mut state = self.state.write().await;
                if let Some(expires_at) = point.expires_at {
                    state.expiry.schedule(&point.id, expires_at);
                }
                state.points.insert(point.id.clone(), point.clone());
            }
            self.snapshots
                .set_owner_expiry(&point.id, point.expires_at)
                .await;
            loaded += 1;
        }

        info!("Loaded {} persisted rollback point(s)", loaded);
        loaded
    }

    async fn persist(&self, point: &RollbackPoint) {
        if let Err(e) = self.persistence.save(point).await {
            warn!("Failed to persist rollback point {}: {:#}", point.id, e);
        }
    }

    async fn unpersist(&self, id: &str) {
        if let Err(e) = self.persistence.delete(id).await {
            warn!("Failed to delete persisted rollback point {}: {:#}", id, e);
        }
    }

    // ========== Shutdown ==========

    /// Stop the sweep and cancel pending expiries.
    ///
    /// Idempotent. Operations already running finish normally; operations
    /// that never started are marked failed. New points and restores are
    /// rejected with [`RollbackError::ShutDown`].
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweeper {
            handle.abort();
        }

        let abandoned = {
            let mut state = self.state.write().await;
            state.expiry.clear();
            let mut abandoned = 0;
            for op in state
                .operations
                .values_mut()
                .filter(|op| op.status == OperationStatus::Pending)
            {
                op.fail("rollback store shut down before the operation started");
                abandoned += 1;
            }
            abandoned
        };

        info!(
            "Rollback store shut down ({} pending operation(s) marked failed)",
            abandoned
        );
    }
}

impl Drop for RollbackStore {
    fn drop(&mut self) {
        let sweeper = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweeper {
            handle.abort();
        }
    }
}
