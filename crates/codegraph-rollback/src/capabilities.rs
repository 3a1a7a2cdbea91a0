//! Public entry point of the rollback subsystem.
//!
//! [`RollbackCapabilities`] creates rollback points, captures graph state into
//! them and drives restores through `validate -> resolve -> stage -> apply ->
//! finalize`, reverting partial writes when a restore fails halfway.

use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::diff::{diff_states, EntityStates, RollbackDiff};
use crate::error::{Result, RollbackError};
use crate::events::{RollbackEvent, RollbackEventKind};
use crate::graph::{EntityState, GraphStateAccess};
use crate::locks::ExecutionGuard;
use crate::resolver::{ConflictResolver, ResolutionDecision};
use crate::store::{ConsumePolicy, RollbackStore};
use crate::types::{
    ConflictStrategy, ConflictType, EntityId, Metadata, OperationStatus, OperationType,
    RollbackConflict, RollbackOperation, RollbackPoint, RollbackPointId, RollbackPointStatus,
    Snapshot, SnapshotTarget, SnapshotType,
};

/// Options for [`RollbackCapabilities::restore`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreOptions {
    /// Conflict strategy; the orchestrator default when unset
    pub strategy: Option<ConflictStrategy>,
    /// Deadline for the whole operation, including the revert trigger
    pub timeout: Option<Duration>,
    pub operation_type: OperationType,
}

impl RestoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verify() -> Self {
        Self::default().with_operation_type(OperationType::Verify)
    }

    pub fn dry_run() -> Self {
        Self::default().with_operation_type(OperationType::DryRun)
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_operation_type(mut self, operation_type: OperationType) -> Self {
        self.operation_type = operation_type;
        self
    }
}

/// Result of a finished restore, verify or dry run.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreOutcome {
    /// Final operation record
    pub operation: RollbackOperation,
    /// Every conflict detected, including forced and merged ones
    pub conflicts: Vec<RollbackConflict>,
    /// Changes a dry run would apply
    pub diff: Option<RollbackDiff>,
    /// Graph writes performed
    pub applied: usize,
    /// Snapshots without a graph target, which are never written back
    pub skipped: usize,
    pub audit_point_id: Option<RollbackPointId>,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    after: Duration,
}

/// Everything decided before the first graph write.
#[derive(Debug, Default)]
struct RestorePlan {
    writes: Vec<(EntityId, JsonValue)>,
    skipped: usize,
    /// Forced conflicts whose live data gets overwritten
    forced: Vec<RollbackConflict>,
    live: HashMap<EntityId, Option<EntityState>>,
}

/// Orchestrates rollback points and restores against a live graph.
pub struct RollbackCapabilities {
    store: Arc<RollbackStore>,
    resolver: ConflictResolver,
    graph: Arc<dyn GraphStateAccess>,
    default_strategy: ConflictStrategy,
}

impl RollbackCapabilities {
    pub fn new(store: Arc<RollbackStore>, graph: Arc<dyn GraphStateAccess>) -> Self {
        Self {
            resolver: ConflictResolver::new(store.clone()),
            default_strategy: store.config().default_strategy,
            store,
            graph,
        }
    }

    /// Use a resolver with registered merge functions.
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_default_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn store(&self) -> &Arc<RollbackStore> {
        &self.store
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn default_strategy(&self) -> ConflictStrategy {
        self.default_strategy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RollbackEvent> {
        self.store.events().subscribe()
    }

    // ========== Rollback Points ==========

    /// Store a new rollback point, applying the default TTL when it has no
    /// expiry of its own.
    pub async fn create_rollback_point(&self, mut point: RollbackPoint) -> Result<RollbackPoint> {
        if point.expires_at.is_none() {
            if let Some(ttl) = self.store.config().default_ttl {
                point.expires_at = Some(point.timestamp + ttl);
            }
        }
        self.store.store_rollback_point(point.clone()).await?;
        self.announce(&point);
        Ok(point)
    }

    fn announce(&self, point: &RollbackPoint) {
        self.store.events().publish(
            RollbackEventKind::Created,
            &point.id,
            None,
            json!({
                "name": point.name,
                "session_id": point.session_id,
                "expires_at": point.expires_at,
            }),
        );
        info!("Created rollback point {} ({})", point.id, point.name);
    }

    pub async fn remove_rollback_point(&self, id: &str) -> bool {
        self.store.remove_rollback_point(id).await
    }

    /// Capture the live state of one graph entity under a rollback point.
    pub async fn capture_entity(
        &self,
        rollback_point_id: &str,
        entity_id: &str,
        entity_type: Option<&str>,
    ) -> Result<Snapshot> {
        let _guard = self.store.locks().acquire(rollback_point_id).await;
        self.store.get_rollback_point(rollback_point_id).await?;

        let state = self
            .graph
            .get_entity_state(entity_id)
            .await
            .map_err(graph_unavailable)?
            .ok_or_else(|| RollbackError::not_found("Entity", entity_id))?;

        let target = SnapshotTarget {
            entity_id: entity_id.to_string(),
            entity_type: entity_type.map(str::to_string),
            fingerprint: state.fingerprint,
        };
        let snapshot = self
            .store
            .snapshots()
            .create_target_snapshot(
                rollback_point_id,
                SnapshotType::Entity,
                target,
                &state.data,
                None,
            )
            .await?;
        self.attach(rollback_point_id, &snapshot).await?;
        Ok(snapshot)
    }

    /// Capture several entities of the same type, in order.
    pub async fn capture_entities<I, S>(
        &self,
        rollback_point_id: &str,
        entity_ids: I,
        entity_type: Option<&str>,
    ) -> Result<Vec<Snapshot>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut snapshots = Vec::new();
        for entity_id in entity_ids {
            snapshots.push(
                self.capture_entity(rollback_point_id, entity_id.as_ref(), entity_type)
                    .await?,
            );
        }
        Ok(snapshots)
    }

    /// Store an opaque payload under a rollback point. It is verified during
    /// restores but never written to the graph.
    pub async fn capture_custom<T>(
        &self,
        rollback_point_id: &str,
        snapshot_type: SnapshotType,
        data: &T,
        metadata: Option<Metadata>,
    ) -> Result<Snapshot>
    where
        T: Serialize + ?Sized,
    {
        let _guard = self.store.locks().acquire(rollback_point_id).await;
        self.store.get_rollback_point(rollback_point_id).await?;

        let snapshot = self
            .store
            .snapshots()
            .create_snapshot(rollback_point_id, snapshot_type, data, metadata)
            .await?;
        self.attach(rollback_point_id, &snapshot).await?;
        Ok(snapshot)
    }

    async fn attach(&self, rollback_point_id: &str, snapshot: &Snapshot) -> Result<()> {
        let attached = self
            .store
            .modify_point(rollback_point_id, |point| {
                point.snapshot_ids.push(snapshot.id.clone())
            })
            .await;
        if let Err(e) = attached {
            self.store.snapshots().delete_snapshot(&snapshot.id).await;
            return Err(e);
        }
        Ok(())
    }

    // ========== Restore ==========

    /// Restore the graph to a rollback point.
    ///
    /// Fails with [`RollbackError::AlreadyRunning`] if another operation holds
    /// the point. Unresolved conflicts fail with [`RollbackError::Conflict`]
    /// before anything is written. A failure after the first write reverts the
    /// partial changes and fails with [`RollbackError::RolledBack`] (or
    /// [`RollbackError::Timeout`]); if the revert fails too the error is
    /// [`RollbackError::Irrecoverable`].
    pub async fn restore(
        &self,
        rollback_point_id: &str,
        options: RestoreOptions,
    ) -> Result<RestoreOutcome> {
        self.store.ensure_running()?;

        let Some(guard) = self.store.locks().try_acquire(rollback_point_id).await else {
            warn!("Rollback point {} already has a running operation", rollback_point_id);
            return Err(RollbackError::AlreadyRunning(rollback_point_id.to_string()));
        };

        let result = self.restore_locked(&guard, options).await;
        drop(guard);

        // Expiry is deferred while the lock is held
        self.store.reevaluate_expiry(rollback_point_id).await;
        result
    }

    /// Check integrity and conflicts without writing.
    pub async fn verify(&self, rollback_point_id: &str) -> Result<RestoreOutcome> {
        self.restore(rollback_point_id, RestoreOptions::verify()).await
    }

    /// Compute what a restore with `strategy` would write.
    pub async fn dry_run(
        &self,
        rollback_point_id: &str,
        strategy: Option<ConflictStrategy>,
    ) -> Result<RestoreOutcome> {
        let mut options = RestoreOptions::dry_run();
        options.strategy = strategy;
        self.restore(rollback_point_id, options).await
    }

    async fn restore_locked(
        &self,
        guard: &ExecutionGuard,
        options: RestoreOptions,
    ) -> Result<RestoreOutcome> {
        let point = self
            .store
            .get_rollback_point(guard.rollback_point_id())
            .await?;

        let strategy = options.strategy.unwrap_or(self.default_strategy);
        let mut operation = RollbackOperation::new(&point.id, options.operation_type, strategy);
        operation.start();
        self.store.store_operation(operation.clone()).await?;

        let started = std::time::Instant::now();
        let deadline = options.timeout.map(|after| Deadline {
            at: Instant::now() + after,
            after,
        });
        debug!(
            operation_id = %operation.id,
            rollback_point_id = %point.id,
            ?strategy,
            operation_type = ?operation.operation_type,
            "Starting rollback operation"
        );

        let plan = match self.prepare(&point, &mut operation, deadline).await {
            Ok(plan) => plan,
            Err(e) => return Err(self.fail(operation, e, started).await),
        };

        if operation.operation_type != OperationType::Restore {
            return Ok(self.finish_inspection(operation, plan).await);
        }

        match self.capture_audit(&point, &operation, &plan).await {
            Ok(audit_point_id) => operation.audit_point_id = audit_point_id,
            Err(e) => return Err(self.fail(operation, e, started).await),
        }

        let pre_state = match self.capture_pre_state(&plan, &operation.id, deadline).await {
            Ok(pre_state) => pre_state,
            Err(e) => return Err(self.fail(operation, e, started).await),
        };

        match self.apply(&plan, &mut operation, deadline).await {
            Ok(()) => Ok(self.finish_restore(guard, operation, plan, started).await),
            Err((cause, touched)) => {
                Err(self
                    .revert_and_fail(operation, cause, &pre_state[..touched], started)
                    .await)
            }
        }
    }

    /// Validate, resolve conflicts and stage every payload.
    async fn prepare(
        &self,
        point: &RollbackPoint,
        operation: &mut RollbackOperation,
        deadline: Option<Deadline>,
    ) -> Result<RestorePlan> {
        let report = within(
            deadline,
            &operation.id,
            self.resolver.validate_point(point, self.graph.as_ref()),
        )
        .await?;

        let snapshots = self.store.snapshots();
        let inspecting = operation.operation_type != OperationType::Restore;
        operation.conflicts = report.conflicts.clone();
        self.store.record_conflicts(report.conflicts.len());

        let mut plan = RestorePlan {
            live: report.live,
            ..Default::default()
        };
        let mut merged: HashMap<String, JsonValue> = HashMap::new();
        let mut unresolved = 0;

        for conflict in &report.conflicts {
            let captured = match (&conflict.snapshot_id, conflict.conflict_type.is_forceable()) {
                (Some(id), true) => snapshots.restore_from_snapshot(id).await.ok(),
                _ => None,
            };
            let live = conflict
                .entity_id
                .as_ref()
                .and_then(|id| plan.live.get(id))
                .and_then(|state| state.as_ref())
                .map(|state| &state.data);

            match self
                .resolver
                .resolve(conflict, operation.strategy, captured.as_ref(), live)
            {
                ResolutionDecision::Abort => unresolved += 1,
                ResolutionDecision::Proceed => {
                    if conflict.conflict_type == ConflictType::ConcurrentModification {
                        plan.forced.push(conflict.clone());
                    }
                }
                ResolutionDecision::Merge(value) => {
                    if let Some(id) = &conflict.snapshot_id {
                        merged.insert(id.clone(), value);
                    }
                }
            }
        }

        if unresolved > 0 && !inspecting {
            // A corrupted payload is reported as corruption, not as a conflict
            let corrupted = report
                .conflicts
                .iter()
                .filter(|c| c.conflict_type == ConflictType::ChecksumMismatch)
                .find_map(|c| c.snapshot_id.as_ref());
            if let Some(snapshot_id) = corrupted {
                snapshots.verify_snapshot(snapshot_id).await?;
            }
            return Err(RollbackError::Conflict {
                rollback_point_id: point.id.clone(),
                operation_id: operation.id.clone(),
                conflicts: report.conflicts,
            });
        }

        for snapshot_id in &point.snapshot_ids {
            let snapshot = match snapshots.get_snapshot(snapshot_id).await {
                Some(snapshot) => snapshot,
                // Already reported as a conflict
                None if inspecting => continue,
                None => return Err(RollbackError::not_found("Snapshot", snapshot_id)),
            };
            let Some(target) = snapshot.target else {
                plan.skipped += 1;
                continue;
            };

            let value = match merged.remove(snapshot_id) {
                Some(value) => value,
                None => match snapshots.restore_from_snapshot(snapshot_id).await {
                    Ok(value) => value,
                    Err(_) if inspecting => continue,
                    Err(e) => return Err(e),
                },
            };
            plan.writes.push((target.entity_id, value));
        }

        Ok(plan)
    }

    /// Copy live data about to be overwritten by a forced restore into an
    /// `audit:<name>` rollback point.
    async fn capture_audit(
        &self,
        point: &RollbackPoint,
        operation: &RollbackOperation,
        plan: &RestorePlan,
    ) -> Result<Option<RollbackPointId>> {
        let overwritten: Vec<(&RollbackConflict, &EntityState)> = plan
            .forced
            .iter()
            .filter_map(|conflict| {
                let entity_id = conflict.entity_id.as_ref()?;
                let state = plan.live.get(entity_id)?.as_ref()?;
                Some((conflict, state))
            })
            .collect();
        if overwritten.is_empty() {
            return Ok(None);
        }

        let mut audit = RollbackPoint::new(format!("audit:{}", point.name))
            .with_description(format!(
                "Live state overwritten by forced restore {} of {}",
                operation.id, point.id
            ))
            .with_metadata("source_rollback_point", json!(point.id))
            .with_metadata("operation_id", json!(operation.id));
        if let Some(session_id) = &point.session_id {
            audit = audit.with_session(session_id.clone());
        }
        if let Some(ttl) = self.store.config().default_ttl {
            audit.expires_at = Some(audit.timestamp + ttl);
        }

        let snapshots = self.store.snapshots();
        for (conflict, state) in overwritten {
            let target = SnapshotTarget {
                entity_id: conflict.entity_id.clone().unwrap_or_default(),
                entity_type: conflict.entity_type.clone(),
                fingerprint: state.fingerprint,
            };
            let captured = snapshots
                .create_target_snapshot(&audit.id, SnapshotType::Entity, target, &state.data, None)
                .await;
            match captured {
                Ok(snapshot) => audit.snapshot_ids.push(snapshot.id),
                Err(e) => {
                    snapshots.delete_snapshots_for_rollback_point(&audit.id).await;
                    return Err(e);
                }
            }
        }

        let audit_id = audit.id.clone();
        let captured = audit.snapshot_ids.len();
        self.store.insert_point(audit.clone()).await;
        self.announce(&audit);
        info!(
            "Forced restore {} saved {} overwritten entity state(s) to {}",
            operation.id, captured, audit_id
        );
        Ok(Some(audit_id))
    }

    /// Live state of every entity about to be written, one entry per write.
    async fn capture_pre_state(
        &self,
        plan: &RestorePlan,
        operation_id: &str,
        deadline: Option<Deadline>,
    ) -> Result<Vec<(EntityId, Option<JsonValue>)>> {
        let mut first_seen: HashMap<&str, Option<JsonValue>> = HashMap::new();
        let mut pre_state = Vec::with_capacity(plan.writes.len());

        for (entity_id, _) in &plan.writes {
            if !first_seen.contains_key(entity_id.as_str()) {
                let state = within(deadline, operation_id, async {
                    self.graph
                        .get_entity_state(entity_id)
                        .await
                        .map_err(graph_unavailable)
                })
                .await?;
                first_seen.insert(entity_id.as_str(), state.map(|s| s.data));
            }
            let previous = first_seen.get(entity_id.as_str()).cloned().flatten();
            pre_state.push((entity_id.clone(), previous));
        }
        Ok(pre_state)
    }

    /// Write staged payloads in order. On failure returns the cause and how
    /// many writes may have reached the graph.
    async fn apply(
        &self,
        plan: &RestorePlan,
        operation: &mut RollbackOperation,
        deadline: Option<Deadline>,
    ) -> std::result::Result<(), (RollbackError, usize)> {
        for (index, (entity_id, value)) in plan.writes.iter().enumerate() {
            let written = within(deadline, &operation.id, async {
                self.graph
                    .write_entity_state(entity_id, value)
                    .await
                    .map_err(graph_unavailable)
            })
            .await;

            match written {
                Ok(()) => operation.writes_applied = index + 1,
                // The interrupted write may or may not have landed
                Err(e @ RollbackError::Timeout { .. }) => return Err((e, index + 1)),
                Err(e) => return Err((e, index)),
            }
        }
        Ok(())
    }

    /// Write back pre-restore state, newest write first. Returns the
    /// collected failures, if any.
    async fn revert(
        &self,
        touched: &[(EntityId, Option<JsonValue>)],
    ) -> std::result::Result<(), String> {
        let mut failures = Vec::new();
        for (entity_id, previous) in touched.iter().rev() {
            let reverted = match previous {
                Some(data) => self.graph.write_entity_state(entity_id, data).await,
                None => self.graph.remove_entity_state(entity_id).await,
            };
            if let Err(e) = reverted {
                failures.push(format!("{}: {:#}", entity_id, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }

    // ========== Finalization ==========

    async fn save(&self, operation: &RollbackOperation) {
        if let Err(e) = self.store.update_operation(operation.clone()).await {
            warn!("Failed to record rollback operation {}: {}", operation.id, e);
        }
        if operation.operation_type == OperationType::Restore {
            let elapsed = operation
                .started_at
                .zip(operation.completed_at)
                .and_then(|(start, end)| (end - start).to_std().ok())
                .unwrap_or_default();
            self.store.record_restore(operation.status, elapsed);
        }
    }

    fn publish(&self, kind: RollbackEventKind, operation: &RollbackOperation, detail: JsonValue) {
        self.store
            .events()
            .publish(kind, &operation.rollback_point_id, Some(&operation.id), detail);
    }

    /// Fail an operation that has not written anything.
    async fn fail(
        &self,
        mut operation: RollbackOperation,
        cause: RollbackError,
        started: std::time::Instant,
    ) -> RollbackError {
        operation.fail(cause.to_string());
        self.save(&operation).await;
        self.publish(
            RollbackEventKind::Failed,
            &operation,
            json!({
                "error": cause.to_string(),
                "conflicts": operation.conflicts.len(),
                "writes_applied": 0,
            }),
        );
        warn!(
            "Rollback operation {} on {} failed after {:?}: {}",
            operation.id, operation.rollback_point_id, started.elapsed(), cause
        );
        cause
    }

    async fn revert_and_fail(
        &self,
        mut operation: RollbackOperation,
        cause: RollbackError,
        touched: &[(EntityId, Option<JsonValue>)],
        started: std::time::Instant,
    ) -> RollbackError {
        warn!(
            "Restore {} failed after {} write(s), reverting: {}",
            operation.id, operation.writes_applied, cause
        );

        match self.revert(touched).await {
            Ok(()) => {
                let detail = json!({
                    "error": cause.to_string(),
                    "writes_applied": operation.writes_applied,
                    "reverted": touched.len(),
                });
                if matches!(cause, RollbackError::Timeout { .. }) {
                    operation.fail(cause.to_string());
                    self.save(&operation).await;
                    self.publish(RollbackEventKind::Failed, &operation, detail);
                    warn!("Restore {} timed out after {:?}; changes reverted", operation.id, started.elapsed());
                    cause
                } else {
                    operation.mark_rolled_back(cause.to_string());
                    self.save(&operation).await;
                    self.publish(RollbackEventKind::RolledBack, &operation, detail);
                    info!("Restore {} rolled back {} write(s)", operation.id, touched.len());
                    RollbackError::RolledBack {
                        operation_id: operation.id,
                        cause: Box::new(cause),
                    }
                }
            }
            Err(revert_error) => {
                operation.fail(format!("{}; revert failed: {}", cause, revert_error));
                operation.requires_manual_intervention = true;
                self.save(&operation).await;
                self.publish(
                    RollbackEventKind::Failed,
                    &operation,
                    json!({
                        "error": cause.to_string(),
                        "revert_error": revert_error,
                        "writes_applied": operation.writes_applied,
                        "requires_manual_intervention": true,
                    }),
                );
                error!(
                    operation_id = %operation.id,
                    rollback_point_id = %operation.rollback_point_id,
                    "Restore failed and could not be reverted, manual intervention required: {}; revert error: {}",
                    cause,
                    revert_error
                );
                RollbackError::Irrecoverable {
                    operation_id: operation.id,
                    cause: Box::new(cause),
                    revert_error,
                }
            }
        }
    }

    async fn finish_inspection(
        &self,
        mut operation: RollbackOperation,
        plan: RestorePlan,
    ) -> RestoreOutcome {
        let diff = (operation.operation_type == OperationType::DryRun).then(|| {
            let mut live = EntityStates::new();
            let mut restored = EntityStates::new();
            for (entity_id, value) in &plan.writes {
                let current = plan
                    .live
                    .get(entity_id)
                    .and_then(|state| state.as_ref())
                    .map(|state| state.data.clone());
                live.insert(entity_id.clone(), current);
                restored.insert(entity_id.clone(), Some(value.clone()));
            }
            diff_states("live", operation.rollback_point_id.clone(), &live, &restored)
        });

        operation.complete();
        self.save(&operation).await;
        self.publish(
            RollbackEventKind::Completed,
            &operation,
            json!({
                "operation_type": operation.operation_type,
                "conflicts": operation.conflicts.len(),
            }),
        );

        RestoreOutcome {
            conflicts: operation.conflicts.clone(),
            diff,
            applied: 0,
            skipped: plan.skipped,
            audit_point_id: None,
            operation,
        }
    }

    async fn finish_restore(
        &self,
        guard: &ExecutionGuard,
        mut operation: RollbackOperation,
        plan: RestorePlan,
        started: std::time::Instant,
    ) -> RestoreOutcome {
        operation.complete();
        self.save(&operation).await;
        self.publish(
            RollbackEventKind::Completed,
            &operation,
            json!({
                "writes_applied": operation.writes_applied,
                "conflicts": operation.conflicts.len(),
                "audit_point_id": operation.audit_point_id,
            }),
        );
        info!(
            "Restored rollback point {} ({} write(s)) in {:?}",
            operation.rollback_point_id,
            operation.writes_applied,
            started.elapsed()
        );

        match self.store.config().consume_policy {
            ConsumePolicy::Retain => {
                let consumed = self
                    .store
                    .modify_point(&operation.rollback_point_id, |point| {
                        point.status = RollbackPointStatus::Consumed
                    })
                    .await;
                if let Err(e) = consumed {
                    debug!("Could not mark {} consumed: {}", operation.rollback_point_id, e);
                }
            }
            ConsumePolicy::Remove => {
                self.store.remove_point_locked(guard).await;
            }
        }

        RestoreOutcome {
            conflicts: operation.conflicts.clone(),
            diff: None,
            applied: operation.writes_applied,
            skipped: plan.skipped,
            audit_point_id: operation.audit_point_id.clone(),
            operation,
        }
    }

    // ========== Diffs ==========

    /// Entity-level differences between the states captured by two points.
    ///
    /// An entity captured by only one of them counts as absent in the other.
    pub async fn diff_points(&self, from_id: &str, to_id: &str) -> Result<RollbackDiff> {
        let from = self.store.get_rollback_point(from_id).await?;
        let to = self.store.get_rollback_point(to_id).await?;
        let from_states = self.captured_states(&from).await?;
        let to_states = self.captured_states(&to).await?;
        Ok(diff_states(from_id, to_id, &from_states, &to_states))
    }

    /// What restoring `rollback_point_id` would change in the live graph.
    pub async fn diff_against_live(&self, rollback_point_id: &str) -> Result<RollbackDiff> {
        let point = self.store.get_rollback_point(rollback_point_id).await?;
        let captured = self.captured_states(&point).await?;

        let mut live = EntityStates::new();
        for entity_id in captured.keys() {
            let state = self
                .graph
                .get_entity_state(entity_id)
                .await
                .map_err(graph_unavailable)?;
            live.insert(entity_id.clone(), state.map(|s| s.data));
        }
        Ok(diff_states("live", rollback_point_id, &live, &captured))
    }

    async fn captured_states(&self, point: &RollbackPoint) -> Result<EntityStates> {
        let snapshots = self.store.snapshots();
        let mut states = EntityStates::new();
        for snapshot_id in &point.snapshot_ids {
            let Some(snapshot) = snapshots.get_snapshot(snapshot_id).await else {
                debug!(snapshot_id = %snapshot_id, "Skipping missing snapshot in diff");
                continue;
            };
            if let Some(target) = snapshot.target {
                let value = snapshots.restore_from_snapshot(snapshot_id).await?;
                states.insert(target.entity_id, Some(value));
            }
        }
        Ok(states)
    }

    // ========== Lifecycle ==========

    pub async fn get_operation(&self, id: &str) -> Result<RollbackOperation> {
        self.store.get_operation(id).await
    }

    pub async fn get_operations_by_status(&self, status: OperationStatus) -> Vec<RollbackOperation> {
        self.store.get_operations_by_status(status).await
    }

    pub async fn shutdown(&self) {
        self.store.shutdown().await;
    }
}

fn graph_unavailable(error: anyhow::Error) -> RollbackError {
    RollbackError::DatabaseNotReady(format!("{:#}", error))
}

async fn within<T, F>(deadline: Option<Deadline>, operation_id: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(deadline) = deadline else {
        return future.await;
    };
    match time::timeout_at(deadline.at, future).await {
        Ok(result) => result,
        Err(_) => Err(RollbackError::Timeout {
            operation_id: operation_id.to_string(),
            after_ms: deadline.after.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use crate::store::RollbackStoreConfig;

    struct Fixture {
        caps: RollbackCapabilities,
        graph: Arc<MemoryGraph>,
    }

    fn fixture_with(config: RollbackStoreConfig) -> Fixture {
        let store = Arc::new(RollbackStore::new(config));
        let graph = Arc::new(MemoryGraph::new());
        Fixture {
            caps: RollbackCapabilities::new(store, graph.clone()),
            graph,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RollbackStoreConfig::default())
    }

    #[tokio::test]
    async fn test_default_ttl_applied() {
        let f = fixture();
        let point = f
            .caps
            .create_rollback_point(RollbackPoint::new("p"))
            .await
            .unwrap();
        let ttl = f.caps.store().config().default_ttl.unwrap();
        assert_eq!(point.expires_at, Some(point.timestamp + ttl));
    }

    #[tokio::test]
    async fn test_capture_unknown_entity_fails() {
        let f = fixture();
        let point = f.caps.create_rollback_point(RollbackPoint::new("p")).await.unwrap();
        let err = f
            .caps
            .capture_entity(&point.id, "sym:ghost", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RollbackError::NotFound { kind: "Entity", .. }));
        assert!(f.caps.store().get_rollback_point(&point.id).await.unwrap().snapshot_ids.is_empty());
    }

    #[tokio::test]
    async fn test_restore_without_conflicts() {
        let f = fixture();
        f.graph.put("sym:a", json!({"v": 1})).await;
        f.graph.put("sym:b", json!({"v": 1})).await;
        let point = f.caps.create_rollback_point(RollbackPoint::new("p")).await.unwrap();
        f.caps
            .capture_entities(&point.id, ["sym:a", "sym:b"], Some("symbol"))
            .await
            .unwrap();
        f.caps
            .capture_custom(&point.id, SnapshotType::Custom("index".into()), &json!({"files": 2}), None)
            .await
            .unwrap();

        let outcome = f.caps.restore(&point.id, RestoreOptions::new()).await.unwrap();
        assert_eq!(outcome.operation.status, OperationStatus::Completed);
        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.skipped, 1);
        assert!(outcome.conflicts.is_empty());

        let point = f.caps.store().get_rollback_point(&point.id).await.unwrap();
        assert_eq!(point.status, RollbackPointStatus::Consumed);
        assert_eq!(f.caps.store().get_metrics().await.completed_restores, 1);
    }

    #[tokio::test]
    async fn test_consume_policy_remove() {
        let mut config = RollbackStoreConfig::default();
        config.consume_policy = ConsumePolicy::Remove;
        let f = fixture_with(config);
        f.graph.put("sym:a", json!(1)).await;
        let point = f.caps.create_rollback_point(RollbackPoint::new("p")).await.unwrap();
        f.caps.capture_entity(&point.id, "sym:a", None).await.unwrap();

        f.caps.restore(&point.id, RestoreOptions::new()).await.unwrap();

        let err = f.caps.store().get_rollback_point(&point.id).await.unwrap_err();
        assert!(matches!(err, RollbackError::NotFound { .. }));
        assert_eq!(f.caps.store().snapshots().get_memory_usage().await.total_snapshots, 0);
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_cannot_be_forced() {
        let f = fixture();
        f.graph.put("sym:a", json!({"v": 1})).await;
        let point = f.caps.create_rollback_point(RollbackPoint::new("p")).await.unwrap();
        let snapshot = f.caps.capture_entity(&point.id, "sym:a", None).await.unwrap();
        f.caps.store().snapshots().corrupt_payload(&snapshot.id).await;

        let err = f
            .caps
            .restore(&point.id, RestoreOptions::new().with_strategy(ConflictStrategy::Force))
            .await
            .unwrap_err();
        match &err {
            RollbackError::ChecksumMismatch { snapshot_id, expected, actual } => {
                assert_eq!(snapshot_id, &snapshot.id);
                assert_ne!(expected, actual);
            }
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
        assert!(!err.is_conflict());
        assert_eq!(f.graph.get("sym:a").await, Some(json!({"v": 1})));

        let failed = f.caps.get_operations_by_status(OperationStatus::Failed).await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].conflicts.len(), 1);
        assert_eq!(failed[0].conflicts[0].conflict_type, ConflictType::ChecksumMismatch);

        let metrics = f.caps.store().get_metrics().await;
        assert_eq!(metrics.failed_restores, 1);
        assert!(metrics.corruption_count >= 1);
    }

    #[tokio::test]
    async fn test_verify_reports_without_writing() {
        let f = fixture();
        f.graph.put("sym:a", json!({"v": 1})).await;
        let point = f.caps.create_rollback_point(RollbackPoint::new("p")).await.unwrap();
        f.caps.capture_entity(&point.id, "sym:a", None).await.unwrap();
        f.graph.put("sym:a", json!({"v": 2})).await;

        let outcome = f.caps.verify(&point.id).await.unwrap();
        assert_eq!(outcome.operation.status, OperationStatus::Completed);
        assert_eq!(outcome.operation.operation_type, OperationType::Verify);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.applied, 0);
        assert_eq!(f.graph.get("sym:a").await, Some(json!({"v": 2})));

        // Verification does not consume the point
        let point = f.caps.store().get_rollback_point(&point.id).await.unwrap();
        assert_eq!(point.status, RollbackPointStatus::Active);
    }

    #[tokio::test]
    async fn test_dry_run_computes_diff() {
        let f = fixture();
        f.graph.put("sym:a", json!({"v": 1})).await;
        f.graph.put("sym:b", json!({"v": 1})).await;
        let point = f.caps.create_rollback_point(RollbackPoint::new("p")).await.unwrap();
        f.caps.capture_entities(&point.id, ["sym:a", "sym:b"], None).await.unwrap();
        f.graph.put("sym:a", json!({"v": 5})).await;

        let outcome = f.caps.dry_run(&point.id, Some(ConflictStrategy::Force)).await.unwrap();
        let diff = outcome.diff.expect("dry run diff");
        assert_eq!(diff.entries.len(), 1);
        assert_eq!(diff.entries[0].target_id, "sym:a");
        assert_eq!(diff.entries[0].before, Some(json!({"v": 5})));
        assert_eq!(diff.entries[0].after, Some(json!({"v": 1})));
        assert_eq!(f.graph.get("sym:a").await, Some(json!({"v": 5})));

        let live_diff = f.caps.diff_against_live(&point.id).await.unwrap();
        assert_eq!(live_diff.entries, diff.entries);
    }

    #[tokio::test]
    async fn test_merge_strategy_writes_merged_value() {
        let f = fixture();
        let resolver = ConflictResolver::new(f.caps.store().clone()).with_json_merge("symbol");
        let caps = RollbackCapabilities::new(f.caps.store().clone(), f.graph.clone())
            .with_resolver(resolver)
            .with_default_strategy(ConflictStrategy::Merge);

        f.graph.put("sym:a", json!({"name": "a", "doc": null})).await;
        let point = caps.create_rollback_point(RollbackPoint::new("p")).await.unwrap();
        caps.capture_entity(&point.id, "sym:a", Some("symbol")).await.unwrap();
        f.graph.put("sym:a", json!({"name": "renamed", "doc": "text", "pub": true})).await;

        let outcome = caps.restore(&point.id, RestoreOptions::new()).await.unwrap();
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.audit_point_id, None);
        assert_eq!(
            f.graph.get("sym:a").await,
            Some(json!({"name": "a", "doc": null, "pub": true}))
        );
    }

    #[tokio::test]
    async fn test_stale_point_force_recreates_entity() {
        let f = fixture();
        f.graph.put("sym:a", json!({"v": 1})).await;
        let point = f.caps.create_rollback_point(RollbackPoint::new("p")).await.unwrap();
        f.caps.capture_entity(&point.id, "sym:a", None).await.unwrap();
        f.graph.remove("sym:a").await;

        let err = f.caps.restore(&point.id, RestoreOptions::new()).await.unwrap_err();
        assert_eq!(err.conflicts()[0].conflict_type, ConflictType::StalePoint);

        let outcome = f
            .caps
            .restore(&point.id, RestoreOptions::new().with_strategy(ConflictStrategy::Force))
            .await
            .unwrap();
        // Nothing live was overwritten, so no audit point
        assert_eq!(outcome.audit_point_id, None);
        assert_eq!(f.graph.get("sym:a").await, Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_diff_points() {
        let f = fixture();
        f.graph.put("file:a", json!({"lines": 1})).await;
        let first = f.caps.create_rollback_point(RollbackPoint::new("first")).await.unwrap();
        f.caps.capture_entity(&first.id, "file:a", None).await.unwrap();

        f.graph.put("file:a", json!({"lines": 2})).await;
        f.graph.put("file:b", json!({"lines": 9})).await;
        let second = f.caps.create_rollback_point(RollbackPoint::new("second")).await.unwrap();
        f.caps.capture_entities(&second.id, ["file:a", "file:b"], None).await.unwrap();

        let diff = f.caps.diff_points(&first.id, &second.id).await.unwrap();
        let ops: Vec<(&str, crate::diff::DiffOperation)> = diff
            .entries
            .iter()
            .map(|e| (e.target_id.as_str(), e.operation))
            .collect();
        assert_eq!(
            ops,
            vec![
                ("file:a", crate::diff::DiffOperation::Modified),
                ("file:b", crate::diff::DiffOperation::Added),
            ]
        );
    }

    #[tokio::test]
    async fn test_restore_after_shutdown_rejected() {
        let f = fixture();
        let point = f.caps.create_rollback_point(RollbackPoint::new("p")).await.unwrap();
        f.caps.shutdown().await;
        let err = f.caps.restore(&point.id, RestoreOptions::new()).await.unwrap_err();
        assert!(matches!(err, RollbackError::ShutDown));
    }
}
