//! Conflict detection and resolution for restores.

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Result, RollbackError};
use crate::graph::{EntityState, GraphStateAccess};
use crate::store::RollbackStore;
use crate::types::{
    ConflictStrategy, ConflictType, EntityId, RollbackConflict, RollbackPoint,
};

/// Caller-supplied merge of `(captured, live)` entity data.
pub type MergeFn = Arc<dyn Fn(&JsonValue, &JsonValue) -> anyhow::Result<JsonValue> + Send + Sync>;

/// Outcome of resolving a single conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionDecision {
    /// Write the captured state, overwriting live changes
    Proceed,
    /// Fail the operation
    Abort,
    /// Write this merged value instead of the captured state
    Merge(JsonValue),
}

/// Result of validating a rollback point against the live graph.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub conflicts: Vec<RollbackConflict>,
    /// Live state of every captured entity, `None` where it no longer exists
    pub live: HashMap<EntityId, Option<EntityState>>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Detects conflicts between captured snapshots and live graph state and
/// applies a [`ConflictStrategy`] to them.
#[derive(Clone)]
pub struct ConflictResolver {
    store: Arc<RollbackStore>,
    merge_fns: HashMap<String, MergeFn>,
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.merge_fns.keys().collect();
        types.sort();
        f.debug_struct("ConflictResolver")
            .field("merge_fns", &types)
            .finish()
    }
}

impl ConflictResolver {
    pub fn new(store: Arc<RollbackStore>) -> Self {
        Self {
            store,
            merge_fns: HashMap::new(),
        }
    }

    /// Register the merge function used for conflicts on `entity_type`.
    pub fn with_merge_fn<F>(mut self, entity_type: impl Into<String>, merge: F) -> Self
    where
        F: Fn(&JsonValue, &JsonValue) -> anyhow::Result<JsonValue> + Send + Sync + 'static,
    {
        self.merge_fns.insert(entity_type.into(), Arc::new(merge));
        self
    }

    /// Register [`merge_json`] for `entity_type`.
    pub fn with_json_merge(self, entity_type: impl Into<String>) -> Self {
        self.with_merge_fn(entity_type, |captured, live| Ok(merge_json(captured, live)))
    }

    pub fn has_merge_fn(&self, entity_type: &str) -> bool {
        self.merge_fns.contains_key(entity_type)
    }

    /// Validate a stored rollback point against the live graph.
    pub async fn validate(
        &self,
        rollback_point_id: &str,
        graph: &dyn GraphStateAccess,
    ) -> Result<ValidationReport> {
        let point = self.store.get_rollback_point(rollback_point_id).await?;
        self.validate_point(&point, graph).await
    }

    /// Compare every snapshot of `point` against the live graph.
    ///
    /// Each snapshot contributes at most one conflict. Graph read failures
    /// abort validation with [`RollbackError::DatabaseNotReady`].
    pub async fn validate_point(
        &self,
        point: &RollbackPoint,
        graph: &dyn GraphStateAccess,
    ) -> Result<ValidationReport> {
        let snapshots = self.store.snapshots();
        let mut report = ValidationReport::default();

        for snapshot_id in &point.snapshot_ids {
            let Some(snapshot) = snapshots.get_snapshot(snapshot_id).await else {
                report.conflicts.push(
                    RollbackConflict::new(
                        ConflictType::MissingSnapshot,
                        format!("Snapshot {} can no longer be retrieved", snapshot_id),
                    )
                    .with_snapshot(snapshot_id.as_str()),
                );
                continue;
            };

            match snapshots.verify_snapshot(snapshot_id).await {
                Ok(()) => {}
                Err(RollbackError::ChecksumMismatch { .. }) => {
                    let mut conflict = RollbackConflict::new(
                        ConflictType::ChecksumMismatch,
                        format!("Snapshot {} failed integrity verification", snapshot_id),
                    )
                    .with_snapshot(snapshot_id.as_str());
                    if let Some(target) = &snapshot.target {
                        conflict = conflict.with_target(target);
                    }
                    report.conflicts.push(conflict);
                    continue;
                }
                Err(_) => {
                    // Removed between the lookup and the verification
                    report.conflicts.push(
                        RollbackConflict::new(
                            ConflictType::MissingSnapshot,
                            format!("Snapshot {} can no longer be retrieved", snapshot_id),
                        )
                        .with_snapshot(snapshot_id.as_str()),
                    );
                    continue;
                }
            }

            let Some(target) = &snapshot.target else {
                continue;
            };

            let live = graph
                .get_entity_state(&target.entity_id)
                .await
                .map_err(|e| RollbackError::DatabaseNotReady(format!("{:#}", e)))?;

            match &live {
                None => report.conflicts.push(
                    RollbackConflict::new(
                        ConflictType::StalePoint,
                        format!("Entity {} no longer exists", target.entity_id),
                    )
                    .with_snapshot(snapshot_id.as_str())
                    .with_target(target),
                ),
                Some(state) if state.fingerprint != target.fingerprint => {
                    let description = if state.fingerprint > target.fingerprint {
                        format!(
                            "Entity {} was modified after capture ({} -> {})",
                            target.entity_id, target.fingerprint, state.fingerprint
                        )
                    } else {
                        format!(
                            "Entity {} diverged from its captured version ({} vs {})",
                            target.entity_id, target.fingerprint, state.fingerprint
                        )
                    };
                    report.conflicts.push(
                        RollbackConflict::new(ConflictType::ConcurrentModification, description)
                            .with_snapshot(snapshot_id.as_str())
                            .with_target(target)
                            .with_live(state.fingerprint),
                    );
                }
                Some(_) => {}
            }
            report.live.insert(target.entity_id.clone(), live);
        }

        debug!(
            rollback_point_id = %point.id,
            conflicts = report.conflicts.len(),
            "Validated rollback point"
        );
        Ok(report)
    }

    /// Decide how to handle one conflict.
    ///
    /// `captured` and `live` are the entity payloads involved, used by the
    /// merge strategy. Integrity conflicts always abort.
    pub fn resolve(
        &self,
        conflict: &RollbackConflict,
        strategy: ConflictStrategy,
        captured: Option<&JsonValue>,
        live: Option<&JsonValue>,
    ) -> ResolutionDecision {
        if !conflict.conflict_type.is_forceable() {
            return ResolutionDecision::Abort;
        }

        match strategy {
            ConflictStrategy::Abort => ResolutionDecision::Abort,
            ConflictStrategy::Force => ResolutionDecision::Proceed,
            ConflictStrategy::Merge => self.merge(conflict, captured, live),
        }
    }

    fn merge(
        &self,
        conflict: &RollbackConflict,
        captured: Option<&JsonValue>,
        live: Option<&JsonValue>,
    ) -> ResolutionDecision {
        let Some(merge) = conflict
            .entity_type
            .as_deref()
            .and_then(|entity_type| self.merge_fns.get(entity_type))
        else {
            debug!(
                entity_type = conflict.entity_type.as_deref().unwrap_or("<none>"),
                "No merge function registered, aborting"
            );
            return ResolutionDecision::Abort;
        };

        let (Some(captured), Some(live)) = (captured, live) else {
            return ResolutionDecision::Abort;
        };

        match merge(captured, live) {
            Ok(merged) => ResolutionDecision::Merge(merged),
            Err(e) => {
                warn!(
                    entity_id = conflict.entity_id.as_deref().unwrap_or("<none>"),
                    "Merge function failed, aborting: {:#}", e
                );
                ResolutionDecision::Abort
            }
        }
    }
}

/// Merge captured entity data over live data.
///
/// Objects merge key by key with captured values winning, arrays keep the
/// captured items followed by live items not already present, and any other
/// pair resolves to the captured value.
pub fn merge_json(captured: &JsonValue, live: &JsonValue) -> JsonValue {
    match (captured, live) {
        (JsonValue::Object(captured_map), JsonValue::Object(live_map)) => {
            let mut merged = live_map.clone();
            for (key, captured_value) in captured_map {
                let value = match live_map.get(key) {
                    Some(live_value) => merge_json(captured_value, live_value),
                    None => captured_value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            JsonValue::Object(merged)
        }
        (JsonValue::Array(captured_arr), JsonValue::Array(live_arr)) => {
            let mut merged = captured_arr.clone();
            for item in live_arr {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
            JsonValue::Array(merged)
        }
        _ => captured.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use crate::store::RollbackStoreConfig;
    use crate::types::{SnapshotTarget, SnapshotType};
    use serde_json::json;

    async fn setup() -> (Arc<RollbackStore>, MemoryGraph, RollbackPoint) {
        let store = Arc::new(RollbackStore::new(RollbackStoreConfig::default()));
        let graph = MemoryGraph::new();
        let point = RollbackPoint::new("before-edit");
        store.store_rollback_point(point.clone()).await.unwrap();
        (store, graph, point)
    }

    async fn capture(
        store: &RollbackStore,
        graph: &MemoryGraph,
        point_id: &str,
        entity_id: &str,
    ) -> String {
        let state = graph.get_entity_state(entity_id).await.unwrap().unwrap();
        let target = SnapshotTarget {
            entity_id: entity_id.to_string(),
            entity_type: Some("symbol".to_string()),
            fingerprint: state.fingerprint,
        };
        let snapshot = store
            .snapshots()
            .create_target_snapshot(point_id, SnapshotType::Entity, target, &state.data, None)
            .await
            .unwrap();
        store
            .modify_point(point_id, |p| p.snapshot_ids.push(snapshot.id.clone()))
            .await
            .unwrap();
        snapshot.id
    }

    #[tokio::test]
    async fn test_unchanged_graph_validates() {
        let (store, graph, point) = setup().await;
        graph.put("sym:a", json!({"v": 1})).await;
        capture(&store, &graph, &point.id, "sym:a").await;

        let report = ConflictResolver::new(store)
            .validate(&point.id, &graph)
            .await
            .unwrap();
        assert!(report.is_ok());
        assert!(report.live["sym:a"].is_some());
    }

    #[tokio::test]
    async fn test_classifies_conflicts() {
        let (store, graph, point) = setup().await;
        graph.put("sym:modified", json!({"v": 1})).await;
        graph.put("sym:deleted", json!({"v": 1})).await;
        graph.put("sym:evicted", json!({"v": 1})).await;
        capture(&store, &graph, &point.id, "sym:modified").await;
        capture(&store, &graph, &point.id, "sym:deleted").await;
        let evicted = capture(&store, &graph, &point.id, "sym:evicted").await;

        graph.put("sym:modified", json!({"v": 2})).await;
        graph.remove("sym:deleted").await;
        store.snapshots().delete_snapshot(&evicted).await;

        let report = ConflictResolver::new(store)
            .validate(&point.id, &graph)
            .await
            .unwrap();
        let types: Vec<ConflictType> = report.conflicts.iter().map(|c| c.conflict_type).collect();
        assert_eq!(
            types,
            vec![
                ConflictType::ConcurrentModification,
                ConflictType::StalePoint,
                ConflictType::MissingSnapshot,
            ]
        );

        let modified = &report.conflicts[0];
        assert_eq!(modified.entity_id.as_deref(), Some("sym:modified"));
        assert!(modified.live > modified.recorded);
        assert_eq!(report.live["sym:deleted"], None);
    }

    #[tokio::test]
    async fn test_validate_unknown_point() {
        let (store, graph, _) = setup().await;
        let err = ConflictResolver::new(store)
            .validate("missing", &graph)
            .await
            .unwrap_err();
        assert!(matches!(err, RollbackError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_resolve_strategies() {
        let (store, _, _) = setup().await;
        let resolver = ConflictResolver::new(store).with_json_merge("symbol");

        let target = SnapshotTarget {
            entity_id: "sym:a".to_string(),
            entity_type: Some("symbol".to_string()),
            fingerprint: crate::types::Fingerprint(1),
        };
        let conflict = RollbackConflict::new(ConflictType::ConcurrentModification, "changed")
            .with_target(&target);
        let captured = json!({"name": "a", "tags": ["x"]});
        let live = json!({"name": "b", "tags": ["y"], "doc": "new"});

        assert_eq!(
            resolver.resolve(&conflict, ConflictStrategy::Abort, None, None),
            ResolutionDecision::Abort
        );
        assert_eq!(
            resolver.resolve(&conflict, ConflictStrategy::Force, None, None),
            ResolutionDecision::Proceed
        );
        assert_eq!(
            resolver.resolve(&conflict, ConflictStrategy::Merge, Some(&captured), Some(&live)),
            ResolutionDecision::Merge(json!({"name": "a", "tags": ["x", "y"], "doc": "new"}))
        );
    }

    #[tokio::test]
    async fn test_merge_without_function_aborts() {
        let (store, _, _) = setup().await;
        let resolver = ConflictResolver::new(store)
            .with_merge_fn("symbol", |_, _| Err(anyhow::anyhow!("cannot merge")));

        let mut conflict = RollbackConflict::new(ConflictType::ConcurrentModification, "changed");
        conflict.entity_type = Some("file".to_string());
        let value = json!(1);
        assert_eq!(
            resolver.resolve(&conflict, ConflictStrategy::Merge, Some(&value), Some(&value)),
            ResolutionDecision::Abort
        );

        // A failing merge function also aborts
        conflict.entity_type = Some("symbol".to_string());
        assert_eq!(
            resolver.resolve(&conflict, ConflictStrategy::Merge, Some(&value), Some(&value)),
            ResolutionDecision::Abort
        );
    }

    #[tokio::test]
    async fn test_integrity_conflicts_cannot_be_forced() {
        let (store, _, _) = setup().await;
        let resolver = ConflictResolver::new(store);
        for conflict_type in [ConflictType::ChecksumMismatch, ConflictType::MissingSnapshot] {
            let conflict = RollbackConflict::new(conflict_type, "broken");
            assert_eq!(
                resolver.resolve(&conflict, ConflictStrategy::Force, None, None),
                ResolutionDecision::Abort
            );
        }
    }

    #[test]
    fn test_merge_json_scalars_prefer_captured() {
        assert_eq!(merge_json(&json!(1), &json!(2)), json!(1));
        assert_eq!(
            merge_json(&json!({"a": {"b": 1}}), &json!({"a": {"b": 2, "c": 3}})),
            json!({"a": {"b": 1, "c": 3}})
        );
    }
}
