//! Entity-level diffs between captured and live graph states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::types::EntityId;

/// Entity data keyed by entity id; a `None` value means the entity is absent.
pub type EntityStates = BTreeMap<EntityId, Option<JsonValue>>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiffOperation {
    Added,
    Modified,
    Removed,
}

/// Change of one entity between two states.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffEntry {
    pub operation: DiffOperation,
    pub target_id: EntityId,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
}

/// Changes going from state `from` to state `to`, ordered by target id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackDiff {
    pub from: String,
    pub to: String,
    pub entries: Vec<DiffEntry>,
    pub computed_at: DateTime<Utc>,
}

impl RollbackDiff {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, operation: DiffOperation) -> usize {
        self.entries
            .iter()
            .filter(|e| e.operation == operation)
            .count()
    }

    pub fn entry(&self, target_id: &str) -> Option<&DiffEntry> {
        self.entries.iter().find(|e| e.target_id == target_id)
    }
}

/// Diff two entity states. Ids present in only one map count as absent in
/// the other.
pub fn diff_states(
    from_label: impl Into<String>,
    to_label: impl Into<String>,
    from: &EntityStates,
    to: &EntityStates,
) -> RollbackDiff {
    let mut ids: Vec<&EntityId> = from.keys().chain(to.keys()).collect();
    ids.sort();
    ids.dedup();

    let entries = ids
        .into_iter()
        .filter_map(|id| {
            let before = from.get(id).cloned().flatten();
            let after = to.get(id).cloned().flatten();
            let operation = match (&before, &after) {
                (None, Some(_)) => DiffOperation::Added,
                (Some(_), None) => DiffOperation::Removed,
                (Some(b), Some(a)) if b != a => DiffOperation::Modified,
                _ => return None,
            };
            Some(DiffEntry {
                operation,
                target_id: id.clone(),
                before,
                after,
            })
        })
        .collect();

    RollbackDiff {
        from: from_label.into(),
        to: to_label.into(),
        entries,
        computed_at: Utc::now(),
    }
}
