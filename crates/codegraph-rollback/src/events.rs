//! Lifecycle events published by the rollback store and orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

use crate::types::{OperationId, RollbackPointId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RollbackEventKind {
    #[serde(rename = "rollback:created")]
    Created,
    #[serde(rename = "rollback:expired")]
    Expired,
    #[serde(rename = "rollback:completed")]
    Completed,
    #[serde(rename = "rollback:failed")]
    Failed,
    #[serde(rename = "rollback:rolled_back")]
    RolledBack,
}

impl RollbackEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackEventKind::Created => "rollback:created",
            RollbackEventKind::Expired => "rollback:expired",
            RollbackEventKind::Completed => "rollback:completed",
            RollbackEventKind::Failed => "rollback:failed",
            RollbackEventKind::RolledBack => "rollback:rolled_back",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackEvent {
    /// Global publish order; strictly increasing
    pub sequence: u64,
    pub kind: RollbackEventKind,
    pub rollback_point_id: RollbackPointId,
    pub operation_id: Option<OperationId>,
    pub timestamp: DateTime<Utc>,
    pub detail: serde_json::Value,
}

/// Broadcast sink for [`RollbackEvent`]s.
///
/// Publishing is serialized so that sequence numbers match delivery order.
/// Subscribers that fall behind by more than the channel capacity miss events
/// (and are told so by the receiver), publishers never block.
pub struct EventBus {
    sender: broadcast::Sender<RollbackEvent>,
    sequence: Mutex<u64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: Mutex::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RollbackEvent> {
        self.sender.subscribe()
    }

    pub fn publish(
        &self,
        kind: RollbackEventKind,
        rollback_point_id: &str,
        operation_id: Option<&str>,
        detail: serde_json::Value,
    ) -> u64 {
        let mut sequence = self.sequence.lock().unwrap_or_else(PoisonError::into_inner);
        *sequence += 1;
        let event = RollbackEvent {
            sequence: *sequence,
            kind,
            rollback_point_id: rollback_point_id.to_string(),
            operation_id: operation_id.map(str::to_string),
            timestamp: Utc::now(),
            detail,
        };
        tracing::debug!(
            event = kind.as_str(),
            rollback_point_id,
            sequence = *sequence,
            "Publishing rollback event"
        );
        // No subscribers is fine
        let _ = self.sender.send(event);
        *sequence
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_events_arrive_in_sequence_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(RollbackEventKind::Created, "rp-1", None, json!({}));
        bus.publish(RollbackEventKind::Completed, "rp-1", Some("op-1"), json!({"applied": 2}));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, RollbackEventKind::Created);
        assert_eq!(second.kind, RollbackEventKind::Completed);
        assert!(first.sequence < second.sequence);
        assert_eq!(second.operation_id.as_deref(), Some("op-1"));
        assert_eq!(second.detail["applied"], 2);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(RollbackEventKind::Expired, "rp", None, json!(null)), 1);
        assert_eq!(bus.publish(RollbackEventKind::Expired, "rp", None, json!(null)), 2);
    }

    #[test]
    fn test_event_names() {
        let json = serde_json::to_string(&RollbackEventKind::RolledBack).unwrap();
        assert_eq!(json, "\"rollback:rolled_back\"");
        assert_eq!(RollbackEventKind::Created.as_str(), "rollback:created");
    }
}
