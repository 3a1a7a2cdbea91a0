//! Checksummed snapshot storage.
//!
//! Snapshots are serialized to JSON at capture time, which both deep-copies the
//! caller's data (nothing aliases live graph structures afterwards) and limits
//! payloads to the JSON value model. The serialized bytes are hashed with
//! blake3; every read re-hashes and refuses to hand back data whose digest no
//! longer matches.
//!
//! The manager knows rollback points only as owner ids with an optional
//! expiry deadline, which it uses to hide snapshots of expired owners and to
//! pick eviction candidates.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::error::{Result, RollbackError};
use crate::types::{
    MemoryUsage, Metadata, RollbackPointId, Snapshot, SnapshotId, SnapshotTarget, SnapshotType,
};

/// Byte limits enforced by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotLimits {
    /// Ceiling for all snapshot payloads together
    pub max_total_bytes: u64,
    /// Ceiling for the payloads of one rollback point
    pub max_point_bytes: u64,
}

impl Default for SnapshotLimits {
    fn default() -> Self {
        Self {
            max_total_bytes: 256 * 1024 * 1024,
            max_point_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Default)]
struct SnapshotIndex {
    by_id: HashMap<SnapshotId, Snapshot>,
    /// Snapshot ids per owner, in creation order
    by_point: HashMap<RollbackPointId, Vec<SnapshotId>>,
    owner_expiry: HashMap<RollbackPointId, DateTime<Utc>>,
    total_bytes: u64,
    next_sequence: u64,
}

impl SnapshotIndex {
    fn owner_expired(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.owner_expiry
            .get(owner)
            .is_some_and(|expires_at| now >= *expires_at)
    }

    fn point_bytes(&self, owner: &str) -> u64 {
        self.by_point
            .get(owner)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.by_id.get(id))
                    .map(|s| s.size_bytes)
                    .sum()
            })
            .unwrap_or(0)
    }

    fn remove(&mut self, id: &str) -> Option<Snapshot> {
        let snapshot = self.by_id.remove(id)?;
        self.total_bytes = self.total_bytes.saturating_sub(snapshot.size_bytes);
        if let Some(ids) = self.by_point.get_mut(&snapshot.rollback_point_id) {
            ids.retain(|s| s != id);
            if ids.is_empty() {
                self.by_point.remove(&snapshot.rollback_point_id);
            }
        }
        Some(snapshot)
    }

    /// Ids ordered by creation, oldest first.
    fn ids_by_age(&self) -> Vec<SnapshotId> {
        let mut entries: Vec<(u64, &SnapshotId)> =
            self.by_id.values().map(|s| (s.sequence, &s.id)).collect();
        entries.sort_unstable_by_key(|(sequence, _)| *sequence);
        entries.into_iter().map(|(_, id)| id.clone()).collect()
    }
}

/// Content store for snapshots, indexed by id and by owning rollback point.
pub struct SnapshotManager {
    index: RwLock<SnapshotIndex>,
    limits: SnapshotLimits,
    corruption_count: AtomicU64,
    evicted_count: AtomicU64,
}

impl SnapshotManager {
    pub fn new(limits: SnapshotLimits) -> Self {
        Self {
            index: RwLock::new(SnapshotIndex::default()),
            limits,
            corruption_count: AtomicU64::new(0),
            evicted_count: AtomicU64::new(0),
        }
    }

    pub fn limits(&self) -> SnapshotLimits {
        self.limits
    }

    /// Capture an opaque payload under `rollback_point_id`.
    ///
    /// Fails with [`RollbackError::Serialization`] when `data` cannot be
    /// represented as JSON.
    pub async fn create_snapshot<T>(
        &self,
        rollback_point_id: &str,
        snapshot_type: SnapshotType,
        data: &T,
        metadata: Option<Metadata>,
    ) -> Result<Snapshot>
    where
        T: Serialize + ?Sized,
    {
        self.insert(rollback_point_id, snapshot_type, data, metadata, None)
            .await
    }

    /// Capture the state of a live graph entity so it can be written back.
    pub async fn create_target_snapshot<T>(
        &self,
        rollback_point_id: &str,
        snapshot_type: SnapshotType,
        target: SnapshotTarget,
        data: &T,
        metadata: Option<Metadata>,
    ) -> Result<Snapshot>
    where
        T: Serialize + ?Sized,
    {
        self.insert(rollback_point_id, snapshot_type, data, metadata, Some(target))
            .await
    }

    async fn insert<T>(
        &self,
        rollback_point_id: &str,
        snapshot_type: SnapshotType,
        data: &T,
        metadata: Option<Metadata>,
        target: Option<SnapshotTarget>,
    ) -> Result<Snapshot>
    where
        T: Serialize + ?Sized,
    {
        // Round-trip through the JSON value model first so that anything it
        // cannot represent (e.g. non-string map keys) is rejected up front.
        let value = serde_json::to_value(data)?;
        let payload = serde_json::to_vec(&value)?;
        let size_bytes = payload.len() as u64;
        let checksum = checksum(&payload);

        let mut index = self.index.write().await;

        let point_bytes = index.point_bytes(rollback_point_id);
        if point_bytes + size_bytes > self.limits.max_point_bytes {
            return Err(RollbackError::CapacityExceeded {
                requested: point_bytes + size_bytes,
                limit: self.limits.max_point_bytes,
            });
        }

        let sequence = index.next_sequence;
        index.next_sequence += 1;

        let snapshot = Snapshot {
            id: uuid::Uuid::new_v4().to_string(),
            rollback_point_id: rollback_point_id.to_string(),
            snapshot_type,
            payload,
            size_bytes,
            checksum,
            created_at: Utc::now(),
            metadata: metadata.unwrap_or_default(),
            target,
            sequence,
        };

        index.total_bytes += size_bytes;
        index
            .by_point
            .entry(rollback_point_id.to_string())
            .or_default()
            .push(snapshot.id.clone());
        index.by_id.insert(snapshot.id.clone(), snapshot.clone());

        debug!(
            snapshot_id = %snapshot.id,
            rollback_point_id,
            size_bytes,
            "Created snapshot"
        );

        if index.total_bytes > self.limits.max_total_bytes {
            let evicted = self.evict(&mut index, Some(&snapshot.id));
            if evicted > 0 {
                warn!(
                    "Snapshot memory ceiling of {} bytes exceeded, evicted {} snapshot(s)",
                    self.limits.max_total_bytes, evicted
                );
            }
        }

        Ok(snapshot)
    }

    /// Fetch a snapshot. Snapshots of expired owners are not returned.
    pub async fn get_snapshot(&self, id: &str) -> Option<Snapshot> {
        let index = self.index.read().await;
        let snapshot = index.by_id.get(id)?;
        if index.owner_expired(&snapshot.rollback_point_id, Utc::now()) {
            return None;
        }
        Some(snapshot.clone())
    }

    /// Snapshots of one owner in capture order.
    pub async fn snapshots_for_rollback_point(&self, rollback_point_id: &str) -> Vec<Snapshot> {
        let index = self.index.read().await;
        if index.owner_expired(rollback_point_id, Utc::now()) {
            return Vec::new();
        }
        index
            .by_point
            .get(rollback_point_id)
            .map(|ids| ids.iter().filter_map(|id| index.by_id.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    /// Verify and deserialize a snapshot payload.
    pub async fn restore_from_snapshot(&self, id: &str) -> Result<serde_json::Value> {
        self.restore_as(id).await
    }

    /// Verify and deserialize a snapshot payload into `T`.
    pub async fn restore_as<T: DeserializeOwned>(&self, id: &str) -> Result<T> {
        let index = self.index.read().await;
        let snapshot = self.readable(&index, id)?;
        self.verify_payload(snapshot)?;
        Ok(serde_json::from_slice(&snapshot.payload)?)
    }

    /// Re-hash a stored snapshot without deserializing it.
    pub async fn verify_snapshot(&self, id: &str) -> Result<()> {
        let index = self.index.read().await;
        let snapshot = self.readable(&index, id)?;
        self.verify_payload(snapshot)
    }

    fn readable<'a>(&self, index: &'a SnapshotIndex, id: &str) -> Result<&'a Snapshot> {
        let snapshot = index
            .by_id
            .get(id)
            .ok_or_else(|| RollbackError::not_found("Snapshot", id))?;
        if index.owner_expired(&snapshot.rollback_point_id, Utc::now()) {
            debug!(snapshot_id = id, "Snapshot belongs to an expired rollback point");
            return Err(RollbackError::not_found("Snapshot", id));
        }
        Ok(snapshot)
    }

    fn verify_payload(&self, snapshot: &Snapshot) -> Result<()> {
        let actual = checksum(&snapshot.payload);
        if actual != snapshot.checksum {
            self.corruption_count.fetch_add(1, Ordering::Relaxed);
            error!(
                snapshot_id = %snapshot.id,
                rollback_point_id = %snapshot.rollback_point_id,
                expected = %snapshot.checksum,
                actual = %actual,
                "Snapshot checksum mismatch"
            );
            return Err(RollbackError::ChecksumMismatch {
                snapshot_id: snapshot.id.clone(),
                expected: snapshot.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    pub async fn delete_snapshot(&self, id: &str) -> bool {
        self.index.write().await.remove(id).is_some()
    }

    /// Delete every snapshot owned by a rollback point and forget its expiry.
    pub async fn delete_snapshots_for_rollback_point(&self, rollback_point_id: &str) -> usize {
        let mut index = self.index.write().await;
        index.owner_expiry.remove(rollback_point_id);
        let ids = index.by_point.remove(rollback_point_id).unwrap_or_default();
        let mut removed = 0;
        for id in ids {
            if let Some(snapshot) = index.by_id.remove(&id) {
                index.total_bytes = index.total_bytes.saturating_sub(snapshot.size_bytes);
                removed += 1;
            }
        }
        removed
    }

    /// Record (or clear) the expiry deadline of an owner.
    pub async fn set_owner_expiry(&self, rollback_point_id: &str, expires_at: Option<DateTime<Utc>>) {
        let mut index = self.index.write().await;
        match expires_at {
            Some(expires_at) => {
                index
                    .owner_expiry
                    .insert(rollback_point_id.to_string(), expires_at);
            }
            None => {
                index.owner_expiry.remove(rollback_point_id);
            }
        }
    }

    pub async fn get_memory_usage(&self) -> MemoryUsage {
        let index = self.index.read().await;
        let total_snapshots = index.by_id.len();
        let mut size_by_type: HashMap<String, u64> = HashMap::new();
        for snapshot in index.by_id.values() {
            *size_by_type.entry(snapshot.snapshot_type.label()).or_default() +=
                snapshot.size_bytes;
        }
        MemoryUsage {
            total_snapshots,
            total_size: index.total_bytes,
            average_size: if total_snapshots == 0 {
                0.0
            } else {
                index.total_bytes as f64 / total_snapshots as f64
            },
            size_by_type,
        }
    }

    /// Evict snapshots of expired owners, then the oldest snapshots until the
    /// total size is back under the ceiling. Returns the number removed.
    pub async fn cleanup(&self) -> usize {
        let mut index = self.index.write().await;
        self.evict(&mut index, None)
    }

    fn evict(&self, index: &mut SnapshotIndex, protect: Option<&str>) -> usize {
        let now = Utc::now();
        let by_age = index.ids_by_age();
        let mut removed = 0;

        for id in &by_age {
            let expired = index
                .by_id
                .get(id)
                .is_some_and(|s| index.owner_expired(&s.rollback_point_id, now));
            if expired && index.remove(id).is_some() {
                removed += 1;
            }
        }

        let mut evicted = 0;
        for id in &by_age {
            if index.total_bytes <= self.limits.max_total_bytes {
                break;
            }
            if protect == Some(id.as_str()) {
                continue;
            }
            if let Some(snapshot) = index.remove(id) {
                debug!(
                    snapshot_id = %snapshot.id,
                    rollback_point_id = %snapshot.rollback_point_id,
                    "Evicted snapshot under memory pressure"
                );
                evicted += 1;
            }
        }
        self.evicted_count.fetch_add(evicted as u64, Ordering::Relaxed);

        // Owners whose snapshots are all gone no longer need an expiry entry
        let SnapshotIndex {
            by_point,
            owner_expiry,
            ..
        } = index;
        owner_expiry.retain(|owner, expires_at| now < *expires_at || by_point.contains_key(owner));

        removed + evicted
    }

    pub fn corruption_count(&self) -> u64 {
        self.corruption_count.load(Ordering::Relaxed)
    }

    pub fn evicted_count(&self) -> u64 {
        self.evicted_count.load(Ordering::Relaxed)
    }

    /// Zero the corruption and eviction counters.
    pub fn reset_counters(&self) {
        self.corruption_count.store(0, Ordering::Relaxed);
        self.evicted_count.store(0, Ordering::Relaxed);
    }

    /// Flip the last digit in a stored payload without touching its checksum.
    #[cfg(test)]
    pub(crate) async fn corrupt_payload(&self, id: &str) {
        let mut index = self.index.write().await;
        if let Some(stored) = index.by_id.get_mut(id) {
            if let Some(pos) = stored.payload.iter().rposition(u8::is_ascii_digit) {
                stored.payload[pos] = if stored.payload[pos] == b'9' { b'0' } else { stored.payload[pos] + 1 };
            }
        }
    }
}

impl Default for SnapshotManager {
    fn default() -> Self {
        Self::new(SnapshotLimits::default())
    }
}

/// blake3 hex digest of a serialized payload.
pub fn checksum(payload: &[u8]) -> String {
    blake3::hash(payload).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn manager(max_total_bytes: u64) -> SnapshotManager {
        SnapshotManager::new(SnapshotLimits {
            max_total_bytes,
            max_point_bytes: max_total_bytes,
        })
    }

    #[tokio::test]
    async fn test_round_trip_returns_equal_payload() {
        let manager = SnapshotManager::default();
        let payload = json!({
            "path": "src/lib.rs",
            "symbols": [{"name": "main", "kind": "fn", "line": 3}],
            "hash": null,
            "weight": 0.25,
        });

        let snapshot = manager
            .create_snapshot("rp-1", SnapshotType::Entity, &payload, None)
            .await
            .unwrap();
        assert_eq!(snapshot.size_bytes, snapshot.payload.len() as u64);
        assert_eq!(snapshot.checksum, checksum(&snapshot.payload));

        let restored = manager.restore_from_snapshot(&snapshot.id).await.unwrap();
        assert_eq!(restored, payload);
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Symbol {
            name: String,
            line: u32,
        }

        let manager = SnapshotManager::default();
        let symbol = Symbol {
            name: "parse".to_string(),
            line: 42,
        };
        let snapshot = manager
            .create_snapshot("rp-1", SnapshotType::Entity, &symbol, None)
            .await
            .unwrap();

        let restored: Symbol = manager.restore_as(&snapshot.id).await.unwrap();
        assert_eq!(restored, symbol);
    }

    #[tokio::test]
    async fn test_capture_is_detached_from_source() {
        let manager = SnapshotManager::default();
        let mut live = json!({"v": 1});
        let snapshot = manager
            .create_snapshot("rp-1", SnapshotType::Entity, &live, None)
            .await
            .unwrap();

        live["v"] = json!(2);

        let restored = manager.restore_from_snapshot(&snapshot.id).await.unwrap();
        assert_eq!(restored, json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_non_string_keys_fail_serialization() {
        let manager = SnapshotManager::default();
        let mut data = BTreeMap::new();
        data.insert(vec![1u8, 2], "edge");

        let err = manager
            .create_snapshot("rp-1", SnapshotType::Relationship, &data, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RollbackError::Serialization(_)));
        assert_eq!(manager.get_memory_usage().await.total_snapshots, 0);
    }

    #[tokio::test]
    async fn test_corrupted_payload_is_rejected() {
        let manager = SnapshotManager::default();
        let snapshot = manager
            .create_snapshot("rp-1", SnapshotType::Entity, &json!({"v": 1}), None)
            .await
            .unwrap();

        // {"v":1} -> {"v":2}: still valid JSON, so only the checksum can catch it
        manager.corrupt_payload(&snapshot.id).await;

        let err = manager
            .restore_from_snapshot(&snapshot.id)
            .await
            .unwrap_err();
        assert!(matches!(err, RollbackError::ChecksumMismatch { ref snapshot_id, .. } if snapshot_id == &snapshot.id));
        assert!(manager.verify_snapshot(&snapshot.id).await.is_err());
        assert_eq!(manager.corruption_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_snapshot_is_not_found() {
        let manager = SnapshotManager::default();
        let err = manager.restore_from_snapshot("missing").await.unwrap_err();
        assert!(matches!(err, RollbackError::NotFound { kind: "Snapshot", .. }));
        assert!(manager.get_snapshot("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_owner_hides_snapshots() {
        let manager = SnapshotManager::default();
        let snapshot = manager
            .create_snapshot("rp-1", SnapshotType::Entity, &json!({"v": 1}), None)
            .await
            .unwrap();

        manager
            .set_owner_expiry("rp-1", Some(Utc::now() - Duration::milliseconds(1)))
            .await;

        assert!(manager.get_snapshot(&snapshot.id).await.is_none());
        assert!(manager.snapshots_for_rollback_point("rp-1").await.is_empty());
        let err = manager
            .restore_from_snapshot(&snapshot.id)
            .await
            .unwrap_err();
        assert!(matches!(err, RollbackError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_per_point_limit() {
        let manager = SnapshotManager::new(SnapshotLimits {
            max_total_bytes: 1024,
            max_point_bytes: 16,
        });
        manager
            .create_snapshot("rp-1", SnapshotType::Entity, &json!({"v": 1}), None)
            .await
            .unwrap();

        let err = manager
            .create_snapshot("rp-1", SnapshotType::Entity, &json!({"v": 22}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RollbackError::CapacityExceeded { limit: 16, .. }));

        // Other owners have their own budget
        manager
            .create_snapshot("rp-2", SnapshotType::Entity, &json!({"v": 22}), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_evicts_expired_then_oldest() {
        // Every payload below serializes to 7 bytes: {"v":N}
        let manager = manager(1024);
        let mut ids = Vec::new();
        for (owner, v) in [("old", 1), ("keep", 2), ("keep", 3), ("expired", 4), ("keep", 5)] {
            let snapshot = manager
                .create_snapshot(owner, SnapshotType::Entity, &json!({"v": v}), None)
                .await
                .unwrap();
            assert_eq!(snapshot.size_bytes, 7);
            ids.push(snapshot.id);
        }
        manager
            .set_owner_expiry("expired", Some(Utc::now() - Duration::seconds(1)))
            .await;

        // Shrink the ceiling to 21 bytes: 35 total, expired one goes first (28),
        // then the oldest one (21)
        let mut shrunk = manager;
        shrunk.limits.max_total_bytes = 21;
        let removed = shrunk.cleanup().await;

        assert_eq!(removed, 2);
        assert!(shrunk.get_snapshot(&ids[0]).await.is_none());
        assert!(shrunk.get_snapshot(&ids[1]).await.is_some());
        assert!(shrunk.get_snapshot(&ids[2]).await.is_some());
        assert!(shrunk.get_snapshot(&ids[3]).await.is_none());
        assert!(shrunk.get_snapshot(&ids[4]).await.is_some());

        let usage = shrunk.get_memory_usage().await;
        assert_eq!(usage.total_size, 21);
        assert!(usage.total_size <= 21);
        assert_eq!(shrunk.evicted_count(), 1);
    }

    #[tokio::test]
    async fn test_insert_over_ceiling_evicts_older_snapshots() {
        let manager = manager(14);
        let first = manager
            .create_snapshot("a", SnapshotType::Entity, &json!({"v": 1}), None)
            .await
            .unwrap();
        let second = manager
            .create_snapshot("b", SnapshotType::Entity, &json!({"v": 2}), None)
            .await
            .unwrap();
        let third = manager
            .create_snapshot("c", SnapshotType::Entity, &json!({"v": 3}), None)
            .await
            .unwrap();

        assert!(manager.get_snapshot(&first.id).await.is_none());
        assert!(manager.get_snapshot(&second.id).await.is_some());
        assert!(manager.get_snapshot(&third.id).await.is_some());
        assert_eq!(manager.get_memory_usage().await.total_size, 14);
    }

    #[tokio::test]
    async fn test_memory_usage_by_type() {
        let manager = SnapshotManager::default();
        manager
            .create_snapshot("rp", SnapshotType::Entity, &json!({"v": 1}), None)
            .await
            .unwrap();
        manager
            .create_snapshot("rp", SnapshotType::Relationship, &json!([1, 2, 3]), None)
            .await
            .unwrap();
        manager
            .create_snapshot("rp", SnapshotType::Custom("ast".to_string()), &json!("x"), None)
            .await
            .unwrap();

        let usage = manager.get_memory_usage().await;
        assert_eq!(usage.total_snapshots, 3);
        assert_eq!(usage.total_size, 7 + 7 + 3);
        assert_eq!(usage.size_by_type["entity"], 7);
        assert_eq!(usage.size_by_type["relationship"], 7);
        assert_eq!(usage.size_by_type["custom:ast"], 3);
        assert!((usage.average_size - 17.0 / 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_delete_by_point() {
        let manager = SnapshotManager::default();
        for v in 0..3 {
            manager
                .create_snapshot("rp-1", SnapshotType::Entity, &json!({"v": v}), None)
                .await
                .unwrap();
        }
        let other = manager
            .create_snapshot("rp-2", SnapshotType::Entity, &json!({"v": 9}), None)
            .await
            .unwrap();

        assert_eq!(manager.delete_snapshots_for_rollback_point("rp-1").await, 3);
        assert_eq!(manager.delete_snapshots_for_rollback_point("rp-1").await, 0);
        assert!(manager.delete_snapshot(&other.id).await);
        assert!(!manager.delete_snapshot(&other.id).await);
        assert_eq!(manager.get_memory_usage().await.total_size, 0);
    }
}
