//! Interface to the live knowledge graph.
//!
//! The rollback subsystem reads entity state and fingerprints through
//! [`GraphStateAccess`] during capture and validation, and writes restored
//! payloads back through it.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::types::{EntityId, Fingerprint};

/// Current state of a live graph entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityState {
    pub data: serde_json::Value,
    pub fingerprint: Fingerprint,
}

/// Graph read/write operations required by the rollback subsystem.
///
/// Errors are treated as the graph store being unavailable.
#[async_trait]
pub trait GraphStateAccess: Send + Sync {
    /// Current data and fingerprint of an entity, `None` if it does not exist.
    async fn get_entity_state(&self, id: &str) -> Result<Option<EntityState>>;

    /// Replace the data of an entity, creating it if needed.
    async fn write_entity_state(&self, id: &str, data: &serde_json::Value) -> Result<()>;

    /// Delete an entity. Deleting an unknown entity is not an error.
    async fn remove_entity_state(&self, id: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct GraphState {
    entities: HashMap<EntityId, EntityState>,
    /// Last fingerprint handed out, shared by all entities
    version: u64,
}

/// In-process graph keyed by entity id.
///
/// Fingerprints come from one graph-wide counter, so a deleted and recreated
/// entity never repeats a fingerprint it had before.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    state: RwLock<GraphState>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current data of an entity.
    pub async fn get(&self, id: &str) -> Option<serde_json::Value> {
        self.state.read().await.entities.get(id).map(|e| e.data.clone())
    }

    /// Write an entity and return its new fingerprint.
    pub async fn put(&self, id: &str, data: serde_json::Value) -> Fingerprint {
        let mut state = self.state.write().await;
        state.version += 1;
        let fingerprint = Fingerprint(state.version);
        state
            .entities
            .insert(id.to_string(), EntityState { data, fingerprint });
        fingerprint
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.state.write().await.entities.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entities.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entities.is_empty()
    }
}

#[async_trait]
impl GraphStateAccess for MemoryGraph {
    async fn get_entity_state(&self, id: &str) -> Result<Option<EntityState>> {
        Ok(self.state.read().await.entities.get(id).cloned())
    }

    async fn write_entity_state(&self, id: &str, data: &serde_json::Value) -> Result<()> {
        self.put(id, data.clone()).await;
        Ok(())
    }

    async fn remove_entity_state(&self, id: &str) -> Result<()> {
        self.remove(id).await;
        Ok(())
    }
}
