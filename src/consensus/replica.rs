//! Read-only view of a replica's log.
//!
//! The replication layer implements [`ReplicaLogView`]; the governance layer
//! only ever asks a replica for the hash it holds at an index.

use crate::core::{Error, Hash256, ReplicaId, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// A replica's locally observed log.
#[async_trait]
pub trait ReplicaLogView: Send + Sync {
    /// Replica identity.
    fn replica_id(&self) -> &ReplicaId;

    /// Content hash at `index`, `None` when the replica has no entry there.
    async fn hash_at(&self, index: u64) -> Result<Option<Hash256>>;
}

/// Replica log held in memory. Can be slowed down or taken offline.
pub struct MemoryReplica {
    id: ReplicaId,
    hashes: RwLock<HashMap<u64, Hash256>>,
    delay: Option<Duration>,
    offline: bool,
}

impl MemoryReplica {
    pub fn new(id: &str) -> Self {
        Self {
            id: ReplicaId::new(id),
            hashes: RwLock::new(HashMap::new()),
            delay: None,
            offline: false,
        }
    }

    /// Respond only after `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every query.
    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    /// Record the hash held at `index`.
    pub fn with_entry(self, index: u64, hash: Hash256) -> Self {
        self.set(index, hash);
        self
    }

    pub fn set(&self, index: u64, hash: Hash256) {
        self.hashes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, hash);
    }
}

#[async_trait]
impl ReplicaLogView for MemoryReplica {
    fn replica_id(&self) -> &ReplicaId {
        &self.id
    }

    async fn hash_at(&self, index: u64) -> Result<Option<Hash256>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.offline {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("replica {} unreachable", self.id),
            )));
        }
        Ok(self
            .hashes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&index)
            .cloned())
    }
}
