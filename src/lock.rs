//! Process-wide memory lock table over logical record identifiers.
//!
//! The table serializes concurrent read-modify-write cycles on the same
//! record without blocking unrelated records. Locks are advisory and
//! in-memory only: they coordinate nothing that bypasses this table (bulk
//! ingest, direct batch appends), and the table is empty after a restart.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;
use tracing::debug;

use crate::types::{EdgeRank, EdgeType, PartId, SpaceId, TagId, VertexId};

const DEFAULT_SHARDS: usize = 64;

/// Identity of one logical record being updated.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum LockKey {
    /// One vertex-tag record.
    VertexTag {
        /// Owning space.
        space: SpaceId,
        /// Owning partition.
        part: PartId,
        /// Tag id.
        tag: TagId,
        /// Vertex id.
        vid: VertexId,
    },
    /// One edge record.
    Edge {
        /// Owning space.
        space: SpaceId,
        /// Owning partition.
        part: PartId,
        /// Edge type.
        edge_type: EdgeType,
        /// Source vertex.
        src: VertexId,
        /// Parallel-edge rank.
        rank: EdgeRank,
        /// Destination vertex.
        dst: VertexId,
    },
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::VertexTag {
                space,
                part,
                tag,
                vid,
            } => write!(f, "vertex {space}/{part}/{tag}/{vid}"),
            LockKey::Edge {
                space,
                part,
                edge_type,
                src,
                rank,
                dst,
            } => write!(f, "edge {space}/{part}/{edge_type}/{src}/{}/{dst}", rank.0),
        }
    }
}

/// Sharded registry of currently locked record identifiers.
///
/// Acquisition over a key set is all-or-nothing; shard locks are taken in
/// shard order so two overlapping acquisitions cannot deadlock.
#[derive(Debug)]
pub struct MemoryLockTable {
    shards: Vec<Mutex<HashSet<LockKey>>>,
}

impl Default for MemoryLockTable {
    fn default() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }
}

impl MemoryLockTable {
    /// Table with the default shard count.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with an explicit shard count (minimum one).
    pub fn with_shards(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashSet::new())).collect(),
        }
    }

    fn shard_of(&self, key: &LockKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Acquires every key or none. On conflict the first conflicting key in
    /// caller order is returned; the caller treats this as a retryable
    /// concurrent-modification condition.
    pub fn acquire(&self, keys: Vec<LockKey>) -> std::result::Result<LockGuard<'_>, LockKey> {
        let mut shard_ids: Vec<usize> = keys.iter().map(|k| self.shard_of(k)).collect();
        shard_ids.sort_unstable();
        shard_ids.dedup();

        let mut guards: Vec<_> = shard_ids
            .iter()
            .map(|&idx| (idx, self.shards[idx].lock()))
            .collect();

        for key in &keys {
            let shard = self.shard_of(key);
            let held = guards
                .iter()
                .find(|(idx, _)| *idx == shard)
                .map(|(_, g)| g.contains(key))
                .unwrap_or(false);
            if held {
                debug!(key = %key, "memory lock conflict");
                return Err(key.clone());
            }
        }

        for key in &keys {
            let shard = self.shard_of(key);
            if let Some((_, guard)) = guards.iter_mut().find(|(idx, _)| *idx == shard) {
                guard.insert(key.clone());
            }
        }

        Ok(LockGuard {
            table: self,
            keys: Some(keys),
        })
    }

    /// True when the key is currently held. Test and diagnostics hook.
    pub fn is_locked(&self, key: &LockKey) -> bool {
        self.shards[self.shard_of(key)].lock().contains(key)
    }

    fn release(&self, keys: &[LockKey]) {
        for key in keys {
            self.shards[self.shard_of(key)].lock().remove(key);
        }
    }
}

/// RAII guard over one acquisition. Release happens on drop and is
/// idempotent; `release` can be called early.
#[derive(Debug)]
pub struct LockGuard<'t> {
    table: &'t MemoryLockTable,
    keys: Option<Vec<LockKey>>,
}

impl LockGuard<'_> {
    /// Releases the held keys now instead of at end of scope.
    pub fn release(&mut self) {
        if let Some(keys) = self.keys.take() {
            self.table.release(&keys);
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
