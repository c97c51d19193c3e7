//! Partition directory and the replication collaborator contract.
//!
//! The directory answers which engine backs a partition and who leads it;
//! every mutating path checks leadership here and rejects non-leader
//! writes with `LeaderChanged`. The raft-style log
//! itself is an external collaborator behind the [`Replication`] trait;
//! this crate ships a single-replica in-process implementation that applies
//! batches directly while preserving the contract (per-partition append
//! serialization, exactly-once completion callbacks).

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::batch::{decode_batch, BatchOp};
use crate::engine::KvEngine;
use crate::error::{Result, StoreError};
use crate::types::{HostAddr, PartId, SpaceId};

/// Replication role of one partition replica.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Role {
    /// Accepts writes.
    Leader,
    /// Serves opt-in stale reads only.
    Follower,
}

/// Completion callback; invoked exactly once per submitted operation.
pub type DoneCallback<'a> = Box<dyn FnOnce(Result<()>) + Send + 'a>;

/// Outcome of one atomic read-modify-write closure.
///
/// `Abort` (deliberate no-op) and `Err` (failure) are distinct variants;
/// neither writes anything.
pub enum AtomicOpResult {
    /// Commit this encoded batch through the replication path.
    Commit(Vec<u8>),
    /// Abort without writing.
    Abort,
    /// Fail without writing, surfacing this error.
    Err(StoreError),
}

/// One read-modify-write closure run under the partition's append lock.
pub type AtomicOp<'a> = Box<dyn FnOnce() -> AtomicOpResult + Send + 'a>;

/// Contract the core exposes to the replication collaborator.
///
/// Operations submitted to one partition are applied in submission order;
/// there is no cross-partition ordering. Every callback fires exactly once.
pub trait Replication: Send + Sync {
    /// Appends a put set to the partition's log.
    fn async_multi_put(
        &self,
        space: SpaceId,
        part: PartId,
        kvs: Vec<(Vec<u8>, Vec<u8>)>,
        done: DoneCallback<'_>,
    );

    /// Appends a removal set.
    fn async_multi_remove(
        &self,
        space: SpaceId,
        part: PartId,
        keys: Vec<Vec<u8>>,
        done: DoneCallback<'_>,
    );

    /// Appends a range removal over `[start, end)`.
    fn async_remove_range(
        &self,
        space: SpaceId,
        part: PartId,
        start: Vec<u8>,
        end: Vec<u8>,
        done: DoneCallback<'_>,
    );

    /// Appends a pre-encoded atomic batch.
    fn async_append_batch(
        &self,
        space: SpaceId,
        part: PartId,
        batch: Vec<u8>,
        done: DoneCallback<'_>,
    );

    /// Runs `op` with exclusive access to one read-modify-write cycle; a
    /// returned batch commits through the same log path as any other
    /// write, preserving ordering against concurrent non-atomic writes.
    fn async_atomic_op<'a>(
        &'a self,
        space: SpaceId,
        part: PartId,
        op: AtomicOp<'a>,
        done: DoneCallback<'a>,
    );

    /// Current leader of the partition.
    fn part_leader(&self, space: SpaceId, part: PartId) -> Result<HostAddr>;
}

struct PartState {
    engine: Arc<dyn KvEngine>,
    role: Role,
    leader: Option<HostAddr>,
}

/// Maps (space, partition) to its backing engine and replication role.
#[derive(Default)]
pub struct PartDirectory {
    parts: RwLock<HashMap<(SpaceId, PartId), PartState>>,
}

impl PartDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a partition with its engine, role, and known leader. Also
    /// marks the partition live on the engine.
    pub fn add_part(
        &self,
        space: SpaceId,
        part: PartId,
        engine: Arc<dyn KvEngine>,
        role: Role,
        leader: Option<HostAddr>,
    ) -> Result<()> {
        engine.add_part(part)?;
        self.parts
            .write()
            .insert((space, part), PartState { engine, role, leader });
        Ok(())
    }

    /// Removes a partition from the directory and the engine's live set.
    pub fn remove_part(&self, space: SpaceId, part: PartId) -> Result<()> {
        if let Some(state) = self.parts.write().remove(&(space, part)) {
            state.engine.remove_part(part)?;
        }
        Ok(())
    }

    /// Updates the role (and known leader) of one partition.
    pub fn set_role(&self, space: SpaceId, part: PartId, role: Role, leader: Option<HostAddr>) {
        if let Some(state) = self.parts.write().get_mut(&(space, part)) {
            state.role = role;
            state.leader = leader;
        }
    }

    /// The engine backing a partition, regardless of role.
    pub fn engine(&self, space: SpaceId, part: PartId) -> Result<Arc<dyn KvEngine>> {
        self.parts
            .read()
            .get(&(space, part))
            .map(|s| Arc::clone(&s.engine))
            .ok_or(StoreError::PartNotFound { space, part })
    }

    /// True when this process leads the partition.
    pub fn is_leader(&self, space: SpaceId, part: PartId) -> bool {
        self.parts
            .read()
            .get(&(space, part))
            .map(|s| s.role == Role::Leader)
            .unwrap_or(false)
    }

    /// Fails with `LeaderChanged` (naming the leader when known) unless
    /// this process leads the partition.
    pub fn check_leader(&self, space: SpaceId, part: PartId) -> Result<()> {
        let parts = self.parts.read();
        let state = parts
            .get(&(space, part))
            .ok_or(StoreError::PartNotFound { space, part })?;
        if state.role == Role::Leader {
            Ok(())
        } else {
            debug!(space = space.0, part = part.0, "write rejected on non-leader replica");
            Err(StoreError::LeaderChanged {
                leader: state.leader.clone(),
            })
        }
    }

    /// Resolves the engine for a read. Followers serve reads only when the
    /// caller explicitly opts in to staleness.
    pub fn read_engine(
        &self,
        space: SpaceId,
        part: PartId,
        follower_read: bool,
    ) -> Result<Arc<dyn KvEngine>> {
        if !follower_read {
            self.check_leader(space, part)?;
        }
        self.engine(space, part)
    }

    /// Current leader address for a partition.
    pub fn part_leader(&self, space: SpaceId, part: PartId) -> Result<HostAddr> {
        let parts = self.parts.read();
        let state = parts
            .get(&(space, part))
            .ok_or(StoreError::PartNotFound { space, part })?;
        state.leader.clone().ok_or(StoreError::Unknown)
    }
}

/// Single-replica [`Replication`] implementation.
///
/// Applies committed batches straight to the partition's engine while
/// honoring the contract: leadership is checked first, appends to one
/// partition are serialized by a per-partition lock, and the callback
/// fires exactly once.
pub struct LocalReplication {
    directory: Arc<PartDirectory>,
    appenders: Mutex<HashMap<(SpaceId, PartId), Arc<Mutex<()>>>>,
}

impl LocalReplication {
    /// Replication layer over the given directory.
    pub fn new(directory: Arc<PartDirectory>) -> Self {
        Self {
            directory,
            appenders: Mutex::new(HashMap::new()),
        }
    }

    fn appender(&self, space: SpaceId, part: PartId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.appenders
                .lock()
                .entry((space, part))
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn apply(&self, space: SpaceId, part: PartId, ops: Vec<BatchOp>) -> Result<()> {
        let appender = self.appender(space, part);
        let _serialized = appender.lock();
        self.directory.check_leader(space, part)?;
        let engine = self.directory.engine(space, part)?;
        engine.commit_batch(ops, false, false)
    }
}

impl Replication for LocalReplication {
    fn async_multi_put(
        &self,
        space: SpaceId,
        part: PartId,
        kvs: Vec<(Vec<u8>, Vec<u8>)>,
        done: DoneCallback<'_>,
    ) {
        let ops = kvs
            .into_iter()
            .map(|(key, value)| BatchOp::Put { key, value })
            .collect();
        done(self.apply(space, part, ops));
    }

    fn async_multi_remove(
        &self,
        space: SpaceId,
        part: PartId,
        keys: Vec<Vec<u8>>,
        done: DoneCallback<'_>,
    ) {
        let ops = keys.into_iter().map(|key| BatchOp::Remove { key }).collect();
        done(self.apply(space, part, ops));
    }

    fn async_remove_range(
        &self,
        space: SpaceId,
        part: PartId,
        start: Vec<u8>,
        end: Vec<u8>,
        done: DoneCallback<'_>,
    ) {
        done(self.apply(space, part, vec![BatchOp::RemoveRange { start, end }]));
    }

    fn async_append_batch(
        &self,
        space: SpaceId,
        part: PartId,
        batch: Vec<u8>,
        done: DoneCallback<'_>,
    ) {
        let result = decode_batch(&batch).and_then(|ops| self.apply(space, part, ops));
        done(result);
    }

    fn async_atomic_op<'a>(
        &'a self,
        space: SpaceId,
        part: PartId,
        op: AtomicOp<'a>,
        done: DoneCallback<'a>,
    ) {
        let appender = self.appender(space, part);
        let _serialized = appender.lock();
        if let Err(e) = self.directory.check_leader(space, part) {
            return done(Err(e));
        }
        match op() {
            AtomicOpResult::Commit(batch) => {
                let result = decode_batch(&batch).and_then(|ops| {
                    let engine = self.directory.engine(space, part)?;
                    engine.commit_batch(ops, false, false)
                });
                if let Err(e) = &result {
                    warn!(space = space.0, part = part.0, error = %e, "atomic batch commit failed");
                }
                done(result);
            }
            AtomicOpResult::Abort => done(Err(StoreError::AtomicOpFailed)),
            AtomicOpResult::Err(e) => done(Err(e)),
        }
    }

    fn part_leader(&self, space: SpaceId, part: PartId) -> Result<HostAddr> {
        self.directory.part_leader(space, part)
    }
}

// Synchronous wrappers: each parks on a one-shot channel completed by the
// callback, never busy-waiting. A dropped completion surfaces as Unknown.

fn park(rx: mpsc::Receiver<Result<()>>) -> Result<()> {
    rx.recv().unwrap_or(Err(StoreError::Unknown))
}

/// Blocking multi-put through the replication path.
pub fn sync_multi_put(
    repl: &dyn Replication,
    space: SpaceId,
    part: PartId,
    kvs: Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<()> {
    let (tx, rx) = mpsc::sync_channel(1);
    repl.async_multi_put(space, part, kvs, Box::new(move |res| {
        let _ = tx.send(res);
    }));
    park(rx)
}

/// Blocking multi-remove through the replication path.
pub fn sync_multi_remove(
    repl: &dyn Replication,
    space: SpaceId,
    part: PartId,
    keys: Vec<Vec<u8>>,
) -> Result<()> {
    let (tx, rx) = mpsc::sync_channel(1);
    repl.async_multi_remove(space, part, keys, Box::new(move |res| {
        let _ = tx.send(res);
    }));
    park(rx)
}

/// Blocking range removal through the replication path.
pub fn sync_remove_range(
    repl: &dyn Replication,
    space: SpaceId,
    part: PartId,
    start: Vec<u8>,
    end: Vec<u8>,
) -> Result<()> {
    let (tx, rx) = mpsc::sync_channel(1);
    repl.async_remove_range(space, part, start, end, Box::new(move |res| {
        let _ = tx.send(res);
    }));
    park(rx)
}

/// Blocking batch append through the replication path.
pub fn sync_append_batch(
    repl: &dyn Replication,
    space: SpaceId,
    part: PartId,
    batch: Vec<u8>,
) -> Result<()> {
    let (tx, rx) = mpsc::sync_channel(1);
    repl.async_append_batch(space, part, batch, Box::new(move |res| {
        let _ = tx.send(res);
    }));
    park(rx)
}
