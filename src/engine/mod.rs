//! Storage engine abstraction: an ordered key-value store per graph space.
//!
//! One engine instance backs every partition physically co-located on one
//! data path. The engine is partition-agnostic for raw byte reads and
//! writes; partition routing and leadership live in the directory layer.

use std::path::{Path, PathBuf};

use crate::batch::BatchOp;
use crate::error::Result;
use crate::types::{PartId, SpaceId};

mod rocks;

pub use rocks::RocksEngine;

/// Predicate over a key, used to restrict `backup_table` exports.
pub type KeyFilter<'a> = &'a dyn Fn(&[u8]) -> bool;

/// Forward iterator over an ordered key range.
///
/// Iterators are point-in-time: writes committed after the iterator is
/// created are not observed.
pub trait KvIter {
    /// True while the iterator is positioned on an entry.
    fn valid(&self) -> bool;
    /// Advances to the next entry.
    fn next(&mut self);
    /// Current key. Empty when not valid.
    fn key(&self) -> &[u8];
    /// Current value. Empty when not valid.
    fn val(&self) -> &[u8];
}

/// Ordered key-value store capability interface.
///
/// All multi-key reads report status per element; a missing key never fails
/// the whole call. All writes funnel into atomic batches: a crash never
/// observes part of one committed batch.
pub trait KvEngine: Send + Sync {
    /// The graph space this engine stores.
    fn space(&self) -> SpaceId;

    /// Root directory of the persisted data.
    fn data_root(&self) -> &Path;

    /// Reads a single key.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Reads several keys; each element carries its own result.
    fn multi_get(&self, keys: &[Vec<u8>]) -> Vec<Result<Vec<u8>>>;

    /// Iterates `[start, end)`.
    fn range(&self, start: &[u8], end: &[u8]) -> Result<Box<dyn KvIter + '_>>;

    /// Iterates every key with the given prefix.
    fn prefix(&self, prefix: &[u8]) -> Result<Box<dyn KvIter + '_>>;

    /// Iterates keys with the given prefix, starting at `start`. Used to
    /// resume paginated scans.
    fn range_with_prefix(&self, start: &[u8], prefix: &[u8]) -> Result<Box<dyn KvIter + '_>>;

    /// Writes a single record.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Writes a batch of records atomically.
    fn multi_put(&self, kvs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()>;

    /// Removes a single key.
    fn remove(&self, key: &[u8]) -> Result<()>;

    /// Removes a batch of keys atomically.
    fn multi_remove(&self, keys: Vec<Vec<u8>>) -> Result<()>;

    /// Removes every key in `[start, end)`.
    fn remove_range(&self, start: &[u8], end: &[u8]) -> Result<()>;

    /// Commits an ordered op sequence atomically. `disable_wal` trades
    /// crash durability for throughput: a crash may lose the batch even
    /// after a successful return. `sync` forces the WAL to disk before
    /// returning.
    fn commit_batch(&self, ops: Vec<BatchOp>, disable_wal: bool, sync: bool) -> Result<()>;

    /// Bulk-loads pre-sorted external files, bypassing the write path.
    ///
    /// `verify_checksum` is advisory with the current backend: it verifies
    /// block checksums whenever it reads ingested files and exposes no
    /// per-ingest toggle, so the flag is recorded in the logs only.
    fn ingest(&self, files: &[PathBuf], verify_checksum: bool) -> Result<()>;

    /// Produces a named consistent point-in-time checkpoint, returning its
    /// directory.
    fn create_checkpoint(&self, name: &str) -> Result<PathBuf>;

    /// Exports all keys under `prefix` (optionally filtered) into a new
    /// ingestible file under `path`, returning the file's path.
    fn backup_table(
        &self,
        path: &Path,
        prefix: &[u8],
        filter: Option<KeyFilter<'_>>,
    ) -> Result<PathBuf>;

    /// Requests a full compaction.
    fn compact(&self) -> Result<()>;

    /// Flushes memtables to disk.
    fn flush(&self) -> Result<()>;

    /// Sets a mutable table option. Unknown keys and malformed values fail
    /// with distinct `InvalidParameter` reasons.
    fn set_option(&self, key: &str, value: &str) -> Result<()>;

    /// Sets a mutable database option, with the same validation split.
    fn set_db_option(&self, key: &str, value: &str) -> Result<()>;

    /// Marks a partition live on this engine.
    fn add_part(&self, part: PartId) -> Result<()>;

    /// Removes a partition from the live set. Persisted bytes outside the
    /// live set are untouched.
    fn remove_part(&self, part: PartId) -> Result<()>;

    /// All partitions currently live on this engine.
    fn all_parts(&self) -> Result<Vec<PartId>>;

    /// Number of live partitions.
    fn total_parts_num(&self) -> Result<usize>;
}

/// Smallest key strictly greater than every key with the given prefix, or
/// `None` when the prefix is all `0xff` and no such bound exists.
pub(crate) fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(bound);
        }
        bound.pop();
    }
    None
}

/// Tuning options supplied when opening an engine.
///
/// Modelled as a builder over documented fields; every knob maps onto the
/// backing store's corresponding option.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Create the database when the path holds none.
    pub create_if_missing: bool,
    /// Maximum open SST files; -1 means unlimited.
    pub max_open_files: i32,
    /// Memtable size in bytes before flush.
    pub write_buffer_size: usize,
    /// Disable automatic background compactions.
    pub disable_auto_compactions: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            max_open_files: -1,
            write_buffer_size: 64 * 1024 * 1024,
            disable_auto_compactions: false,
        }
    }
}

impl EngineOptions {
    /// Defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of open SST files.
    pub fn max_open_files(mut self, n: i32) -> Self {
        self.max_open_files = n;
        self
    }

    /// Sets the memtable size.
    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    /// Disables automatic compactions.
    pub fn disable_auto_compactions(mut self, disabled: bool) -> Self {
        self.disable_auto_compactions = disabled;
        self
    }
}
