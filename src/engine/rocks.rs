//! RocksDB-backed engine implementation.

use std::path::{Path, PathBuf};

use rocksdb::checkpoint::Checkpoint;
use rocksdb::{
    DBRawIteratorWithThreadMode, IngestExternalFileOptions, Options, ReadOptions, SstFileWriter,
    WriteBatch, WriteOptions, DB,
};
use tracing::{debug, info, warn};

use crate::batch::BatchOp;
use crate::error::{Result, StoreError};
use crate::keys;
use crate::types::{PartId, SpaceId};

use super::{prefix_upper_bound, EngineOptions, KeyFilter, KvEngine, KvIter};

#[derive(Copy, Clone)]
enum OptKind {
    Bool,
    Int,
}

// Mutable options this engine accepts at runtime, split by concern:
// per-table memtable and flush tuning vs database-wide compaction limits.
// Only options the backing store's runtime setter accepts are listed;
// open-time knobs (max open files and the like) belong to EngineOptions.
const TABLE_OPTIONS: &[(&str, OptKind)] = &[
    ("disable_auto_compactions", OptKind::Bool),
    ("write_buffer_size", OptKind::Int),
    ("max_write_buffer_number", OptKind::Int),
    ("level0_file_num_compaction_trigger", OptKind::Int),
];

const DB_OPTIONS: &[(&str, OptKind)] = &[
    ("max_compaction_bytes", OptKind::Int),
    ("soft_pending_compaction_bytes_limit", OptKind::Int),
    ("hard_pending_compaction_bytes_limit", OptKind::Int),
];

fn validate_option(table: &[(&str, OptKind)], key: &str, value: &str) -> Result<()> {
    let Some((_, kind)) = table.iter().find(|(k, _)| *k == key) else {
        return Err(StoreError::InvalidParameter(format!(
            "unknown option key {key}"
        )));
    };
    let well_formed = match kind {
        OptKind::Bool => matches!(value, "true" | "false"),
        OptKind::Int => value.parse::<i64>().is_ok(),
    };
    if !well_formed {
        return Err(StoreError::InvalidParameter(format!(
            "malformed value {value:?} for option {key}"
        )));
    }
    Ok(())
}

/// Ordered key-value engine for one graph space, persisted through RocksDB.
///
/// Iterators take an implicit point-in-time snapshot at creation; writes
/// committed afterwards are not observed by an open iterator.
pub struct RocksEngine {
    space: SpaceId,
    data_root: PathBuf,
    db: DB,
}

impl RocksEngine {
    /// Opens (or creates) the engine at `path`.
    pub fn open(space: SpaceId, path: impl AsRef<Path>, opts: &EngineOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        let mut db_opts = Options::default();
        db_opts.create_if_missing(opts.create_if_missing);
        db_opts.set_max_open_files(opts.max_open_files);
        db_opts.set_write_buffer_size(opts.write_buffer_size);
        if opts.disable_auto_compactions {
            db_opts.set_disable_auto_compactions(true);
        }
        let db = DB::open(&db_opts, &path)?;
        info!(space = space.0, path = %path.display(), "opened storage engine");
        Ok(Self {
            space,
            data_root: path,
            db,
        })
    }

    fn iter_with(&self, read_opts: ReadOptions, seek_to: &[u8]) -> Box<dyn KvIter + '_> {
        let mut inner = self.db.raw_iterator_opt(read_opts);
        inner.seek(seek_to);
        Box::new(RocksIter { inner })
    }
}

struct RocksIter<'a> {
    inner: DBRawIteratorWithThreadMode<'a, DB>,
}

impl KvIter for RocksIter<'_> {
    fn valid(&self) -> bool {
        self.inner.valid()
    }

    fn next(&mut self) {
        self.inner.next();
    }

    fn key(&self) -> &[u8] {
        self.inner.key().unwrap_or(&[])
    }

    fn val(&self) -> &[u8] {
        self.inner.value().unwrap_or(&[])
    }
}

impl KvEngine for RocksEngine {
    fn space(&self) -> SpaceId {
        self.space
    }

    fn data_root(&self) -> &Path {
        &self.data_root
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        match self.db.get(key)? {
            Some(value) => Ok(value),
            None => Err(StoreError::KeyNotFound),
        }
    }

    fn multi_get(&self, keys: &[Vec<u8>]) -> Vec<Result<Vec<u8>>> {
        self.db
            .multi_get(keys)
            .into_iter()
            .map(|entry| match entry {
                Ok(Some(value)) => Ok(value),
                Ok(None) => Err(StoreError::KeyNotFound),
                Err(e) => Err(e.into()),
            })
            .collect()
    }

    fn range(&self, start: &[u8], end: &[u8]) -> Result<Box<dyn KvIter + '_>> {
        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_lower_bound(start.to_vec());
        read_opts.set_iterate_upper_bound(end.to_vec());
        Ok(self.iter_with(read_opts, start))
    }

    fn prefix(&self, prefix: &[u8]) -> Result<Box<dyn KvIter + '_>> {
        let mut read_opts = ReadOptions::default();
        if let Some(upper) = prefix_upper_bound(prefix) {
            read_opts.set_iterate_upper_bound(upper);
        }
        Ok(self.iter_with(read_opts, prefix))
    }

    fn range_with_prefix(&self, start: &[u8], prefix: &[u8]) -> Result<Box<dyn KvIter + '_>> {
        let mut read_opts = ReadOptions::default();
        if let Some(upper) = prefix_upper_bound(prefix) {
            read_opts.set_iterate_upper_bound(upper);
        }
        Ok(self.iter_with(read_opts, start))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.commit_batch(
            vec![BatchOp::Put {
                key: key.to_vec(),
                value: value.to_vec(),
            }],
            false,
            false,
        )
    }

    fn multi_put(&self, kvs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let ops = kvs
            .into_iter()
            .map(|(key, value)| BatchOp::Put { key, value })
            .collect();
        self.commit_batch(ops, false, false)
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.commit_batch(vec![BatchOp::Remove { key: key.to_vec() }], false, false)
    }

    fn multi_remove(&self, keys: Vec<Vec<u8>>) -> Result<()> {
        let ops = keys.into_iter().map(|key| BatchOp::Remove { key }).collect();
        self.commit_batch(ops, false, false)
    }

    fn remove_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
        self.commit_batch(
            vec![BatchOp::RemoveRange {
                start: start.to_vec(),
                end: end.to_vec(),
            }],
            false,
            false,
        )
    }

    fn commit_batch(&self, ops: Vec<BatchOp>, disable_wal: bool, sync: bool) -> Result<()> {
        if disable_wal && sync {
            return Err(StoreError::InvalidParameter(
                "sync commit requires the WAL".into(),
            ));
        }
        let mut wb = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put { key, value }
                | BatchOp::LogPut { key, value }
                | BatchOp::LogDelete { key, value } => wb.put(key, value),
                BatchOp::Remove { key } => wb.delete(key),
                BatchOp::RemoveRange { start, end } => wb.delete_range(start, end),
            }
        }
        let mut write_opts = WriteOptions::default();
        write_opts.disable_wal(disable_wal);
        write_opts.set_sync(sync);
        self.db.write_opt(wb, &write_opts)?;
        Ok(())
    }

    fn ingest(&self, files: &[PathBuf], verify_checksum: bool) -> Result<()> {
        debug!(
            space = self.space.0,
            files = files.len(),
            verify_checksum,
            "ingesting external files"
        );
        let mut ingest_opts = IngestExternalFileOptions::default();
        ingest_opts.set_move_files(false);
        self.db
            .ingest_external_file_opts(&ingest_opts, files.to_vec())
            .map_err(|e| {
                warn!(space = self.space.0, error = %e, "ingest failed");
                StoreError::from(e)
            })
    }

    fn create_checkpoint(&self, name: &str) -> Result<PathBuf> {
        let dir = self.data_root.join("checkpoints");
        std::fs::create_dir_all(&dir)?;
        let target = dir.join(name);
        if target.exists() {
            return Err(StoreError::InvalidParameter(format!(
                "checkpoint {name} already exists"
            )));
        }
        let cp = Checkpoint::new(&self.db)?;
        cp.create_checkpoint(&target)?;
        info!(space = self.space.0, checkpoint = name, "checkpoint created");
        Ok(target)
    }

    fn backup_table(
        &self,
        path: &Path,
        prefix: &[u8],
        filter: Option<KeyFilter<'_>>,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(path)?;
        let file = path.join(format!("{}-{}.sst", self.space.0, hex::encode(prefix)));
        let sst_opts = Options::default();
        let mut writer = SstFileWriter::create(&sst_opts);
        writer.open(&file)?;

        let mut exported = 0usize;
        let mut iter = self.prefix(prefix)?;
        while iter.valid() {
            if filter.map_or(true, |keep| keep(iter.key())) {
                writer.put(iter.key(), iter.val())?;
                exported += 1;
            }
            iter.next();
        }
        drop(iter);

        if exported == 0 {
            // the writer already created the file on open
            drop(writer);
            let _ = std::fs::remove_file(&file);
            return Err(StoreError::KeyNotFound);
        }
        writer.finish()?;
        info!(
            space = self.space.0,
            exported,
            file = %file.display(),
            "table backup written"
        );
        Ok(file)
    }

    fn compact(&self) -> Result<()> {
        self.db.compact_range(None::<&[u8]>, None::<&[u8]>);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn set_option(&self, key: &str, value: &str) -> Result<()> {
        validate_option(TABLE_OPTIONS, key, value)?;
        self.db.set_options(&[(key, value)])?;
        Ok(())
    }

    fn set_db_option(&self, key: &str, value: &str) -> Result<()> {
        validate_option(DB_OPTIONS, key, value)?;
        self.db.set_options(&[(key, value)])?;
        Ok(())
    }

    fn add_part(&self, part: PartId) -> Result<()> {
        self.put(&keys::system_part_key(part), &[])
    }

    fn remove_part(&self, part: PartId) -> Result<()> {
        self.remove(&keys::system_part_key(part))
    }

    fn all_parts(&self) -> Result<Vec<PartId>> {
        let mut parts = Vec::new();
        let mut iter = self.prefix(&keys::system_part_prefix())?;
        while iter.valid() {
            parts.push(keys::parse_system_part_key(iter.key())?);
            iter.next();
        }
        Ok(parts)
    }

    fn total_parts_num(&self) -> Result<usize> {
        Ok(self.all_parts()?.len())
    }
}
