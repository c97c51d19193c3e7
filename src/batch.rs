//! Write-batch model and the wire codec replication commits and replays.
//!
//! A batch is an ordered op sequence applied atomically by the engine. The
//! deferred operation-log variants are first-class ops rather than a key
//! prefix convention, so replay logic can dispatch on the variant instead
//! of sniffing key bytes.

use crate::error::{Result, StoreError};

const BATCH_MAGIC: u8 = 0xB7;
const BATCH_VERSION: u8 = 1;

const OP_PUT: u8 = 1;
const OP_REMOVE: u8 = 2;
const OP_REMOVE_RANGE: u8 = 3;
const OP_LOG_PUT: u8 = 4;
const OP_LOG_DELETE: u8 = 5;

/// One operation inside an atomic write batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    /// Store `value` under `key`.
    Put {
        /// Target key.
        key: Vec<u8>,
        /// Stored value.
        value: Vec<u8>,
    },
    /// Delete `key`.
    Remove {
        /// Target key.
        key: Vec<u8>,
    },
    /// Delete every key in `[start, end)`.
    RemoveRange {
        /// Inclusive range start.
        start: Vec<u8>,
        /// Exclusive range end.
        end: Vec<u8>,
    },
    /// Deferred index insertion: `key` is an operation-log key, `value`
    /// carries the encoded index entry to apply once a rebuild catches up.
    LogPut {
        /// Operation-log key.
        key: Vec<u8>,
        /// Encoded `{index key, index value}` payload.
        value: Vec<u8>,
    },
    /// Deferred index deletion: `key` is an operation-log key, `value` is
    /// the index key to delete once a rebuild catches up.
    LogDelete {
        /// Operation-log key.
        key: Vec<u8>,
        /// Index key to delete later.
        value: Vec<u8>,
    },
}

/// Ordered batch builder, mirroring how the update pipeline assembles one
/// commit: index removals first, index insertions second, the record last.
#[derive(Default, Debug)]
pub struct BatchHolder {
    ops: Vec<BatchOp>,
}

impl BatchHolder {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a put.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { key, value });
    }

    /// Appends a delete.
    pub fn remove(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Remove { key });
    }

    /// Appends a range delete over `[start, end)`.
    pub fn remove_range(&mut self, start: Vec<u8>, end: Vec<u8>) {
        self.ops.push(BatchOp::RemoveRange { start, end });
    }

    /// Appends a deferred index insertion.
    pub fn log_put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::LogPut { key, value });
    }

    /// Appends a deferred index deletion.
    pub fn log_delete(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::LogDelete { key, value });
    }

    /// Appends another holder's ops after this one's, preserving order.
    pub fn append(&mut self, other: BatchHolder) {
        self.ops.extend(other.ops);
    }

    /// Number of queued ops.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when nothing was queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the holder, yielding the ordered ops.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    /// Serializes the queued ops into the replication wire format.
    pub fn encode(&self) -> Vec<u8> {
        encode_batch(&self.ops)
    }
}

/// Serializes an ordered op sequence. `decode_batch` is the exact inverse.
pub fn encode_batch(ops: &[BatchOp]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + ops.len() * 16);
    out.push(BATCH_MAGIC);
    out.push(BATCH_VERSION);
    out.extend_from_slice(&(ops.len() as u32).to_be_bytes());
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                out.push(OP_PUT);
                write_blob(&mut out, key);
                write_blob(&mut out, value);
            }
            BatchOp::Remove { key } => {
                out.push(OP_REMOVE);
                write_blob(&mut out, key);
            }
            BatchOp::RemoveRange { start, end } => {
                out.push(OP_REMOVE_RANGE);
                write_blob(&mut out, start);
                write_blob(&mut out, end);
            }
            BatchOp::LogPut { key, value } => {
                out.push(OP_LOG_PUT);
                write_blob(&mut out, key);
                write_blob(&mut out, value);
            }
            BatchOp::LogDelete { key, value } => {
                out.push(OP_LOG_DELETE);
                write_blob(&mut out, key);
                write_blob(&mut out, value);
            }
        }
    }
    out
}

/// Deserializes a batch, preserving op order.
pub fn decode_batch(raw: &[u8]) -> Result<Vec<BatchOp>> {
    if raw.len() < 6 || raw[0] != BATCH_MAGIC || raw[1] != BATCH_VERSION {
        return Err(StoreError::InvalidData("bad batch header".into()));
    }
    let count = u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]) as usize;
    let mut ops = Vec::with_capacity(count);
    let mut cursor = &raw[6..];
    for _ in 0..count {
        let tag = *cursor
            .first()
            .ok_or_else(|| StoreError::InvalidData("batch entry truncated".into()))?;
        cursor = &cursor[1..];
        let op = match tag {
            OP_PUT => {
                let key = read_blob(&mut cursor)?;
                let value = read_blob(&mut cursor)?;
                BatchOp::Put { key, value }
            }
            OP_REMOVE => BatchOp::Remove {
                key: read_blob(&mut cursor)?,
            },
            OP_REMOVE_RANGE => {
                let start = read_blob(&mut cursor)?;
                let end = read_blob(&mut cursor)?;
                BatchOp::RemoveRange { start, end }
            }
            OP_LOG_PUT => {
                let key = read_blob(&mut cursor)?;
                let value = read_blob(&mut cursor)?;
                BatchOp::LogPut { key, value }
            }
            OP_LOG_DELETE => {
                let key = read_blob(&mut cursor)?;
                let value = read_blob(&mut cursor)?;
                BatchOp::LogDelete { key, value }
            }
            other => {
                return Err(StoreError::InvalidData(format!("unknown batch op {other}")));
            }
        };
        ops.push(op);
    }
    if !cursor.is_empty() {
        return Err(StoreError::InvalidData("trailing bytes after batch".into()));
    }
    Ok(ops)
}

/// Encodes the payload of a deferred index insertion.
pub fn encode_log_modify(index_key: &[u8], index_value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + index_key.len() + index_value.len());
    write_blob(&mut out, index_key);
    write_blob(&mut out, index_value);
    out
}

/// Decodes the payload of a deferred index insertion.
pub fn decode_log_modify(raw: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut cursor = raw;
    let key = read_blob(&mut cursor)?;
    let value = read_blob(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(StoreError::InvalidData(
            "trailing bytes after log payload".into(),
        ));
    }
    Ok((key, value))
}

fn write_blob(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn read_blob(cursor: &mut &[u8]) -> Result<Vec<u8>> {
    if cursor.len() < 4 {
        return Err(StoreError::InvalidData("blob length truncated".into()));
    }
    let len = u32::from_be_bytes([cursor[0], cursor[1], cursor[2], cursor[3]]) as usize;
    if cursor.len() < 4 + len {
        return Err(StoreError::InvalidData("blob payload truncated".into()));
    }
    let bytes = cursor[4..4 + len].to_vec();
    *cursor = &cursor[4 + len..];
    Ok(bytes)
}
