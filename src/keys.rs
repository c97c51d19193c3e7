//! Binary key codecs for records, index entries, operation-log entries and
//! engine-internal system keys.
//!
//! Every key starts with a one-byte kind tag followed by the big-endian
//! partition id, so partition-scoped prefix scans cover exactly one kind of
//! data inside one partition. Record keys end with a version stamp encoded
//! so that greater recency sorts first; a prefix scan over a record's key
//! therefore yields the newest version at the first position.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, StoreError};
use crate::types::{EdgeRank, EdgeType, IndexId, PartId, TagId, VertexId};

/// Kind tag for engine-internal system keys (live-partition markers).
pub const KIND_SYSTEM: u8 = 0x00;
/// Kind tag for vertex-tag record keys.
pub const KIND_VERTEX: u8 = 0x01;
/// Kind tag for edge record keys.
pub const KIND_EDGE: u8 = 0x02;
/// Kind tag for secondary-index entry keys.
pub const KIND_INDEX: u8 = 0x03;
/// Kind tag for deferred operation-log keys.
pub const KIND_OPERATION: u8 = 0x04;

const SYSTEM_PART_MARKER: u8 = 0x01;

/// Operation-log subtype for deferred index insertions.
pub const OP_MODIFY: u8 = 0x01;
/// Operation-log subtype for deferred index deletions.
pub const OP_DELETE: u8 = 0x02;

/// Total length of an encoded vertex key.
pub const VERTEX_KEY_LEN: usize = 1 + 4 + 8 + 4 + 8;
/// Total length of an encoded edge key.
pub const EDGE_KEY_LEN: usize = 1 + 4 + 8 + 4 + 8 + 8 + 8;

/// Returns a fresh version stamp for a newly written record.
///
/// Versions count down from `i64::MAX` by the current wall clock in
/// microseconds, so that when stored big-endian a newer record sorts before
/// every older version of the same key.
pub fn fresh_version() -> u64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);
    (i64::MAX - micros) as u64
}

fn order_encode_i32(v: i32) -> u32 {
    (v as u32) ^ 0x8000_0000
}

fn order_decode_i32(v: u32) -> i32 {
    (v ^ 0x8000_0000) as i32
}

fn order_encode_i64(v: i64) -> u64 {
    (v as u64) ^ (1 << 63)
}

fn order_decode_i64(v: u64) -> i64 {
    (v ^ (1 << 63)) as i64
}

/// Builds a versioned vertex-tag record key.
pub fn vertex_key(part: PartId, vid: VertexId, tag: TagId, version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(VERTEX_KEY_LEN);
    key.push(KIND_VERTEX);
    key.extend_from_slice(&part.0.to_be_bytes());
    key.extend_from_slice(&vid.0.to_be_bytes());
    key.extend_from_slice(&tag.0.to_be_bytes());
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// Prefix covering every stored version of one vertex-tag record.
pub fn vertex_prefix(part: PartId, vid: VertexId, tag: TagId) -> Vec<u8> {
    let mut key = Vec::with_capacity(VERTEX_KEY_LEN - 8);
    key.push(KIND_VERTEX);
    key.extend_from_slice(&part.0.to_be_bytes());
    key.extend_from_slice(&vid.0.to_be_bytes());
    key.extend_from_slice(&tag.0.to_be_bytes());
    key
}

/// Builds a versioned edge record key.
pub fn edge_key(
    part: PartId,
    src: VertexId,
    edge_type: EdgeType,
    rank: EdgeRank,
    dst: VertexId,
    version: u64,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(EDGE_KEY_LEN);
    key.push(KIND_EDGE);
    key.extend_from_slice(&part.0.to_be_bytes());
    key.extend_from_slice(&src.0.to_be_bytes());
    key.extend_from_slice(&order_encode_i32(edge_type.0).to_be_bytes());
    key.extend_from_slice(&order_encode_i64(rank.0).to_be_bytes());
    key.extend_from_slice(&dst.0.to_be_bytes());
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// Prefix covering every stored version of one edge record.
pub fn edge_prefix(
    part: PartId,
    src: VertexId,
    edge_type: EdgeType,
    rank: EdgeRank,
    dst: VertexId,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(EDGE_KEY_LEN - 8);
    key.push(KIND_EDGE);
    key.extend_from_slice(&part.0.to_be_bytes());
    key.extend_from_slice(&src.0.to_be_bytes());
    key.extend_from_slice(&order_encode_i32(edge_type.0).to_be_bytes());
    key.extend_from_slice(&order_encode_i64(rank.0).to_be_bytes());
    key.extend_from_slice(&dst.0.to_be_bytes());
    key
}

/// Prefix covering all keys of one kind inside one partition.
pub fn partition_prefix(kind: u8, part: PartId) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(kind);
    key.extend_from_slice(&part.0.to_be_bytes());
    key
}

/// Extracts the version stamp from a record key.
pub fn version_of(key: &[u8]) -> Result<u64> {
    if key.len() < 8 {
        return Err(StoreError::InvalidData("record key truncated".into()));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[key.len() - 8..]);
    Ok(u64::from_be_bytes(buf))
}

/// Parsed form of a vertex record key.
#[derive(Debug, Eq, PartialEq)]
pub struct VertexKey {
    /// Owning partition.
    pub part: PartId,
    /// Vertex id.
    pub vid: VertexId,
    /// Tag id.
    pub tag: TagId,
    /// Version stamp.
    pub version: u64,
}

/// Decodes a vertex record key.
pub fn parse_vertex_key(key: &[u8]) -> Result<VertexKey> {
    if key.len() != VERTEX_KEY_LEN || key[0] != KIND_VERTEX {
        return Err(StoreError::InvalidData("not a vertex key".into()));
    }
    Ok(VertexKey {
        part: PartId(be_u32(&key[1..5])),
        vid: VertexId(be_u64(&key[5..13])),
        tag: TagId(be_u32(&key[13..17])),
        version: be_u64(&key[17..25]),
    })
}

/// Parsed form of an edge record key.
#[derive(Debug, Eq, PartialEq)]
pub struct EdgeKey {
    /// Owning partition.
    pub part: PartId,
    /// Source vertex.
    pub src: VertexId,
    /// Edge type (sign encodes direction).
    pub edge_type: EdgeType,
    /// Parallel-edge rank.
    pub rank: EdgeRank,
    /// Destination vertex.
    pub dst: VertexId,
    /// Version stamp.
    pub version: u64,
}

/// Decodes an edge record key.
pub fn parse_edge_key(key: &[u8]) -> Result<EdgeKey> {
    if key.len() != EDGE_KEY_LEN || key[0] != KIND_EDGE {
        return Err(StoreError::InvalidData("not an edge key".into()));
    }
    Ok(EdgeKey {
        part: PartId(be_u32(&key[1..5])),
        src: VertexId(be_u64(&key[5..13])),
        edge_type: EdgeType(order_decode_i32(be_u32(&key[13..17]))),
        rank: EdgeRank(order_decode_i64(be_u64(&key[17..25]))),
        dst: VertexId(be_u64(&key[25..33])),
        version: be_u64(&key[33..41]),
    })
}

/// Builds a vertex index entry key. `values` must already be in the
/// order-preserving encoding produced by the index module.
pub fn vertex_index_key(part: PartId, index: IndexId, values: &[u8], vid: VertexId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9 + values.len() + 8);
    key.push(KIND_INDEX);
    key.extend_from_slice(&part.0.to_be_bytes());
    key.extend_from_slice(&index.0.to_be_bytes());
    key.extend_from_slice(values);
    key.extend_from_slice(&vid.0.to_be_bytes());
    key
}

/// Builds an edge index entry key.
pub fn edge_index_key(
    part: PartId,
    index: IndexId,
    values: &[u8],
    src: VertexId,
    rank: EdgeRank,
    dst: VertexId,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(9 + values.len() + 24);
    key.push(KIND_INDEX);
    key.extend_from_slice(&part.0.to_be_bytes());
    key.extend_from_slice(&index.0.to_be_bytes());
    key.extend_from_slice(values);
    key.extend_from_slice(&src.0.to_be_bytes());
    key.extend_from_slice(&order_encode_i64(rank.0).to_be_bytes());
    key.extend_from_slice(&dst.0.to_be_bytes());
    key
}

/// Prefix covering all entries of one index inside one partition.
pub fn index_prefix(part: PartId, index: IndexId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(KIND_INDEX);
    key.extend_from_slice(&part.0.to_be_bytes());
    key.extend_from_slice(&index.0.to_be_bytes());
    key
}

fn operation_key(part: PartId, op: u8, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(14);
    key.push(KIND_OPERATION);
    key.extend_from_slice(&part.0.to_be_bytes());
    key.push(op);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Key of a deferred index insertion produced while the index rebuilds.
pub fn modify_operation_key(part: PartId, seq: u64) -> Vec<u8> {
    operation_key(part, OP_MODIFY, seq)
}

/// Key of a deferred index deletion produced while the index rebuilds.
pub fn delete_operation_key(part: PartId, seq: u64) -> Vec<u8> {
    operation_key(part, OP_DELETE, seq)
}

/// Prefix covering every operation-log entry of one partition.
pub fn operation_prefix(part: PartId) -> Vec<u8> {
    partition_prefix(KIND_OPERATION, part)
}

/// True when the key defers an index insertion.
pub fn is_modify_op(key: &[u8]) -> bool {
    key.len() == 14 && key[0] == KIND_OPERATION && key[5] == OP_MODIFY
}

/// True when the key defers an index deletion.
pub fn is_delete_op(key: &[u8]) -> bool {
    key.len() == 14 && key[0] == KIND_OPERATION && key[5] == OP_DELETE
}

/// Marker key recording that a partition is live on this engine.
pub fn system_part_key(part: PartId) -> Vec<u8> {
    let mut key = Vec::with_capacity(6);
    key.push(KIND_SYSTEM);
    key.push(SYSTEM_PART_MARKER);
    key.extend_from_slice(&part.0.to_be_bytes());
    key
}

/// Prefix covering all live-partition markers.
pub fn system_part_prefix() -> Vec<u8> {
    vec![KIND_SYSTEM, SYSTEM_PART_MARKER]
}

/// Recovers the partition id from a live-partition marker key.
pub fn parse_system_part_key(key: &[u8]) -> Result<PartId> {
    if key.len() != 6 || key[0] != KIND_SYSTEM || key[1] != SYSTEM_PART_MARKER {
        return Err(StoreError::InvalidData("not a system part key".into()));
    }
    Ok(PartId(be_u32(&key[2..6])))
}

fn be_u32(src: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(src);
    u32::from_be_bytes(buf)
}

fn be_u64(src: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(src);
    u64::from_be_bytes(buf)
}
