//! Secondary-index definitions, the per-partition index state registry,
//! and the order-preserving encoding of indexed values.
//!
//! State transitions are driven by the external index-build job; the core
//! only reads the state to route each index mutation: applied directly
//! (NORMAL), deferred to the operation log (REBUILDING), or rejected
//! (LOCKED).

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::info;

use crate::error::{Result, StoreError};
use crate::row::Value;
use crate::schema::{PropType, Schema};
use crate::types::{EdgeType, IndexId, PartId, SpaceId, TagId};

/// Fixed width of an encoded string or bytes index column.
pub const INDEX_STR_LEN: usize = 16;

/// Consistency state of one index on one partition.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum IndexState {
    /// Mutations apply directly.
    #[default]
    Normal,
    /// A rebuild scan is in flight; mutations defer to the operation log.
    Rebuilding,
    /// Protective state; index mutations are rejected outright.
    Locked,
}

/// Schema a secondary index belongs to.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum IndexTarget {
    /// Index over a vertex tag.
    Tag(TagId),
    /// Index over an edge type.
    Edge(EdgeType),
}

/// Definition of one secondary index, supplied by the metadata service.
#[derive(Clone, Debug)]
pub struct IndexDef {
    /// Index identifier.
    pub index_id: IndexId,
    /// Owning tag or edge type.
    pub target: IndexTarget,
    /// Indexed field names, in index column order.
    pub fields: Vec<String>,
}

/// Read-mostly registry of per (space, partition, index) states.
///
/// Unlisted combinations are NORMAL.
#[derive(Default)]
pub struct IndexStateRegistry {
    states: RwLock<HashMap<(SpaceId, PartId, IndexId), IndexState>>,
}

impl IndexStateRegistry {
    /// Empty registry; everything reads as NORMAL.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state for one index on one partition.
    pub fn state(&self, space: SpaceId, part: PartId, index: IndexId) -> IndexState {
        self.states
            .read()
            .get(&(space, part, index))
            .copied()
            .unwrap_or_default()
    }

    /// Sets the state. Called by the external rebuild job.
    pub fn set_state(&self, space: SpaceId, part: PartId, index: IndexId, state: IndexState) {
        info!(space = space.0, part = part.0, index = index.0, ?state, "index state changed");
        if state == IndexState::Normal {
            self.states.write().remove(&(space, part, index));
        } else {
            self.states.write().insert((space, part, index), state);
        }
    }
}

/// Encodes the indexed columns of one record into the order-preserving
/// byte form embedded in index entry keys.
///
/// Every column is a presence byte followed by a fixed-width payload, so a
/// null column still occupies its slot and keys stay comparable
/// column-by-column.
pub fn collect_index_values(
    schema: &Schema,
    fields: &[String],
    props: &HashMap<String, Value>,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(fields.len() * (1 + INDEX_STR_LEN));
    for name in fields {
        let (_, field) = schema
            .field(name)
            .ok_or_else(|| StoreError::InvalidData(format!("indexed field {name} not in schema")))?;
        let value = props
            .get(name)
            .ok_or_else(|| StoreError::InvalidData(format!("indexed field {name} missing")))?;
        encode_index_value(field.prop_type, value, &mut out)?;
    }
    Ok(out)
}

fn encode_index_value(ty: PropType, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    if value.is_null() {
        out.push(0);
        out.extend(std::iter::repeat(0u8).take(payload_width(ty)));
        return Ok(());
    }
    if !value.matches(ty) {
        return Err(StoreError::InvalidData(
            "indexed value does not match field type".into(),
        ));
    }
    out.push(1);
    match value {
        Value::Bool(b) => out.push(u8::from(*b)),
        Value::Int(v) | Value::Timestamp(v) => {
            out.extend_from_slice(&order_encode_i64(*v).to_be_bytes());
        }
        Value::Float(v) => out.extend_from_slice(&order_encode_f64(*v).to_be_bytes()),
        Value::Str(s) => push_fixed(out, s.as_bytes()),
        Value::Bytes(b) => push_fixed(out, b),
        Value::Null => unreachable!("null handled above"),
    }
    Ok(())
}

fn payload_width(ty: PropType) -> usize {
    match ty {
        PropType::Bool => 1,
        PropType::Int | PropType::Float | PropType::Timestamp => 8,
        PropType::Str | PropType::Bytes => INDEX_STR_LEN,
    }
}

// Strings and byte columns are truncated or zero-padded to a fixed width,
// trading tail precision for comparable fixed-layout keys.
fn push_fixed(out: &mut Vec<u8>, bytes: &[u8]) {
    let take = bytes.len().min(INDEX_STR_LEN);
    out.extend_from_slice(&bytes[..take]);
    out.extend(std::iter::repeat(0u8).take(INDEX_STR_LEN - take));
}

fn order_encode_i64(v: i64) -> u64 {
    (v as u64) ^ (1 << 63)
}

// Total order over doubles: flip the sign bit for positives, all bits for
// negatives.
fn order_encode_f64(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits & (1 << 63) == 0 {
        bits ^ (1 << 63)
    } else {
        !bits
    }
}
