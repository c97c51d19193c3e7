//! Contracts supplied by the external metadata service: schema field lists
//! with defaults and nullability, and an in-process registry snapshot the
//! update pipeline reads from.
//!
//! Schemas are immutable once registered; executors take an `Arc<Schema>`
//! snapshot and never observe mid-request changes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::row::Value;
use crate::types::{EdgeType, TagId};

/// Declared type of one schema field.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PropType {
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// 64-bit float.
    Float,
    /// UTF-8 string.
    Str,
    /// Raw bytes.
    Bytes,
    /// Microseconds since the epoch.
    Timestamp,
}

/// One field of a tag or edge schema.
#[derive(Clone, Debug)]
pub struct FieldDef {
    /// Field name, unique within the schema.
    pub name: String,
    /// Declared type.
    pub prop_type: PropType,
    /// Whether null is a legal stored value.
    pub nullable: bool,
    /// Declared default, used when a row or request omits the field.
    pub default: Option<Value>,
}

impl FieldDef {
    /// New non-nullable field with no default.
    pub fn new(name: impl Into<String>, prop_type: PropType) -> Self {
        Self {
            name: name.into(),
            prop_type,
            nullable: false,
            default: None,
        }
    }

    /// Marks the field nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Attaches a declared default value.
    pub fn default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// An immutable schema snapshot: an ordered field list with name lookup.
#[derive(Debug)]
pub struct Schema {
    fields: Vec<FieldDef>,
    by_name: HashMap<String, usize>,
}

impl Schema {
    /// Builds a schema from its declaration-ordered fields.
    pub fn new(fields: Vec<FieldDef>) -> Self {
        let by_name = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Self { fields, by_name }
    }

    /// Number of declared fields.
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Looks a field up by name, returning its position and definition.
    pub fn field(&self, name: &str) -> Option<(usize, &FieldDef)> {
        self.by_name.get(name).map(|&i| (i, &self.fields[i]))
    }

    /// The field at a declaration position. Panics on out-of-range input;
    /// positions come from this schema's own lookups.
    pub fn field_at(&self, idx: usize) -> &FieldDef {
        &self.fields[idx]
    }

    /// Declaration-ordered iteration over the fields.
    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter()
    }
}

/// Process-local snapshot of the metadata service's schema catalog.
///
/// The real catalog lives in the external meta service; this registry holds
/// the per-process read copy the storage paths consult.
#[derive(Default)]
pub struct SchemaRegistry {
    tags: RwLock<HashMap<TagId, Arc<Schema>>>,
    edges: RwLock<HashMap<i32, Arc<Schema>>>,
}

impl SchemaRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the schema of a vertex tag.
    pub fn register_tag(&self, tag: TagId, schema: Schema) {
        self.tags.write().insert(tag, Arc::new(schema));
    }

    /// Registers (or replaces) the schema of an edge type. Both directions
    /// of an edge type share one schema.
    pub fn register_edge(&self, edge_type: EdgeType, schema: Schema) {
        self.edges.write().insert(edge_type.0.abs(), Arc::new(schema));
    }

    /// Schema snapshot for a vertex tag.
    pub fn tag(&self, tag: TagId) -> Option<Arc<Schema>> {
        self.tags.read().get(&tag).cloned()
    }

    /// Schema snapshot for an edge type, ignoring direction.
    pub fn edge(&self, edge_type: EdgeType) -> Option<Arc<Schema>> {
        self.edges.read().get(&edge_type.0.abs()).cloned()
    }
}
