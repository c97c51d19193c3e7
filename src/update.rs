//! Atomic read-modify-write pipeline for vertex and edge properties.
//!
//! An update runs as one closure through the replication layer's atomic-op
//! path, under the record's memory lock: read the latest version, evaluate
//! the optional condition and the property expressions, route index
//! mutations by index state, and emit one batch. The batch orders index
//! removals first, index insertions second, and the record write last, so
//! a reader racing the commit may see a transiently missing index entry
//! but never a dangling one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::batch::{encode_log_modify, BatchHolder};
use crate::engine::KvEngine;
use crate::error::{Result, StoreError};
use crate::expr::{Expr, UpdateContext};
use crate::index::{collect_index_values, IndexDef, IndexState, IndexStateRegistry, IndexTarget};
use crate::keys;
use crate::lock::{LockKey, MemoryLockTable};
use crate::part::{AtomicOpResult, PartDirectory, Replication};
use crate::row::{RowReader, RowWriter, Value};
use crate::schema::{Schema, SchemaRegistry};
use crate::types::{EdgeRank, EdgeType, PartId, SpaceId, TagId, VertexId};

// Monotonic sequence for operation-log keys written by updates.
static OP_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_op_seq() -> u64 {
    OP_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// One property assignment: the field name and its encoded expression.
#[derive(Clone, Debug)]
pub struct UpdatedProp {
    /// Target field name.
    pub name: String,
    /// Encoded expression evaluated against the current property set.
    pub expr: Vec<u8>,
}

/// Record addressed by an update request.
#[derive(Clone, Debug)]
pub enum UpdateTarget {
    /// One vertex-tag record.
    Vertex {
        /// Owning partition.
        part: PartId,
        /// Vertex id.
        vid: VertexId,
        /// Tag id.
        tag: TagId,
    },
    /// One edge record.
    Edge {
        /// Owning partition.
        part: PartId,
        /// Source vertex.
        src: VertexId,
        /// Edge type.
        edge_type: EdgeType,
        /// Parallel-edge rank.
        rank: EdgeRank,
        /// Destination vertex.
        dst: VertexId,
    },
}

impl UpdateTarget {
    fn part(&self) -> PartId {
        match self {
            UpdateTarget::Vertex { part, .. } | UpdateTarget::Edge { part, .. } => *part,
        }
    }

    fn lock_key(&self, space: SpaceId) -> LockKey {
        match *self {
            UpdateTarget::Vertex { part, vid, tag } => LockKey::VertexTag {
                space,
                part,
                tag,
                vid,
            },
            UpdateTarget::Edge {
                part,
                src,
                edge_type,
                rank,
                dst,
            } => LockKey::Edge {
                space,
                part,
                edge_type,
                src,
                rank,
                dst,
            },
        }
    }

    fn prefix(&self) -> Vec<u8> {
        match *self {
            UpdateTarget::Vertex { part, vid, tag } => keys::vertex_prefix(part, vid, tag),
            UpdateTarget::Edge {
                part,
                src,
                edge_type,
                rank,
                dst,
            } => keys::edge_prefix(part, src, edge_type, rank, dst),
        }
    }

    fn fresh_key(&self) -> Vec<u8> {
        match *self {
            UpdateTarget::Vertex { part, vid, tag } => {
                keys::vertex_key(part, vid, tag, keys::fresh_version())
            }
            UpdateTarget::Edge {
                part,
                src,
                edge_type,
                rank,
                dst,
            } => keys::edge_key(part, src, edge_type, rank, dst, keys::fresh_version()),
        }
    }

    fn matches_index(&self, target: IndexTarget) -> bool {
        match (self, target) {
            (UpdateTarget::Vertex { tag, .. }, IndexTarget::Tag(t)) => *tag == t,
            (UpdateTarget::Edge { edge_type, .. }, IndexTarget::Edge(t)) => *edge_type == t,
            _ => false,
        }
    }
}

/// One update request against a single record.
#[derive(Clone, Debug)]
pub struct UpdateRequest {
    /// Owning space.
    pub space: SpaceId,
    /// Addressed record.
    pub target: UpdateTarget,
    /// Assignments, evaluated in declaration order.
    pub updated_props: Vec<UpdatedProp>,
    /// Insert a fresh record when the target does not exist (or fails the
    /// condition).
    pub insertable: bool,
    /// Optional encoded condition over the current properties, evaluated
    /// before any assignment.
    pub condition: Option<Vec<u8>>,
}

/// Outcome of a successful update.
#[derive(Clone, Debug)]
pub struct UpdateResponse {
    /// Schema property set after the update.
    pub props: HashMap<String, Value>,
    /// True when the insertable path created the record.
    pub inserted: bool,
}

/// Executes atomic property updates over the partition directory.
pub struct UpdateExecutor {
    locks: Arc<MemoryLockTable>,
    replication: Arc<dyn Replication>,
    directory: Arc<PartDirectory>,
    index_states: Arc<IndexStateRegistry>,
    schemas: Arc<SchemaRegistry>,
    indexes: Vec<IndexDef>,
}

impl UpdateExecutor {
    /// Executor wired to its collaborators. `indexes` is the full index
    /// definition set for the space, as supplied by the metadata service.
    pub fn new(
        locks: Arc<MemoryLockTable>,
        replication: Arc<dyn Replication>,
        directory: Arc<PartDirectory>,
        index_states: Arc<IndexStateRegistry>,
        schemas: Arc<SchemaRegistry>,
        indexes: Vec<IndexDef>,
    ) -> Self {
        Self {
            locks,
            replication,
            directory,
            index_states,
            schemas,
            indexes,
        }
    }

    /// Runs one update to completion.
    ///
    /// Fails fast with `ConcurrentModification` when another update holds
    /// the record's lock; the caller retries.
    #[instrument(skip(self, req), fields(space = req.space.0, part = req.target.part().0))]
    pub fn execute(&self, req: &UpdateRequest) -> Result<UpdateResponse> {
        self.directory.check_leader(req.space, req.target.part())?;

        let lock_key = req.target.lock_key(req.space);
        let _guard = self
            .locks
            .acquire(vec![lock_key])
            .map_err(|key| StoreError::ConcurrentModification(key.to_string()))?;

        let engine = self.directory.engine(req.space, req.target.part())?;

        // The closure runs inline inside the replication layer's atomic-op
        // section and hands the response out through this slot.
        let mut response = None;
        let (tx, rx) = mpsc::sync_channel(1);
        self.replication.async_atomic_op(
            req.space,
            req.target.part(),
            Box::new(|| match self.run_update(req, engine.as_ref()) {
                Ok((batch, resp)) => {
                    response = Some(resp);
                    AtomicOpResult::Commit(batch)
                }
                Err(e) => AtomicOpResult::Err(e),
            }),
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        );
        rx.recv().unwrap_or(Err(StoreError::Unknown))?;
        response.ok_or(StoreError::Unknown)
    }

    fn schema_for(&self, target: &UpdateTarget) -> Result<Arc<Schema>> {
        match target {
            UpdateTarget::Vertex { tag, .. } => self
                .schemas
                .tag(*tag)
                .ok_or_else(|| StoreError::InvalidData(format!("unknown tag {tag}"))),
            UpdateTarget::Edge { edge_type, .. } => self
                .schemas
                .edge(*edge_type)
                .ok_or_else(|| StoreError::InvalidData(format!("unknown edge type {edge_type}"))),
        }
    }

    // The read-evaluate-build cycle, run inside the partition's atomic-op
    // section. Returns the encoded batch and the response to surface.
    fn run_update(
        &self,
        req: &UpdateRequest,
        engine: &dyn KvEngine,
    ) -> Result<(Vec<u8>, UpdateResponse)> {
        let schema = self.schema_for(&req.target)?;

        // Latest stored version, if any; versions sort newest-first under
        // the record prefix.
        let existing = {
            let iter = engine.prefix(&req.target.prefix())?;
            if iter.valid() {
                Some((iter.key().to_vec(), iter.val().to_vec()))
            } else {
                None
            }
        };

        let mut inserted = false;
        let mut old_props: Option<HashMap<String, Value>> = None;
        let (record_key, mut ctx) = if let Some((key, value)) = existing {
            let reader = RowReader::decode(Arc::clone(&schema), &value)?;
            let mut ctx = UpdateContext::new();
            for field in schema.fields() {
                ctx.set_prop(&field.name, reader.get(&field.name)?);
            }
            push_pseudo_props(&req.target, &mut ctx);

            let passed = match &req.condition {
                Some(cond) => matches!(Expr::decode(cond)?.eval(&ctx)?, Value::Bool(true)),
                None => true,
            };
            if passed {
                old_props = Some(ctx.props().clone());
                (key, ctx)
            } else if req.insertable {
                debug!("condition not met, taking insert path");
                inserted = true;
                (req.target.fresh_key(), self.insert_context(req, &schema)?)
            } else {
                return Err(StoreError::FilterNotPassed);
            }
        } else if req.insertable {
            inserted = true;
            (req.target.fresh_key(), self.insert_context(req, &schema)?)
        } else {
            return Err(StoreError::KeyNotFound);
        };

        // Assignments observe the effect of earlier assignments.
        for prop in &req.updated_props {
            if schema.field(&prop.name).is_none() {
                return Err(StoreError::InvalidData(format!(
                    "updated field {} not in schema",
                    prop.name
                )));
            }
            let value = Expr::decode(&prop.expr)?.eval(&ctx)?;
            ctx.set_prop(&prop.name, value);
        }

        let mut writer = RowWriter::new(Arc::clone(&schema));
        for field in schema.fields() {
            if let Some(value) = ctx.prop(&field.name) {
                writer.set(&field.name, value.clone())?;
            }
        }
        let new_value = writer.finish()?;

        let mut removals = BatchHolder::new();
        let mut inserts = BatchHolder::new();
        for def in &self.indexes {
            if !req.target.matches_index(def.target) {
                continue;
            }
            let state = self
                .index_states
                .state(req.space, req.target.part(), def.index_id);
            if state == IndexState::Locked {
                return Err(StoreError::IndexLocked);
            }

            if let Some(old) = &old_props {
                let old_values = collect_index_values(&schema, &def.fields, old)?;
                let old_key = index_key(&req.target, def, &old_values);
                match state {
                    IndexState::Normal => removals.remove(old_key),
                    IndexState::Rebuilding => {
                        let op_key = keys::delete_operation_key(req.target.part(), next_op_seq());
                        removals.log_delete(op_key, old_key);
                    }
                    IndexState::Locked => {}
                }
            }

            let new_values = collect_index_values(&schema, &def.fields, ctx.props())?;
            let new_key = index_key(&req.target, def, &new_values);
            match state {
                IndexState::Normal => inserts.put(new_key, Vec::new()),
                IndexState::Rebuilding => {
                    let op_key = keys::modify_operation_key(req.target.part(), next_op_seq());
                    inserts.log_put(op_key, encode_log_modify(&new_key, &[]));
                }
                IndexState::Locked => {}
            }
        }

        let mut batch = removals;
        batch.append(inserts);
        batch.put(record_key, new_value);

        // Response carries schema properties only, not edge pseudo-props.
        let mut props = HashMap::with_capacity(schema.num_fields());
        for field in schema.fields() {
            if let Some(value) = ctx.prop(&field.name) {
                props.insert(field.name.clone(), value.clone());
            }
        }
        Ok((batch.encode(), UpdateResponse { props, inserted }))
    }

    // Initial property set for the insert path: defaults, then null for
    // nullable fields, otherwise the insert fails.
    fn insert_context(&self, req: &UpdateRequest, schema: &Schema) -> Result<UpdateContext> {
        let mut ctx = UpdateContext::new();
        for field in schema.fields() {
            let value = if let Some(default) = &field.default {
                default.clone()
            } else if field.nullable {
                Value::Null
            } else {
                return Err(StoreError::NoDefaultValueAndNotNullable {
                    field: field.name.clone(),
                });
            };
            ctx.set_prop(&field.name, value);
        }
        push_pseudo_props(&req.target, &mut ctx);
        Ok(ctx)
    }
}

// Edge endpoints are addressable from condition expressions as
// pseudo-properties.
fn push_pseudo_props(target: &UpdateTarget, ctx: &mut UpdateContext) {
    if let UpdateTarget::Edge {
        src,
        edge_type,
        rank,
        dst,
        ..
    } = *target
    {
        ctx.set_prop("_src", Value::Int(src.0 as i64));
        ctx.set_prop("_dst", Value::Int(dst.0 as i64));
        ctx.set_prop("_rank", Value::Int(rank.0));
        ctx.set_prop("_type", Value::Int(edge_type.0 as i64));
    }
}

fn index_key(target: &UpdateTarget, def: &IndexDef, values: &[u8]) -> Vec<u8> {
    match *target {
        UpdateTarget::Vertex { part, vid, .. } => {
            keys::vertex_index_key(part, def.index_id, values, vid)
        }
        UpdateTarget::Edge {
            part,
            src,
            rank,
            dst,
            ..
        } => keys::edge_index_key(part, def.index_id, values, src, rank, dst),
    }
}
