//! Storage core of a partitioned, replicated graph store.
//!
//! The crate layers an ordered key-value engine ([`engine::KvEngine`],
//! backed by RocksDB) under a partition directory that routes reads and
//! writes by leadership, a replication contract ([`part::Replication`])
//! that applies atomic batches in submission order, and an update executor
//! ([`update::UpdateExecutor`]) that runs read-modify-write cycles on
//! vertex and edge records while keeping secondary indexes consistent
//! through their NORMAL, REBUILDING and LOCKED states.

#![warn(missing_docs)]

pub mod batch;
pub mod engine;
pub mod error;
pub mod expr;
pub mod index;
pub mod keys;
pub mod lock;
pub mod part;
pub mod row;
pub mod schema;
pub mod types;
pub mod update;

pub use batch::{BatchHolder, BatchOp};
pub use engine::{EngineOptions, KvEngine, KvIter, RocksEngine};
pub use error::{Result, StoreError};
pub use expr::{Expr, UpdateContext};
pub use index::{IndexDef, IndexState, IndexStateRegistry, IndexTarget};
pub use lock::{LockKey, MemoryLockTable};
pub use part::{
    AtomicOpResult, LocalReplication, PartDirectory, Replication, Role,
};
pub use row::{RowReader, RowWriter, Value};
pub use schema::{FieldDef, PropType, Schema, SchemaRegistry};
pub use types::{EdgeRank, EdgeType, HostAddr, IndexId, PartId, SpaceId, TagId, VertexId};
pub use update::{UpdateExecutor, UpdateRequest, UpdateResponse, UpdateTarget, UpdatedProp};
