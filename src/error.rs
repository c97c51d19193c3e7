//! Closed error enumeration for the storage core.
//!
//! Callers dispatch on variants, never on message strings: routing errors
//! (`LeaderChanged`) are retryable after re-resolving the leader, conflict
//! errors (`ConcurrentModification`) are retryable from the top of the
//! update cycle, data errors are not retryable without changing the request.

use std::io;
use thiserror::Error;

use crate::types::{HostAddr, PartId, SpaceId};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Every error the storage core surfaces upward.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested key does not exist.
    #[error("key not found")]
    KeyNotFound,

    /// The (space, partition) pair is not served by this process.
    #[error("part {part} of space {space} not found")]
    PartNotFound {
        /// Space the lookup targeted.
        space: SpaceId,
        /// Partition the lookup targeted.
        part: PartId,
    },

    /// A write was issued against a non-leader replica. Carries the current
    /// leader's address when the directory knows it.
    #[error("leader changed{}", leader_suffix(.leader))]
    LeaderChanged {
        /// Current leader, if known.
        leader: Option<HostAddr>,
    },

    /// Another in-flight update holds the memory lock for the same record.
    #[error("concurrent modification on {0}")]
    ConcurrentModification(String),

    /// Stored bytes failed to decode (schema mismatch, truncated payload,
    /// malformed expression). Fatal for the issuing request.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The record exists but failed the caller-supplied predicate.
    #[error("filter not passed")]
    FilterNotPassed,

    /// The index is in its protective LOCKED state; writes are rejected.
    #[error("index locked")]
    IndexLocked,

    /// An insert needed a field value that has neither a declared default
    /// nor nullability.
    #[error("field {field} has no default value and is not nullable")]
    NoDefaultValueAndNotNullable {
        /// Offending schema field.
        field: String,
    },

    /// Configuration input was rejected. The message states whether the key
    /// was unknown or the value malformed.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The atomic read-modify-write closure aborted without writing.
    #[error("atomic op failed")]
    AtomicOpFailed,

    /// Error reported by the underlying storage engine.
    #[error("engine: {0}")]
    Engine(String),

    /// I/O failure outside the engine proper (backup paths, checkpoints).
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// Completion signal was dropped without firing, or a failure with no
    /// better classification.
    #[error("unknown storage error")]
    Unknown,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Engine(e.into_string())
    }
}

fn leader_suffix(leader: &Option<HostAddr>) -> String {
    match leader {
        Some(addr) => format!(", current leader {addr}"),
        None => String::new(),
    }
}
