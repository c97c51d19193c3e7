//! Identifier newtypes shared across the storage core.

use std::fmt;

/// Identifier of one graph space. A space is subdivided into a fixed number
/// of partitions, each an independent replicated key range.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SpaceId(pub u32);

/// Identifier of one partition inside a space.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PartId(pub u32);

/// Identifier of a vertex tag schema.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TagId(pub u32);

/// Identifier of an edge schema. Negative values address the reverse
/// direction of the same edge type.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct EdgeType(pub i32);

/// Identifier of one vertex.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct VertexId(pub u64);

/// Rank distinguishing parallel edges between the same endpoints.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct EdgeRank(pub i64);

/// Identifier of a secondary index.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct IndexId(pub u32);

/// Network address of a storage replica, surfaced in leader redirections.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct HostAddr {
    /// Host name or address.
    pub host: String,
    /// Service port.
    pub port: u16,
}

impl HostAddr {
    /// Builds an address from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SpaceId {
    fn from(value: u32) -> Self {
        SpaceId(value)
    }
}

impl From<u32> for PartId {
    fn from(value: u32) -> Self {
        PartId(value)
    }
}

impl From<u32> for TagId {
    fn from(value: u32) -> Self {
        TagId(value)
    }
}

impl From<u64> for VertexId {
    fn from(value: u64) -> Self {
        VertexId(value)
    }
}
