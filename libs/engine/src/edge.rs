//! Edge and vertex identity types.
//!
//! Vertices are string identifiers with a cluster-wide stable hash: every
//! node must agree on `owner(v)`, so the hash is a fixed xxHash64 with seed 0
//! rather than the process-local `DefaultHasher`.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::tuple::FlowTuple;

/// Monotonically assigned edge identifier, unique per ingest source.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EdgeId(pub u64);

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which endpoint of an edge a vertex occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Source,
    Target,
}

/// Opaque vertex identifier (an IP address for flow records).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VertexId(String);

impl VertexId {
    pub fn new(id: impl Into<String>) -> Self {
        VertexId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cluster-wide stable hash. All nodes in a deployment must compute the
    /// same value for the same vertex.
    pub fn stable_hash(&self) -> u64 {
        xxh64(self.0.as_bytes(), 0)
    }

    /// The node that owns this vertex: `hash(v) mod num_nodes`.
    pub fn owner(&self, num_nodes: usize) -> usize {
        (self.stable_hash() % num_nodes as u64) as usize
    }
}

impl std::fmt::Display for VertexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VertexId {
    fn from(s: &str) -> Self {
        VertexId(s.to_string())
    }
}

/// An immutable edge in the streaming graph.
///
/// Created once by the ingest path and shared read-only (as `Arc<Edge>`)
/// between the sparse indexes and any partial matches that bind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub src: VertexId,
    pub dst: VertexId,
    pub t_start: f64,
    pub t_end: f64,
    pub tuple: FlowTuple,
}

impl Edge {
    /// Build an edge from a parsed flow record. This is the tuplizer: source
    /// and target vertices come from the IP pair, the time span from
    /// `time .. time + duration`.
    pub fn from_tuple(id: u64, tuple: FlowTuple) -> Self {
        Edge {
            id: EdgeId(id),
            src: VertexId::new(tuple.src_ip.clone()),
            dst: VertexId::new(tuple.dst_ip.clone()),
            t_start: tuple.time,
            t_end: tuple.time + tuple.duration,
            tuple,
        }
    }

    /// The vertex occupying `role` on this edge.
    pub fn vertex(&self, role: Role) -> &VertexId {
        match role {
            Role::Source => &self.src,
            Role::Target => &self.dst,
        }
    }
}
