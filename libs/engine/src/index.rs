//! Compressed sparse edge indexes.
//!
//! Two instances exist per store: one keyed by source vertex (the CSR) and
//! one keyed by target vertex (the CSC). Each is a fixed array of
//! `graph_capacity` buckets; a bucket is an unbounded list of slots for
//! edges whose key vertex hashes there. There is no growth and no
//! rebalancing: operators must size the capacity well above the expected
//! number of distinct vertices or scans degrade to linear walks.
//!
//! Scans filter by exact vertex equality (hash collisions share buckets) and
//! drop expired slots in place, so correctness never depends on the
//! background sweeper.

use std::sync::{Arc, Mutex};

use crate::arena::EdgeArena;
use crate::edge::{Edge, EdgeId, Role, VertexId};

struct Slot {
    edge_id: EdgeId,
    vertex: VertexId,
    t_start: f64,
}

pub struct CompressedSparseIndex {
    role: Role,
    buckets: Vec<Mutex<Vec<Slot>>>,
}

impl CompressedSparseIndex {
    pub fn new(role: Role, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut buckets = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            buckets.push(Mutex::new(Vec::new()));
        }
        CompressedSparseIndex { role, buckets }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn bucket(&self, vertex: &VertexId) -> &Mutex<Vec<Slot>> {
        let idx = (vertex.stable_hash() % self.buckets.len() as u64) as usize;
        &self.buckets[idx]
    }

    /// Append the edge to the bucket of its key vertex. O(1) amortized.
    pub fn insert(&self, edge: &Edge) {
        let vertex = edge.vertex(self.role).clone();
        let mut bucket = self.bucket(&vertex).lock().unwrap();
        bucket.push(Slot {
            edge_id: edge.id,
            vertex,
            t_start: edge.t_start,
        });
    }

    /// All edges where `vertex` occupies this index's role and
    /// `t_lo <= t_start <= t_hi`. Slots older than `expiry` (or whose arena
    /// entry is gone) are removed during the walk.
    pub fn neighbors(
        &self,
        arena: &EdgeArena,
        vertex: &VertexId,
        t_lo: f64,
        t_hi: f64,
        expiry: f64,
    ) -> Vec<Arc<Edge>> {
        let mut bucket = self.bucket(vertex).lock().unwrap();
        let mut out = Vec::new();
        bucket.retain(|slot| {
            if slot.t_start < expiry {
                return false;
            }
            if slot.vertex != *vertex || slot.t_start < t_lo || slot.t_start > t_hi {
                return true;
            }
            match arena.get(slot.edge_id) {
                Some(edge) => {
                    out.push(edge);
                    true
                }
                None => false,
            }
        });
        out
    }

    /// Sweep every bucket, dropping slots older than the watermark.
    pub fn expire(&self, watermark: f64) -> usize {
        let mut removed = 0;
        for bucket in &self.buckets {
            let mut bucket = bucket.lock().unwrap();
            let before = bucket.len();
            bucket.retain(|slot| slot.t_start >= watermark);
            removed += before - bucket.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
