//! Outstanding edge requests from peer nodes.
//!
//! The producer-side mirror of the result map: when a peer needs edges
//! touching a vertex this node owns, its request parks here. Registration
//! answers immediately from the stored graph (the request asks for ALL edges
//! in its window, including ones that already arrived); after that, every
//! local insert probes the table and ships matches to the requester.

use std::sync::{Arc, Mutex};

use xxhash_rust::xxh64::xxh64;

use crate::arena::EdgeArena;
use crate::edge::{Edge, Role, VertexId};
use crate::index::CompressedSparseIndex;

/// A standing request for edges where `vertex` occupies `role` within
/// `[t_lo, t_hi]`.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRequest {
    pub request_id: u64,
    pub vertex: VertexId,
    pub role: Role,
    pub t_lo: f64,
    pub t_hi: f64,
    pub requester: usize,
}

impl EdgeRequest {
    fn admits(&self, edge: &Edge) -> bool {
        let t = edge.t_start;
        *edge.vertex(self.role) == self.vertex && t >= self.t_lo && t <= self.t_hi
    }
}

pub struct EdgeRequestMap {
    buckets: Vec<Mutex<Vec<EdgeRequest>>>,
}

impl EdgeRequestMap {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut buckets = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            buckets.push(Mutex::new(Vec::new()));
        }
        EdgeRequestMap { buckets }
    }

    fn bucket_index(&self, vertex: &VertexId) -> usize {
        (xxh64(vertex.as_str().as_bytes(), 0) % self.buckets.len() as u64) as usize
    }

    /// Park a request and return the already-stored edges that answer it.
    pub fn register(
        &self,
        request: EdgeRequest,
        csr: &CompressedSparseIndex,
        csc: &CompressedSparseIndex,
        arena: &EdgeArena,
        expiry: f64,
    ) -> Vec<Arc<Edge>> {
        let index = match request.role {
            Role::Source => csr,
            Role::Target => csc,
        };
        let immediate = index.neighbors(arena, &request.vertex, request.t_lo, request.t_hi, expiry);
        let idx = self.bucket_index(&request.vertex);
        self.buckets[idx].lock().unwrap().push(request);
        immediate
    }

    /// Requester nodes whose standing requests match a freshly inserted
    /// edge. Each requester appears at most once per probe.
    pub fn probe(&self, edge: &Edge) -> Vec<usize> {
        let src_idx = self.bucket_index(&edge.src);
        let dst_idx = self.bucket_index(&edge.dst);
        let mut requesters = Vec::new();
        let mut scan = |idx: usize| {
            for request in self.buckets[idx].lock().unwrap().iter() {
                if request.admits(edge) && !requesters.contains(&request.requester) {
                    requesters.push(request.requester);
                }
            }
        };
        scan(src_idx);
        // Both endpoints may hash to the same bucket; scan it once.
        if dst_idx != src_idx {
            scan(dst_idx);
        }
        requesters
    }

    /// Drop requests whose window closed before the watermark.
    pub fn expire(&self, watermark: f64) -> usize {
        let mut removed = 0;
        for bucket in &self.buckets {
            let mut bucket = bucket.lock().unwrap();
            let before = bucket.len();
            bucket.retain(|request| request.t_hi >= watermark);
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
