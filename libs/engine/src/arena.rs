//! Shared edge arena.
//!
//! Single owner of every edge materialized on this node, keyed by edge id.
//! The sparse indexes store edge ids and resolve through the arena; partial
//! matches clone the `Arc` so completed results survive expiry. Inserting an
//! id that is already present is rejected, which deduplicates edges that
//! reach a node twice (once by partition, once as a requested edge).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::edge::{Edge, EdgeId};

const NUM_SHARDS: usize = 64;

pub struct EdgeArena {
    shards: Vec<Mutex<HashMap<u64, Arc<Edge>>>>,
}

impl EdgeArena {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(NUM_SHARDS);
        for _ in 0..NUM_SHARDS {
            shards.push(Mutex::new(HashMap::new()));
        }
        EdgeArena { shards }
    }

    fn shard(&self, id: EdgeId) -> &Mutex<HashMap<u64, Arc<Edge>>> {
        &self.shards[(id.0 % NUM_SHARDS as u64) as usize]
    }

    /// Insert an edge, returning its shared handle, or `None` if the id is
    /// already present.
    pub fn insert(&self, edge: Edge) -> Option<Arc<Edge>> {
        let edge = Arc::new(edge);
        if self.insert_shared(&edge) {
            Some(edge)
        } else {
            None
        }
    }

    /// Insert an already shared edge. Returns false when the id is present.
    pub fn insert_shared(&self, edge: &Arc<Edge>) -> bool {
        let mut shard = self.shard(edge.id).lock().unwrap();
        match shard.entry(edge.id.0) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(edge.clone());
                true
            }
        }
    }

    pub fn get(&self, id: EdgeId) -> Option<Arc<Edge>> {
        self.shard(id).lock().unwrap().get(&id.0).cloned()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every edge whose `t_start` precedes the watermark. Returns the
    /// number of entries removed. Matches holding an `Arc` keep their copies.
    pub fn expire(&self, watermark: f64) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            let before = shard.len();
            shard.retain(|_, edge| edge.t_start >= watermark);
            removed += before - shard.len();
        }
        removed
    }
}

impl Default for EdgeArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::FlowTuple;

    fn flow(id: u64, t: f64) -> Edge {
        Edge::from_tuple(
            id,
            FlowTuple {
                time: t,
                src_ip: "10.0.0.1".into(),
                dst_ip: "10.0.0.2".into(),
                src_port: 1,
                dst_port: 2,
                protocol: "tcp".into(),
                duration: 1.0,
                src_bytes: 0,
                dst_bytes: 0,
            },
        )
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let arena = EdgeArena::new();
        assert!(arena.insert(flow(1, 0.0)).is_some());
        assert!(arena.insert(flow(1, 5.0)).is_none());
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.get(EdgeId(1)).unwrap().t_start, 0.0);
    }

    #[test]
    fn expire_drops_old_entries_but_not_held_arcs() {
        let arena = EdgeArena::new();
        let held = arena.insert(flow(1, 0.0)).unwrap();
        arena.insert(flow(2, 10.0)).unwrap();

        assert_eq!(arena.expire(5.0), 1);
        assert!(arena.get(EdgeId(1)).is_none());
        assert!(arena.get(EdgeId(2)).is_some());
        // The clone taken before expiry stays valid.
        assert_eq!(held.id, EdgeId(1));
    }
}
