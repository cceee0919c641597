//! The table of partial matches awaiting their next edge.
//!
//! Matches are keyed by their advance fingerprint: the concrete vertex the
//! next edge must carry and the role it carries it in. The table is a fixed
//! array of `table_capacity` chained buckets; every probe fully re-checks
//! the resident, so hash collisions and unrelated queries sharing a bucket
//! only cost time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use xxhash_rust::xxh64::xxh64;

use crate::edge::{Edge, Role, VertexId};
use crate::features::FeatureLookup;
use crate::partial::{CompletedMatch, Lead, PartialMatch};

struct Resident {
    vertex: VertexId,
    role: Role,
    inner: PartialMatch,
}

/// Everything one `advance` call produced: finished matches for the results
/// queue and remote leads the store should turn into edge requests.
#[derive(Default)]
pub struct AdvanceOutcome {
    pub completed: Vec<CompletedMatch>,
    pub leads: Vec<Lead>,
}

pub struct SubgraphQueryResultMap {
    buckets: Vec<Mutex<Vec<Resident>>>,
    num_nodes: usize,
    node_id: usize,
    expired: AtomicUsize,
}

impl SubgraphQueryResultMap {
    pub fn new(capacity: usize, num_nodes: usize, node_id: usize) -> Self {
        let capacity = capacity.max(1);
        let mut buckets = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            buckets.push(Mutex::new(Vec::new()));
        }
        SubgraphQueryResultMap {
            buckets,
            num_nodes,
            node_id,
            expired: AtomicUsize::new(0),
        }
    }

    fn bucket_index(&self, vertex: &VertexId, role: Role) -> usize {
        let seed = match role {
            Role::Source => 0,
            Role::Target => 1,
        };
        (xxh64(vertex.as_str().as_bytes(), seed) % self.buckets.len() as u64) as usize
    }

    /// Park an incomplete match under its next-slot fingerprint. Returns a
    /// lead when the fingerprint vertex is owned by a peer, meaning the
    /// caller must request matching edges from that node.
    pub fn register(&self, m: PartialMatch) -> Option<Lead> {
        let (vertex, role) = match m.expected() {
            Some(key) => key,
            None => {
                // Connected plans always have a bound endpoint on the next
                // slot; a miss here means the plan validator let one through.
                tracing::warn!(query = %m.query_id(), "partial match has no advance fingerprint");
                return None;
            }
        };
        let lead = m.remote_lead(self.num_nodes, self.node_id);
        let idx = self.bucket_index(&vertex, role);
        self.buckets[idx].lock().unwrap().push(Resident {
            vertex,
            role,
            inner: m,
        });
        lead
    }

    /// Offer `edge` to every match fingerprinted on either of its endpoints.
    /// Extended copies re-register (the resident stays put for further
    /// cartesian extensions); completed ones are returned.
    pub fn advance(
        &self,
        edge: &Arc<Edge>,
        features: &dyn FeatureLookup,
        watermark: f64,
    ) -> AdvanceOutcome {
        let src_idx = self.bucket_index(&edge.src, Role::Source);
        let dst_idx = self.bucket_index(&edge.dst, Role::Target);

        let mut extensions = Vec::new();
        self.probe_bucket(src_idx, edge, features, watermark, &mut extensions);
        if dst_idx != src_idx {
            self.probe_bucket(dst_idx, edge, features, watermark, &mut extensions);
        }

        let mut outcome = AdvanceOutcome::default();
        for extended in extensions {
            if extended.is_complete() {
                outcome.completed.push(extended.into_completed());
            } else {
                outcome.leads.extend(self.register(extended));
            }
        }
        outcome
    }

    /// Does this node keep a match seeded with this fingerprint? Edges
    /// carrying the fingerprint vertex are partitioned to its owner, which
    /// also saw the seed edge; letting the owner keep the sole copy avoids
    /// duplicate matches across the cluster.
    pub fn owns_fingerprint(&self, m: &PartialMatch) -> bool {
        match m.expected() {
            Some((vertex, _)) => vertex.owner(self.num_nodes) == self.node_id,
            None => false,
        }
    }

    fn probe_bucket(
        &self,
        idx: usize,
        edge: &Arc<Edge>,
        features: &dyn FeatureLookup,
        watermark: f64,
        extensions: &mut Vec<PartialMatch>,
    ) {
        let mut bucket = self.buckets[idx].lock().unwrap();
        let mut expired = 0;
        bucket.retain(|resident| {
            if resident.inner.deadline() < watermark {
                expired += 1;
                return false;
            }
            let hit = match resident.role {
                Role::Source => resident.vertex == edge.src,
                Role::Target => resident.vertex == edge.dst,
            };
            if hit {
                if let Some(extended) = resident.inner.extend(edge, features) {
                    extensions.push(extended);
                }
            }
            true
        });
        if expired > 0 {
            self.expired.fetch_add(expired, Ordering::Relaxed);
        }
    }

    /// Sweep every bucket, dropping matches past their deadline.
    pub fn expire(&self, watermark: f64) -> usize {
        let mut removed = 0;
        for bucket in &self.buckets {
            let mut bucket = bucket.lock().unwrap();
            let before = bucket.len();
            bucket.retain(|resident| resident.inner.deadline() >= watermark);
            removed += before - bucket.len();
        }
        if removed > 0 {
            self.expired.fetch_add(removed, Ordering::Relaxed);
        }
        removed
    }

    /// Matches currently parked in the table.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Matches dropped at their deadline since construction.
    pub fn expired_count(&self) -> usize {
        self.expired.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::NullFeatureLookup;
    use crate::query::{
        EdgeExpression, EdgeFunction, EdgeOperator, QueryId, SubgraphQuery, TimeEdgeExpression,
    };
    use crate::tuple::FlowTuple;

    fn flow(id: u64, src: &str, dst: &str, t: f64) -> Arc<Edge> {
        Arc::new(Edge::from_tuple(
            id,
            FlowTuple {
                time: t,
                src_ip: src.into(),
                dst_ip: dst.into(),
                src_port: 1,
                dst_port: 2,
                protocol: "tcp".into(),
                duration: 1.0,
                src_bytes: 0,
                dst_bytes: 0,
            },
        ))
    }

    fn chain_plan() -> Arc<crate::query::QueryPlan> {
        let mut q = SubgraphQuery::new();
        q.add_edge_expression(EdgeExpression::new("y", "e1", "x"));
        q.add_edge_expression(EdgeExpression::new("z", "e2", "x"));
        q.add_time_expression(TimeEdgeExpression::new(
            EdgeFunction::StartTime,
            "e2",
            EdgeOperator::GreaterThan,
            0.0,
        ));
        q.finalize().unwrap();
        q.plan().unwrap()
    }

    fn seed(plan: &Arc<crate::query::QueryPlan>, edge: &Arc<Edge>) -> PartialMatch {
        PartialMatch::seed(QueryId(1), plan, edge, 100.0, &NullFeatureLookup).unwrap()
    }

    #[test]
    fn resident_stays_for_cartesian_extensions() {
        let plan = chain_plan();
        let map = SubgraphQueryResultMap::new(64, 1, 0);
        let _ = map.register(seed(&plan, &flow(0, "a", "x", 1.0)));

        let one = map.advance(&flow(1, "b", "x", 2.0), &NullFeatureLookup, f64::NEG_INFINITY);
        assert_eq!(one.completed.len(), 1);
        // The same resident accepts a later edge too.
        let two = map.advance(&flow(2, "c", "x", 3.0), &NullFeatureLookup, f64::NEG_INFINITY);
        assert_eq!(two.completed.len(), 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn every_matching_resident_extends() {
        let plan = chain_plan();
        let map = SubgraphQueryResultMap::new(64, 1, 0);
        let _ = map.register(seed(&plan, &flow(0, "a", "x", 1.0)));
        let _ = map.register(seed(&plan, &flow(1, "b", "x", 2.0)));

        let outcome = map.advance(&flow(2, "c", "x", 3.0), &NullFeatureLookup, f64::NEG_INFINITY);
        assert_eq!(outcome.completed.len(), 2);
    }

    #[test]
    fn unrelated_edges_do_not_advance() {
        let plan = chain_plan();
        let map = SubgraphQueryResultMap::new(64, 1, 0);
        let _ = map.register(seed(&plan, &flow(0, "a", "x", 1.0)));

        let outcome =
            map.advance(&flow(1, "b", "elsewhere", 2.0), &NullFeatureLookup, f64::NEG_INFINITY);
        assert!(outcome.completed.is_empty());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn probes_drop_expired_residents() {
        let plan = chain_plan();
        let map = SubgraphQueryResultMap::new(64, 1, 0);
        let _ = map.register(seed(&plan, &flow(0, "a", "x", 1.0)));

        // Deadline is 1.0 + 100.0; a watermark past it expires the resident.
        let outcome = map.advance(&flow(1, "b", "x", 200.0), &NullFeatureLookup, 150.0);
        assert!(outcome.completed.is_empty());
        assert_eq!(map.len(), 0);
        assert_eq!(map.expired_count(), 1);
    }

    #[test]
    fn expire_sweeps_all_buckets() {
        let plan = chain_plan();
        let map = SubgraphQueryResultMap::new(64, 1, 0);
        let _ = map.register(seed(&plan, &flow(0, "a", "x", 1.0)));
        let _ = map.register(seed(&plan, &flow(1, "b", "x", 80.0)));

        assert_eq!(map.expire(120.0), 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn single_bucket_table_still_advances_once() {
        let plan = chain_plan();
        // Capacity 1: source and target fingerprints collide into one bucket.
        let map = SubgraphQueryResultMap::new(1, 1, 0);
        let _ = map.register(seed(&plan, &flow(0, "a", "x", 1.0)));

        let outcome = map.advance(&flow(1, "b", "x", 2.0), &NullFeatureLookup, f64::NEG_INFINITY);
        assert_eq!(outcome.completed.len(), 1);
    }
}
