//! Vertex feature lookup and the features the engine ships with.
//!
//! Query vertex constraints resolve through the [`FeatureLookup`] trait;
//! feature computation itself is a collaborator. The in-process
//! implementation is [`FeatureMap`], a fixed-capacity bucketed table that
//! operators like [`TopK`] publish into.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::edge::{Edge, Role};
use crate::transport::FlowConsumer;

/// Three-valued membership answer. `Unknown` (feature absent) is treated as
/// non-matching by the query engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    In,
    NotIn,
    Unknown,
}

/// Contract the query engine uses to resolve vertex constraints.
pub trait FeatureLookup: Send + Sync {
    fn membership(&self, feature_id: &str, vertex: &str) -> Membership;

    fn contains(&self, feature_id: &str, vertex: &str) -> bool {
        matches!(self.membership(feature_id, vertex), Membership::In)
    }
}

/// Lookup that knows nothing. Constraint-free queries never consult it.
pub struct NullFeatureLookup;

impl FeatureLookup for NullFeatureLookup {
    fn membership(&self, _feature_id: &str, _vertex: &str) -> Membership {
        Membership::Unknown
    }
}

/// A published feature value.
#[derive(Debug, Clone, PartialEq)]
pub enum Feature {
    /// The current top-k key list, most frequent first.
    TopK(Vec<String>),
}

// ============================================================================
// FeatureMap
// ============================================================================

/// Fixed-capacity table of published features, keyed by feature identifier.
///
/// Capacity is the bucket-array size; buckets chain, so overflow degrades
/// rather than fails.
pub struct FeatureMap {
    buckets: Vec<Mutex<Vec<(String, Feature)>>>,
}

impl FeatureMap {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut buckets = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            buckets.push(Mutex::new(Vec::new()));
        }
        FeatureMap { buckets }
    }

    fn bucket(&self, feature_id: &str) -> &Mutex<Vec<(String, Feature)>> {
        let idx =
            (xxhash_rust::xxh64::xxh64(feature_id.as_bytes(), 0) % self.buckets.len() as u64) as usize;
        &self.buckets[idx]
    }

    /// Insert or replace the feature under `feature_id`.
    pub fn publish(&self, feature_id: &str, feature: Feature) {
        let mut bucket = self.bucket(feature_id).lock().unwrap();
        if let Some(entry) = bucket.iter_mut().find(|(id, _)| id == feature_id) {
            entry.1 = feature;
        } else {
            bucket.push((feature_id.to_string(), feature));
        }
    }

    pub fn get(&self, feature_id: &str) -> Option<Feature> {
        let bucket = self.bucket(feature_id).lock().unwrap();
        bucket
            .iter()
            .find(|(id, _)| id == feature_id)
            .map(|(_, f)| f.clone())
    }
}

impl FeatureLookup for FeatureMap {
    fn membership(&self, feature_id: &str, vertex: &str) -> Membership {
        match self.get(feature_id) {
            Some(Feature::TopK(keys)) => {
                if keys.iter().any(|k| k == vertex) {
                    Membership::In
                } else {
                    Membership::NotIn
                }
            }
            None => Membership::Unknown,
        }
    }
}

// ============================================================================
// TopK
// ============================================================================

/// Sliding-window top-k over one endpoint of the flow stream.
///
/// Keeps the last `window_size` observations of the keyed vertex and
/// publishes the `k` most frequent keys into the feature map after every
/// update.
pub struct TopK {
    identifier: String,
    key_role: Role,
    window_size: usize,
    k: usize,
    feature_map: Arc<FeatureMap>,
    state: Mutex<TopKState>,
}

struct TopKState {
    window: std::collections::VecDeque<String>,
    counts: HashMap<String, usize>,
}

impl TopK {
    pub fn new(
        identifier: impl Into<String>,
        key_role: Role,
        window_size: usize,
        k: usize,
        feature_map: Arc<FeatureMap>,
    ) -> Self {
        TopK {
            identifier: identifier.into(),
            key_role,
            window_size: window_size.max(1),
            k,
            feature_map,
            state: Mutex::new(TopKState {
                window: std::collections::VecDeque::new(),
                counts: HashMap::new(),
            }),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    fn observe(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.window.push_back(key.to_string());
        *state.counts.entry(key.to_string()).or_insert(0) += 1;

        if state.window.len() > self.window_size {
            let evicted = state.window.pop_front().unwrap();
            if let Some(count) = state.counts.get_mut(&evicted) {
                *count -= 1;
                if *count == 0 {
                    state.counts.remove(&evicted);
                }
            }
        }

        let mut ranked: Vec<(&String, &usize)> = state.counts.iter().collect();
        // Ties break on key so publication order is deterministic.
        ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let keys: Vec<String> = ranked.into_iter().take(self.k).map(|(k, _)| k.clone()).collect();

        self.feature_map.publish(&self.identifier, Feature::TopK(keys));
    }
}

impl FlowConsumer for TopK {
    fn accept(&self, edge: &Arc<Edge>) {
        self.observe(edge.vertex(self.key_role).as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use crate::tuple::FlowTuple;

    fn flow(id: u64, dst: &str) -> Arc<Edge> {
        Arc::new(Edge::from_tuple(
            id,
            FlowTuple {
                time: id as f64,
                src_ip: "client".into(),
                dst_ip: dst.into(),
                src_port: 1,
                dst_port: 80,
                protocol: "tcp".into(),
                duration: 1.0,
                src_bytes: 0,
                dst_bytes: 0,
            },
        ))
    }

    #[test]
    fn membership_is_unknown_until_published() {
        let map = FeatureMap::new(16);
        assert_eq!(map.membership("topk", "server0"), Membership::Unknown);

        map.publish("topk", Feature::TopK(vec!["server0".into()]));
        assert_eq!(map.membership("topk", "server0"), Membership::In);
        assert_eq!(map.membership("topk", "server9"), Membership::NotIn);
    }

    #[test]
    fn topk_tracks_most_frequent_destinations() {
        let map = Arc::new(FeatureMap::new(16));
        let topk = TopK::new("topk", Role::Target, 100, 2, map.clone());

        let mut id = 0;
        for _ in 0..5 {
            topk.accept(&flow(id, "hot"));
            id += 1;
        }
        for _ in 0..3 {
            topk.accept(&flow(id, "warm"));
            id += 1;
        }
        topk.accept(&flow(id, "cold"));

        match map.get("topk").unwrap() {
            Feature::TopK(keys) => assert_eq!(keys, vec!["hot".to_string(), "warm".to_string()]),
        }
    }

    #[test]
    fn topk_window_evicts_stale_keys() {
        let map = Arc::new(FeatureMap::new(16));
        let topk = TopK::new("topk", Role::Target, 4, 1, map.clone());

        for i in 0..4 {
            topk.accept(&flow(i, "old"));
        }
        for i in 4..8 {
            topk.accept(&flow(i, "new"));
        }

        match map.get("topk").unwrap() {
            Feature::TopK(keys) => assert_eq!(keys, vec!["new".to_string()]),
        }
    }
}
