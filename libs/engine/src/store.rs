//! The per-node graph store: the façade binding indexes, the match table,
//! the request table, and the transport into one edge-consumption pipeline.
//!
//! `consume` is the hot path and stays synchronous; it only ever blocks on
//! the specific buckets it touches. Remote traffic is drained by pull
//! workers that call straight back into the same path. Transport and
//! capacity losses are absorbed into counters - losing one edge must never
//! unwind a consume call or tear down a partial match chain.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::arena::EdgeArena;
use crate::edge::{Edge, Role};
use crate::error::{QueryError, StoreError};
use crate::features::FeatureLookup;
use crate::index::CompressedSparseIndex;
use crate::partial::{CompletedMatch, Lead, PartialMatch};
use crate::query::{QueryId, QueryPlan, SubgraphQuery};
use crate::request_map::{EdgeRequest, EdgeRequestMap};
use crate::result_map::SubgraphQueryResultMap;
use crate::transport::{FlowConsumer, PushPull, SocketClass, TransportConfig};
use crate::wire::{EdgeMessage, EdgeRequestMessage, Message};

// ============================================================================
// Configuration
// ============================================================================

/// Process-wide store configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct GraphStoreConfig {
    pub num_nodes: usize,
    pub node_id: usize,
    /// One hostname per node; `127.0.0.1` for single-node runs.
    pub hostnames: Vec<String>,
    pub starting_port: u16,
    /// Bucket count for the CSR and CSC.
    pub graph_capacity: usize,
    /// Bucket count for the match and request tables.
    pub table_capacity: usize,
    /// Bound on the results queue; overflow drops with a counter bump.
    pub results_capacity: usize,
    pub num_sockets: usize,
    pub num_pull_threads: usize,
    pub hwm: usize,
    pub send_timeout_ms: u64,
    /// Sliding window in stream seconds; the longest lifetime of an edge or
    /// partial match.
    pub time_window: f64,
    /// Inbound buffer between socket readers and pull workers.
    pub queue_length: usize,
}

impl Default for GraphStoreConfig {
    fn default() -> Self {
        Self {
            num_nodes: 1,
            node_id: 0,
            hostnames: vec!["127.0.0.1".to_string()],
            starting_port: 10000,
            graph_capacity: 100_000,
            table_capacity: 1000,
            results_capacity: 1000,
            num_sockets: 1,
            num_pull_threads: 1,
            hwm: 10_000,
            send_timeout_ms: 1000,
            time_window: 100.0,
            queue_length: 1000,
        }
    }
}

impl GraphStoreConfig {
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            num_nodes: self.num_nodes,
            node_id: self.node_id,
            hostnames: self.hostnames.clone(),
            starting_port: self.starting_port,
            num_sockets: self.num_sockets,
            queue_length: self.queue_length,
            hwm: self.hwm,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

const STATE_INIT: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_TERMINATING: u8 = 2;
const STATE_TERMINATED: u8 = 3;

struct RegisteredQuery {
    id: QueryId,
    plan: Arc<QueryPlan>,
}

/// Counts from one expiry sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepCounts {
    pub edges: usize,
    pub index_slots: usize,
    pub matches: usize,
    pub requests: usize,
}

// ============================================================================
// GraphStore
// ============================================================================

pub struct GraphStore {
    config: GraphStoreConfig,
    state: AtomicU8,
    arena: EdgeArena,
    csr: CompressedSparseIndex,
    csc: CompressedSparseIndex,
    result_map: SubgraphQueryResultMap,
    request_map: EdgeRequestMap,
    queries: RwLock<Vec<RegisteredQuery>>,
    features: Arc<dyn FeatureLookup>,
    results: Mutex<Vec<CompletedMatch>>,
    next_query_id: AtomicU64,
    next_request_id: AtomicU64,
    edge_pulls: AtomicU64,
    dropped_results: AtomicU64,
    /// Max `t_start` consumed so far, as f64 bits. Stream time.
    watermark: AtomicU64,
    request_net: Option<Arc<PushPull>>,
    edge_net: Option<Arc<PushPull>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl GraphStore {
    /// Construct the store and, for multi-node clusters, its request and
    /// edge socket fabrics plus the pull workers draining them. Must run on
    /// a tokio runtime. The returned store is in the running state.
    pub async fn start(
        config: GraphStoreConfig,
        features: Arc<dyn FeatureLookup>,
    ) -> Result<Arc<GraphStore>> {
        let transport = config.transport();
        let (request_net, request_rx, edge_net, edge_rx) = if config.num_nodes > 1 {
            let (request_net, request_rx) = PushPull::start(SocketClass::Request, &transport).await?;
            let (edge_net, edge_rx) = PushPull::start(SocketClass::EdgeReply, &transport).await?;
            (Some(request_net), Some(request_rx), Some(edge_net), Some(edge_rx))
        } else {
            (None, None, None, None)
        };

        let store = Arc::new(GraphStore {
            arena: EdgeArena::new(),
            csr: CompressedSparseIndex::new(Role::Source, config.graph_capacity),
            csc: CompressedSparseIndex::new(Role::Target, config.graph_capacity),
            result_map: SubgraphQueryResultMap::new(
                config.table_capacity,
                config.num_nodes,
                config.node_id,
            ),
            request_map: EdgeRequestMap::new(config.table_capacity),
            queries: RwLock::new(Vec::new()),
            features,
            results: Mutex::new(Vec::new()),
            next_query_id: AtomicU64::new(0),
            next_request_id: AtomicU64::new(0),
            edge_pulls: AtomicU64::new(0),
            dropped_results: AtomicU64::new(0),
            watermark: AtomicU64::new(f64::NEG_INFINITY.to_bits()),
            state: AtomicU8::new(STATE_INIT),
            request_net,
            edge_net,
            workers: Mutex::new(Vec::new()),
            config,
        });

        {
            let mut workers = store.workers.lock().unwrap();
            if let Some(rx) = edge_rx {
                for _ in 0..store.config.num_pull_threads.max(1) {
                    let rx = rx.clone();
                    let me = store.clone();
                    workers.push(tokio::spawn(async move {
                        while let Ok(msg) = rx.recv_async().await {
                            match msg {
                                Message::Edge(msg) => me.handle_remote_edge(msg),
                                Message::Request(_) => {
                                    tracing::warn!("edge request arrived on edge class");
                                }
                            }
                        }
                    }));
                }
            }
            if let Some(rx) = request_rx {
                let me = store.clone();
                workers.push(tokio::spawn(async move {
                    while let Ok(msg) = rx.recv_async().await {
                        match msg {
                            Message::Request(msg) => me.handle_remote_request(msg),
                            Message::Edge(_) => {
                                tracing::warn!("edge arrived on request class");
                            }
                        }
                    }
                }));
            }
        }

        store.state.store(STATE_RUNNING, Ordering::Release);
        tracing::info!(
            node = store.config.node_id,
            nodes = store.config.num_nodes,
            "graph store running"
        );
        Ok(store)
    }

    pub fn config(&self) -> &GraphStoreConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Install a finalized query on this node. Fails with
    /// [`QueryError::NotFinalized`] if `finalize()` has not run.
    pub fn register_query(&self, query: &SubgraphQuery) -> Result<QueryId, QueryError> {
        let plan = query.plan().ok_or(QueryError::NotFinalized)?;
        let id = QueryId(self.next_query_id.fetch_add(1, Ordering::Relaxed));
        self.queries.write().unwrap().push(RegisteredQuery { id, plan });
        tracing::info!(query = %id, "query registered");
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Hot path
    // ------------------------------------------------------------------

    /// Ingest one edge. Stores it in the CSR/CSC, answers outstanding
    /// remote requests, advances and seeds partial matches, and fans any
    /// remote leads out as edge requests. Re-consuming an edge id already
    /// stored on this node is a no-op.
    pub fn consume(&self, edge: Edge) -> Result<(), StoreError> {
        self.consume_shared(Arc::new(edge))
    }

    fn consume_shared(&self, edge: Arc<Edge>) -> Result<(), StoreError> {
        if self.state.load(Ordering::Acquire) != STATE_RUNNING {
            return Err(StoreError::Terminated);
        }
        if !self.arena.insert_shared(&edge) {
            return Ok(());
        }
        self.advance_watermark(edge.t_start);
        let watermark = self.watermark_value();

        self.csr.insert(&edge);
        self.csc.insert(&edge);

        for requester in self.request_map.probe(&edge) {
            self.ship_edge(requester, &edge);
        }

        let outcome = self.result_map.advance(&edge, self.features.as_ref(), watermark);
        self.deliver(outcome.completed);
        self.send_requests(outcome.leads);

        let queries = self.queries.read().unwrap();
        for query in queries.iter() {
            let seeded = PartialMatch::seed(
                query.id,
                &query.plan,
                &edge,
                self.config.time_window,
                self.features.as_ref(),
            );
            if let Some(m) = seeded {
                if m.is_complete() {
                    // An edge may reach both endpoint owners; the source
                    // owner is the canonical emitter of single-slot matches.
                    if edge.src.owner(self.config.num_nodes) == self.config.node_id {
                        self.deliver(vec![m.into_completed()]);
                    }
                } else if self.result_map.owns_fingerprint(&m) {
                    // The fingerprint owner keeps the sole copy of a fresh
                    // seed; peers that also saw this edge drop theirs. A
                    // locally owned fingerprint never yields a lead.
                    let _ = self.result_map.register(m);
                }
            }
        }
        Ok(())
    }

    fn deliver(&self, completed: Vec<CompletedMatch>) {
        if completed.is_empty() {
            return;
        }
        let mut results = self.results.lock().unwrap();
        for m in completed {
            if results.len() < self.config.results_capacity {
                tracing::debug!(query = %m.query_id, edges = m.edges.len(), "match completed");
                results.push(m);
            } else {
                self.dropped_results.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(query = %m.query_id, "results queue full, dropping match");
            }
        }
    }

    fn send_requests(&self, leads: Vec<Lead>) {
        let net = match &self.request_net {
            Some(net) => net,
            None => return,
        };
        for lead in leads {
            let owner = lead.vertex.owner(self.config.num_nodes);
            let request = EdgeRequest {
                request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
                vertex: lead.vertex,
                role: lead.role,
                t_lo: lead.t_lo,
                t_hi: lead.t_hi,
                requester: self.config.node_id,
            };
            tracing::debug!(vertex = %request.vertex, owner, "requesting remote edges");
            net.push(owner, Message::Request(EdgeRequestMessage::from(&request)));
        }
    }

    fn ship_edge(&self, node: usize, edge: &Arc<Edge>) {
        if node == self.config.node_id {
            return;
        }
        if let Some(net) = &self.edge_net {
            net.push(node, Message::Edge(EdgeMessage::from(edge.as_ref())));
        }
    }

    // ------------------------------------------------------------------
    // Remote traffic (invoked by the pull workers)
    // ------------------------------------------------------------------

    pub fn handle_remote_edge(&self, msg: EdgeMessage) {
        self.edge_pulls.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.consume_shared(Arc::new(Edge::from(msg))) {
            tracing::debug!(err = %e, "remote edge ignored");
        }
    }

    pub fn handle_remote_request(&self, msg: EdgeRequestMessage) {
        let request = EdgeRequest::from(msg);
        if request.requester == self.config.node_id {
            return;
        }
        let requester = request.requester;
        let immediate = self.request_map.register(
            request,
            &self.csr,
            &self.csc,
            &self.arena,
            self.expiry(),
        );
        for edge in immediate {
            self.ship_edge(requester, &edge);
        }
    }

    // ------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------

    fn advance_watermark(&self, t: f64) {
        let mut current = self.watermark.load(Ordering::Relaxed);
        loop {
            if f64::from_bits(current) >= t {
                return;
            }
            match self.watermark.compare_exchange_weak(
                current,
                t.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Max `t_start` consumed so far.
    pub fn watermark_value(&self) -> f64 {
        f64::from_bits(self.watermark.load(Ordering::Relaxed))
    }

    fn expiry(&self) -> f64 {
        self.watermark_value() - self.config.time_window
    }

    /// Expire everything older than the sliding window. The sweeper calls
    /// this periodically; scans also filter lazily, so correctness never
    /// depends on it.
    pub fn sweep_expired(&self) -> SweepCounts {
        let watermark = self.watermark_value();
        if !watermark.is_finite() {
            return SweepCounts::default();
        }
        let expiry = watermark - self.config.time_window;
        SweepCounts {
            edges: self.arena.expire(expiry),
            index_slots: self.csr.expire(expiry) + self.csc.expire(expiry),
            matches: self.result_map.expire(watermark),
            requests: self.request_map.expire(watermark),
        }
    }

    // ------------------------------------------------------------------
    // Results & metrics
    // ------------------------------------------------------------------

    /// Completed matches currently queued.
    pub fn num_results(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub fn results(&self) -> Vec<CompletedMatch> {
        self.results.lock().unwrap().clone()
    }

    pub fn clear_results(&self) {
        self.results.lock().unwrap().clear();
    }

    /// Edges received over the edge socket class.
    pub fn total_edge_pulls(&self) -> u64 {
        self.edge_pulls.load(Ordering::Relaxed)
    }

    /// Messages dropped by full send queues or timed-out pushes.
    pub fn dropped_sends(&self) -> u64 {
        let request = self.request_net.as_ref().map(|n| n.dropped()).unwrap_or(0);
        let edge = self.edge_net.as_ref().map(|n| n.dropped()).unwrap_or(0);
        request + edge
    }

    /// Completed matches dropped because the results queue was full.
    pub fn dropped_results(&self) -> u64 {
        self.dropped_results.load(Ordering::Relaxed)
    }

    /// Partial matches currently awaiting their next edge.
    pub fn num_partial_matches(&self) -> usize {
        self.result_map.len()
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    /// The upstream source failed; log and shut the engine down.
    pub async fn ingest_failed(&self, reason: &str) {
        tracing::error!(reason, "ingest failed, terminating");
        self.terminate().await;
    }

    /// Stop accepting edges, tear down the transport, and join the pull
    /// workers. Idempotent: the second call observes the terminal state and
    /// returns immediately.
    pub async fn terminate(&self) {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_TERMINATING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        if let Some(net) = &self.request_net {
            net.shutdown().await;
        }
        if let Some(net) = &self.edge_net {
            net.shutdown().await;
        }
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            let _ = worker.await;
        }

        self.state.store(STATE_TERMINATED, Ordering::Release);
        tracing::info!(node = self.config.node_id, "graph store terminated");
    }

    pub fn is_terminated(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_TERMINATED
    }
}

/// Lets a store sit at the end of a partitioner's consumer chain.
impl FlowConsumer for GraphStore {
    fn accept(&self, edge: &Arc<Edge>) {
        if let Err(e) = self.consume_shared(edge.clone()) {
            tracing::debug!(err = %e, "edge refused by store");
        }
    }
}
