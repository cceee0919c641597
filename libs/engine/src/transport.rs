//! Push/pull transport between cluster nodes.
//!
//! Three socket classes keep traffic types isolated so small, latency
//! sensitive messages never starve behind bulk edge shipping:
//!
//! - `Partition` - raw stream edges routed to their owner nodes
//! - `Request`   - edge requests (small, latency sensitive)
//! - `EdgeReply` - matched-edge responses between graph stores
//!
//! Each class reserves a contiguous block of `2 * num_nodes * num_sockets`
//! ports above `starting_port`; a node's listener binds at the block base
//! plus its node id. Per peer, `num_sockets` outbound connections are each
//! owned by exactly one sender task draining a bounded queue of capacity
//! `hwm`. Enqueueing never blocks the hot path: a full queue drops the
//! message and bumps a counter. Socket writes are bounded by the send
//! timeout; an expired write abandons the message and reconnects.
//!
//! Delivery is FIFO per connection and best effort overall. The matcher
//! tolerates cross-connection reordering because its time constraints are
//! absolute.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::edge::Edge;
use crate::wire::{self, EdgeMessage, Message};

const RECONNECT_DELAY: Duration = Duration::from_millis(200);

/// Traffic class; determines the port block a listener binds in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketClass {
    Partition,
    Request,
    EdgeReply,
}

impl SocketClass {
    fn block_index(self) -> u16 {
        match self {
            SocketClass::Partition => 0,
            SocketClass::Request => 1,
            SocketClass::EdgeReply => 2,
        }
    }
}

/// Cluster topology and socket tuning shared by all transport instances on
/// a node.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub num_nodes: usize,
    pub node_id: usize,
    /// One hostname per node. Single-node deployments use `127.0.0.1`.
    pub hostnames: Vec<String>,
    pub starting_port: u16,
    /// Outbound connections per peer and class.
    pub num_sockets: usize,
    /// Bounded inbound buffer between socket readers and pull workers.
    pub queue_length: usize,
    /// Send-queue bound per connection; overflow drops.
    pub hwm: usize,
    pub send_timeout: Duration,
}

impl TransportConfig {
    fn block_size(&self) -> u16 {
        (2 * self.num_nodes * self.num_sockets) as u16
    }

    /// Port this node's listener binds for `class`.
    pub fn listen_port(&self, class: SocketClass) -> u16 {
        self.starting_port + class.block_index() * self.block_size() + self.node_id as u16
    }

    /// Address of `node`'s listener for `class`.
    pub fn peer_addr(&self, class: SocketClass, node: usize) -> String {
        let port = self.starting_port + class.block_index() * self.block_size() + node as u16;
        format!("{}:{}", self.hostnames[node], port)
    }
}

/// Counters for one transport instance.
#[derive(Debug, Default)]
pub struct TransportMetrics {
    pub sent: AtomicU64,
    pub dropped: AtomicU64,
    pub received: AtomicU64,
}

struct Peer {
    queues: Vec<mpsc::Sender<Message>>,
    next: AtomicUsize,
}

/// One class worth of push sockets towards every peer, plus the pull side
/// feeding an MPMC channel of inbound messages.
pub struct PushPull {
    class: SocketClass,
    node_id: usize,
    peers: Vec<Option<Peer>>,
    metrics: Arc<TransportMetrics>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reader_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    terminated: AtomicBool,
}

impl PushPull {
    /// Bind the listener, connect push sockets to every peer, and return
    /// the handle together with the inbound message channel. Single-node
    /// deployments open no sockets at all; the channel simply stays empty.
    pub async fn start(
        class: SocketClass,
        config: &TransportConfig,
    ) -> Result<(Arc<PushPull>, flume::Receiver<Message>)> {
        let (inbound_tx, inbound_rx) = flume::bounded(config.queue_length.max(1));
        let metrics = Arc::new(TransportMetrics::default());
        let mut tasks = Vec::new();
        let reader_tasks = Arc::new(Mutex::new(Vec::new()));
        let mut peers: Vec<Option<Peer>> = Vec::with_capacity(config.num_nodes);

        if config.num_nodes > 1 {
            let port = config.listen_port(class);
            let listener = TcpListener::bind(("0.0.0.0", port))
                .await
                .with_context(|| format!("Failed to bind {:?} listener on port {}", class, port))?;
            tracing::info!(?class, port, node = config.node_id, "transport listening");

            tasks.push(tokio::spawn(accept_loop(
                listener,
                inbound_tx,
                metrics.clone(),
                reader_tasks.clone(),
            )));

            for node in 0..config.num_nodes {
                if node == config.node_id {
                    peers.push(None);
                    continue;
                }
                let addr = config.peer_addr(class, node);
                let mut queues = Vec::with_capacity(config.num_sockets);
                for socket in 0..config.num_sockets {
                    let (tx, rx) = mpsc::channel(config.hwm.max(1));
                    queues.push(tx);
                    tasks.push(tokio::spawn(sender_loop(
                        addr.clone(),
                        socket,
                        rx,
                        config.send_timeout,
                        metrics.clone(),
                    )));
                }
                peers.push(Some(Peer {
                    queues,
                    next: AtomicUsize::new(0),
                }));
            }
        } else {
            peers.push(None);
        }

        let push_pull = Arc::new(PushPull {
            class,
            node_id: config.node_id,
            peers,
            metrics,
            tasks: Mutex::new(tasks),
            reader_tasks,
            terminated: AtomicBool::new(false),
        });
        Ok((push_pull, inbound_rx))
    }

    /// Enqueue a message towards `node`, round-robining across that peer's
    /// sockets. Never blocks: a full or closed queue drops the message.
    /// Returns whether the message was accepted.
    pub fn push(&self, node: usize, msg: Message) -> bool {
        if node == self.node_id {
            tracing::warn!(class = ?self.class, node, "refusing to push to self");
            return false;
        }
        let peer = match self.peers.get(node).and_then(|p| p.as_ref()) {
            Some(peer) => peer,
            None => return false,
        };
        let idx = peer.next.fetch_add(1, Ordering::Relaxed) % peer.queues.len();
        match peer.queues[idx].try_send(msg) {
            Ok(()) => true,
            Err(_) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(class = ?self.class, node, "send queue full, dropping message");
                false
            }
        }
    }

    pub fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    pub fn dropped(&self) -> u64 {
        self.metrics.dropped.load(Ordering::Relaxed)
    }

    /// Tear the socket fabric down. Idempotent.
    pub async fn shutdown(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        tasks.extend(std::mem::take(&mut *self.reader_tasks.lock().unwrap()));
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        tracing::debug!(class = ?self.class, "transport shut down");
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound_tx: flume::Sender<Message>,
    metrics: Arc<TransportMetrics>,
    reader_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                tracing::debug!(%peer_addr, "pull connection accepted");
                let handle = tokio::spawn(reader_loop(stream, inbound_tx.clone(), metrics.clone()));
                let mut tasks = reader_tasks.lock().unwrap();
                tasks.retain(|t| !t.is_finished());
                tasks.push(handle);
            }
            Err(e) => {
                tracing::warn!(err = %e, "accept failed");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn reader_loop(
    mut stream: TcpStream,
    inbound_tx: flume::Sender<Message>,
    metrics: Arc<TransportMetrics>,
) {
    loop {
        match wire::read_frame(&mut stream).await {
            Ok(Some(msg)) => {
                metrics.received.fetch_add(1, Ordering::Relaxed);
                if inbound_tx.send_async(msg).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(err = %e, "dropping pull connection");
                return;
            }
        }
    }
}

/// Owns one outbound connection: connects (with retry), then drains its
/// queue. A failed or timed-out write abandons that message and reconnects.
async fn sender_loop(
    addr: String,
    socket: usize,
    mut rx: mpsc::Receiver<Message>,
    send_timeout: Duration,
    metrics: Arc<TransportMetrics>,
) {
    'reconnect: loop {
        let mut stream = loop {
            match TcpStream::connect(&addr).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(RECONNECT_DELAY).await,
            }
        };
        tracing::debug!(%addr, socket, "push connection established");

        while let Some(msg) = rx.recv().await {
            match tokio::time::timeout(send_timeout, wire::write_frame(&mut stream, &msg)).await {
                Ok(Ok(())) => {
                    metrics.sent.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    metrics.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%addr, err = %e, "push failed, reconnecting");
                    continue 'reconnect;
                }
                Err(_) => {
                    metrics.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%addr, timeout = ?send_timeout, "push timed out, reconnecting");
                    continue 'reconnect;
                }
            }
        }
        return; // queue closed
    }
}

// ============================================================================
// EdgePartitioner
// ============================================================================

/// A stage in the local edge pipeline. Consumers are invoked synchronously
/// in registration order.
pub trait FlowConsumer: Send + Sync {
    fn accept(&self, edge: &Arc<Edge>);
}

/// Routes every ingested edge to the nodes owning its endpoints.
///
/// Locally owned copies flow through the registered consumer chain; remote
/// copies ship over the `Partition` socket class. Inbound partition traffic
/// is drained by this partitioner's own pull workers and fed to the same
/// consumer chain.
pub struct EdgePartitioner {
    num_nodes: usize,
    node_id: usize,
    net: Option<Arc<PushPull>>,
    consumers: RwLock<Vec<Arc<dyn FlowConsumer>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl EdgePartitioner {
    /// Create the partitioner and, for multi-node clusters, its socket
    /// fabric and pull workers.
    pub async fn start(config: &TransportConfig, num_pull_threads: usize) -> Result<Arc<Self>> {
        let (net, inbound_rx) = if config.num_nodes > 1 {
            let (net, rx) = PushPull::start(SocketClass::Partition, config).await?;
            (Some(net), Some(rx))
        } else {
            (None, None)
        };

        let partitioner = Arc::new(EdgePartitioner {
            num_nodes: config.num_nodes,
            node_id: config.node_id,
            net,
            consumers: RwLock::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
        });

        if let Some(rx) = inbound_rx {
            let mut workers = partitioner.workers.lock().unwrap();
            for _ in 0..num_pull_threads.max(1) {
                let rx = rx.clone();
                let me = partitioner.clone();
                workers.push(tokio::spawn(async move {
                    while let Ok(msg) = rx.recv_async().await {
                        match msg {
                            Message::Edge(msg) => me.deliver_local(&Arc::new(Edge::from(msg))),
                            Message::Request(_) => {
                                tracing::warn!("edge request on partition class, ignoring");
                            }
                        }
                    }
                }));
            }
        }
        Ok(partitioner)
    }

    /// Append a consumer to the local delivery chain. Order matters:
    /// feature operators are typically registered before the graph store so
    /// constraints see up-to-date features.
    pub fn register_consumer(&self, consumer: Arc<dyn FlowConsumer>) {
        self.consumers.write().unwrap().push(consumer);
    }

    /// Route one edge: local owners receive it through the consumer chain,
    /// remote owners over the wire. An edge whose endpoints are owned by
    /// two different nodes exists on both.
    pub fn consume(&self, edge: Edge) {
        let edge = Arc::new(edge);
        let src_owner = edge.src.owner(self.num_nodes);
        let dst_owner = edge.dst.owner(self.num_nodes);

        if src_owner == self.node_id || dst_owner == self.node_id {
            self.deliver_local(&edge);
        }
        if let Some(net) = &self.net {
            if src_owner != self.node_id {
                net.push(src_owner, Message::Edge(EdgeMessage::from(edge.as_ref())));
            }
            if dst_owner != self.node_id && dst_owner != src_owner {
                net.push(dst_owner, Message::Edge(EdgeMessage::from(edge.as_ref())));
            }
        }
    }

    fn deliver_local(&self, edge: &Arc<Edge>) {
        for consumer in self.consumers.read().unwrap().iter() {
            consumer.accept(edge);
        }
    }

    /// Shut the socket fabric and pull workers down. Idempotent.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(net) = &self.net {
            net.shutdown().await;
        }
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            let _ = worker.await;
        }
    }
}
