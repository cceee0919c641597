//! weir - run one streaming subgraph matching node.
//!
//! Reads CSV flow records from `--input`, partitions them across the
//! cluster, maintains the sliding-window graph, and writes completed
//! matches to `--output`. Exit codes: 0 on a clean run, 1 on a usage
//! error, -1 when input/output cannot be opened or the transport cannot
//! be established.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use weir_engine::{
    Edge, EdgeExpression, EdgeFunction, EdgeOperator, EdgePartitioner, FeatureMap, FlowTuple,
    GraphStore, GraphStoreConfig, Role, SubgraphQuery, SweepConfig, Sweeper, TimeEdgeExpression,
    TopK, VertexConstraintExpression, VertexOperator,
};

#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Parser)]
#[clap(version, about = "Streaming subgraph matching node")]
struct Cli {
    /// Total number of nodes in the cluster.
    #[clap(long, default_value_t = 1)]
    num_nodes: usize,

    /// This node's id in [0, num_nodes).
    #[clap(long, default_value_t = 0)]
    node_id: usize,

    /// Hostname prefix; node i resolves to "<prefix><i>". Single-node runs
    /// use 127.0.0.1.
    #[clap(long, default_value = "node")]
    prefix: String,

    /// First port of the transport's contiguous port blocks.
    #[clap(long, default_value_t = 10000)]
    starting_port: u16,

    /// Bucket slots in the CSR and CSC indexes.
    #[clap(long, default_value_t = 100_000)]
    graph_capacity: usize,

    /// Bucket slots in the match and edge-request tables.
    #[clap(long, default_value_t = 1000)]
    table_capacity: usize,

    /// Bucket slots in the feature map.
    #[clap(long, default_value_t = 10_000)]
    feature_capacity: usize,

    /// Bound on completed matches retained in memory.
    #[clap(long, default_value_t = 1000)]
    results_capacity: usize,

    /// Per-socket send-queue bound; overflow drops.
    #[clap(long, default_value_t = 10_000)]
    hwm: usize,

    /// Push-socket send timeout in milliseconds.
    #[clap(long, default_value_t = 1000)]
    timeout: u64,

    /// Sliding window in stream seconds.
    #[clap(long, default_value_t = 10.0)]
    time_window: f64,

    /// Inbound buffer between socket readers and pull workers.
    #[clap(long, default_value_t = 1000)]
    queue_length: usize,

    /// Push sockets per peer node.
    #[clap(long, default_value_t = 1)]
    num_sockets: usize,

    /// Pull workers draining remote edge traffic.
    #[clap(long, default_value_t = 1)]
    num_pull_threads: usize,

    /// Register the built-in watering-hole detection query over a top-k
    /// feature of this size (0 disables the query).
    #[clap(long, default_value_t = 0)]
    watering_hole_k: usize,

    /// Observations in the top-k sliding window.
    #[clap(long, default_value_t = 1000)]
    topk_window: usize,

    /// CSV flow records to ingest.
    #[clap(long)]
    input: PathBuf,

    /// Where completed matches are written.
    #[clap(long)]
    output: PathBuf,
}

#[tokio::main]
async fn main() {
    weir_core::telemetry::init_dev_subscriber_with_env_filter();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli).await {
        error!("node failed: {:#}", e);
        std::process::exit(-1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let input = std::fs::File::open(&cli.input)
        .with_context(|| format!("Failed to open input {}", cli.input.display()))?;
    let mut output = std::fs::File::create(&cli.output)
        .with_context(|| format!("Failed to create output {}", cli.output.display()))?;

    let hostnames = if cli.num_nodes == 1 {
        vec!["127.0.0.1".to_string()]
    } else {
        (0..cli.num_nodes).map(|i| format!("{}{}", cli.prefix, i)).collect()
    };

    let config = GraphStoreConfig {
        num_nodes: cli.num_nodes,
        node_id: cli.node_id,
        hostnames,
        starting_port: cli.starting_port,
        graph_capacity: cli.graph_capacity,
        table_capacity: cli.table_capacity,
        results_capacity: cli.results_capacity,
        num_sockets: cli.num_sockets,
        num_pull_threads: cli.num_pull_threads,
        hwm: cli.hwm,
        send_timeout_ms: cli.timeout,
        time_window: cli.time_window,
        queue_length: cli.queue_length,
    };

    let feature_map = Arc::new(FeatureMap::new(cli.feature_capacity));
    let store = GraphStore::start(config.clone(), feature_map.clone())
        .await
        .context("Failed to establish the graph store transport")?;
    let partitioner = EdgePartitioner::start(&config.transport(), cli.num_pull_threads)
        .await
        .context("Failed to establish the partitioner transport")?;

    let topk = Arc::new(TopK::new(
        "topk",
        Role::Target,
        cli.topk_window,
        cli.watering_hole_k.max(1),
        feature_map.clone(),
    ));
    // Features update before the store sees each edge.
    partitioner.register_consumer(topk);
    partitioner.register_consumer(store.clone());

    if cli.watering_hole_k > 0 {
        let query = watering_hole_query(cli.time_window);
        let id = store
            .register_query(&query)
            .context("Failed to register the watering-hole query")?;
        info!(query = %id, k = cli.watering_hole_k, "watering-hole query registered");
    }

    let sweeper = Sweeper::new(store.clone(), SweepConfig::default());
    let sweeper_handle = sweeper.spawn_worker();

    let started = std::time::Instant::now();
    let mut ingested = 0u64;
    let mut malformed = 0u64;
    let reader = std::io::BufReader::new(input);
    for (line_no, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                store.ingest_failed(&format!("input read error: {}", e)).await;
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match FlowTuple::parse_csv(&line) {
            Ok(tuple) => {
                partitioner.consume(Edge::from_tuple(line_no as u64, tuple));
                ingested += 1;
            }
            Err(e) => {
                malformed += 1;
                warn!(line = line_no, err = %e, "skipping malformed flow record");
            }
        }
    }

    partitioner.terminate().await;
    store.terminate().await;
    sweeper.shutdown();
    let _ = sweeper_handle.await;

    for m in store.results() {
        let edges: Vec<String> = m.edges.iter().map(|e| e.id.to_string()).collect();
        let bindings: Vec<String> = m
            .bindings
            .iter()
            .map(|(var, vertex)| format!("{}={}", var, vertex))
            .collect();
        writeln!(output, "{} edges=[{}] {}", m.query_id, edges.join(","), bindings.join(" "))
            .context("Failed to write results")?;
    }

    info!(
        node = cli.node_id,
        ingested,
        malformed,
        results = store.num_results(),
        edge_pulls = store.total_edge_pulls(),
        dropped_sends = store.dropped_sends(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "run complete"
    );
    Ok(())
}

/// The canonical watering-hole pattern: the victim visits a popular server
/// (the bait), then contacts an unpopular controller right after that flow
/// ends.
fn watering_hole_query(window: f64) -> SubgraphQuery {
    let mut query = SubgraphQuery::new();
    query.add_edge_expression(EdgeExpression::new("target", "e0", "bait"));
    query.add_edge_expression(EdgeExpression::new("target", "e1", "controller"));
    query.add_time_expression(TimeEdgeExpression::new(
        EdgeFunction::EndTime,
        "e0",
        EdgeOperator::Assignment,
        0.0,
    ));
    query.add_time_expression(TimeEdgeExpression::new(
        EdgeFunction::StartTime,
        "e1",
        EdgeOperator::GreaterThan,
        0.0,
    ));
    query.add_time_expression(TimeEdgeExpression::new(
        EdgeFunction::StartTime,
        "e1",
        EdgeOperator::LessThan,
        window,
    ));
    query.add_vertex_expression(VertexConstraintExpression::new(
        "bait",
        VertexOperator::In,
        "topk",
    ));
    query.add_vertex_expression(VertexConstraintExpression::new(
        "controller",
        VertexOperator::NotIn,
        "topk",
    ));
    query.finalize().expect("built-in query is well formed");
    query
}
