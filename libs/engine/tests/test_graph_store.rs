//! Integration tests for the per-node graph store: query gating, the
//! single- and multi-edge matching scenarios, timestamp strictness, and the
//! two-node silent cluster.

use std::sync::Arc;

use weir_engine::generators::UniformDestPort;
use weir_engine::{
    Edge, EdgeExpression, EdgeFunction, EdgeOperator, FlowTuple, GraphStore, GraphStoreConfig,
    NullFeatureLookup, QueryError, SubgraphQuery, TimeEdgeExpression,
};

fn single_node_config() -> GraphStoreConfig {
    GraphStoreConfig {
        results_capacity: 1000,
        time_window: 100.0,
        ..Default::default()
    }
}

async fn single_node_store() -> Arc<GraphStore> {
    GraphStore::start(single_node_config(), Arc::new(NullFeatureLookup))
        .await
        .unwrap()
}

/// `(y)-[e1]->(x)` anchored at `start(e1) = 0`: every edge matches.
fn single_edge_query() -> SubgraphQuery {
    let mut query = SubgraphQuery::new();
    query.add_time_expression(TimeEdgeExpression::new(
        EdgeFunction::StartTime,
        "e1",
        EdgeOperator::Assignment,
        0.0,
    ));
    query.add_edge_expression(EdgeExpression::new("nodey", "e1", "nodex"));
    query
}

fn flow(id: u64, src: &str, dst: &str, t: f64) -> Edge {
    Edge::from_tuple(
        id,
        FlowTuple {
            time: t,
            src_ip: src.into(),
            dst_ip: dst.into(),
            src_port: 51482,
            dst_port: 40020,
            protocol: "tcp".into(),
            duration: 1.0,
            src_bytes: 1,
            dst_bytes: 1,
        },
    )
}

#[tokio::test]
async fn register_rejects_unfinalized_query() {
    let store = single_node_store().await;
    let mut query = single_edge_query();

    assert!(matches!(
        store.register_query(&query),
        Err(QueryError::NotFinalized)
    ));

    query.finalize().unwrap();
    store.register_query(&query).unwrap();
    // Finalizing again is a no-op.
    query.finalize().unwrap();
    store.terminate().await;
}

#[tokio::test]
async fn single_edge_query_matches_every_flow() {
    let store = single_node_store().await;
    let mut query = single_edge_query();
    query.finalize().unwrap();
    store.register_query(&query).unwrap();

    let mut generator = UniformDestPort::new("192.168.0.2", 1, 11);
    let n = 1000;
    for i in 0..n {
        let tuple = generator.generate(i as f64 * 0.01);
        store.consume(Edge::from_tuple(i, tuple)).unwrap();
    }
    store.terminate().await;

    assert_eq!(store.num_results(), n as usize);
}

#[tokio::test]
async fn double_terminate_is_a_no_op() {
    let store = single_node_store().await;
    store.terminate().await;
    store.terminate().await;
    assert!(store.is_terminated());
}

#[tokio::test]
async fn consume_after_terminate_is_refused() {
    let store = single_node_store().await;
    store.terminate().await;
    let err = store.consume(flow(0, "a", "b", 0.0)).unwrap_err();
    assert_eq!(err, weir_engine::StoreError::Terminated);
}

#[tokio::test]
async fn impossible_end_constraint_matches_nothing() {
    let store = single_node_store().await;
    let mut query = single_edge_query();
    // end(e1) must equal the zero point exactly; flows last one second.
    query.add_time_expression(TimeEdgeExpression::new(
        EdgeFunction::EndTime,
        "e1",
        EdgeOperator::Assignment,
        0.0,
    ));
    query.finalize().unwrap();
    store.register_query(&query).unwrap();

    let mut generator = UniformDestPort::new("192.168.0.2", 1, 13);
    for i in 0..10_000u64 {
        let tuple = generator.generate(i as f64 * 0.01);
        store.consume(Edge::from_tuple(i, tuple)).unwrap();
    }
    store.terminate().await;

    assert_eq!(store.num_results(), 0);
}

#[tokio::test]
async fn connected_pair_query_produces_all_pairs() {
    let store = single_node_store().await;

    // (y)-[e1]->(x), (z)-[e2]->(x) with e2 strictly after the anchor.
    let mut query = SubgraphQuery::new();
    query.add_time_expression(TimeEdgeExpression::new(
        EdgeFunction::StartTime,
        "e1",
        EdgeOperator::Assignment,
        0.0,
    ));
    query.add_time_expression(TimeEdgeExpression::new(
        EdgeFunction::StartTime,
        "e2",
        EdgeOperator::GreaterThan,
        0.0,
    ));
    query.add_edge_expression(EdgeExpression::new("nodey", "e1", "nodex"));
    query.add_edge_expression(EdgeExpression::new("nodez", "e2", "nodex"));
    query.finalize().unwrap();
    store.register_query(&query).unwrap();

    let mut generator = UniformDestPort::new("192.168.0.2", 1, 17);
    let n = 3u64;
    for i in 0..n {
        let tuple = generator.generate(i as f64 * 0.01);
        store.consume(Edge::from_tuple(i, tuple)).unwrap();
    }
    store.terminate().await;

    // Every unordered pair of distinct edges sharing x matches once.
    assert_eq!(store.num_results() as u64, n * (n - 1) / 2);
}

#[tokio::test]
async fn tied_timestamps_never_complete_a_triangle() {
    let store = single_node_store().await;

    let window = 10.0;
    let mut query = SubgraphQuery::new();
    query.add_edge_expression(EdgeExpression::new("nodex", "e0", "nodey"));
    query.add_edge_expression(EdgeExpression::new("nodey", "e1", "nodez"));
    query.add_edge_expression(EdgeExpression::new("nodez", "e2", "nodex"));
    query.add_time_expression(TimeEdgeExpression::new(
        EdgeFunction::StartTime,
        "e0",
        EdgeOperator::Assignment,
        0.0,
    ));
    for var in ["e1", "e2"] {
        query.add_time_expression(TimeEdgeExpression::new(
            EdgeFunction::StartTime,
            var,
            EdgeOperator::GreaterThan,
            0.0,
        ));
    }
    for var in ["e0", "e1", "e2"] {
        query.add_time_expression(TimeEdgeExpression::new(
            EdgeFunction::StartTime,
            var,
            EdgeOperator::LessThan,
            window,
        ));
        query.add_time_expression(TimeEdgeExpression::new(
            EdgeFunction::EndTime,
            var,
            EdgeOperator::LessThan,
            window,
        ));
    }
    query.finalize().unwrap();
    store.register_query(&query).unwrap();

    // Two triangles; in each, two edges carry identical start times.
    store.consume(flow(0, "node1", "node2", 0.47000000000000025)).unwrap();
    store.consume(flow(1, "node2", "node3", 0.52000000000000024)).unwrap();
    store.consume(flow(2, "node3", "node1", 0.52000000000000024)).unwrap();
    store.consume(flow(3, "node4", "node5", 0.47000000000000025)).unwrap();
    store.consume(flow(4, "node5", "node6", 0.47000000000000025)).unwrap();
    store.consume(flow(5, "node6", "node4", 0.52000000000000024)).unwrap();
    store.terminate().await;

    assert_eq!(store.num_results(), 0);
}

#[tokio::test]
async fn sweep_reclaims_state_behind_the_window() {
    let config = GraphStoreConfig {
        time_window: 10.0,
        ..Default::default()
    };
    let store = GraphStore::start(config, Arc::new(NullFeatureLookup)).await.unwrap();

    let mut query = SubgraphQuery::new();
    query.add_edge_expression(EdgeExpression::new("nodey", "e1", "nodex"));
    query.add_edge_expression(EdgeExpression::new("nodez", "e2", "nodex"));
    query.finalize().unwrap();
    store.register_query(&query).unwrap();

    store.consume(flow(0, "a", "x", 0.0)).unwrap();
    assert_eq!(store.num_partial_matches(), 1);

    // Jump stream time far past the first edge's window.
    store.consume(flow(1, "b", "elsewhere", 50.0)).unwrap();
    let counts = store.sweep_expired();

    assert_eq!(counts.edges, 1);
    assert_eq!(counts.index_slots, 2);
    assert_eq!(counts.matches, 1);
    // The t=50 seed is still live.
    assert_eq!(store.num_partial_matches(), 1);
    store.terminate().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn two_node_cluster_without_queries_stays_silent() {
    let hostnames = vec!["127.0.0.1".to_string(), "127.0.0.1".to_string()];
    let config = |node_id| GraphStoreConfig {
        num_nodes: 2,
        node_id,
        hostnames: hostnames.clone(),
        starting_port: 17000,
        time_window: 100.0,
        ..Default::default()
    };

    let store0 = GraphStore::start(config(0), Arc::new(NullFeatureLookup)).await.unwrap();
    let store1 = GraphStore::start(config(1), Arc::new(NullFeatureLookup)).await.unwrap();

    let mut generator0 = UniformDestPort::new("192.168.0.0", 1, 23);
    let mut generator1 = UniformDestPort::new("192.168.0.1", 1, 29);
    for i in 0..1000u64 {
        let t = i as f64 * 0.01;
        store0.consume(Edge::from_tuple(i, generator0.generate(t))).unwrap();
        store1.consume(Edge::from_tuple(i, generator1.generate(t))).unwrap();
    }

    store0.terminate().await;
    store1.terminate().await;

    // No query ever forced communication.
    assert_eq!(store0.total_edge_pulls(), 0);
    assert_eq!(store1.total_edge_pulls(), 0);
}
