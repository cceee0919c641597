//! End-to-end watering-hole detection: a top-k feature over destination
//! vertices feeds the query's vertex constraints while the store matches
//! the two-edge infection pattern.

use std::sync::Arc;

use weir_engine::generators::WateringHoleGenerator;
use weir_engine::{
    Edge, EdgeExpression, EdgeFunction, EdgeOperator, EdgePartitioner, FeatureMap, FlowTuple,
    GraphStore, GraphStoreConfig, Role, SubgraphQuery, TimeEdgeExpression, TopK,
    VertexConstraintExpression, VertexOperator,
};

/// Deterministic stream time and edge-id assignment.
struct StreamClock {
    time: f64,
    increment: f64,
    next_id: u64,
}

impl StreamClock {
    fn send(&mut self, partitioner: &EdgePartitioner, tuple: FlowTuple) {
        partitioner.consume(Edge::from_tuple(self.next_id, tuple));
        self.next_id += 1;
        self.time += self.increment;
    }
}

#[tokio::test]
async fn watering_hole_flows_are_detected() {
    let num_clients = 1000;
    let num_servers = 5;
    let num_benign = 100;
    let num_bad_messages = 5;

    let config = GraphStoreConfig {
        graph_capacity: 100_000,
        table_capacity: 100_000,
        results_capacity: 1000,
        time_window: 10_000.0,
        ..Default::default()
    };

    let feature_map = Arc::new(FeatureMap::new(10_000));
    let store = GraphStore::start(config.clone(), feature_map.clone()).await.unwrap();
    let partitioner = EdgePartitioner::start(&config.transport(), 1).await.unwrap();

    // The top-k of visited servers updates before the store sees each edge.
    let topk = Arc::new(TopK::new("topk", Role::Target, 1000, num_servers, feature_map));
    partitioner.register_consumer(topk);
    partitioner.register_consumer(store.clone());

    // target visits a popular bait server; right after that flow ends, it
    // contacts a controller nobody popular ever sees.
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
        10.0,
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
    query.finalize().unwrap();
    store.register_query(&query).unwrap();

    let mut generator = WateringHoleGenerator::new(num_clients, num_servers, 31);
    let increment = 0.01;
    let mut clock = StreamClock { time: 0.0, increment, next_id: 0 };

    // Benign traffic populates the top-k with the five servers.
    for _ in 0..num_benign {
        let tuple = generator.generate(clock.time);
        clock.send(&partitioner, tuple);
    }

    // The infection flow: target visits the bait for one second.
    let tuple = generator.generate_infection(clock.time);
    clock.send(&partitioner, tuple);

    // Enough benign traffic to cover the infection flow's duration, so the
    // malicious messages start after it ends.
    let gap = (1.0 / increment) as usize + 1;
    for _ in 0..gap {
        let tuple = generator.generate(clock.time);
        clock.send(&partitioner, tuple);
    }

    store.clear_results();

    for _ in 0..num_bad_messages {
        let tuple = generator.generate_control_message(clock.time);
        clock.send(&partitioner, tuple);
    }

    for _ in 0..num_benign {
        let tuple = generator.generate(clock.time);
        clock.send(&partitioner, tuple);
    }

    partitioner.terminate().await;
    store.terminate().await;

    assert_eq!(store.num_results(), num_bad_messages);
    for m in store.results() {
        assert!(m
            .bindings
            .iter()
            .any(|(var, v)| var == "target" && v.as_str() == "infected"));
        assert!(m
            .bindings
            .iter()
            .any(|(var, v)| var == "controller" && v.as_str() == "controller"));
    }
}
