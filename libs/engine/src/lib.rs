//! Streaming subgraph matching over flow-record edge streams.
//!
//! Each cluster node runs a [`GraphStore`]: it materializes its partition
//! of the edge stream in a sliding time window (CSR/CSC indexes over a
//! shared edge arena), advances partial matches of registered
//! [`SubgraphQuery`]s, answers edge requests from peers, and delivers
//! completed matches to a local results queue.
//!
//! ## Module structure
//!
//! - `edge`, `tuple` - edge records and the flow tuple schema
//! - `arena` - shared edge ownership, keyed by edge id
//! - `index` - the CSR/CSC bucket indexes
//! - `query`, `partial`, `result_map` - query plans and match advancement
//! - `request_map` - outstanding neighbor requests from peers
//! - `wire`, `transport` - framed codec and the push/pull socket fabric
//! - `store` - the per-node façade binding it all together
//! - `features` - vertex feature lookup (top-k and friends)
//! - `sweep` - background expiry
//! - `generators` - synthetic flow streams for tests and demos

pub mod arena;
pub mod edge;
pub mod error;
pub mod features;
pub mod generators;
pub mod index;
pub mod partial;
pub mod query;
pub mod request_map;
pub mod result_map;
pub mod store;
pub mod sweep;
pub mod transport;
pub mod tuple;
pub mod wire;

pub use edge::{Edge, EdgeId, Role, VertexId};
pub use error::{QueryError, StoreError};
pub use features::{Feature, FeatureLookup, FeatureMap, Membership, NullFeatureLookup, TopK};
pub use partial::CompletedMatch;
pub use query::{
    EdgeExpression, EdgeFunction, EdgeOperator, QueryId, SubgraphQuery, TimeEdgeExpression,
    VertexConstraintExpression, VertexOperator,
};
pub use store::{GraphStore, GraphStoreConfig};
pub use sweep::{SweepConfig, Sweeper};
pub use transport::{EdgePartitioner, FlowConsumer, TransportConfig};
pub use tuple::FlowTuple;
