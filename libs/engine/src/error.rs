//! Error types surfaced to callers.
//!
//! Pipeline and transport layers use `anyhow::Result`; the enums here cover
//! the failures callers are expected to branch on.

/// Errors raised while building or registering a subgraph query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// `register_query` was called before `finalize()`.
    NotFinalized,
    /// `finalize()` rejected the query (disconnected slots, unbound
    /// variables, contradictory time constraints).
    Malformed(String),
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::NotFinalized => write!(f, "query has not been finalized"),
            QueryError::Malformed(reason) => write!(f, "malformed query: {}", reason),
        }
    }
}

impl std::error::Error for QueryError {}

/// Errors raised by the graph store itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store is terminating or terminated; `consume` is no longer legal.
    Terminated,
    /// The upstream source disconnected; the local engine shuts down.
    IngestFailed(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Terminated => write!(f, "graph store is terminated"),
            StoreError::IngestFailed(reason) => write!(f, "ingest failed: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_reason() {
        let err = QueryError::Malformed("slot e2 shares no vertex".to_string());
        assert!(err.to_string().contains("e2"));
        assert_eq!(StoreError::Terminated.to_string(), "graph store is terminated");
    }
}
