//! Subgraph query construction and finalization.
//!
//! Queries are assembled programmatically by appending expressions: edge
//! shapes, time constraints on edge endpoints, and vertex membership
//! constraints. `finalize()` turns the expression soup into a [`QueryPlan`],
//! the ordered sequence of edge slots the matcher advances through, and is
//! mandatory before registration.

use std::collections::HashMap;
use std::sync::Arc;

use crate::edge::Edge;
use crate::error::QueryError;

/// Which timestamp of an edge a time expression constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeFunction {
    StartTime,
    EndTime,
}

/// Comparison in a time expression. `Assignment` on the first slot anchors
/// the query's zero point; elsewhere it is an equality constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOperator {
    Assignment,
    GreaterThan,
    LessThan,
}

/// Membership test in a vertex constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexOperator {
    In,
    NotIn,
}

/// `(src_var)-[edge_var]->(dst_var)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeExpression {
    pub src_var: String,
    pub edge_var: String,
    pub dst_var: String,
}

impl EdgeExpression {
    pub fn new(
        src_var: impl Into<String>,
        edge_var: impl Into<String>,
        dst_var: impl Into<String>,
    ) -> Self {
        EdgeExpression {
            src_var: src_var.into(),
            edge_var: edge_var.into(),
            dst_var: dst_var.into(),
        }
    }
}

/// `function(edge_var) op value`, with `value` in seconds relative to the
/// query's zero point.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeEdgeExpression {
    pub function: EdgeFunction,
    pub edge_var: String,
    pub op: EdgeOperator,
    pub value: f64,
}

impl TimeEdgeExpression {
    pub fn new(
        function: EdgeFunction,
        edge_var: impl Into<String>,
        op: EdgeOperator,
        value: f64,
    ) -> Self {
        TimeEdgeExpression {
            function,
            edge_var: edge_var.into(),
            op,
            value,
        }
    }
}

/// `vertex_var in feature` / `vertex_var not in feature`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexConstraintExpression {
    pub vertex_var: String,
    pub op: VertexOperator,
    pub feature_id: String,
}

impl VertexConstraintExpression {
    pub fn new(
        vertex_var: impl Into<String>,
        op: VertexOperator,
        feature_id: impl Into<String>,
    ) -> Self {
        VertexConstraintExpression {
            vertex_var: vertex_var.into(),
            op,
            feature_id: feature_id.into(),
        }
    }
}

/// Store-assigned identifier of a registered query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "q{}", self.0)
    }
}

// ============================================================================
// Time bounds
// ============================================================================

/// Folded interval constraint on one timestamp, relative to the zero point.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeBound {
    lo: Option<(f64, bool)>,
    hi: Option<(f64, bool)>,
}

impl TimeBound {
    fn tighten_lo(&mut self, value: f64, strict: bool) {
        let replace = match self.lo {
            None => true,
            Some((cur, cur_strict)) => value > cur || (value == cur && strict && !cur_strict),
        };
        if replace {
            self.lo = Some((value, strict));
        }
    }

    fn tighten_hi(&mut self, value: f64, strict: bool) {
        let replace = match self.hi {
            None => true,
            Some((cur, cur_strict)) => value < cur || (value == cur && strict && !cur_strict),
        };
        if replace {
            self.hi = Some((value, strict));
        }
    }

    fn is_contradictory(&self) -> bool {
        match (self.lo, self.hi) {
            (Some((lo, lo_strict)), Some((hi, hi_strict))) => {
                lo > hi || (lo == hi && (lo_strict || hi_strict))
            }
            _ => false,
        }
    }

    /// Does `t` satisfy this bound when the match's zero point is `zero`?
    pub fn admits(&self, t: f64, zero: f64) -> bool {
        if let Some((lo, strict)) = self.lo {
            let bound = zero + lo;
            if t < bound || (strict && t == bound) {
                return false;
            }
        }
        if let Some((hi, strict)) = self.hi {
            let bound = zero + hi;
            if t > bound || (strict && t == bound) {
                return false;
            }
        }
        true
    }

    fn finite_hi(&self) -> Option<f64> {
        self.hi.map(|(v, _)| v)
    }
}

// ============================================================================
// Finalized plan
// ============================================================================

/// Membership predicate attached to a vertex variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexConstraint {
    pub op: VertexOperator,
    pub feature_id: String,
}

/// One edge position in the matching plan.
#[derive(Debug, Clone)]
pub struct QuerySlot {
    pub index: usize,
    pub src_var: String,
    pub edge_var: String,
    pub dst_var: String,
    pub start: TimeBound,
    pub end: TimeBound,
}

/// The finalized form of a query: ordered slots, the anchor that defines the
/// zero point, per-variable vertex constraints, and the largest deadline
/// offset any constraint allows.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub slots: Vec<QuerySlot>,
    pub anchor: EdgeFunction,
    pub anchor_value: f64,
    pub constraints: HashMap<String, Vec<VertexConstraint>>,
    pub max_time_extent: f64,
}

impl QueryPlan {
    /// The zero point a candidate base edge would define.
    pub fn zero_for(&self, edge: &Edge) -> f64 {
        let anchored = match self.anchor {
            EdgeFunction::StartTime => edge.t_start,
            EdgeFunction::EndTime => edge.t_end,
        };
        anchored - self.anchor_value
    }

    pub fn constraints_for(&self, var: &str) -> &[VertexConstraint] {
        self.constraints.get(var).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ============================================================================
// SubgraphQuery
// ============================================================================

/// A query under construction. Append expressions, then call
/// [`SubgraphQuery::finalize`]; registration rejects unfinalized queries.
#[derive(Debug, Clone, Default)]
pub struct SubgraphQuery {
    edges: Vec<EdgeExpression>,
    times: Vec<TimeEdgeExpression>,
    vertices: Vec<VertexConstraintExpression>,
    plan: Option<Arc<QueryPlan>>,
}

impl SubgraphQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge_expression(&mut self, expr: EdgeExpression) -> &mut Self {
        self.plan = None;
        self.edges.push(expr);
        self
    }

    pub fn add_time_expression(&mut self, expr: TimeEdgeExpression) -> &mut Self {
        self.plan = None;
        self.times.push(expr);
        self
    }

    pub fn add_vertex_expression(&mut self, expr: VertexConstraintExpression) -> &mut Self {
        self.plan = None;
        self.vertices.push(expr);
        self
    }

    /// The finalized plan, if `finalize()` has run since the last edit.
    pub fn plan(&self) -> Option<Arc<QueryPlan>> {
        self.plan.clone()
    }

    /// Compute the matching plan. Idempotent: finalizing an already
    /// finalized query returns Ok without recomputation.
    pub fn finalize(&mut self) -> Result<(), QueryError> {
        if self.plan.is_some() {
            return Ok(());
        }

        if self.edges.is_empty() {
            return Err(QueryError::Malformed("query has no edge expressions".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for expr in &self.edges {
            if !seen.insert(expr.edge_var.clone()) {
                return Err(QueryError::Malformed(format!(
                    "edge variable {} declared twice",
                    expr.edge_var
                )));
            }
        }

        let ordered = self.order_slots()?;
        let anchor = self.resolve_anchor(&ordered);

        let mut slots = Vec::with_capacity(ordered.len());
        for (index, expr) in ordered.iter().enumerate() {
            slots.push(QuerySlot {
                index,
                src_var: expr.src_var.clone(),
                edge_var: expr.edge_var.clone(),
                dst_var: expr.dst_var.clone(),
                start: TimeBound::default(),
                end: TimeBound::default(),
            });
        }

        self.fold_time_expressions(&mut slots, anchor)?;

        for slot in &slots {
            if slot.start.is_contradictory() || slot.end.is_contradictory() {
                return Err(QueryError::Malformed(format!(
                    "contradictory time constraints on {}",
                    slot.edge_var
                )));
            }
        }

        let constraints = self.collect_vertex_constraints(&slots)?;

        let max_time_extent = slots
            .iter()
            .flat_map(|s| [s.start.finite_hi(), s.end.finite_hi()])
            .flatten()
            .fold(f64::NEG_INFINITY, f64::max);
        let max_time_extent = if max_time_extent.is_finite() {
            max_time_extent
        } else {
            f64::INFINITY
        };

        self.plan = Some(Arc::new(QueryPlan {
            slots,
            anchor: anchor.0,
            anchor_value: anchor.1,
            constraints,
            max_time_extent,
        }));
        Ok(())
    }

    /// Greedy connected ordering starting from the first declared edge:
    /// repeatedly place the earliest-declared slot sharing a vertex variable
    /// with the slots placed so far.
    fn order_slots(&self) -> Result<Vec<EdgeExpression>, QueryError> {
        let mut remaining: Vec<EdgeExpression> = self.edges.clone();
        let mut ordered = vec![remaining.remove(0)];
        let mut vars: std::collections::HashSet<String> = std::collections::HashSet::new();
        vars.insert(ordered[0].src_var.clone());
        vars.insert(ordered[0].dst_var.clone());

        while !remaining.is_empty() {
            let next = remaining
                .iter()
                .position(|e| vars.contains(&e.src_var) || vars.contains(&e.dst_var));
            match next {
                Some(pos) => {
                    let expr = remaining.remove(pos);
                    vars.insert(expr.src_var.clone());
                    vars.insert(expr.dst_var.clone());
                    ordered.push(expr);
                }
                None => {
                    return Err(QueryError::Malformed(format!(
                        "edge {} shares no vertex variable with the rest of the query",
                        remaining[0].edge_var
                    )));
                }
            }
        }
        Ok(ordered)
    }

    /// The first Assignment expression on the plan's first slot defines the
    /// zero point; absent one, the first edge's start time anchors at 0.
    fn resolve_anchor(&self, ordered: &[EdgeExpression]) -> (EdgeFunction, f64) {
        let first = &ordered[0].edge_var;
        self.times
            .iter()
            .find(|t| t.op == EdgeOperator::Assignment && &t.edge_var == first)
            .map(|t| (t.function, t.value))
            .unwrap_or((EdgeFunction::StartTime, 0.0))
    }

    fn fold_time_expressions(
        &self,
        slots: &mut [QuerySlot],
        anchor: (EdgeFunction, f64),
    ) -> Result<(), QueryError> {
        let mut anchor_consumed = false;
        for expr in &self.times {
            let slot = slots
                .iter_mut()
                .find(|s| s.edge_var == expr.edge_var)
                .ok_or_else(|| {
                    QueryError::Malformed(format!(
                        "time constraint references unknown edge variable {}",
                        expr.edge_var
                    ))
                })?;

            // The anchor expression defines the zero point; it holds by
            // construction and is not folded as a bound.
            if !anchor_consumed
                && slot.index == 0
                && expr.op == EdgeOperator::Assignment
                && expr.function == anchor.0
                && expr.value == anchor.1
            {
                anchor_consumed = true;
                continue;
            }

            let bound = match expr.function {
                EdgeFunction::StartTime => &mut slot.start,
                EdgeFunction::EndTime => &mut slot.end,
            };
            match expr.op {
                EdgeOperator::Assignment => {
                    bound.tighten_lo(expr.value, false);
                    bound.tighten_hi(expr.value, false);
                }
                EdgeOperator::GreaterThan => bound.tighten_lo(expr.value, true),
                EdgeOperator::LessThan => bound.tighten_hi(expr.value, true),
            }
        }
        Ok(())
    }

    fn collect_vertex_constraints(
        &self,
        slots: &[QuerySlot],
    ) -> Result<HashMap<String, Vec<VertexConstraint>>, QueryError> {
        let mut constraints: HashMap<String, Vec<VertexConstraint>> = HashMap::new();
        for expr in &self.vertices {
            let known = slots
                .iter()
                .any(|s| s.src_var == expr.vertex_var || s.dst_var == expr.vertex_var);
            if !known {
                return Err(QueryError::Malformed(format!(
                    "vertex constraint references unknown vertex variable {}",
                    expr.vertex_var
                )));
            }
            constraints
                .entry(expr.vertex_var.clone())
                .or_default()
                .push(VertexConstraint {
                    op: expr.op,
                    feature_id: expr.feature_id.clone(),
                });
        }
        Ok(constraints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_query() -> SubgraphQuery {
        let mut q = SubgraphQuery::new();
        q.add_edge_expression(EdgeExpression::new("y", "e1", "x"));
        q.add_edge_expression(EdgeExpression::new("z", "e2", "x"));
        q.add_time_expression(TimeEdgeExpression::new(
            EdgeFunction::StartTime,
            "e1",
            EdgeOperator::Assignment,
            0.0,
        ));
        q.add_time_expression(TimeEdgeExpression::new(
            EdgeFunction::StartTime,
            "e2",
            EdgeOperator::GreaterThan,
            0.0,
        ));
        q
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut q = chain_query();
        q.finalize().unwrap();
        let first = q.plan().unwrap();
        q.finalize().unwrap();
        assert!(Arc::ptr_eq(&first, &q.plan().unwrap()));
    }

    #[test]
    fn editing_invalidates_the_plan() {
        let mut q = chain_query();
        q.finalize().unwrap();
        q.add_edge_expression(EdgeExpression::new("x", "e3", "w"));
        assert!(q.plan().is_none());
    }

    #[test]
    fn disconnected_slots_are_rejected() {
        let mut q = SubgraphQuery::new();
        q.add_edge_expression(EdgeExpression::new("a", "e1", "b"));
        q.add_edge_expression(EdgeExpression::new("c", "e2", "d"));
        match q.finalize() {
            Err(QueryError::Malformed(reason)) => assert!(reason.contains("e2")),
            other => panic!("expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn out_of_order_chain_is_reordered() {
        let mut q = SubgraphQuery::new();
        q.add_edge_expression(EdgeExpression::new("a", "e1", "b"));
        q.add_edge_expression(EdgeExpression::new("c", "e3", "d"));
        q.add_edge_expression(EdgeExpression::new("b", "e2", "c"));
        q.finalize().unwrap();
        let plan = q.plan().unwrap();
        let order: Vec<&str> = plan.slots.iter().map(|s| s.edge_var.as_str()).collect();
        assert_eq!(order, vec!["e1", "e2", "e3"]);
    }

    #[test]
    fn unknown_edge_variable_is_rejected() {
        let mut q = SubgraphQuery::new();
        q.add_edge_expression(EdgeExpression::new("a", "e1", "b"));
        q.add_time_expression(TimeEdgeExpression::new(
            EdgeFunction::StartTime,
            "e9",
            EdgeOperator::GreaterThan,
            0.0,
        ));
        assert!(matches!(q.finalize(), Err(QueryError::Malformed(_))));
    }

    #[test]
    fn unknown_vertex_variable_is_rejected() {
        let mut q = SubgraphQuery::new();
        q.add_edge_expression(EdgeExpression::new("a", "e1", "b"));
        q.add_vertex_expression(VertexConstraintExpression::new(
            "nobody",
            VertexOperator::In,
            "topk",
        ));
        assert!(matches!(q.finalize(), Err(QueryError::Malformed(_))));
    }

    #[test]
    fn contradictory_bounds_are_rejected() {
        let mut q = SubgraphQuery::new();
        q.add_edge_expression(EdgeExpression::new("a", "e1", "b"));
        q.add_edge_expression(EdgeExpression::new("b", "e2", "c"));
        q.add_time_expression(TimeEdgeExpression::new(
            EdgeFunction::StartTime,
            "e2",
            EdgeOperator::GreaterThan,
            10.0,
        ));
        q.add_time_expression(TimeEdgeExpression::new(
            EdgeFunction::StartTime,
            "e2",
            EdgeOperator::LessThan,
            5.0,
        ));
        match q.finalize() {
            Err(QueryError::Malformed(reason)) => assert!(reason.contains("e2")),
            other => panic!("expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn end_time_assignment_anchors_the_plan() {
        let mut q = SubgraphQuery::new();
        q.add_edge_expression(EdgeExpression::new("target", "e0", "bait"));
        q.add_edge_expression(EdgeExpression::new("target", "e1", "controller"));
        q.add_time_expression(TimeEdgeExpression::new(
            EdgeFunction::EndTime,
            "e0",
            EdgeOperator::Assignment,
            0.0,
        ));
        q.add_time_expression(TimeEdgeExpression::new(
            EdgeFunction::StartTime,
            "e1",
            EdgeOperator::GreaterThan,
            0.0,
        ));
        q.add_time_expression(TimeEdgeExpression::new(
            EdgeFunction::StartTime,
            "e1",
            EdgeOperator::LessThan,
            10.0,
        ));
        q.finalize().unwrap();

        let plan = q.plan().unwrap();
        assert_eq!(plan.anchor, EdgeFunction::EndTime);
        assert_eq!(plan.max_time_extent, 10.0);
        // e1 must start strictly inside (zero, zero + 10).
        assert!(!plan.slots[1].start.admits(5.0, 5.0));
        assert!(plan.slots[1].start.admits(6.0, 5.0));
        assert!(!plan.slots[1].start.admits(15.0, 5.0));
    }

    #[test]
    fn max_extent_defaults_to_infinity() {
        let mut q = chain_query();
        q.finalize().unwrap();
        assert!(q.plan().unwrap().max_time_extent.is_infinite());
    }
}
