//! Partial matches: in-progress bindings of a query plan's slot prefix.
//!
//! A match is born when an edge satisfies a plan's first slot, grows one
//! slot at a time, and either completes (all slots bound) or expires at its
//! deadline. Extension is by value: the source match stays where it is, so
//! one resident can fan out into many extensions (cartesian semantics).

use std::sync::Arc;

use crate::edge::{Edge, Role, VertexId};
use crate::features::{FeatureLookup, Membership};
use crate::query::{QueryId, QueryPlan, QuerySlot, VertexOperator};

/// A fully bound match, delivered to the results queue.
#[derive(Debug, Clone)]
pub struct CompletedMatch {
    pub query_id: QueryId,
    pub edges: Vec<Arc<Edge>>,
    pub bindings: Vec<(String, VertexId)>,
}

/// A next-slot fingerprint vertex owned by a remote node; the store turns
/// these into edge requests.
#[derive(Debug, Clone)]
pub struct Lead {
    pub vertex: VertexId,
    pub role: Role,
    pub t_lo: f64,
    pub t_hi: f64,
}

/// Ordered binding of edges to the first `k` slots of a plan.
#[derive(Debug, Clone)]
pub struct PartialMatch {
    query_id: QueryId,
    plan: Arc<QueryPlan>,
    edges: Vec<Arc<Edge>>,
    bindings: Vec<(String, VertexId)>,
    zero: f64,
    deadline: f64,
}

impl PartialMatch {
    /// Bind `edge` to the plan's first slot, if it is admitted. Single-slot
    /// plans produce a match that is immediately complete.
    pub fn seed(
        query_id: QueryId,
        plan: &Arc<QueryPlan>,
        edge: &Arc<Edge>,
        time_window: f64,
        features: &dyn FeatureLookup,
    ) -> Option<PartialMatch> {
        let zero = plan.zero_for(edge);
        let slot = &plan.slots[0];
        if !slot.start.admits(edge.t_start, zero) || !slot.end.admits(edge.t_end, zero) {
            return None;
        }

        let mut bindings = Vec::with_capacity(plan.slots.len() + 1);
        bind(&mut bindings, &slot.src_var, &edge.src)?;
        bind(&mut bindings, &slot.dst_var, &edge.dst)?;
        check_constraints(plan, &slot.src_var, &edge.src, features)?;
        if slot.dst_var != slot.src_var {
            check_constraints(plan, &slot.dst_var, &edge.dst, features)?;
        }

        let deadline = (zero + plan.max_time_extent).min(edge.t_start + time_window);
        Some(PartialMatch {
            query_id,
            plan: plan.clone(),
            edges: vec![edge.clone()],
            bindings,
            zero,
            deadline,
        })
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn deadline(&self) -> f64 {
        self.deadline
    }

    pub fn is_complete(&self) -> bool {
        self.edges.len() == self.plan.slots.len()
    }

    pub fn next_slot(&self) -> Option<&QuerySlot> {
        self.plan.slots.get(self.edges.len())
    }

    fn binding(&self, var: &str) -> Option<&VertexId> {
        self.bindings
            .iter()
            .find(|(name, _)| name == var)
            .map(|(_, v)| v)
    }

    /// The fingerprint the next admissible edge must carry: a concrete
    /// vertex and the role it occupies. Source is preferred when both
    /// endpoints are already bound, so each match registers exactly once.
    pub fn expected(&self) -> Option<(VertexId, Role)> {
        let slot = self.next_slot()?;
        if let Some(v) = self.binding(&slot.src_var) {
            return Some((v.clone(), Role::Source));
        }
        self.binding(&slot.dst_var).map(|v| (v.clone(), Role::Target))
    }

    /// An edge request lead, present when the fingerprint vertex is owned
    /// by another node. Edges carrying that vertex are partitioned to its
    /// owner, so they only ever reach this node by request.
    pub fn remote_lead(&self, num_nodes: usize, node_id: usize) -> Option<Lead> {
        let (vertex, role) = self.expected()?;
        if vertex.owner(num_nodes) == node_id {
            return None;
        }
        let t_lo = self.edges.last().map(|e| e.t_start).unwrap_or(self.zero);
        Some(Lead {
            vertex,
            role,
            t_lo,
            t_hi: self.deadline,
        })
    }

    /// Attempt to bind `edge` to the next slot, producing an extended copy.
    ///
    /// Rejects: a reused edge id, a `t_start` not strictly after the last
    /// bound edge, timestamps outside the slot's bounds or past the
    /// deadline, endpoint mismatches against existing bindings, and failed
    /// vertex constraints on newly bound variables.
    pub fn extend(&self, edge: &Arc<Edge>, features: &dyn FeatureLookup) -> Option<PartialMatch> {
        let slot = self.next_slot()?;

        if self.edges.iter().any(|e| e.id == edge.id) {
            return None;
        }
        let last_start = self.edges.last().map(|e| e.t_start).unwrap_or(f64::NEG_INFINITY);
        if edge.t_start <= last_start || edge.t_start > self.deadline {
            return None;
        }
        if !slot.start.admits(edge.t_start, self.zero) || !slot.end.admits(edge.t_end, self.zero) {
            return None;
        }

        let mut bindings = self.bindings.clone();
        let src_new = bind_checked(&mut bindings, &slot.src_var, &edge.src)?;
        let dst_new = bind_checked(&mut bindings, &slot.dst_var, &edge.dst)?;
        if src_new {
            check_constraints(&self.plan, &slot.src_var, &edge.src, features)?;
        }
        if dst_new && slot.dst_var != slot.src_var {
            check_constraints(&self.plan, &slot.dst_var, &edge.dst, features)?;
        }

        let mut edges = self.edges.clone();
        edges.push(edge.clone());
        Some(PartialMatch {
            query_id: self.query_id,
            plan: self.plan.clone(),
            edges,
            bindings,
            zero: self.zero,
            deadline: self.deadline,
        })
    }

    pub fn into_completed(self) -> CompletedMatch {
        CompletedMatch {
            query_id: self.query_id,
            edges: self.edges,
            bindings: self.bindings,
        }
    }
}

/// Bind `var` to `vertex`, failing on a conflicting existing binding.
/// Variables bind non-injectively: two variables may hold the same vertex.
fn bind(bindings: &mut Vec<(String, VertexId)>, var: &str, vertex: &VertexId) -> Option<()> {
    match bindings.iter().find(|(name, _)| name == var) {
        Some((_, bound)) if bound == vertex => Some(()),
        Some(_) => None,
        None => {
            bindings.push((var.to_string(), vertex.clone()));
            Some(())
        }
    }
}

/// Like [`bind`], also reporting whether the binding is new.
fn bind_checked(
    bindings: &mut Vec<(String, VertexId)>,
    var: &str,
    vertex: &VertexId,
) -> Option<bool> {
    match bindings.iter().find(|(name, _)| name == var) {
        Some((_, bound)) if bound == vertex => Some(false),
        Some(_) => None,
        None => {
            bindings.push((var.to_string(), vertex.clone()));
            Some(true)
        }
    }
}

fn check_constraints(
    plan: &QueryPlan,
    var: &str,
    vertex: &VertexId,
    features: &dyn FeatureLookup,
) -> Option<()> {
    for constraint in plan.constraints_for(var) {
        let membership = features.membership(&constraint.feature_id, vertex.as_str());
        let satisfied = match constraint.op {
            VertexOperator::In => membership == Membership::In,
            // Unknown is conservative: an absent feature matches nothing.
            VertexOperator::NotIn => membership == Membership::NotIn,
        };
        if !satisfied {
            return None;
        }
    }
    Some(())
}
