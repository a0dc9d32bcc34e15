//! Cycle checking for bundles.
//!
//! A bundle executes as one scheduling unit. Contracting its nodes into a single
//! vertex can create a cycle even when the node graph is acyclic: e.g. when a
//! path leaves the bundle and re-enters it through an outside node. The
//! [Validator] contracts every accepted bundle plus a proposed one into a
//! [DiGraphMap] over [Unit]s and rejects the proposal if that graph has no
//! topological order.

use log::{debug, trace};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::bundlizer::BundleId;
use crate::graph::{Graph, NodeId};
use crate::utils::layered_toposort;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum BundleState {
    Proposed,
    /// The bundle's nodes are all still available.
    Validated,
    /// Contracting the bundle together with all accepted bundles is acyclic.
    Accepted,
    Rejected,
}

/// A vertex of the contracted graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub enum Unit {
    Bundle(BundleId),
    Node(NodeId),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("node {0} already belongs to an accepted bundle")]
    Claimed(NodeId),
    #[error("contracting the bundle closes a cycle through {0:?}")]
    Cycle(Vec<NodeId>),
}

pub struct Validator<'g> {
    graph: &'g Graph,
    owner: HashMap<NodeId, BundleId>,
    bundles: Vec<(BundleId, Vec<NodeId>)>,
    extra_edges: Vec<(NodeId, NodeId)>,
}

const PROPOSED: BundleId = BundleId(u32::MAX);

impl<'g> Validator<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Validator {
            graph,
            owner: HashMap::new(),
            bundles: vec![],
            extra_edges: vec![],
        }
    }

    pub fn owner(&self, node: NodeId) -> Option<BundleId> {
        self.owner.get(&node).copied()
    }

    pub fn is_claimed(&self, node: NodeId) -> bool {
        self.owner.contains_key(&node)
    }

    pub fn extra_edges(&self) -> &[(NodeId, NodeId)] {
        &self.extra_edges
    }

    /// Run a proposed bundle through Proposed → Validated → Accepted without
    /// recording it.
    ///
    /// On a cycle, the returned error lists the proposed bundle's nodes at
    /// either end of an edge on a cycle through it.
    pub fn check(&self, members: &[NodeId]) -> Result<BundleState, ValidationError> {
        trace!("Validating {:?}", members);
        if let Some(&n) = members.iter().find(|n| self.owner.contains_key(n)) {
            return Err(ValidationError::Claimed(n));
        }
        if members.len() > 1 {
            let units = self.unit_map(Some(members));
            let dag = self.contract(&units);
            if toposort(&dag, None).is_err() {
                let on_cycle = self.cycle_witness(&units, &dag, members);
                debug!("Bundle {:?} would close a cycle through {:?}", members, on_cycle);
                return Err(ValidationError::Cycle(on_cycle));
            }
        }
        Ok(BundleState::Accepted)
    }

    /// Record a bundle which passed [Validator::check].
    pub fn accept(&mut self, id: BundleId, members: &[NodeId]) {
        debug_assert!(self.check(members).is_ok());
        for &n in members {
            self.owner.insert(n, id);
        }
        self.bundles.push((id, members.to_vec()));
    }

    /// Forget a previously accepted bundle. Its nodes become free again.
    pub fn release(&mut self, id: BundleId) {
        self.bundles.retain(|(b, _)| *b != id);
        self.owner.retain(|_, b| *b != id);
    }

    /// Order `to` after `from` if doing so keeps the contracted graph acyclic.
    pub fn try_add_control_edge(&mut self, from: NodeId, to: NodeId) -> bool {
        self.extra_edges.push((from, to));
        let units = self.unit_map(None);
        if toposort(&self.contract(&units), None).is_err() {
            self.extra_edges.pop();
            return false;
        }
        true
    }

    fn unit_map(&self, proposed: Option<&[NodeId]>) -> HashMap<NodeId, Unit> {
        let mut units = self
            .owner
            .iter()
            .map(|(&n, &b)| (n, Unit::Bundle(b)))
            .collect::<HashMap<_, _>>();
        if let Some(members) = proposed {
            for &n in members {
                units.insert(n, Unit::Bundle(PROPOSED));
            }
        }
        units
    }

    fn unit_of(units: &HashMap<NodeId, Unit>, n: NodeId) -> Unit {
        units.get(&n).copied().unwrap_or(Unit::Node(n))
    }

    /// Data, control and added edges between nodes.
    fn node_edges(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.graph
            .node_ids()
            .flat_map(move |n| self.graph.successors(n).into_iter().map(move |s| (n, s)))
            .chain(self.extra_edges.iter().copied())
    }

    /// The node graph with each bundle contracted to one vertex.
    fn contract(&self, units: &HashMap<NodeId, Unit>) -> DiGraphMap<Unit, ()> {
        let mut dag = DiGraphMap::new();
        for n in self.graph.node_ids() {
            dag.add_node(Self::unit_of(units, n));
        }
        for (from, to) in self.node_edges() {
            let (uf, ut) = (Self::unit_of(units, from), Self::unit_of(units, to));
            if uf != ut {
                dag.add_edge(uf, ut, ());
            }
        }
        dag
    }

    /// Members of the proposed bundle at either end of a node edge inside the
    /// strongly connected component containing it. Every such edge is on a
    /// cycle.
    fn cycle_witness(
        &self,
        units: &HashMap<NodeId, Unit>,
        dag: &DiGraphMap<Unit, ()>,
        members: &[NodeId],
    ) -> Vec<NodeId> {
        let proposed = Unit::Bundle(PROPOSED);
        let Some(component) = tarjan_scc(dag)
            .into_iter()
            .find(|c| c.len() > 1 && c.contains(&proposed))
        else {
            return vec![];
        };
        let mut nodes = self
            .node_edges()
            .filter(|&(a, b)| {
                let (ua, ub) = (Self::unit_of(units, a), Self::unit_of(units, b));
                ua != ub && component.contains(&ua) && component.contains(&ub)
            })
            .flat_map(|(a, b)| [a, b])
            .filter(|n| members.contains(n))
            .collect::<Vec<_>>();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    fn min_node(&self, unit: Unit) -> NodeId {
        match unit {
            Unit::Node(n) => n,
            Unit::Bundle(b) => self
                .bundles
                .iter()
                .find(|(id, _)| *id == b)
                .and_then(|(_, m)| m.iter().min().copied())
                .unwrap_or(NodeId(u32::MAX)),
        }
    }

    /// A deterministic topological order of all units: accepted bundles and
    /// every node outside them. Units go by depth in the contracted graph, then
    /// by the lowest node index they hold.
    pub fn unit_order(&self) -> Result<Vec<Unit>, ValidationError> {
        let units = self.unit_map(None);
        let dag = self.contract(&units);
        layered_toposort(&dag, |u| self.min_node(u)).map_err(|cycle| {
            let witness = match cycle.node_id() {
                Unit::Node(n) => vec![n],
                Unit::Bundle(b) => self
                    .bundles
                    .iter()
                    .find(|(id, _)| *id == b)
                    .map(|(_, m)| m.clone())
                    .unwrap_or_default(),
            };
            ValidationError::Cycle(witness)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::graph::ops::{EltwiseFn, Op};
    use crate::shape;
    use proptest::prelude::*;

    /// a -> mm0 -> relu -> mm1, with a side path mm0 -> neg -> add(relu', neg).
    fn diamond() -> Graph {
        let mut g = Graph::new();
        let a = g.create_tensor("a", shape![4, 4], Dtype::Float32, false).unwrap();
        let y = g.apply("mm0", Op::gemm(), &[a, a]).unwrap();
        let r = g.apply("relu", Op::eltwise(EltwiseFn::Relu), &[y]).unwrap();
        let n = g.apply("neg", Op::eltwise(EltwiseFn::Neg), &[y]).unwrap();
        g.apply("add", Op::eltwise(EltwiseFn::Add), &[r, n]).unwrap();
        g.freeze().unwrap();
        g
    }

    #[test]
    fn test_bundle_skipping_middle_node_is_cyclic() {
        let g = diamond();
        let v = Validator::new(&g);
        // {mm0, add} without neg: mm0 -> neg -> add re-enters the bundle.
        // The witness is the bundle's ends of mm0 -> neg -> add.
        assert_eq!(
            v.check(&[NodeId(0), NodeId(1), NodeId(3)]),
            Err(ValidationError::Cycle(vec![NodeId(0), NodeId(3)]))
        );
        assert_eq!(
            v.check(&[NodeId(0), NodeId(1), NodeId(2), NodeId(3)]),
            Ok(BundleState::Accepted)
        );
    }

    #[test]
    fn test_claimed_nodes_are_rejected() {
        let g = diamond();
        let mut v = Validator::new(&g);
        v.accept(BundleId(0), &[NodeId(0), NodeId(1)]);
        assert_eq!(
            v.check(&[NodeId(1), NodeId(3)]),
            Err(ValidationError::Claimed(NodeId(1)))
        );
    }

    #[test]
    fn test_two_bundles_interleaving_is_cyclic() {
        let g = diamond();
        let mut v = Validator::new(&g);
        // {mm0, add} is itself cyclic, but {relu, neg} + {mm0, add} interleave too.
        v.accept(BundleId(0), &[NodeId(1), NodeId(2)]);
        assert!(matches!(
            v.check(&[NodeId(0), NodeId(3)]),
            Err(ValidationError::Cycle(_))
        ));
    }

    #[test]
    fn test_control_edge_rejected_when_cyclic() {
        let g = diamond();
        let mut v = Validator::new(&g);
        assert!(!v.try_add_control_edge(NodeId(3), NodeId(0)));
        assert!(v.try_add_control_edge(NodeId(2), NodeId(1)));
        let order = v.unit_order().unwrap();
        let pos = |n| order.iter().position(|u| *u == Unit::Node(n)).unwrap();
        assert!(pos(NodeId(2)) < pos(NodeId(1)));
    }

    #[test]
    fn test_unit_order_places_bundle_once() {
        let g = diamond();
        let mut v = Validator::new(&g);
        v.accept(BundleId(7), &[NodeId(0), NodeId(1)]);
        let order = v.unit_order().unwrap();
        assert_eq!(
            order,
            vec![
                Unit::Bundle(BundleId(7)),
                Unit::Node(NodeId(2)),
                Unit::Node(NodeId(3))
            ]
        );
    }

    #[test]
    fn test_released_bundle_frees_its_nodes() {
        let g = diamond();
        let mut v = Validator::new(&g);
        v.accept(BundleId(0), &[NodeId(1), NodeId(2)]);
        assert_eq!(v.unit_order().unwrap().len(), 3);
        assert_eq!(
            v.check(&[NodeId(1), NodeId(3)]),
            Err(ValidationError::Claimed(NodeId(1)))
        );
        v.release(BundleId(0));
        assert!(!v.is_claimed(NodeId(1)));
        assert_eq!(v.check(&[NodeId(1), NodeId(3)]), Ok(BundleState::Accepted));
        assert_eq!(v.unit_order().unwrap().len(), 4);
    }

    fn random_dag(n: usize, edges: &[(usize, usize)]) -> Graph {
        // Each node is a binary add of two earlier tensors (or graph inputs).
        let mut g = Graph::new();
        let base = g.create_tensor("in", shape![2], Dtype::Float32, false).unwrap();
        let mut outs = vec![];
        for i in 0..n {
            let preds = edges
                .iter()
                .filter(|(_, b)| *b == i)
                .map(|(a, _)| outs[*a])
                .take(2)
                .collect::<Vec<_>>();
            let lhs = preds.first().copied().unwrap_or(base);
            let rhs = preds.get(1).copied().unwrap_or(base);
            outs.push(
                g.apply(format!("n{i}"), Op::eltwise(EltwiseFn::Add), &[lhs, rhs])
                    .unwrap(),
            );
        }
        g.freeze().unwrap();
        g
    }

    proptest! {
        #[test]
        fn test_accepted_bundles_keep_contraction_acyclic(
            n in 2usize..10,
            raw_edges in prop::collection::vec((0usize..10, 0usize..10), 0..20),
            groups in prop::collection::vec(prop::collection::vec(0usize..10, 1..4), 0..5),
        ) {
            let edges = raw_edges
                .into_iter()
                .filter(|(a, b)| a < b && *b < n)
                .collect::<Vec<_>>();
            let g = random_dag(n, &edges);
            let mut v = Validator::new(&g);
            for (i, group) in groups.iter().enumerate() {
                let mut members = group
                    .iter()
                    .filter(|&&x| x < n)
                    .map(|&x| NodeId(x as u32))
                    .collect::<Vec<_>>();
                members.sort_unstable();
                members.dedup();
                if members.is_empty() {
                    continue;
                }
                if v.check(&members).is_ok() {
                    v.accept(BundleId(i as u32), &members);
                }
            }
            let order = v.unit_order().unwrap();
            // Every node edge goes forward in the unit order.
            let pos = |node: NodeId| {
                let unit = v
                    .owner(node)
                    .map(Unit::Bundle)
                    .unwrap_or(Unit::Node(node));
                order.iter().position(|u| *u == unit).unwrap()
            };
            for a in g.node_ids() {
                for b in g.successors(a) {
                    if v.owner(a).is_none() || v.owner(a) != v.owner(b) {
                        prop_assert!(pos(a) < pos(b));
                    }
                }
            }
        }
    }
}
