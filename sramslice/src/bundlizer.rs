//! Groups each matrix-engine node with its producer and consumer chains.

use itertools::Itertools;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{self, Display};

use crate::config::{BundlizerPolicy, SchedulerConfig};
use crate::graph::ops::{Op, OpKind, OpSemantics};
use crate::graph::{Graph, NodeId, TensorId};

/// The fewest nodes (anchor included) an elementwise chain needs to become a
/// bundle of its own.
pub const MIN_TPC_BUNDLE_NODES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct BundleId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum BundleKind {
    /// Anchored on a matrix-engine node.
    Mme,
    /// An elementwise chain anchored on its last node.
    Tpc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum MemberRole {
    Producer,
    Consumer,
    /// A second matrix-engine node sharing an input with the anchor.
    Slave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Member {
    pub node: NodeId,
    pub role: MemberRole,
    /// The member this one was reached from. Removing the parent removes this too.
    pub parent: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Bundle {
    pub id: BundleId,
    pub kind: BundleKind,
    pub anchor: NodeId,
    /// Non-anchor members, oldest first.
    members: Vec<Member>,
}

pub struct Bundlizer<'a> {
    graph: &'a Graph,
    config: &'a SchedulerConfig,
    policy: BundlizerPolicy,
}

impl Bundle {
    pub fn new(id: BundleId, kind: BundleKind, anchor: NodeId) -> Self {
        Bundle {
            id,
            kind,
            anchor,
            members: vec![],
        }
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Every node in the bundle, anchor first.
    pub fn nodes(&self) -> Vec<NodeId> {
        std::iter::once(self.anchor)
            .chain(self.members.iter().map(|m| m.node))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, node: NodeId) -> bool {
        node == self.anchor || self.members.iter().any(|m| m.node == node)
    }

    pub fn slave(&self) -> Option<NodeId> {
        self.members
            .iter()
            .find(|m| m.role == MemberRole::Slave)
            .map(|m| m.node)
    }

    pub fn producers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members
            .iter()
            .filter(|m| m.role == MemberRole::Producer)
            .map(|m| m.node)
    }

    pub fn consumers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members
            .iter()
            .filter(|m| m.role == MemberRole::Consumer)
            .map(|m| m.node)
    }

    pub fn push(&mut self, node: NodeId, role: MemberRole, parent: NodeId) {
        debug_assert!(!self.contains(node));
        debug_assert!(self.contains(parent));
        self.members.push(Member { node, role, parent });
    }

    /// Remove `node` and every member reached through it. Returns the removed nodes.
    ///
    /// The anchor can't be removed.
    pub fn remove(&mut self, node: NodeId) -> Vec<NodeId> {
        if node == self.anchor || !self.contains(node) {
            return vec![];
        }
        let mut removed = vec![node];
        // Members are pushed after their parents, so one forward pass suffices.
        for m in &self.members {
            if removed.contains(&m.parent) && !removed.contains(&m.node) {
                removed.push(m.node);
            }
        }
        self.members.retain(|m| !removed.contains(&m.node));
        removed
    }

    /// Drop the newest member. Returns `None` once only the anchor remains.
    pub fn shrink(&mut self) -> Option<Vec<NodeId>> {
        let newest = self.members.last()?.node;
        Some(self.remove(newest))
    }

    /// The newest member among `candidates`, if any.
    pub fn newest_of(&self, candidates: &[NodeId]) -> Option<NodeId> {
        self.members
            .iter()
            .rev()
            .find(|m| candidates.contains(&m.node))
            .map(|m| m.node)
    }
}

impl Display for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{} [anchor {}", self.id.0, self.anchor)?;
        for m in &self.members {
            let tag = match m.role {
                MemberRole::Producer => "p",
                MemberRole::Consumer => "c",
                MemberRole::Slave => "s",
            };
            write!(f, ", {}:{}", tag, m.node)?;
        }
        write!(f, "]")
    }
}

impl<'a> Bundlizer<'a> {
    pub fn new(graph: &'a Graph, config: &'a SchedulerConfig) -> Self {
        let policy = match config.force_bundlizer {
            BundlizerPolicy::Auto => {
                if graph.node_ids().any(|n| graph.node(n).op.is_conv_family()) {
                    BundlizerPolicy::Vision
                } else {
                    BundlizerPolicy::Standard
                }
            }
            p => p,
        };
        Bundlizer {
            graph,
            config,
            policy,
        }
    }

    fn expands(&self) -> bool {
        self.config.bundle_expansion
            && !(self.config.pipeline_management && self.policy == BundlizerPolicy::MmeOnly)
    }

    /// Longest producer or consumer chain walked from one tensor.
    fn chain_limit(&self) -> usize {
        if self.config.pipeline_management {
            usize::MAX
        } else {
            1
        }
    }

    fn makes_tpc_bundles(&self) -> bool {
        self.config.pipeline_management
            && (self.config.tpc_bundles || self.policy == BundlizerPolicy::TpcProducerChains)
    }

    /// Produce candidate bundles, in topological order of their anchors.
    ///
    /// A chain node feeding two matrix-engine nodes may appear in two candidates.
    /// Whichever candidate is accepted first keeps it.
    pub fn candidates(&self) -> Vec<Bundle> {
        let order = match self.graph.topo_order() {
            Ok(o) => o,
            Err(_) => return vec![],
        };
        let mut anchored: HashSet<NodeId> = HashSet::new();
        let mut bundles = vec![];

        for &n in &order {
            if !self.graph.node(n).op.is_matrix_engine() || anchored.contains(&n) {
                continue;
            }
            let mut bundle = Bundle::new(BundleId(bundles.len() as u32), BundleKind::Mme, n);
            anchored.insert(n);
            if self.expands() {
                if let Some((slave, via)) = self.find_slave(n, &anchored) {
                    bundle.push(slave, MemberRole::Slave, n);
                    if let Some(reshape) = via {
                        bundle.push(reshape, MemberRole::Producer, slave);
                    }
                    anchored.insert(slave);
                }
                for slot in self.producer_slots(n) {
                    let t = self.graph.node(n).inputs[slot];
                    self.walk_producers(&mut bundle, n, t, false);
                }
                self.walk_consumers(&mut bundle, n);
            }
            debug!("Candidate bundle {}", bundle);
            bundles.push(bundle);
        }

        if self.makes_tpc_bundles() {
            let taken = bundles
                .iter()
                .flat_map(|b| b.nodes())
                .collect::<HashSet<_>>();
            let mut tpc_taken = HashSet::new();
            for &n in order.iter().rev() {
                if taken.contains(&n) || tpc_taken.contains(&n) || !self.feeds_mme(n) {
                    continue;
                }
                let op = &self.graph.node(n).op;
                if op.kind() != OpKind::Elementwise {
                    continue;
                }
                let mut bundle =
                    Bundle::new(BundleId(bundles.len() as u32), BundleKind::Tpc, n);
                let inputs = self.graph.node(n).inputs.clone();
                if let Some(&widest) = inputs.iter().max_by_key(|&&t| self.graph.tensor(t).bytes())
                {
                    self.walk_producers(&mut bundle, n, widest, true);
                }
                bundle.remove_all(|m| taken.contains(&m) || tpc_taken.contains(&m));
                if bundle.len() >= MIN_TPC_BUNDLE_NODES {
                    debug!("Candidate TPC bundle {}", bundle);
                    tpc_taken.extend(bundle.nodes());
                    bundles.push(bundle);
                }
            }
        }
        bundles
    }

    /// Input slots of `anchor` whose producer chains join its bundle.
    fn producer_slots(&self, anchor: NodeId) -> Vec<usize> {
        let node = self.graph.node(anchor);
        let unique_slots = node
            .inputs
            .iter()
            .enumerate()
            .unique_by(|(_, t)| **t)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        let widest = || -> Vec<usize> {
            unique_slots
                .iter()
                .copied()
                .max_by(|&a, &b| {
                    let ba = self.graph.tensor(node.inputs[a]).bytes();
                    let bb = self.graph.tensor(node.inputs[b]).bytes();
                    ba.cmp(&bb).then(b.cmp(&a))
                })
                .into_iter()
                .collect()
        };
        if !self.config.pipeline_management {
            return widest();
        }
        match self.policy {
            BundlizerPolicy::MmeOnly => vec![],
            BundlizerPolicy::Vision => vec![0],
            _ if self.config.slice_both_producer_chains => unique_slots.clone(),
            _ => widest(),
        }
    }

    /// Whether every consumer of `t` is either in `bundle` or a matrix-engine node.
    fn consumers_allow_chaining(&self, bundle: &Bundle, t: TensorId) -> bool {
        let consumers = self.graph.tensor(t).consumers();
        consumers.iter().all(|&c| bundle.contains(c))
            || consumers
                .iter()
                .all(|&c| self.graph.node(c).op.is_matrix_engine())
    }

    fn walk_producers(&self, bundle: &mut Bundle, from: NodeId, t: TensorId, eltwise_only: bool) {
        let mut parent = from;
        let mut t = t;
        for _ in 0..self.chain_limit() {
            let tensor = self.graph.tensor(t);
            let Some(p) = tensor.producer() else {
                break;
            };
            let op = &self.graph.node(p).op;
            let stop = !op.is_chainable()
                || (eltwise_only && op.kind() != OpKind::Elementwise)
                || tensor.persistent
                || bundle.contains(p)
                || !self.consumers_allow_chaining(bundle, t);
            if stop {
                trace!("Producer chain of {} stops at {}", bundle.anchor, t);
                break;
            }
            bundle.push(p, MemberRole::Producer, parent);
            parent = p;
            // Follow the widest input; ties go to the lowest slot.
            let inputs = &self.graph.node(p).inputs;
            match inputs
                .iter()
                .rev()
                .max_by_key(|&&i| self.graph.tensor(i).bytes())
            {
                Some(&next) => t = next,
                None => break,
            }
        }
    }

    fn walk_consumers(&self, bundle: &mut Bundle, anchor: NodeId) {
        let mut parent = anchor;
        for _ in 0..self.chain_limit() {
            let t = self.graph.node(parent).output;
            let tensor = self.graph.tensor(t);
            if tensor.persistent {
                break;
            }
            let [c] = tensor.consumers() else {
                break;
            };
            let c = *c;
            if !self.graph.node(c).op.is_chainable() || bundle.contains(c) {
                break;
            }
            bundle.push(c, MemberRole::Consumer, parent);
            parent = c;
        }
    }

    /// A matrix-engine node sharing an input tensor with `anchor`, and the
    /// logical reshape it reads that tensor through, if any.
    fn find_slave(
        &self,
        anchor: NodeId,
        anchored: &HashSet<NodeId>,
    ) -> Option<(NodeId, Option<NodeId>)> {
        let inputs = self.graph.node(anchor).inputs.iter().unique();
        let mut found: Vec<(NodeId, Option<NodeId>)> = vec![];
        for &t in inputs {
            for &c in self.graph.tensor(t).consumers() {
                if c == anchor || anchored.contains(&c) {
                    continue;
                }
                let op = &self.graph.node(c).op;
                if op.is_matrix_engine() {
                    found.push((c, None));
                } else if self.config.grad_pairing && matches!(op, Op::Reshape(_)) {
                    let reshaped = self.graph.tensor(self.graph.node(c).output);
                    if let [m] = reshaped.consumers() {
                        if !reshaped.persistent
                            && !anchored.contains(m)
                            && self.graph.node(*m).op.is_matrix_engine()
                        {
                            found.push((*m, Some(c)));
                        }
                    }
                }
            }
        }
        found.into_iter().min_by_key(|(n, _)| *n)
    }

    fn feeds_mme(&self, node: NodeId) -> bool {
        let out = self.graph.node(node).output;
        self.graph
            .tensor(out)
            .consumers()
            .iter()
            .any(|&c| self.graph.node(c).op.is_matrix_engine())
    }
}

impl Bundle {
    /// Remove every member matching `pred`, along with members reached through them.
    pub fn remove_all(&mut self, pred: impl Fn(NodeId) -> bool) -> Vec<NodeId> {
        let doomed = self
            .members
            .iter()
            .map(|m| m.node)
            .filter(|&n| pred(n))
            .collect::<Vec<_>>();
        let mut removed = vec![];
        for n in doomed {
            removed.extend(self.remove(n));
        }
        removed
    }
}
