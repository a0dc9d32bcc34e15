//! The scheduling passes, from candidate bundles to a placed unit order.
//!
//! 1. Bundlize, then validate candidates one at a time in order, shrinking each
//!    until contracting it keeps the graph acyclic.
//! 2. Pick a slicing strategy per accepted bundle. Members the strategy trims
//!    leave the bundle, which is validated again.
//! 3. Reserve SRAM graph-wide: pinned tensors, scalar-pipe inputs, then bundle
//!    buffers in decreasing order of benefit. A bundle which can't get SRAM
//!    is demoted and placement restarts.

use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::ops::Range;

use crate::allocator::{allocate, Allocation};
use crate::bundlizer::{Bundle, BundleId, BundleKind, Bundlizer};
use crate::config::SchedulerConfig;
use crate::cost::{select, PipelineCost};
use crate::datadeps::{Unit, ValidationError, Validator};
use crate::graph::ops::{OpKind, OpSemantics};
use crate::graph::{Graph, GraphError, MemoryHint, NodeId, TensorId};
use crate::memorylimits::{Owner, SramLedger};
use crate::slicing::{generate, SlicingStrategy};
use crate::target::Target;
use crate::utils::round_up;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScheduledBundle {
    pub bundle: Bundle,
    pub strategy: SlicingStrategy,
    pub allocation: Allocation,
    pub cost: PipelineCost,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Scheduled {
    /// SRAM bytes the schedule was planned against.
    pub capacity: u64,
    pub units: Vec<Unit>,
    pub bundles: IndexMap<BundleId, ScheduledBundle>,
    /// Control edges added to order demoted slaves after their masters.
    pub control_edges: Vec<(NodeId, NodeId)>,
    /// Tensors held in SRAM for their whole live range.
    pub pinned: Vec<TensorId>,
    /// Inputs of unbundled nodes staged in SRAM before the node runs.
    pub scalar_pipe: Vec<(NodeId, u8)>,
    /// Bundles accepted by validation but given up later.
    pub demoted: Vec<BundleId>,
    pub peak_sram: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum ScheduleError {
    #[error("graph must be frozen before scheduling")]
    NotFrozen,
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl Scheduled {
    pub fn bundle_of(&self, node: NodeId) -> Option<&ScheduledBundle> {
        self.bundles
            .values()
            .find(|b| b.strategy.members.contains(node))
    }

    pub fn is_pinned(&self, tensor: TensorId) -> bool {
        self.pinned.contains(&tensor)
    }

    pub fn is_scalar_pipe(&self, node: NodeId, slot: u8) -> bool {
        self.scalar_pipe.contains(&(node, slot))
    }
}

struct Accepted {
    bundle: Bundle,
    strategy: SlicingStrategy,
    cost: PipelineCost,
}

pub fn schedule<Tgt: Target>(graph: &Graph, config: &SchedulerConfig) -> Result<Scheduled, ScheduleError> {
    if !graph.is_frozen() {
        return Err(ScheduleError::NotFrozen);
    }
    graph.topo_order()?;
    let capacity = config.effective_capacity(Tgt::sram_bytes());
    info!("Scheduling {} nodes with {} bytes of SRAM", graph.node_count(), capacity);

    let mut validator = Validator::new(graph);
    let mut accepted: IndexMap<BundleId, Accepted> = IndexMap::new();
    if capacity > 0 {
        let mut queue = Bundlizer::new(graph, config)
            .candidates()
            .into_iter()
            .collect::<VecDeque<_>>();
        let mut next_id = queue.len() as u32;
        while let Some(bundle) = queue.pop_front() {
            let mut fresh = |anchor: NodeId| {
                let b = Bundle::new(BundleId(next_id), BundleKind::Mme, anchor);
                next_id += 1;
                b
            };
            let mut requeue = vec![];
            if let Some(a) = settle::<Tgt>(graph, config, capacity, &mut validator, bundle, &mut requeue) {
                accepted.insert(a.bundle.id, a);
            }
            for n in requeue {
                if !validator.is_claimed(n) {
                    queue.push_back(fresh(n));
                }
            }
        }
    }

    let mut demoted = vec![];
    loop {
        let units = validator.unit_order()?;
        match place::<Tgt>(graph, config, capacity, &units, &mut accepted) {
            Ok((bundles, pinned, scalar_pipe, peak_sram)) => {
                info!(
                    "{} units, {} bundles, {} demoted, peak SRAM {} bytes",
                    units.len(),
                    bundles.len(),
                    demoted.len(),
                    peak_sram
                );
                return Ok(Scheduled {
                    capacity,
                    units,
                    bundles,
                    control_edges: validator.extra_edges().to_vec(),
                    pinned,
                    scalar_pipe,
                    demoted,
                    peak_sram,
                });
            }
            Err(id) => {
                warn!("Demoting bundle {}: no SRAM left for it", id.0);
                accepted.shift_remove(&id);
                validator.release(id);
                demoted.push(id);
            }
        }
    }
}

/// Validate `bundle`, choose its strategy and record it with `validator`.
///
/// Matrix-engine nodes dropped along the way are pushed to `requeue` so they
/// can anchor bundles of their own.
fn settle<Tgt: Target>(
    graph: &Graph,
    config: &SchedulerConfig,
    capacity: u64,
    validator: &mut Validator<'_>,
    mut bundle: Bundle,
    requeue: &mut Vec<NodeId>,
) -> Option<Accepted> {
    if validator.is_claimed(bundle.anchor) {
        debug!("Skipping {}: anchor already bundled", bundle);
        return None;
    }
    let claimed = bundle.remove_all(|n| validator.is_claimed(n));
    if !claimed.is_empty() {
        debug!("{} loses {:?} to earlier bundles", bundle, claimed);
    }

    loop {
        shrink_until_valid(graph, validator, &mut bundle, requeue);
        let strategies = generate::<Tgt>(graph, &bundle, config, capacity);
        let multi = config.multi_buffering;
        let Some((idx, cost)) = select::<Tgt>(graph, &strategies, config.cost_model, multi) else {
            info!("{} runs unbundled", bundle);
            requeue.extend(bundle.slave());
            return None;
        };
        let strategy = strategies.into_iter().nth(idx)?;
        if strategy.trimmed.is_empty() {
            validator.accept(bundle.id, &bundle.nodes());
            debug!("Accepted {} sliced {}", bundle, strategy);
            return Some(Accepted {
                bundle,
                strategy,
                cost,
            });
        }
        // Keep exactly the chosen strategy's members, then validate again.
        for &t in &strategy.trimmed {
            if Some(t) == bundle.slave() {
                demote_slave(graph, validator, &bundle, t, requeue);
            }
            bundle.remove(t);
        }
    }
}

fn shrink_until_valid(
    graph: &Graph,
    validator: &mut Validator<'_>,
    bundle: &mut Bundle,
    requeue: &mut Vec<NodeId>,
) {
    loop {
        let victim = match validator.check(&bundle.nodes()) {
            Ok(_) => return,
            Err(ValidationError::Claimed(n)) => n,
            Err(ValidationError::Cycle(witness)) => {
                match bundle.newest_of(&witness) {
                    Some(n) => n,
                    None => match bundle.members().last() {
                        Some(m) => m.node,
                        None => return,
                    },
                }
            }
        };
        if victim == bundle.anchor {
            return;
        }
        if Some(victim) == bundle.slave() {
            demote_slave(graph, validator, bundle, victim, requeue);
        }
        let removed = bundle.remove(victim);
        debug!("Shrunk {}: removed {:?}", bundle, removed);
        if removed.is_empty() {
            return;
        }
    }
}

/// A slave leaving its master's bundle still runs after it when possible.
fn demote_slave(
    graph: &Graph,
    validator: &mut Validator<'_>,
    bundle: &Bundle,
    slave: NodeId,
    requeue: &mut Vec<NodeId>,
) {
    let master = bundle.anchor;
    if !validator.try_add_control_edge(master, slave) && !validator.try_add_control_edge(slave, master) {
        warn!("No control edge orders {} against {}", slave, master);
    }
    if graph.node(slave).op.is_matrix_engine() {
        requeue.push(slave);
    }
}

type Placed = (
    IndexMap<BundleId, ScheduledBundle>,
    Vec<TensorId>,
    Vec<(NodeId, u8)>,
    u64,
);

/// Reserve SRAM for one unit order. On failure, returns the bundle to demote.
fn place<Tgt: Target>(
    graph: &Graph,
    config: &SchedulerConfig,
    capacity: u64,
    units: &[Unit],
    accepted: &mut IndexMap<BundleId, Accepted>,
) -> Result<Placed, BundleId> {
    let line = u64::from(Tgt::line_size());
    let mut step_of: HashMap<NodeId, usize> = HashMap::new();
    for (step, unit) in units.iter().enumerate() {
        match unit {
            Unit::Node(n) => {
                step_of.insert(*n, step);
            }
            Unit::Bundle(b) => {
                if let Some(a) = accepted.get(b) {
                    for n in a.bundle.nodes() {
                        step_of.insert(n, step);
                    }
                }
            }
        }
    }
    let unbundled = |n: NodeId| {
        matches!(
            step_of.get(&n).and_then(|&step| units.get(step)),
            Some(Unit::Node(_))
        )
    };
    let mut ledger = SramLedger::new(capacity, units.len());

    let mut pinned = vec![];
    if capacity > 0 {
        for t in graph.tensor_ids() {
            let tensor = graph.tensor(t);
            if tensor.hint != MemoryHint::ForceSram {
                continue;
            }
            if tensor.producer().is_some_and(|p| !unbundled(p)) {
                continue;
            }
            let Some(steps) = live_range(graph, t, &step_of) else {
                continue;
            };
            match ledger.reserve(Owner::Pinned(t), steps, round_up(tensor.bytes(), line)) {
                Ok(()) => pinned.push(t),
                Err(e) => warn!("{} stays in HBM: {}", tensor.name, e),
            }
        }
    }

    let mut scalar_pipe = vec![];
    if capacity > 0 {
        for (step, unit) in units.iter().enumerate() {
            let Unit::Node(n) = *unit else {
                continue;
            };
            let node = graph.node(n);
            if matches!(node.op.kind(), OpKind::MatrixEngine | OpKind::ShapeOnly) {
                continue;
            }
            for (slot, &t) in node.inputs.iter().enumerate() {
                let tensor = graph.tensor(t);
                if tensor.bytes() < config.min_scalar_pipe_input_bytes
                    || tensor.hint == MemoryHint::ForceHbm
                    || pinned.contains(&t)
                {
                    continue;
                }
                let owner = Owner::ScalarPipe {
                    node: n,
                    slot: slot as u8,
                };
                if ledger
                    .reserve(owner, step..step + 1, round_up(tensor.bytes(), line))
                    .is_ok()
                {
                    scalar_pipe.push((n, slot as u8));
                }
            }
        }
    }

    // Most latency saved first.
    let mut order = accepted
        .iter()
        .map(|(&id, a)| {
            let unsliced = PipelineCost::unsliced::<Tgt>(graph, &a.strategy.members.nodes());
            (unsliced.latency.saturating_sub(a.cost.latency), id)
        })
        .collect::<Vec<_>>();
    order.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let mut allocations: HashMap<BundleId, Allocation> = HashMap::new();
    for (_, id) in order {
        let Some(a) = accepted.get_mut(&id) else {
            continue;
        };
        let Some(&step) = step_of.get(&a.bundle.anchor) else {
            warn!("Bundle {} has no step in the unit order", id.0);
            return Err(id);
        };
        let available = ledger.available_at(step..step + 1);
        let allocation = match allocate::<Tgt>(&a.strategy, available, config.multi_buffering) {
            Ok(alloc) => alloc,
            Err(e) => {
                debug!("Bundle {}: {}; regenerating", id.0, e);
                let (strategy, cost) = regenerate::<Tgt>(graph, config, a, available).ok_or(id)?;
                let alloc = allocate::<Tgt>(&strategy, available, config.multi_buffering)
                    .map_err(|_| id)?;
                a.strategy = strategy;
                a.cost = cost;
                alloc
            }
        };
        ledger
            .reserve(Owner::Bundle(id), step..step + 1, allocation.total_bytes())
            .map_err(|_| id)?;
        allocations.insert(id, allocation);
    }

    let bundles = accepted
        .iter()
        .filter_map(|(&id, a)| {
            let allocation = allocations.remove(&id)?;
            Some((
                id,
                ScheduledBundle {
                    bundle: a.bundle.clone(),
                    strategy: a.strategy.clone(),
                    allocation,
                    cost: a.cost,
                },
            ))
        })
        .collect();
    Ok((bundles, pinned, scalar_pipe, ledger.peak()))
}

/// A cheaper strategy for `a` that keeps the same members and fits `available`.
fn regenerate<Tgt: Target>(
    graph: &Graph,
    config: &SchedulerConfig,
    a: &Accepted,
    available: u64,
) -> Option<(SlicingStrategy, PipelineCost)> {
    let members = a.strategy.members.nodes();
    let candidates = generate::<Tgt>(graph, &a.bundle, config, available)
        .into_iter()
        .filter(|s| s.members.nodes() == members)
        .collect::<Vec<_>>();
    let (idx, cost) = select::<Tgt>(graph, &candidates, config.cost_model, config.multi_buffering)?;
    candidates.into_iter().nth(idx).map(|s| (s, cost))
}

/// Steps from a tensor's producer through its last consumer. `None` if one of
/// them isn't in the unit order.
fn live_range(graph: &Graph, t: TensorId, step_of: &HashMap<NodeId, usize>) -> Option<Range<usize>> {
    let tensor = graph.tensor(t);
    let start = match tensor.producer() {
        Some(p) => *step_of.get(&p)?,
        None => 0,
    };
    let mut end = start;
    for c in tensor.consumers() {
        end = end.max(*step_of.get(c)?);
    }
    Some(start..end + 1)
}
