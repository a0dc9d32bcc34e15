//! Slicing strategy generation.
//!
//! A strategy slices the anchor's index space along one axis (occasionally two)
//! with a fixed chunk size. Every other member's work follows through operand
//! access maps (see [trace]). Members which can't follow are trimmed from the
//! strategy and run unsliced outside the bundle.

pub mod trace;

use log::{debug, trace as log_trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display};

use crate::bundlizer::{Bundle, BundleId, MemberRole};
use crate::common::{volume, Region, Shape};
use crate::config::SchedulerConfig;
use crate::graph::access::{AccessMap, DimAccess, DimRole, IndexDim};
use crate::graph::ops::{Op, OpKind, OpSemantics};
use crate::graph::{Graph, GraphError, MemoryHint, NodeId, TensorId};
use crate::target::Target;
use crate::tiling::{chunk_candidates, granule_candidates, DimSlicing};
use crate::utils::{gcd, round_up};
use trace::{Conflict, Tracer, WalkState};

/// Strategies walking more slices than this are rejected.
pub const MAX_SLICES: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SlicedDim {
    pub index_dim: u8,
    pub chunk: u32,
}

/// The kind of anchor dimension a strategy slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Axis {
    /// Nothing is sliced; the whole bundle fits at once.
    Whole,
    Common,
    Spatial,
    Batch,
    NonCommon,
    Elementwise,
}

/// A buffer-able operand of a bundle.
///
/// Inputs from outside the bundle are keyed per reading slot, so a tensor bound
/// to two slots is fetched into two buffers. Outputs are keyed by their member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub enum OperandKey {
    Input { node: NodeId, slot: u8 },
    Output(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OperandInfo {
    pub key: OperandKey,
    pub tensor: TensorId,
    /// Bytes of the largest region the operand holds in any slice.
    pub max_bytes: u64,
    /// The region changes between at least two consecutive slices.
    pub varies: bool,
    /// Fetched from HBM (inputs) or copied out to HBM (outputs).
    pub external: bool,
    pub in_sram: bool,
}

/// A second matrix-engine node sharing an anchor operand, optionally through a
/// reshape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SlavePath {
    pub node: NodeId,
    pub via: Option<NodeId>,
    pub anchor_slot: u8,
}

/// The nodes a strategy keeps, in the order they run within a slice.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Members {
    pub anchor: NodeId,
    /// Upstream before downstream.
    pub producers: Vec<NodeId>,
    pub slave: Option<SlavePath>,
    pub consumers: Vec<NodeId>,
}

/// Work done by one slice, in raw units.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct SliceLoad {
    pub macs: u64,
    pub tpc_elements: u64,
    pub fetch_bytes: u64,
    pub evict_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SlicingStrategy {
    pub bundle: BundleId,
    pub axis: Axis,
    pub members: Members,
    /// Sliced anchor dimensions in traversal order, outermost first. Reduction
    /// dimensions come last.
    pub sliced: Vec<SlicedDim>,
    /// Position in `sliced` of the dimension walked back and forth.
    pub snake: Option<usize>,
    /// A sliced dimension's size is only known at run time.
    pub dynamic: bool,
    pub operands: Vec<OperandInfo>,
    pub loads: Vec<SliceLoad>,
    /// Bundle members this strategy leaves out.
    pub trimmed: Vec<NodeId>,
}

impl Members {
    pub fn from_bundle(graph: &Graph, bundle: &Bundle) -> Result<Self, GraphError> {
        let anchor = bundle.anchor;
        let slave = bundle.slave().and_then(|s| {
            let via = bundle
                .members()
                .iter()
                .find(|m| m.role == MemberRole::Producer && m.parent == s)
                .map(|m| m.node);
            let reads = match via {
                Some(r) => graph.node(r).inputs.clone(),
                None => graph.node(s).inputs.clone(),
            };
            let anchor_slot = graph
                .node(anchor)
                .inputs
                .iter()
                .position(|t| reads.contains(t))?;
            Some(SlavePath {
                node: s,
                via,
                anchor_slot: anchor_slot as u8,
            })
        });
        let via = slave.and_then(|s| s.via);
        let order = graph.topo_order()?;
        let mut producers = bundle
            .producers()
            .filter(|&p| Some(p) != via)
            .collect::<Vec<_>>();
        producers.sort_by_key(|p| order.iter().position(|n| n == p));
        Ok(Members {
            anchor,
            producers,
            slave,
            consumers: bundle.consumers().collect(),
        })
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes = self.producers.clone();
        nodes.push(self.anchor);
        if let Some(s) = self.slave {
            nodes.extend(s.via);
            nodes.push(s.node);
        }
        nodes.extend(&self.consumers);
        nodes
    }

    pub fn contains(&self, node: NodeId) -> bool {
        node == self.anchor
            || self.producers.contains(&node)
            || self.consumers.contains(&node)
            || self
                .slave
                .is_some_and(|s| s.node == node || s.via == Some(node))
    }

    /// Whether `node` only runs to feed another member.
    pub fn is_producer(&self, node: NodeId) -> bool {
        self.producers.contains(&node) || self.slave.and_then(|s| s.via) == Some(node)
    }
}

impl SlicingStrategy {
    pub fn slice_count(&self) -> u64 {
        self.loads.len() as u64
    }

    /// SRAM bytes with every operand single-buffered.
    pub fn min_footprint(&self, line_size: u32) -> u64 {
        self.operands
            .iter()
            .filter(|o| o.in_sram)
            .map(|o| round_up(o.max_bytes, u64::from(line_size)))
            .sum()
    }

    pub fn operand(&self, key: OperandKey) -> Option<&OperandInfo> {
        self.operands.iter().find(|o| o.key == key)
    }
}

impl Display for SlicingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.axis)?;
        for sd in &self.sliced {
            write!(f, " d{}/{}", sd.index_dim, sd.chunk)?;
        }
        if self.snake.is_some() {
            write!(f, " snake")?;
        }
        Ok(())
    }
}

/// The dimensions an [Axis] slices: zero or more fixed chunks plus one dimension
/// whose chunk is searched.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AxisChoice {
    axis: Axis,
    fixed: Vec<SlicedDim>,
    free: u8,
}

/// Candidate axes for the bundle's anchor, most preferred first.
fn axis_choices(graph: &Graph, anchor: NodeId, config: &SchedulerConfig) -> Vec<AxisChoice> {
    let node = graph.node(anchor);
    let space = graph.index_space(anchor);
    let parallel = |role: DimRole| parallel_dims(&space, role);
    let single = |axis: Axis, free: u8| AxisChoice {
        axis,
        fixed: vec![],
        free,
    };

    if !node.op.is_matrix_engine() {
        return space
            .iter()
            .position(|d| !d.reduction && d.size > 1)
            .map(|i| single(Axis::Elementwise, i as u8))
            .into_iter()
            .collect();
    }

    let mut common = vec![];
    if let Some(k) = space
        .iter()
        .position(|d| d.reduction && d.role == DimRole::Common && d.size > 1)
    {
        common.push(single(Axis::Common, k as u8));
    }
    if let Op::Dedw(_) = node.op {
        // [R, S, C, K | N, OH, OW]: whole images, then output rows.
        if config.conv_packing_training && space[5].size > 1 {
            common.push(AxisChoice {
                axis: Axis::Common,
                fixed: vec![SlicedDim {
                    index_dim: 4,
                    chunk: 1,
                }],
                free: 5,
            });
        }
    }

    let mut spatial = vec![];
    if node.op.capabilities().spatial_slicing {
        let dims = parallel(DimRole::Spatial);
        if let Some(&h) = dims.first() {
            spatial.push(single(Axis::Spatial, h));
            if config.conv_packing_training {
                if let Some(&w) = dims.get(1) {
                    let w_size = space[usize::from(w)].size;
                    spatial.push(AxisChoice {
                        axis: Axis::Spatial,
                        fixed: vec![SlicedDim {
                            index_dim: w,
                            chunk: w_size.div_ceil(2),
                        }],
                        free: h,
                    });
                }
            }
        }
    }

    let batch = parallel(DimRole::Batch)
        .into_iter()
        .map(|b| single(Axis::Batch, b))
        .collect::<Vec<_>>();

    let non_common_allowed = match node.op {
        Op::BatchGemm(_) => config.bgemm_flatten_to_gemm && has_broadcast_batch(graph, anchor),
        _ => true,
    };
    let non_common = if non_common_allowed {
        parallel(DimRole::NonCommon)
            .into_iter()
            .map(|d| single(Axis::NonCommon, d))
            .collect()
    } else {
        vec![]
    };

    let mut choices = vec![];
    if config.layered_brain {
        choices.extend(batch);
        choices.extend(spatial);
        choices.extend(non_common);
    } else {
        choices.extend(non_common);
        choices.extend(batch);
        choices.extend(spatial);
    }
    choices.extend(common);
    choices
}

fn parallel_dims(space: &[IndexDim], role: DimRole) -> Vec<u8> {
    space
        .iter()
        .enumerate()
        .filter(|(_, d)| !d.reduction && d.role == role && d.size > 1)
        .map(|(i, _)| i as u8)
        .collect()
}

/// Whether one batch-GEMM operand is shared by every batch entry.
fn has_broadcast_batch(graph: &Graph, node: NodeId) -> bool {
    (0..graph.node(node).inputs.len()).any(|slot| {
        matches!(
            graph.input_access(node, slot),
            AccessMap::Dims(dims) if dims.first() == Some(&DimAccess::Broadcast)
        )
    })
}

/// Chunks along `dim` are kept to whole cache lines of any operand that has
/// `dim` as its innermost dimension.
fn chunk_multiple<Tgt: Target>(graph: &Graph, anchor: NodeId, dim: u8) -> u32 {
    let node = graph.node(anchor);
    let innermost = |access: &AccessMap| match access {
        AccessMap::Dims(dims) => dims.last() == Some(&DimAccess::Direct(dim)),
        AccessMap::Flat => false,
    };
    let mut tensors = (0..node.inputs.len())
        .filter(|&slot| innermost(&graph.input_access(anchor, slot)))
        .map(|slot| node.inputs[slot])
        .collect::<Vec<_>>();
    if innermost(&graph.output_access(anchor)) {
        tensors.push(node.output);
    }
    tensors
        .into_iter()
        .map(|t| Tgt::line_size() / u32::from(graph.tensor(t).dtype.size()))
        .max()
        .unwrap_or(1)
        .max(1)
}

/// Chunk granules along anchor dimension `dim` which keep a reshape member's
/// slices whole boxes.
///
/// Only reshapes directly on an anchor operand count: a producer feeding the
/// anchor, a slave's reshape of an anchor input, or a consumer of the anchor's
/// output. With the operand's elements past `dim` numbering `inner`, a chunk
/// of `c` rows is a box on the reshape's far side when `c * inner` is a
/// multiple of one of its row sizes.
fn reshape_granules(graph: &Graph, bundle: &Bundle, dim: u8) -> Vec<u32> {
    let anchor = bundle.anchor;
    let node = graph.node(anchor);
    let size = graph.index_space(anchor)[usize::from(dim)].size;
    let mut sides = vec![];
    for m in bundle.members() {
        let reshape = graph.node(m.node);
        let (Op::Reshape(_), [input]) = (&reshape.op, reshape.inputs.as_slice()) else {
            continue;
        };
        if *input == node.output {
            sides.push((node.output, graph.output_access(anchor), reshape.output));
            continue;
        }
        let slot = node
            .inputs
            .iter()
            .position(|&t| t == reshape.output || t == *input);
        if let Some(slot) = slot {
            let operand = node.inputs[slot];
            let far = if operand == reshape.output {
                *input
            } else {
                reshape.output
            };
            sides.push((operand, graph.input_access(anchor, slot), far));
        }
    }

    let mut granules = vec![];
    for (operand, access, far) in sides {
        let AccessMap::Dims(dims) = access else {
            continue;
        };
        let Some(j) = dims.iter().position(|d| *d == DimAccess::Direct(dim)) else {
            continue;
        };
        let inner = volume(&graph.tensor(operand).shape[j + 1..]);
        let far = &graph.tensor(far).shape;
        for k in 0..far.len() {
            let row = volume(&far[k + 1..]);
            let granule = row / gcd(row, inner);
            if granule > 1 && granule < u64::from(size) && !granules.contains(&(granule as u32)) {
                granules.push(granule as u32);
            }
        }
    }
    granules
}

/// Remove members which can never be sliced with the bundle, whatever the axis.
///
/// Returns the removed nodes.
fn static_trim(graph: &Graph, bundle: &mut Bundle) -> Result<Vec<NodeId>, GraphError> {
    let mut removed = vec![];
    loop {
        let members = Members::from_bundle(graph, bundle)?;
        let kept = members.nodes();
        let doomed = bundle.members().iter().find_map(|m| {
            let out = graph.tensor(graph.node(m.node).output);
            let force_hbm = out.hint == MemoryHint::ForceHbm;
            let leaks = out.consumers().iter().any(|c| !kept.contains(c)) || out.persistent;
            match m.role {
                MemberRole::Producer if force_hbm || leaks => Some(m.node),
                MemberRole::Consumer if force_hbm => Some(m.node),
                MemberRole::Slave if members.slave.is_none() => Some(m.node),
                _ => None,
            }
        });
        let Some(n) = doomed else {
            return Ok(removed);
        };
        let gone = bundle.remove(n);
        if gone.is_empty() {
            return Ok(removed);
        }
        removed.extend(gone);
    }
}

/// Every feasible strategy for `bundle` under `capacity` SRAM bytes, in
/// preference order. Empty if the bundle can't be sliced.
pub fn generate<Tgt: Target>(
    graph: &Graph,
    bundle: &Bundle,
    config: &SchedulerConfig,
    capacity: u64,
) -> Vec<SlicingStrategy> {
    match strategies::<Tgt>(graph, bundle, config, capacity) {
        Ok(strategies) => strategies,
        Err(e) => {
            warn!("{}: no strategies: {}", bundle, e);
            vec![]
        }
    }
}

fn strategies<Tgt: Target>(
    graph: &Graph,
    bundle: &Bundle,
    config: &SchedulerConfig,
    capacity: u64,
) -> Result<Vec<SlicingStrategy>, GraphError> {
    let mut base = bundle.clone();
    let trimmed = static_trim(graph, &mut base)?;
    if !trimmed.is_empty() {
        debug!("{}: statically trimmed {:?}", bundle, trimmed);
    }

    let anchor = bundle.anchor;
    let space = graph.index_space(anchor);
    let min_sizes = graph.bound(anchor, &graph.min_shapes()).index_sizes();
    let dynamic_dims = space
        .iter()
        .zip(&min_sizes)
        .enumerate()
        .filter(|(_, (d, &min))| d.size != min)
        .map(|(i, _)| i as u8)
        .collect::<Vec<_>>();

    let mut layouts: Vec<(Axis, Vec<SlicedDim>)> = vec![(Axis::Whole, vec![])];
    for choice in axis_choices(graph, anchor, config) {
        let size = space[usize::from(choice.free)].size;
        let multiple = match chunk_multiple::<Tgt>(graph, anchor, choice.free) {
            m if size > m => m,
            _ => 1,
        };
        let mut chunks = chunk_candidates(size, multiple).split_off(1);
        for g in reshape_granules(graph, &base, choice.free) {
            let g = u64::from(g);
            let granule = g / gcd(g, u64::from(multiple)) * u64::from(multiple);
            if let Ok(granule) = u32::try_from(granule) {
                chunks.extend(granule_candidates(size, granule));
            }
        }
        chunks.sort_unstable_by(|a, b| b.cmp(a));
        chunks.dedup();
        let mut per_axis = vec![];
        for chunk in chunks {
            let mut sliced = choice.fixed.clone();
            sliced.push(SlicedDim {
                index_dim: choice.free,
                chunk,
            });
            sliced.sort_by_key(|sd| (space[usize::from(sd.index_dim)].reduction, sd.index_dim));
            let count: u64 = sliced
                .iter()
                .map(|sd| {
                    u64::from(
                        DimSlicing::new(space[usize::from(sd.index_dim)].size, sd.chunk).count(),
                    )
                })
                .product();
            if count > MAX_SLICES {
                break;
            }
            per_axis.push((choice.axis, sliced));
        }
        layouts.extend(per_axis);
    }

    let shapes = graph.max_shapes();
    let mut strategies: Vec<SlicingStrategy> = vec![];
    let mut axis_start = 0;
    let mut last_axis = None;
    for (axis, sliced) in layouts {
        if last_axis != Some(axis) {
            axis_start = strategies.len();
            last_axis = Some(axis);
        }
        let dynamic = sliced.iter().any(|sd| dynamic_dims.contains(&sd.index_dim));
        let parallel_count = sliced
            .iter()
            .filter(|sd| !space[usize::from(sd.index_dim)].reduction)
            .count();
        let snake = if !dynamic && parallel_count >= 2 {
            Some(parallel_count - 1)
        } else {
            None
        };
        let Some(mut strategy) = build(graph, &shapes, &base, bundle.id, axis, sliced, snake)? else {
            continue;
        };
        strategy.dynamic = dynamic;
        strategy.trimmed.extend(trimmed.iter().copied());
        let footprint = strategy.min_footprint(Tgt::line_size());
        if footprint > capacity {
            log_trace!("{}: {} needs {} bytes", bundle, strategy, footprint);
            continue;
        }
        // Within an axis, strategies keeping more members go first.
        let pos = strategies[axis_start..]
            .iter()
            .position(|s| s.trimmed.len() > strategy.trimmed.len())
            .map_or(strategies.len(), |p| axis_start + p);
        strategies.insert(pos, strategy);
    }
    debug!("{}: {} feasible strategies", bundle, strategies.len());
    Ok(strategies)
}

/// Trace `sliced` over the bundle, trimming members until every slice can be
/// derived. Returns `None` if the anchor itself can't be sliced this way.
fn build(
    graph: &Graph,
    shapes: &[Shape],
    base: &Bundle,
    id: BundleId,
    axis: Axis,
    sliced: Vec<SlicedDim>,
    snake: Option<usize>,
) -> Result<Option<SlicingStrategy>, GraphError> {
    let mut work = base.clone();
    let mut trimmed = vec![];
    'retry: loop {
        let members = Members::from_bundle(graph, &work)?;
        let tracer = Tracer::new(graph, shapes, &members, &sliced, snake);
        let mut state = WalkState::default();
        let mut stats = OperandStats::default();
        let mut loads = vec![];
        for coords in tracer.walk() {
            match tracer.slice(&coords, &mut state) {
                Ok(steps) => loads.push(stats.record(graph, &members, &steps)),
                Err(Conflict { node }) => {
                    log_trace!("Trimming {} from {:?} slicing", node, axis);
                    let Some(removed) = trim(&mut work, &members, node) else {
                        return Ok(None);
                    };
                    trimmed.extend(removed);
                    continue 'retry;
                }
            }
        }
        if let Err(Conflict { node }) = tracer.finish(&state) {
            let Some(removed) = trim(&mut work, &members, node) else {
                return Ok(None);
            };
            trimmed.extend(removed);
            continue 'retry;
        }
        let operands = stats.into_operands(graph, &members);
        return Ok(Some(SlicingStrategy {
            bundle: id,
            axis,
            members,
            sliced,
            snake,
            dynamic: false,
            operands,
            loads,
            trimmed,
        }));
    }
}

/// Remove a conflicting member. A reshape feeding the slave takes the slave
/// with it. `None` if the anchor conflicts.
fn trim(work: &mut Bundle, members: &Members, node: NodeId) -> Option<Vec<NodeId>> {
    if node == members.anchor {
        return None;
    }
    let victim = match members.slave {
        Some(s) if s.via == Some(node) => s.node,
        _ => node,
    };
    let removed = work.remove(victim);
    if removed.is_empty() {
        None
    } else {
        Some(removed)
    }
}

#[derive(Default)]
struct OperandStats {
    order: Vec<OperandKey>,
    seen: HashMap<OperandKey, (TensorId, u64, Region, bool)>,
}

impl OperandStats {
    fn touch(&mut self, key: OperandKey, tensor: TensorId, bytes: u64, region: &Region) -> bool {
        match self.seen.get_mut(&key) {
            Some((_, max, last, varies)) => {
                *max = (*max).max(bytes);
                let changed = !last.contains(region);
                if changed {
                    *varies = true;
                    *last = region.clone();
                }
                changed
            }
            None => {
                self.order.push(key);
                self.seen.insert(key, (tensor, bytes, region.clone(), false));
                true
            }
        }
    }

    fn record(&mut self, graph: &Graph, members: &Members, steps: &[trace::SliceStep]) -> SliceLoad {
        let mut load = SliceLoad::default();
        for step in steps {
            if step.reused {
                continue;
            }
            let node = graph.node(step.node);
            for (key, region) in &step.inputs {
                let tensor = match key {
                    OperandKey::Input { node, slot } => graph.node(*node).inputs[usize::from(*slot)],
                    OperandKey::Output(n) => graph.node(*n).output,
                };
                let t = graph.tensor(tensor);
                let bytes = region.volume() * u64::from(t.dtype.size());
                let changed = self.touch(*key, tensor, bytes, region);
                if let OperandKey::Input { .. } = key {
                    if changed || t.hint == MemoryHint::ForceHbm {
                        load.fetch_bytes += bytes;
                    }
                }
            }
            let out = graph.tensor(node.output);
            let bytes = step.output.volume() * u64::from(out.dtype.size());
            self.touch(OperandKey::Output(step.node), node.output, bytes, &step.output);
            if step.final_write && output_leaves(graph, members, step.node) {
                load.evict_bytes += bytes;
            }
            let volume = step.index_box.volume();
            match node.op.kind() {
                OpKind::MatrixEngine => load.macs += volume,
                OpKind::ShapeOnly => {}
                _ => load.tpc_elements += volume,
            }
        }
        load
    }

    fn into_operands(self, graph: &Graph, members: &Members) -> Vec<OperandInfo> {
        let mut seen = self.seen;
        self.order
            .into_iter()
            .filter_map(|key| {
                let (tensor, max_bytes, _, varies) = seen.remove(&key)?;
                let external = match key {
                    OperandKey::Input { .. } => true,
                    OperandKey::Output(n) => output_leaves(graph, members, n),
                };
                Some(OperandInfo {
                    key,
                    tensor,
                    max_bytes,
                    varies,
                    external,
                    in_sram: graph.tensor(tensor).hint != MemoryHint::ForceHbm,
                })
            })
            .collect()
    }
}

/// Whether a member's output must reach HBM.
pub fn output_leaves(graph: &Graph, members: &Members, node: NodeId) -> bool {
    let t = graph.node(node).output;
    let tensor = graph.tensor(t);
    graph.is_observable(t)
        || tensor
            .consumers()
            .iter()
            .any(|&c| !members.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundlizer::{BundleKind, Bundlizer};
    use crate::common::Dtype;
    use crate::graph::ops::{BatchGemm, EltwiseFn, Reshape, Transpose};
    use crate::shape;
    use crate::target::Gaudi2Target;

    fn only_bundle(g: &Graph, config: &SchedulerConfig) -> Bundle {
        let mut bundles = Bundlizer::new(g, config).candidates();
        assert_eq!(bundles.len(), 1);
        bundles.remove(0)
    }

    #[test]
    fn test_whole_bundle_comes_first_when_it_fits() {
        let mut g = Graph::new();
        let a = g.create_tensor("a", shape![64, 32], Dtype::Float32, false).unwrap();
        let b = g.create_tensor("b", shape![32, 16], Dtype::Float32, false).unwrap();
        g.apply("mm", Op::gemm(), &[a, b]).unwrap();
        g.freeze().unwrap();
        let config = SchedulerConfig::default();
        let bundle = only_bundle(&g, &config);
        let all = generate::<Gaudi2Target>(&g, &bundle, &config, u64::MAX);
        assert_eq!(all[0].axis, Axis::Whole);
        assert_eq!(all[0].slice_count(), 1);
        assert!(all.iter().any(|s| s.axis == Axis::Common));
        assert!(all.iter().any(|s| s.axis == Axis::NonCommon));
    }

    #[test]
    fn test_capacity_filters_strategies() {
        let mut g = Graph::new();
        let a = g.create_tensor("a", shape![64, 32], Dtype::Float32, false).unwrap();
        let b = g.create_tensor("b", shape![32, 16], Dtype::Float32, false).unwrap();
        g.apply("mm", Op::gemm(), &[a, b]).unwrap();
        g.freeze().unwrap();
        let config = SchedulerConfig::default();
        let bundle = only_bundle(&g, &config);
        // a: 8 KiB, b: 2 KiB, out: 4 KiB.
        let capacity = 8 * 1024;
        let all = generate::<Gaudi2Target>(&g, &bundle, &config, capacity);
        assert!(!all.is_empty());
        for s in &all {
            assert!(s.min_footprint(Gaudi2Target::line_size()) <= capacity);
            assert!(s.slice_count() > 1);
        }
        assert!(generate::<Gaudi2Target>(&g, &bundle, &config, 0).is_empty());
    }

    #[test]
    fn test_layered_brain_prefers_batch() {
        let mut g = Graph::new();
        let a = g.create_tensor("a", shape![4, 16, 8], Dtype::Float32, false).unwrap();
        let b = g.create_tensor("b", shape![1, 8, 8], Dtype::Float32, false).unwrap();
        g.apply("bmm", Op::BatchGemm(BatchGemm::default()), &[a, b]).unwrap();
        g.freeze().unwrap();
        let layered = SchedulerConfig {
            layered_brain: true,
            bgemm_flatten_to_gemm: true,
            ..SchedulerConfig::default()
        };
        let bundle = only_bundle(&g, &layered);
        let all = generate::<Gaudi2Target>(&g, &bundle, &layered, u64::MAX);
        assert_eq!(all[1].axis, Axis::Batch);
        let flat = SchedulerConfig {
            layered_brain: false,
            ..layered
        };
        let all = generate::<Gaudi2Target>(&g, &bundle, &flat, u64::MAX);
        assert_eq!(all[1].axis, Axis::NonCommon);
        let plain = SchedulerConfig::default();
        let all = generate::<Gaudi2Target>(&g, &bundle, &plain, u64::MAX);
        assert!(all.iter().all(|s| s.axis != Axis::NonCommon));
    }

    #[test]
    fn test_non_box_reshape_is_trimmed() {
        // x[4, 6] -> reshape [6, 4] -> gemm with w[4, 2], sliced along M.
        let mut g = Graph::new();
        let x = g.create_tensor("x", shape![4, 6], Dtype::Float32, false).unwrap();
        let r = g
            .apply("view", Op::Reshape(Reshape { shape: shape![6, 4] }), &[x])
            .unwrap();
        let w = g.create_tensor("w", shape![4, 2], Dtype::Float32, false).unwrap();
        g.apply("mm", Op::gemm(), &[r, w]).unwrap();
        g.freeze().unwrap();
        let config = SchedulerConfig::default();
        let bundle = only_bundle(&g, &config);
        let all = generate::<Gaudi2Target>(&g, &bundle, &config, u64::MAX);
        let m_slices = all
            .iter()
            .filter(|s| s.axis == Axis::NonCommon && s.sliced[0].index_dim == 0)
            .collect::<Vec<_>>();
        // Rows of 3 map to 2 whole source rows; rows of 2 or 1 don't.
        let by_chunk = |c| m_slices.iter().find(|s| s.sliced[0].chunk == c).unwrap();
        assert!(by_chunk(3).trimmed.is_empty());
        assert_eq!(by_chunk(2).trimmed, vec![NodeId(0)]);
        // The trimmed strategy is ordered after the one keeping the reshape.
        let pos = |c| m_slices.iter().position(|s| s.sliced[0].chunk == c).unwrap();
        assert!(pos(3) < pos(2));
    }

    #[test]
    fn test_transpose_consumer_follows_anchor() {
        let mut g = Graph::new();
        let a = g.create_tensor("a", shape![8, 4], Dtype::Float32, false).unwrap();
        let b = g.create_tensor("b", shape![4, 6], Dtype::Float32, false).unwrap();
        let y = g.apply("mm", Op::gemm(), &[a, b]).unwrap();
        let t = g
            .apply("t", Op::Transpose(Transpose { perm: vec![1, 0] }), &[y])
            .unwrap();
        g.apply("relu", Op::eltwise(EltwiseFn::Relu), &[t]).unwrap();
        g.freeze().unwrap();
        let config = SchedulerConfig::default();
        let bundle = only_bundle(&g, &config);
        let all = generate::<Gaudi2Target>(&g, &bundle, &config, u64::MAX);
        let s = all
            .iter()
            .find(|s| s.axis == Axis::NonCommon && s.sliced[0].index_dim == 0)
            .unwrap();
        assert_eq!(s.members.consumers, vec![NodeId(1), NodeId(2)]);
        let last = s.operand(OperandKey::Output(NodeId(2))).unwrap();
        assert!(last.external && last.varies);
        let mid = s.operand(OperandKey::Output(NodeId(1))).unwrap();
        assert!(!mid.external);
    }

    #[test]
    fn test_upstream_reshape_kept_by_whole_row_chunks() {
        // x[21, 10] -> reshape [70, 3] -> gemm with w[3, 1]. Ten rows of the
        // gemm input are three whole rows of x.
        let mut g = Graph::new();
        let x = g.create_tensor("x", shape![21, 10], Dtype::Float32, false).unwrap();
        let r = g
            .apply("view", Op::Reshape(Reshape { shape: shape![70, 3] }), &[x])
            .unwrap();
        let w = g.create_tensor("w", shape![3, 1], Dtype::Float32, false).unwrap();
        g.apply("mm", Op::gemm(), &[r, w]).unwrap();
        g.freeze().unwrap();
        let config = SchedulerConfig::default();
        let bundle = only_bundle(&g, &config);
        assert_eq!(reshape_granules(&g, &bundle, 0), vec![10]);
        let all = generate::<Gaudi2Target>(&g, &bundle, &config, u64::MAX);
        let kept = all
            .iter()
            .filter(|s| s.axis == Axis::NonCommon && s.sliced[0].index_dim == 0)
            .filter(|s| s.trimmed.is_empty())
            .map(|s| s.sliced[0].chunk)
            .collect::<Vec<_>>();
        assert_eq!(kept, vec![40, 20, 10]);
        let s = all
            .iter()
            .find(|s| s.axis == Axis::NonCommon && s.sliced[0].chunk == 40)
            .unwrap();
        assert_eq!(s.members.producers, vec![NodeId(0)]);
        assert_eq!(s.slice_count(), 2);
        // Chunks off the granule still trim the reshape.
        let odd = all
            .iter()
            .find(|s| s.axis == Axis::NonCommon && s.sliced[0].chunk == 35)
            .unwrap();
        assert_eq!(odd.trimmed, vec![NodeId(0)]);
    }

    #[test]
    fn test_downstream_reshape_kept_by_whole_row_chunks() {
        // gemm [70, 4] x [4, 3] -> reshape [21, 10] -> relu.
        let mut g = Graph::new();
        let a = g.create_tensor("a", shape![70, 4], Dtype::Float32, false).unwrap();
        let b = g.create_tensor("b", shape![4, 3], Dtype::Float32, false).unwrap();
        let y = g.apply("mm", Op::gemm(), &[a, b]).unwrap();
        let r = g
            .apply("view", Op::Reshape(Reshape { shape: shape![21, 10] }), &[y])
            .unwrap();
        g.apply("relu", Op::eltwise(EltwiseFn::Relu), &[r]).unwrap();
        g.freeze().unwrap();
        let config = SchedulerConfig::default();
        let bundle = only_bundle(&g, &config);
        assert_eq!(bundle.len(), 3);
        let all = generate::<Gaudi2Target>(&g, &bundle, &config, u64::MAX);
        let m_sliced = all
            .iter()
            .filter(|s| s.axis == Axis::NonCommon && s.sliced[0].index_dim == 0)
            .collect::<Vec<_>>();
        for s in &m_sliced {
            let whole_rows = s.sliced[0].chunk % 10 == 0;
            assert_eq!(s.trimmed.is_empty(), whole_rows, "{s}");
        }
        let kept = m_sliced.iter().find(|s| s.sliced[0].chunk == 20).unwrap();
        assert_eq!(kept.members.consumers, vec![NodeId(1), NodeId(2)]);
        assert_eq!(kept.slice_count(), 4);
    }

    #[test]
    fn test_cyclic_graph_yields_no_strategies() {
        let mut g = Graph::new();
        let a = g.create_tensor("a", shape![8, 8], Dtype::Float32, false).unwrap();
        let b = g.create_tensor("b", shape![8, 8], Dtype::Float32, false).unwrap();
        let y = g.apply("mm", Op::gemm(), &[a, b]).unwrap();
        g.apply("relu", Op::eltwise(EltwiseFn::Relu), &[y]).unwrap();
        g.add_control_edge(NodeId(1), NodeId(0)).unwrap();
        let mut bundle = Bundle::new(BundleId(0), BundleKind::Mme, NodeId(0));
        bundle.push(NodeId(1), MemberRole::Consumer, NodeId(0));
        assert!(matches!(
            Members::from_bundle(&g, &bundle),
            Err(GraphError::Cycle(_))
        ));
        let config = SchedulerConfig::default();
        assert!(generate::<Gaudi2Target>(&g, &bundle, &config, u64::MAX).is_empty());
    }
}
