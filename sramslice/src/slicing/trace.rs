//! Derivation of every bundle member's work for one slice.
//!
//! The anchor's index box comes straight from the slice coordinates. Producer
//! boxes are derived backwards from the regions their readers need, the slave's
//! box from the shared operand's region, and consumer boxes forwards from the
//! anchor's completed output region.

use log::trace;
use std::collections::HashMap;

use super::{Members, OperandKey, SlicedDim};
use crate::common::{Region, Shape};
use crate::graph::access::{flat_range, IndexDim};
use crate::graph::{BoundNode, Graph, NodeId, TensorId};
use crate::tiling::{DimSlicing, SliceWalk};

/// One node's work within a slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceStep {
    pub node: NodeId,
    pub index_box: Region,
    pub inputs: Vec<(OperandKey, Region)>,
    pub output: Region,
    /// Adds to the partial result already in the output region.
    pub accumulate: bool,
    /// No later slice writes this output region.
    pub final_write: bool,
    /// A producer step recomputing the region its output operand already holds
    /// from the previous slice. Emission skips such steps.
    pub reused: bool,
}

/// A member whose work can't be derived from the anchor's slicing.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{node} can't follow the anchor's slicing")]
pub struct Conflict {
    pub node: NodeId,
}

pub struct Tracer<'a> {
    graph: &'a Graph,
    shapes: &'a [Shape],
    members: &'a Members,
    dims: Vec<(u8, DimSlicing)>,
    snake: Option<usize>,
}

/// Tracks the state carried between consecutive slices of a walk.
#[derive(Default)]
pub struct WalkState {
    /// The output region each member wrote most recently.
    last_output: HashMap<NodeId, Region>,
    /// Accumulations started but not yet completed: output region and the end
    /// of the reduction prefix covered so far.
    pending: HashMap<NodeId, (Region, u64)>,
    last_slave_box: Option<Region>,
}

impl<'a> Tracer<'a> {
    /// `sliced` chunks are applied to the anchor's index space under `shapes`,
    /// so slice counts follow the actual sizes.
    pub fn new(
        graph: &'a Graph,
        shapes: &'a [Shape],
        members: &'a Members,
        sliced: &[SlicedDim],
        snake: Option<usize>,
    ) -> Self {
        let sizes = graph.bound(members.anchor, shapes).index_sizes();
        let dims = sliced
            .iter()
            .map(|sd| {
                (
                    sd.index_dim,
                    DimSlicing::new(sizes[usize::from(sd.index_dim)], sd.chunk),
                )
            })
            .collect();
        Tracer {
            graph,
            shapes,
            members,
            dims,
            snake,
        }
    }

    pub fn slice_count(&self) -> u64 {
        self.dims.iter().map(|(_, s)| u64::from(s.count())).product()
    }

    pub fn walk(&self) -> SliceWalk {
        SliceWalk::new(self.dims.iter().map(|(_, s)| s.count()).collect(), self.snake)
    }

    fn bound(&self, node: NodeId) -> BoundNode<'a> {
        self.graph.bound(node, self.shapes)
    }

    fn member_producing(&self, tensor: TensorId) -> Option<NodeId> {
        self.graph
            .tensor(tensor)
            .producer()
            .filter(|p| self.members.contains(*p))
    }

    /// The steps of the slice at `coords`, in execution order.
    ///
    /// `state` must be the same for every slice of one walk, visited in walk
    /// order; it is how accumulation order and operand reuse are checked.
    pub fn slice(&self, coords: &[u32], state: &mut WalkState) -> Result<Vec<SliceStep>, Conflict> {
        let m = self.members;
        let anchor = self.bound(m.anchor);
        let anchor_sizes = anchor.index_sizes();
        let mut anchor_box = Region::from_sizes(&anchor_sizes);
        for ((dim, slicing), &c) in self.dims.iter().zip(coords) {
            anchor_box.0[usize::from(*dim)] = slicing.range(c);
        }
        let anchor_inputs = self.input_regions(m.anchor, &anchor, &anchor_box)?;

        // Producer output regions, requested downstream first.
        let mut wanted: HashMap<NodeId, Region> = HashMap::new();
        let anchor_node = self.graph.node(m.anchor);
        for (slot, region) in anchor_inputs.iter().enumerate() {
            self.request(&mut wanted, anchor_node.inputs[slot], region)?;
        }
        let mut producer_work: HashMap<NodeId, (Region, Vec<Region>, Region)> = HashMap::new();
        for &p in m.producers.iter().rev() {
            let bound = self.bound(p);
            let out = wanted.get(&p).cloned().ok_or(Conflict { node: p })?;
            let sizes = bound.index_sizes();
            let index_box = bound
                .output_access()
                .index_box_for(&out, &sizes, &bound.output_shape())
                .ok_or(Conflict { node: p })?;
            let ins = self.input_regions(p, &bound, &index_box)?;
            for (slot, region) in ins.iter().enumerate() {
                self.request(&mut wanted, self.graph.node(p).inputs[slot], region)?;
            }
            producer_work.insert(p, (index_box, ins, out));
        }

        let mut steps: Vec<SliceStep> = vec![];
        let mut written: HashMap<NodeId, Region> = HashMap::new();

        for &p in &m.producers {
            let (index_box, ins, out) = producer_work.remove(&p).ok_or(Conflict { node: p })?;
            let step = self.step(p, index_box, &ins, out, &written, &anchor_inputs, state)?;
            written.insert(p, step.output.clone());
            steps.push(step);
        }

        let anchor_out = anchor
            .output_access()
            .region(&anchor_box, &anchor_sizes, &anchor.output_shape())
            .ok_or(Conflict { node: m.anchor })?;
        let anchor_step = self.step(
            m.anchor,
            anchor_box,
            &anchor_inputs,
            anchor_out,
            &written,
            &anchor_inputs,
            state,
        )?;
        let anchor_final = anchor_step.final_write;
        written.insert(m.anchor, anchor_step.output.clone());
        steps.push(anchor_step);

        if let Some(slave) = m.slave {
            let shared = anchor_node.inputs[usize::from(slave.anchor_slot)];
            let shared_region = anchor_inputs[usize::from(slave.anchor_slot)].clone();
            let (slave_tensor, slave_region) = match slave.via {
                Some(r) => {
                    let bound = self.bound(r);
                    let sizes = bound.index_sizes();
                    let index_box = bound
                        .input_access(0)
                        .index_box_for(&shared_region, &sizes, &bound.input_shape(0))
                        .ok_or(Conflict { node: slave.node })?;
                    let out = bound
                        .output_access()
                        .region(&index_box, &sizes, &bound.output_shape())
                        .ok_or(Conflict { node: slave.node })?;
                    let step = self.step(
                        r,
                        index_box,
                        &[shared_region.clone()],
                        out,
                        &written,
                        &anchor_inputs,
                        state,
                    )?;
                    written.insert(r, step.output.clone());
                    let out = step.output.clone();
                    steps.push(step);
                    (self.graph.node(r).output, out)
                }
                None => (shared, shared_region),
            };
            let bound = self.bound(slave.node);
            let sizes = bound.index_sizes();
            let slot = self
                .graph
                .node(slave.node)
                .inputs
                .iter()
                .position(|&t| t == slave_tensor)
                .ok_or(Conflict { node: slave.node })?;
            let index_box = bound
                .input_access(slot)
                .index_box_for(&slave_region, &sizes, &bound.input_shape(slot))
                .ok_or(Conflict { node: slave.node })?;
            if state.last_slave_box.as_ref() == Some(&index_box) {
                // The anchor slices a dimension the shared operand doesn't have.
                return Err(Conflict { node: slave.node });
            }
            state.last_slave_box = Some(index_box.clone());
            let ins = self.input_regions(slave.node, &bound, &index_box)?;
            let out = bound
                .output_access()
                .region(&index_box, &sizes, &bound.output_shape())
                .ok_or(Conflict { node: slave.node })?;
            let step = self.step(slave.node, index_box, &ins, out, &written, &anchor_inputs, state)?;
            written.insert(slave.node, step.output.clone());
            steps.push(step);
        }

        if anchor_final {
            let mut prev = m.anchor;
            for &c in &m.consumers {
                let bound = self.bound(c);
                let sizes = bound.index_sizes();
                let prev_tensor = self.graph.node(prev).output;
                let prev_region = written.get(&prev).cloned().ok_or(Conflict { node: c })?;
                let slot = self
                    .graph
                    .node(c)
                    .inputs
                    .iter()
                    .position(|&t| t == prev_tensor)
                    .ok_or(Conflict { node: c })?;
                let access = bound.input_access(slot);
                let index_box = access
                    .index_box_for(&prev_region, &sizes, &bound.input_shape(slot))
                    .ok_or(Conflict { node: c })?;
                if access.region(&index_box, &sizes, &bound.input_shape(slot)).as_ref()
                    != Some(&prev_region)
                {
                    return Err(Conflict { node: c });
                }
                let ins = self.input_regions(c, &bound, &index_box)?;
                let out = bound
                    .output_access()
                    .region(&index_box, &sizes, &bound.output_shape())
                    .ok_or(Conflict { node: c })?;
                let step = self.step(c, index_box, &ins, out, &written, &anchor_inputs, state)?;
                if step.accumulate || !step.final_write {
                    return Err(Conflict { node: c });
                }
                written.insert(c, step.output.clone());
                steps.push(step);
                prev = c;
            }
        }

        Ok(steps)
    }

    /// Checks that no accumulation was left unfinished by the walk.
    pub fn finish(&self, state: &WalkState) -> Result<(), Conflict> {
        match state.pending.keys().min() {
            Some(&node) => Err(Conflict { node }),
            None => Ok(()),
        }
    }

    fn input_regions(
        &self,
        node: NodeId,
        bound: &BoundNode<'_>,
        index_box: &Region,
    ) -> Result<Vec<Region>, Conflict> {
        let sizes = bound.index_sizes();
        (0..bound.inputs.len())
            .map(|slot| {
                bound
                    .input_access(slot)
                    .region(index_box, &sizes, &bound.input_shape(slot))
                    .ok_or(Conflict { node })
            })
            .collect()
    }

    fn request(
        &self,
        wanted: &mut HashMap<NodeId, Region>,
        tensor: TensorId,
        region: &Region,
    ) -> Result<(), Conflict> {
        let Some(p) = self.member_producing(tensor) else {
            return Ok(());
        };
        if !self.members.producers.contains(&p) {
            return Ok(());
        }
        match wanted.get(&p) {
            Some(existing) if existing != region => Err(Conflict { node: p }),
            Some(_) => Ok(()),
            None => {
                wanted.insert(p, region.clone());
                Ok(())
            }
        }
    }

    /// Which operand serves `node`'s input `slot`.
    fn resolve(
        &self,
        node: NodeId,
        slot: usize,
        region: &Region,
        written: &HashMap<NodeId, Region>,
        anchor_inputs: &[Region],
    ) -> Result<OperandKey, Conflict> {
        let tensor = self.graph.node(node).inputs[slot];
        if let Some(m) = self.member_producing(tensor).filter(|&m| m != node) {
            let held = written.get(&m).ok_or(Conflict { node })?;
            if !region.is_empty() && !held.contains(region) {
                return Err(Conflict { node });
            }
            return Ok(OperandKey::Output(m));
        }
        if let Some(slave) = self.members.slave {
            let on_slave_path = node == slave.node || Some(node) == slave.via;
            let anchor_slot = usize::from(slave.anchor_slot);
            let shared = self.graph.node(self.members.anchor).inputs[anchor_slot];
            if on_slave_path && tensor == shared {
                if !region.is_empty() && !anchor_inputs[anchor_slot].contains(region) {
                    return Err(Conflict { node: slave.node });
                }
                return Ok(OperandKey::Input {
                    node: self.members.anchor,
                    slot: slave.anchor_slot,
                });
            }
        }
        Ok(OperandKey::Input {
            node,
            slot: slot as u8,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn step(
        &self,
        node: NodeId,
        index_box: Region,
        ins: &[Region],
        output: Region,
        written: &HashMap<NodeId, Region>,
        anchor_inputs: &[Region],
        state: &mut WalkState,
    ) -> Result<SliceStep, Conflict> {
        let inputs = ins
            .iter()
            .enumerate()
            .map(|(slot, r)| Ok((self.resolve(node, slot, r, written, anchor_inputs)?, r.clone())))
            .collect::<Result<Vec<_>, Conflict>>()?;
        let space = self.bound(node).index_space();
        let (accumulate, final_write) = accumulation(node, &space, &index_box, &output, state)?;
        let reused = self.members.is_producer(node)
            && state.last_output.get(&node) == Some(&output);
        state.last_output.insert(node, output.clone());
        trace!("{} box {} -> {}", node, index_box, output);
        Ok(SliceStep {
            node,
            index_box,
            inputs,
            output,
            accumulate,
            final_write,
            reused,
        })
    }
}

/// Where a box's reduction coordinates fall in the reduction nest.
///
/// Partial sums only match unsliced execution when each output region's
/// reduction boxes are contiguous runs of the nest, visited in order with
/// nothing written to the region in between.
fn accumulation(
    node: NodeId,
    space: &[IndexDim],
    index_box: &Region,
    output: &Region,
    state: &mut WalkState,
) -> Result<(bool, bool), Conflict> {
    let (sizes, ranges): (Vec<u32>, Vec<_>) = space
        .iter()
        .zip(&index_box.0)
        .filter(|(d, _)| d.reduction)
        .map(|(d, r)| (d.size, r.clone()))
        .unzip();
    if sizes.is_empty() {
        return Ok((false, true));
    }
    let total: u64 = sizes.iter().map(|&s| u64::from(s)).product();
    let run = flat_range(&sizes, &Region(ranges)).ok_or(Conflict { node })?;
    let accumulate = run.start > 0;
    if accumulate {
        match state.pending.get(&node) {
            Some((region, end)) if region == output && *end == run.start => {}
            _ => return Err(Conflict { node }),
        }
    } else if state.pending.contains_key(&node) {
        return Err(Conflict { node });
    }
    let final_write = run.end == total;
    if final_write {
        state.pending.remove(&node);
    } else {
        state.pending.insert(node, (output.clone(), run.end));
    }
    Ok((accumulate, final_write))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundlizer::{Bundle, BundleId, BundleKind, MemberRole};
    use crate::common::Dtype;
    use crate::graph::ops::{EltwiseFn, Op};
    use crate::shape;

    fn gemm_relu() -> Graph {
        let mut g = Graph::new();
        let x = g.create_tensor("x", shape![8, 6], Dtype::Float32, false).unwrap();
        let a = g.apply("relu", Op::eltwise(EltwiseFn::Relu), &[x]).unwrap();
        let b = g.create_tensor("b", shape![6, 4], Dtype::Float32, false).unwrap();
        g.apply("mm", Op::gemm(), &[a, b]).unwrap();
        g.freeze().unwrap();
        g
    }

    fn members(g: &Graph) -> Members {
        let mut b = Bundle::new(BundleId(0), BundleKind::Mme, NodeId(1));
        b.push(NodeId(0), MemberRole::Producer, NodeId(1));
        Members::from_bundle(g, &b).unwrap()
    }

    #[test]
    fn test_common_dim_slices_accumulate_in_order() {
        let g = gemm_relu();
        let shapes = g.max_shapes();
        let m = members(&g);
        let sliced = [SlicedDim {
            index_dim: 2,
            chunk: 4,
        }];
        let tracer = Tracer::new(&g, &shapes, &m, &sliced, None);
        let mut state = WalkState::default();
        let slices = tracer
            .walk()
            .map(|c| tracer.slice(&c, &mut state).unwrap())
            .collect::<Vec<_>>();
        tracer.finish(&state).unwrap();
        assert_eq!(slices.len(), 2);
        let first_mm = &slices[0][1];
        let second_mm = &slices[1][1];
        assert!(!first_mm.accumulate && !first_mm.final_write);
        assert!(second_mm.accumulate && second_mm.final_write);
        // The producer follows the K slice of the anchor's left operand.
        assert_eq!(slices[1][0].output, Region(vec![0..8, 4..6]));
        assert_eq!(
            second_mm.inputs[0],
            (OperandKey::Output(NodeId(0)), Region(vec![0..8, 4..6]))
        );
    }

    #[test]
    fn test_parallel_slice_reuses_unchanged_producer() {
        let g = gemm_relu();
        let shapes = g.max_shapes();
        let m = members(&g);
        // Slicing N leaves the left operand whole in every slice.
        let sliced = [SlicedDim {
            index_dim: 1,
            chunk: 2,
        }];
        let tracer = Tracer::new(&g, &shapes, &m, &sliced, None);
        let mut state = WalkState::default();
        let slices = tracer
            .walk()
            .map(|c| tracer.slice(&c, &mut state).unwrap())
            .collect::<Vec<_>>();
        assert!(!slices[0][0].reused);
        assert!(slices[1][0].reused);
        assert!(slices.iter().all(|s| s[1].final_write));
    }
}
