//! Lowering of a [Scheduled] graph to an ordered list of DMA and compute tasks.
//!
//! Every SRAM buffer slot is tracked with the region it holds, the task which
//! last wrote it and the tasks which read it since. A task waits on the writer
//! of every slot it reads (RAW) and, before overwriting a slot, on everything
//! that used the previous contents (WAR/WAW). HBM tensors are tracked by their
//! writers only: nothing reads a tensor region before it is complete.

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt::{self, Display};

use crate::allocator::Placement;
use crate::bundlizer::BundleId;
use crate::common::{shape_to_u32s, Region, Shape};
use crate::datadeps::Unit;
use crate::graph::{Graph, GraphError, NodeId, TensorId};
use crate::scheduler::{ScheduledBundle, Scheduled};
use crate::slicing::trace::{SliceStep, Tracer, WalkState};
use crate::slicing::OperandKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct TaskId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct BufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum BufferUse {
    Operand {
        bundle: BundleId,
        key: OperandKey,
        slot: u8,
    },
    Pinned(TensorId),
    ScalarPipe {
        node: NodeId,
        slot: u8,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BufferDesc {
    pub id: BufferId,
    pub bytes: u64,
    pub usage: BufferUse,
}

/// Where a compute task finds or puts an operand region. Regions are always in
/// the tensor's own coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum Operand {
    Hbm {
        tensor: TensorId,
        region: Region,
    },
    Sram {
        buffer: BufferId,
        tensor: TensorId,
        region: Region,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum TaskKind {
    /// Copy a region from HBM into a buffer, replacing its contents.
    Fetch {
        tensor: TensorId,
        region: Region,
        dst: BufferId,
    },
    Compute {
        node: NodeId,
        index_box: Region,
        inputs: Vec<Operand>,
        output: Operand,
        /// Add to the partial result the output region already holds.
        accumulate: bool,
    },
    /// Copy a region out of a buffer into HBM.
    Evict {
        src: BufferId,
        tensor: TensorId,
        region: Region,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SliceTask {
    pub id: TaskId,
    pub bundle: Option<BundleId>,
    pub slice: u64,
    pub kind: TaskKind,
    /// Earlier tasks which must complete first.
    pub waits: SmallVec<[TaskId; 4]>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Pipeline {
    pub tasks: Vec<SliceTask>,
    pub buffers: Vec<BufferDesc>,
    /// The shape of every tensor the tasks were emitted for.
    pub shapes: Vec<Shape>,
}

#[derive(thiserror::Error, Debug)]
pub enum EmitError {
    #[error(transparent)]
    Shapes(#[from] GraphError),
    #[error("{node} can't follow the slicing of {bundle:?} at the bound shapes")]
    Untraceable { bundle: BundleId, node: NodeId },
    #[error("{0:?} is missing from the schedule")]
    MissingBundle(BundleId),
    #[error("{node} reads {key:?}, which no buffer holds")]
    NotResident { node: NodeId, key: OperandKey },
}

impl Operand {
    pub fn tensor(&self) -> TensorId {
        match self {
            Operand::Hbm { tensor, .. } | Operand::Sram { tensor, .. } => *tensor,
        }
    }

    pub fn region(&self) -> &Region {
        match self {
            Operand::Hbm { region, .. } | Operand::Sram { region, .. } => region,
        }
    }

    pub fn buffer(&self) -> Option<BufferId> {
        match self {
            Operand::Hbm { .. } => None,
            Operand::Sram { buffer, .. } => Some(*buffer),
        }
    }
}

impl Pipeline {
    pub fn fetch_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| matches!(t.kind, TaskKind::Fetch { .. }))
            .count()
    }

    pub fn evict_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| matches!(t.kind, TaskKind::Evict { .. }))
            .count()
    }

    pub fn computes_of(&self, node: NodeId) -> impl Iterator<Item = &SliceTask> + '_ {
        self.tasks
            .iter()
            .filter(move |t| matches!(t.kind, TaskKind::Compute { node: n, .. } if n == node))
    }

    /// Number of slices `bundle` was emitted with.
    pub fn slice_count(&self, bundle: BundleId) -> u64 {
        self.tasks
            .iter()
            .filter(|t| t.bundle == Some(bundle))
            .map(|t| t.slice + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn buffer(&self, id: BufferId) -> &BufferDesc {
        &self.buffers[id.0 as usize]
    }
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Fetch { tensor, region, dst } => {
                write!(f, "fetch {}{} -> b{}", tensor, region, dst.0)
            }
            TaskKind::Compute {
                node,
                index_box,
                accumulate,
                ..
            } => {
                write!(f, "{} {}{}", node, index_box, if *accumulate { " +=" } else { "" })
            }
            TaskKind::Evict {
                src,
                tensor,
                region,
            } => write!(f, "evict b{} -> {}{}", src.0, tensor, region),
        }
    }
}

/// Emit `scheduled` for the graph's maximum shapes.
pub fn emit(graph: &Graph, scheduled: &Scheduled) -> Result<Pipeline, EmitError> {
    emit_with_shapes(graph, scheduled, graph.max_shapes())
}

/// Emit `scheduled` for actual graph input shapes. Slice counts follow the bound
/// sizes; chunk and buffer sizes stay as planned.
pub fn emit_for_inputs(
    graph: &Graph,
    scheduled: &Scheduled,
    inputs: &HashMap<TensorId, Shape>,
) -> Result<Pipeline, EmitError> {
    let shapes = graph.bind_shapes(inputs)?;
    emit_with_shapes(graph, scheduled, shapes)
}

pub fn emit_with_shapes(
    graph: &Graph,
    scheduled: &Scheduled,
    shapes: Vec<Shape>,
) -> Result<Pipeline, EmitError> {
    let mut emitter = Emitter {
        graph,
        scheduled,
        shapes: &shapes,
        tasks: vec![],
        buffers: vec![],
        hbm_writers: HashMap::new(),
        last_compute: HashMap::new(),
        pinned: HashMap::new(),
    };
    emitter.pin_tensors();
    for unit in &scheduled.units {
        match *unit {
            Unit::Bundle(id) => {
                let b = scheduled
                    .bundles
                    .get(&id)
                    .ok_or(EmitError::MissingBundle(id))?;
                emitter.emit_bundle(b)?;
            }
            Unit::Node(n) => emitter.emit_node(n),
        }
    }
    debug!(
        "Emitted {} tasks over {} buffers",
        emitter.tasks.len(),
        emitter.buffers.len()
    );
    let (tasks, buffers) = (emitter.tasks, emitter.buffers);
    Ok(Pipeline {
        tasks,
        buffers,
        shapes,
    })
}

/// One SRAM buffer and what it currently holds.
struct Slot {
    buffer: BufferId,
    held: Option<Region>,
    writer: Option<TaskId>,
    readers: Vec<TaskId>,
}

/// The slots of one bundle operand, used round-robin.
struct Slots {
    slots: Vec<Slot>,
    current: Option<usize>,
}

impl Slots {
    fn current(&self) -> Option<&Slot> {
        self.current.map(|c| &self.slots[c])
    }

    /// Move on to the next slot, which is about to be overwritten.
    fn rotate(&mut self) -> usize {
        let next = self.current.map_or(0, |c| (c + 1) % self.slots.len());
        self.current = Some(next);
        next
    }
}

struct Emitter<'a> {
    graph: &'a Graph,
    scheduled: &'a Scheduled,
    shapes: &'a [Shape],
    tasks: Vec<SliceTask>,
    buffers: Vec<BufferDesc>,
    hbm_writers: HashMap<TensorId, Vec<TaskId>>,
    last_compute: HashMap<NodeId, TaskId>,
    pinned: HashMap<TensorId, Slot>,
}

impl Emitter<'_> {
    fn new_buffer(&mut self, bytes: u64, usage: BufferUse) -> BufferId {
        let id = BufferId(self.buffers.len() as u32);
        self.buffers.push(BufferDesc { id, bytes, usage });
        id
    }

    fn push(
        &mut self,
        bundle: Option<BundleId>,
        slice: u64,
        kind: TaskKind,
        waits: impl IntoIterator<Item = TaskId>,
    ) -> TaskId {
        let id = TaskId(self.tasks.len() as u32);
        let mut waits = waits.into_iter().collect::<SmallVec<[TaskId; 4]>>();
        waits.sort_unstable();
        waits.dedup();
        trace!("t{} {} after {:?}", id.0, kind, waits);
        self.tasks.push(SliceTask {
            id,
            bundle,
            slice,
            kind,
            waits,
        });
        id
    }

    fn writers_of(&self, tensor: TensorId) -> impl Iterator<Item = TaskId> + '_ {
        self.hbm_writers.get(&tensor).into_iter().flatten().copied()
    }

    /// Last computes of the nodes `node` is ordered after by control edges.
    fn control_waits(&self, node: NodeId) -> Vec<TaskId> {
        self.graph
            .control_edges()
            .iter()
            .chain(&self.scheduled.control_edges)
            .filter(|(_, to)| *to == node)
            .filter_map(|(from, _)| self.last_compute.get(from).copied())
            .collect()
    }

    fn full(&self, tensor: TensorId) -> Region {
        Region::from_sizes(&shape_to_u32s(&self.shapes[tensor.0 as usize]))
    }

    /// Pinned tensors get their buffer up front. Graph inputs are fetched into
    /// it before anything runs.
    fn pin_tensors(&mut self) {
        let scheduled = self.scheduled;
        for &t in &scheduled.pinned {
            let buffer = self.new_buffer(self.graph.tensor(t).bytes(), BufferUse::Pinned(t));
            let mut slot = Slot {
                buffer,
                held: None,
                writer: None,
                readers: vec![],
            };
            if self.graph.tensor(t).producer().is_none() {
                let region = self.full(t);
                let kind = TaskKind::Fetch {
                    tensor: t,
                    region: region.clone(),
                    dst: buffer,
                };
                slot.writer = Some(self.push(None, 0, kind, []));
                slot.held = Some(region);
            }
            self.pinned.insert(t, slot);
        }
    }

    fn emit_node(&mut self, n: NodeId) {
        let graph = self.graph;
        let node = graph.node(n);
        let bound = graph.bound(n, self.shapes);
        let index_box = Region::from_sizes(&bound.index_sizes());
        let mut waits = self.control_waits(n);
        let mut inputs = vec![];
        let mut pinned_reads = vec![];
        for (slot, &t) in node.inputs.iter().enumerate() {
            let region = self.full(t);
            if let Some(p) = self.pinned.get(&t) {
                waits.extend(p.writer);
                pinned_reads.push(t);
                inputs.push(Operand::Sram {
                    buffer: p.buffer,
                    tensor: t,
                    region,
                });
            } else if self.scheduled.is_scalar_pipe(n, slot as u8) {
                let buffer = self.new_buffer(
                    graph.tensor(t).bytes(),
                    BufferUse::ScalarPipe {
                        node: n,
                        slot: slot as u8,
                    },
                );
                let deps = self.writers_of(t).collect::<Vec<_>>();
                let kind = TaskKind::Fetch {
                    tensor: t,
                    region: region.clone(),
                    dst: buffer,
                };
                waits.push(self.push(None, 0, kind, deps));
                inputs.push(Operand::Sram {
                    buffer,
                    tensor: t,
                    region,
                });
            } else {
                waits.extend(self.writers_of(t));
                inputs.push(Operand::Hbm { tensor: t, region });
            }
        }

        let out = node.output;
        let region = self.full(out);
        let output = match self.pinned.get(&out) {
            Some(p) => Operand::Sram {
                buffer: p.buffer,
                tensor: out,
                region: region.clone(),
            },
            None => Operand::Hbm {
                tensor: out,
                region: region.clone(),
            },
        };
        let kind = TaskKind::Compute {
            node: n,
            index_box,
            inputs,
            output,
            accumulate: false,
        };
        let id = self.push(None, 0, kind, waits);
        self.last_compute.insert(n, id);
        for t in pinned_reads {
            if let Some(p) = self.pinned.get_mut(&t) {
                p.readers.push(id);
            }
        }

        let leaves = self.pinned_leaves_sram(out);
        match self.pinned.get_mut(&out) {
            Some(p) => {
                p.writer = Some(id);
                p.held = Some(region.clone());
                if leaves {
                    let buffer = p.buffer;
                    let kind = TaskKind::Evict {
                        src: buffer,
                        tensor: out,
                        region,
                    };
                    let evict = self.push(None, 0, kind, [id]);
                    if let Some(p) = self.pinned.get_mut(&out) {
                        p.readers.push(evict);
                    }
                    self.hbm_writers.entry(out).or_default().push(evict);
                }
            }
            None => self.hbm_writers.entry(out).or_default().push(id),
        }
    }

    /// Whether a pinned tensor also needs a copy in HBM: it's observable or a
    /// bundle reads it.
    fn pinned_leaves_sram(&self, t: TensorId) -> bool {
        self.graph.is_observable(t)
            || self
                .graph
                .tensor(t)
                .consumers()
                .iter()
                .any(|&c| self.scheduled.bundle_of(c).is_some())
    }

    fn emit_bundle(&mut self, sb: &ScheduledBundle) -> Result<(), EmitError> {
        let id = sb.bundle.id;
        let strategy = &sb.strategy;
        let mut slots: HashMap<OperandKey, Slots> = HashMap::new();
        for oa in &sb.allocation.operands {
            let Placement::Sram {
                buffers,
                slot_bytes,
            } = oa.placement
            else {
                continue;
            };
            let s = (0..buffers)
                .map(|slot| Slot {
                    buffer: self.new_buffer(
                        slot_bytes,
                        BufferUse::Operand {
                            bundle: id,
                            key: oa.key,
                            slot,
                        },
                    ),
                    held: None,
                    writer: None,
                    readers: vec![],
                })
                .collect();
            slots.insert(
                oa.key,
                Slots {
                    slots: s,
                    current: None,
                },
            );
        }

        let tracer = Tracer::new(
            self.graph,
            self.shapes,
            &strategy.members,
            &strategy.sliced,
            strategy.snake,
        );
        let untraceable = |c: crate::slicing::trace::Conflict| EmitError::Untraceable {
            bundle: id,
            node: c.node,
        };
        let mut state = WalkState::default();
        for (slice, coords) in tracer.walk().enumerate() {
            let steps = tracer.slice(&coords, &mut state).map_err(untraceable)?;
            for step in steps {
                if step.reused || step.index_box.is_empty() {
                    continue;
                }
                self.emit_step(sb, slice as u64, &step, &mut slots)?;
            }
        }
        tracer.finish(&state).map_err(untraceable)?;
        Ok(())
    }

    fn emit_step(
        &mut self,
        sb: &ScheduledBundle,
        slice: u64,
        step: &SliceStep,
        slots: &mut HashMap<OperandKey, Slots>,
    ) -> Result<(), EmitError> {
        let bundle = Some(sb.bundle.id);
        let node = self.graph.node(step.node);
        let mut waits = self.control_waits(step.node);
        let mut inputs = vec![];
        let mut reads = vec![];

        for (slot_idx, (key, region)) in step.inputs.iter().enumerate() {
            let tensor = node.inputs[slot_idx];
            let Some(op_slots) = slots.get_mut(key).filter(|_| !region.is_empty()) else {
                waits.extend(self.writers_of(tensor));
                inputs.push(Operand::Hbm {
                    tensor,
                    region: region.clone(),
                });
                continue;
            };
            let resident = op_slots
                .current()
                .and_then(|s| s.held.as_ref())
                .is_some_and(|h| h.contains(region));
            if !resident {
                if let OperandKey::Output(_) = key {
                    return Err(EmitError::NotResident {
                        node: step.node,
                        key: *key,
                    });
                }
                let idx = op_slots.rotate();
                let s = &mut op_slots.slots[idx];
                let mut deps = self.writers_of(tensor).collect::<Vec<_>>();
                deps.extend(s.writer);
                deps.extend(s.readers.drain(..));
                let kind = TaskKind::Fetch {
                    tensor,
                    region: region.clone(),
                    dst: s.buffer,
                };
                let fetch = self.push(bundle, slice, kind, deps);
                let s = &mut op_slots.slots[idx];
                s.writer = Some(fetch);
                s.held = Some(region.clone());
            }
            let idx = op_slots.current.ok_or(EmitError::NotResident {
                node: step.node,
                key: *key,
            })?;
            let s = &op_slots.slots[idx];
            waits.extend(s.writer);
            inputs.push(Operand::Sram {
                buffer: s.buffer,
                tensor,
                region: region.clone(),
            });
            reads.push((*key, idx));
        }

        let out = node.output;
        let out_key = OperandKey::Output(step.node);
        let (output, out_slot) = match slots.get_mut(&out_key) {
            None => {
                if step.accumulate {
                    waits.extend(self.writers_of(out));
                }
                let op = Operand::Hbm {
                    tensor: out,
                    region: step.output.clone(),
                };
                (op, None)
            }
            Some(op_slots) => {
                let idx = match (step.accumulate, op_slots.current) {
                    (true, Some(c)) => c,
                    (true, None) => {
                        return Err(EmitError::NotResident {
                            node: step.node,
                            key: out_key,
                        })
                    }
                    (false, _) => op_slots.rotate(),
                };
                let s = &op_slots.slots[idx];
                waits.extend(s.writer);
                waits.extend(s.readers.iter().copied());
                let op = Operand::Sram {
                    buffer: s.buffer,
                    tensor: out,
                    region: step.output.clone(),
                };
                (op, Some(idx))
            }
        };

        let kind = TaskKind::Compute {
            node: step.node,
            index_box: step.index_box.clone(),
            inputs,
            output,
            accumulate: step.accumulate,
        };
        let id = self.push(bundle, slice, kind, waits);
        self.last_compute.insert(step.node, id);
        for (key, idx) in reads {
            if let Some(s) = slots.get_mut(&key) {
                s.slots[idx].readers.push(id);
            }
        }

        let Some(idx) = out_slot else {
            self.hbm_writers.entry(out).or_default().push(id);
            return Ok(());
        };
        let external = sb
            .strategy
            .operand(out_key)
            .is_some_and(|info| info.external);
        let Some(op_slots) = slots.get_mut(&out_key) else {
            return Ok(());
        };
        let s = &mut op_slots.slots[idx];
        s.writer = Some(id);
        if !step.accumulate {
            s.readers.clear();
            s.held = Some(step.output.clone());
        }
        if step.final_write && external {
            let kind = TaskKind::Evict {
                src: s.buffer,
                tensor: out,
                region: step.output.clone(),
            };
            let evict = self.push(bundle, slice, kind, [id]);
            if let Some(op_slots) = slots.get_mut(&out_key) {
                op_slots.slots[idx].readers.push(evict);
            }
            self.hbm_writers.entry(out).or_default().push(evict);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::config::SchedulerConfig;
    use crate::graph::ops::{EltwiseFn, Op};
    use crate::graph::MemoryHint;
    use crate::scheduler::schedule;
    use crate::shape;
    use crate::target::Gaudi2Target;
    use std::collections::HashSet;

    fn config(capacity: u64) -> SchedulerConfig {
        SchedulerConfig {
            sram_capacity_bytes: capacity,
            cost_model: false,
            ..SchedulerConfig::default()
        }
    }

    fn mlp() -> Graph {
        let mut g = Graph::new();
        let x = g.create_tensor("x", shape![64, 32], Dtype::Float32, false).unwrap();
        let w0 = g.create_tensor("w0", shape![32, 32], Dtype::Float32, false).unwrap();
        let w1 = g.create_tensor("w1", shape![32, 16], Dtype::Float32, false).unwrap();
        let h = g.apply("mm0", Op::gemm(), &[x, w0]).unwrap();
        let r = g.apply("relu", Op::eltwise(EltwiseFn::Relu), &[h]).unwrap();
        g.apply("mm1", Op::gemm(), &[r, w1]).unwrap();
        g.freeze().unwrap();
        g
    }

    enum Access {
        Buffer(BufferId),
        Hbm(TensorId, Region),
    }

    fn accesses(kind: &TaskKind) -> (Vec<Access>, Vec<Access>) {
        let as_access = |op: &Operand| match op {
            Operand::Hbm { tensor, region } => Access::Hbm(*tensor, region.clone()),
            Operand::Sram { buffer, .. } => Access::Buffer(*buffer),
        };
        match kind {
            TaskKind::Fetch { tensor, region, dst } => (
                vec![Access::Hbm(*tensor, region.clone())],
                vec![Access::Buffer(*dst)],
            ),
            TaskKind::Compute {
                inputs,
                output,
                accumulate,
                ..
            } => {
                let mut reads = inputs.iter().map(as_access).collect::<Vec<_>>();
                if *accumulate {
                    reads.push(as_access(output));
                }
                (reads, vec![as_access(output)])
            }
            TaskKind::Evict {
                src,
                tensor,
                region,
            } => (
                vec![Access::Buffer(*src)],
                vec![Access::Hbm(*tensor, region.clone())],
            ),
        }
    }

    fn conflict(a: &Access, b: &Access) -> bool {
        match (a, b) {
            (Access::Buffer(x), Access::Buffer(y)) => x == y,
            (Access::Hbm(t, r), Access::Hbm(u, s)) => t == u && r.intersects(s),
            _ => false,
        }
    }

    /// Every pair of conflicting accesses must be ordered by the waits.
    fn assert_hazard_free(p: &Pipeline) {
        let mut ancestors: Vec<HashSet<TaskId>> = vec![];
        for (i, task) in p.tasks.iter().enumerate() {
            assert_eq!(task.id, TaskId(i as u32));
            let mut anc = HashSet::new();
            for w in &task.waits {
                assert!(w.0 < task.id.0, "t{} waits on later t{}", i, w.0);
                anc.insert(*w);
                anc.extend(ancestors[w.0 as usize].iter().copied());
            }
            let (reads, writes) = accesses(&task.kind);
            for earlier in &p.tasks[..i] {
                let (er, ew) = accesses(&earlier.kind);
                let hazard = writes
                    .iter()
                    .any(|w| er.iter().chain(&ew).any(|e| conflict(w, e)))
                    || reads.iter().any(|r| ew.iter().any(|e| conflict(r, e)));
                if hazard {
                    assert!(
                        anc.contains(&earlier.id),
                        "t{} ({}) isn't ordered after t{} ({})",
                        i,
                        task.kind,
                        earlier.id.0,
                        earlier.kind
                    );
                }
            }
            ancestors.push(anc);
        }
    }

    #[test]
    fn test_mlp_pipeline_is_hazard_free() {
        let g = mlp();
        for capacity in [0, 6 * 1024, 12 * 1024, 1 << 20] {
            let s = schedule::<Gaudi2Target>(&g, &config(capacity)).unwrap();
            let p = emit(&g, &s).unwrap();
            assert_hazard_free(&p);
        }
    }

    #[test]
    fn test_single_buffer_pipeline_is_hazard_free() {
        let g = mlp();
        let c = SchedulerConfig {
            multi_buffering: false,
            ..config(8 * 1024)
        };
        let s = schedule::<Gaudi2Target>(&g, &c).unwrap();
        assert!(s.bundles.values().all(|b| !b.allocation.is_multi_buffered()));
        assert_hazard_free(&emit(&g, &s).unwrap());
    }

    #[test]
    fn test_unbundled_nodes_read_hbm() {
        let g = mlp();
        let s = schedule::<Gaudi2Target>(&g, &config(0)).unwrap();
        let p = emit(&g, &s).unwrap();
        assert_eq!(p.tasks.len(), 3);
        assert!(p.buffers.is_empty());
        assert_eq!(p.tasks[2].waits.as_slice(), &[TaskId(1)]);
    }

    #[test]
    fn test_common_dim_slices_accumulate_then_evict_once() {
        let mut g = Graph::new();
        let a = g.create_tensor("a", shape![64, 1024], Dtype::Float32, false).unwrap();
        let b = g.create_tensor("b", shape![1024, 64], Dtype::Float32, false).unwrap();
        g.apply("mm", Op::gemm(), &[a, b]).unwrap();
        g.freeze().unwrap();
        // a and b are 256 KiB each; only K slicing fits.
        let s = schedule::<Gaudi2Target>(&g, &config(40 * 1024)).unwrap();
        let sb = s.bundles.values().next().unwrap();
        assert_eq!(sb.strategy.axis, crate::slicing::Axis::Common);
        let p = emit(&g, &s).unwrap();
        let computes = p.computes_of(NodeId(0)).collect::<Vec<_>>();
        assert!(computes.len() > 1);
        for (i, c) in computes.iter().enumerate() {
            let TaskKind::Compute { accumulate, .. } = c.kind else {
                unreachable!()
            };
            assert_eq!(accumulate, i > 0);
        }
        assert_eq!(p.evict_count(), 1);
        assert_hazard_free(&p);
    }

    #[test]
    fn test_smaller_actual_shape_emits_fewer_slices() {
        let mut g = Graph::new();
        let x = g
            .create_dynamic_tensor("x", shape![8, 32], shape![64, 32], Dtype::Float32, false)
            .unwrap();
        let w = g.create_tensor("w", shape![32, 32], Dtype::Float32, false).unwrap();
        g.apply("mm", Op::gemm(), &[x, w]).unwrap();
        g.freeze().unwrap();
        let s = schedule::<Gaudi2Target>(&g, &config(9 * 1024)).unwrap();
        let sb = s.bundles.values().next().unwrap();
        assert!(sb.strategy.dynamic);
        let full = emit(&g, &s).unwrap();
        let inputs = HashMap::from([(x, shape![16, 32])]);
        let small = emit_for_inputs(&g, &s, &inputs).unwrap();
        assert!(small.slice_count(sb.bundle.id) < full.slice_count(sb.bundle.id));
        assert_hazard_free(&small);
    }

    #[test]
    fn test_pinned_output_written_to_sram() {
        let mut g = Graph::new();
        let x = g.create_tensor("x", shape![16, 16], Dtype::Float32, false).unwrap();
        let y = g.apply("neg", Op::eltwise(EltwiseFn::Neg), &[x]).unwrap();
        g.apply("abs", Op::eltwise(EltwiseFn::Abs), &[y]).unwrap();
        g.set_memory_hint(y, MemoryHint::ForceSram).unwrap();
        g.freeze().unwrap();
        let s = schedule::<Gaudi2Target>(&g, &config(4096)).unwrap();
        let p = emit(&g, &s).unwrap();
        // y is neither observable nor read by a bundle.
        assert_eq!(p.evict_count(), 0);
        let TaskKind::Compute { inputs, .. } = &p.tasks[1].kind else {
            panic!("expected compute");
        };
        assert!(inputs[0].buffer().is_some());
        assert_hazard_free(&p);
    }
}
