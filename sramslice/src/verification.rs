//! A reference executor for emitted pipelines, and an oracle comparing two
//! schedules of the same graph.
//!
//! Values are held as `f32` everywhere. Only [Cast] rounds to its target
//! dtype. Inputs are small integers, so sums come out exact in any order.

use half::bf16;
use itertools::Itertools;
use log::{debug, info};
use ndarray::{ArrayD, Dimension, IxDyn, Slice};
use num_traits::{Bounded, ToPrimitive};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

use crate::common::{Dtype, Region, Shape};
use crate::config::SchedulerConfig;
use crate::graph::access::AccessMap;
use crate::graph::ops::{Cast, EltwiseFn, Op, PoolKind, ReduceKind};
use crate::graph::{Graph, NodeId, TensorId};
use crate::pipeline::{emit_with_shapes, BufferId, EmitError, Operand, Pipeline, TaskId, TaskKind};
use crate::scheduler::{schedule, ScheduleError};
use crate::target::Target;

#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    #[error("input {tensor} has shape {actual:?}, expected {expected:?}")]
    InputShape {
        tensor: TensorId,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("{task:?} waits on {waited:?}, which hasn't run yet")]
    OutOfOrder { task: TaskId, waited: TaskId },
    #[error("{task:?} reads {tensor}{region} from {buffer:?}, which holds {held}")]
    StaleBuffer {
        task: TaskId,
        buffer: BufferId,
        tensor: TensorId,
        region: Region,
        held: String,
    },
    #[error("{task:?} writes outside its output region")]
    Escapes { task: TaskId },
    #[error("{node} can't accumulate into a partial result")]
    Accumulate { node: NodeId },
}

#[derive(thiserror::Error, Debug)]
pub enum VerifyError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Emit(#[from] EmitError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("{tensor}{index:?}: baseline {baseline}, variant {variant}")]
    Mismatch {
        tensor: String,
        index: Vec<usize>,
        baseline: f32,
        variant: f32,
    },
}

/// The contents of one SRAM buffer: a region of one tensor.
struct Slab {
    tensor: TensorId,
    region: Region,
    data: ArrayD<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Combine {
    Sum,
    Max,
    Assign,
}

impl Combine {
    fn identity(self) -> f32 {
        match self {
            Combine::Max => f32::NEG_INFINITY,
            Combine::Sum | Combine::Assign => 0.0,
        }
    }

    fn apply(self, acc: &mut f32, v: f32) {
        match self {
            Combine::Sum => *acc += v,
            Combine::Max => *acc = acc.max(v),
            Combine::Assign => *acc = v,
        }
    }
}

fn dims(shape: &Shape) -> Vec<usize> {
    shape.iter().map(|d| d.get() as usize).collect()
}

fn to_usizes(coord: &[u32]) -> Vec<usize> {
    coord.iter().map(|&c| c as usize).collect()
}

fn saturate<T: Bounded + ToPrimitive>(v: f32) -> f32 {
    let lo = T::min_value().to_f32().unwrap_or(f32::MIN);
    let hi = T::max_value().to_f32().unwrap_or(f32::MAX);
    v.round().clamp(lo, hi)
}

/// Round `v` to the nearest value representable in `dtype`.
pub fn round_to(dtype: Dtype, v: f32) -> f32 {
    match dtype {
        Dtype::Float32 => v,
        Dtype::Bfloat16 => bf16::from_f32(v).to_f32(),
        Dtype::Uint8 => saturate::<u8>(v),
        Dtype::Sint8 => saturate::<i8>(v),
        Dtype::Uint16 => saturate::<u16>(v),
        Dtype::Sint16 => saturate::<i16>(v),
        Dtype::Uint32 => saturate::<u32>(v),
        Dtype::Sint32 => saturate::<i32>(v),
    }
}

fn combine_of(op: &Op) -> Combine {
    match op {
        Op::Gemm(_) | Op::BatchGemm(_) | Op::Conv(_) | Op::Dedx(_) | Op::Dedw(_) => Combine::Sum,
        Op::Reduce(r) => match r.kind {
            ReduceKind::Sum => Combine::Sum,
            ReduceKind::Max => Combine::Max,
        },
        Op::Pool(p) => match p.kind {
            PoolKind::Max => Combine::Max,
            PoolKind::Avg => Combine::Sum,
        },
        Op::AvgPoolGrad(_) => Combine::Sum,
        Op::Elementwise(_) | Op::Cast(_) | Op::Reshape(_) | Op::Transpose(_) => Combine::Assign,
    }
}

fn eltwise(func: EltwiseFn, v: &[f32]) -> f32 {
    match func {
        EltwiseFn::Identity => v[0],
        EltwiseFn::Relu => v[0].max(0.0),
        EltwiseFn::Neg => -v[0],
        EltwiseFn::Abs => v[0].abs(),
        EltwiseFn::Square => v[0] * v[0],
        EltwiseFn::Add => v[0] + v[1],
        EltwiseFn::Sub => v[0] - v[1],
        EltwiseFn::Mul => v[0] * v[1],
        EltwiseFn::Max => v[0].max(v[1]),
        EltwiseFn::Min => v[0].min(v[1]),
        EltwiseFn::ReluGrad => {
            if v[1] > 0.0 {
                v[0]
            } else {
                0.0
            }
        }
    }
}

/// What one index point contributes to its output element. `None` when the
/// point only touches padding.
fn contribution(op: &Op, values: &[Option<f32>]) -> Option<f32> {
    match op {
        Op::Gemm(_) | Op::BatchGemm(_) | Op::Conv(_) | Op::Dedx(_) | Op::Dedw(_) => {
            Some(values[0]? * values[1]?)
        }
        Op::Elementwise(e) => {
            let v = values.iter().copied().collect::<Option<Vec<_>>>()?;
            Some(eltwise(e.func, &v))
        }
        Op::Cast(Cast { to }) => Some(round_to(*to, values[0]?)),
        Op::Pool(p) if p.kind == PoolKind::Avg => {
            Some(values[0]? / (p.window[0] * p.window[1]) as f32)
        }
        Op::AvgPoolGrad(p) => Some(values[0]? / (p.window[0] * p.window[1]) as f32),
        Op::Reduce(_) | Op::Pool(_) | Op::Reshape(_) | Op::Transpose(_) => values[0],
    }
}

/// The operand coordinate of an index point.
fn operand_coord(
    access: &AccessMap,
    point: &[u32],
    index_sizes: &[u32],
    shape: &[u32],
) -> Option<Vec<u32>> {
    match access {
        AccessMap::Dims(dims) => dims
            .iter()
            .zip(shape)
            .map(|(d, &s)| d.coord(point, s))
            .collect(),
        AccessMap::Flat => {
            let mut linear = point
                .iter()
                .zip(index_sizes)
                .fold(0u64, |acc, (&p, &s)| acc * u64::from(s) + u64::from(p));
            let mut coord = vec![0; shape.len()];
            for (c, &s) in coord.iter_mut().zip(shape).rev() {
                *c = (linear % u64::from(s)) as u32;
                linear /= u64::from(s);
            }
            Some(coord)
        }
    }
}

/// Where a compute task reads one input from.
enum Source<'a> {
    Hbm(&'a ArrayD<f32>),
    Slab(&'a Slab),
}

impl Source<'_> {
    fn get(&self, coord: &[u32]) -> Option<f32> {
        match self {
            Source::Hbm(a) => a.get(IxDyn(&to_usizes(coord))).copied(),
            Source::Slab(s) => {
                let local = coord
                    .iter()
                    .zip(&s.region.0)
                    .map(|(&c, r)| r.contains(&c).then(|| (c - r.start) as usize))
                    .collect::<Option<Vec<_>>>()?;
                s.data.get(IxDyn(&local)).copied()
            }
        }
    }
}

fn window(region: &Region, origin: &[u32]) -> Vec<Slice> {
    region
        .0
        .iter()
        .zip(origin)
        .map(|(r, &o)| Slice::from((r.start - o) as usize..(r.end - o) as usize))
        .collect()
}

/// The slab in `buffer`, if it holds `region` of `tensor`.
fn resident<'s>(
    slabs: &'s HashMap<BufferId, Slab>,
    task: TaskId,
    buffer: BufferId,
    tensor: TensorId,
    region: &Region,
) -> Result<&'s Slab, ExecError> {
    match slabs.get(&buffer) {
        Some(s) if s.tensor == tensor && s.region.contains(region) => Ok(s),
        other => Err(ExecError::StaleBuffer {
            task,
            buffer,
            tensor,
            region: region.clone(),
            held: other.map_or("nothing".to_string(), |s| format!("{}{}", s.tensor, s.region)),
        }),
    }
}

/// Runs a [Pipeline] task by task against a simulated HBM and SRAM.
pub struct Executor<'a> {
    graph: &'a Graph,
    pipeline: &'a Pipeline,
    hbm: Vec<ArrayD<f32>>,
    slabs: HashMap<BufferId, Slab>,
}

impl<'a> Executor<'a> {
    /// Tensors missing from `inputs` start zeroed.
    pub fn new(
        graph: &'a Graph,
        pipeline: &'a Pipeline,
        inputs: &HashMap<TensorId, ArrayD<f32>>,
    ) -> Result<Self, ExecError> {
        let mut hbm = Vec::with_capacity(pipeline.shapes.len());
        for (i, shape) in pipeline.shapes.iter().enumerate() {
            let tensor = TensorId(i as u32);
            let expected = dims(shape);
            match inputs.get(&tensor) {
                Some(a) if a.shape() != expected.as_slice() => {
                    return Err(ExecError::InputShape {
                        tensor,
                        expected,
                        actual: a.shape().to_vec(),
                    })
                }
                Some(a) => hbm.push(a.clone()),
                None => hbm.push(ArrayD::zeros(IxDyn(&expected))),
            }
        }
        Ok(Executor {
            graph,
            pipeline,
            hbm,
            slabs: HashMap::new(),
        })
    }

    pub fn run(mut self) -> Result<Vec<ArrayD<f32>>, ExecError> {
        let pipeline = self.pipeline;
        for task in &pipeline.tasks {
            if let Some(&waited) = task.waits.iter().find(|w| **w >= task.id) {
                return Err(ExecError::OutOfOrder {
                    task: task.id,
                    waited,
                });
            }
            match &task.kind {
                TaskKind::Fetch { tensor, region, dst } => {
                    let w = window(region, &vec![0; region.rank()]);
                    let data = self.hbm[tensor.0 as usize]
                        .slice_each_axis(|ax| w[ax.axis.index()])
                        .to_owned();
                    self.slabs.insert(
                        *dst,
                        Slab {
                            tensor: *tensor,
                            region: region.clone(),
                            data,
                        },
                    );
                }
                TaskKind::Evict {
                    src,
                    tensor,
                    region,
                } => {
                    let slab = resident(&self.slabs, task.id, *src, *tensor, region)?;
                    let from_w = window(region, &slab.region.origin());
                    let to_w = window(region, &vec![0; region.rank()]);
                    let from = slab.data.slice_each_axis(|ax| from_w[ax.axis.index()]);
                    self.hbm[tensor.0 as usize]
                        .slice_each_axis_mut(|ax| to_w[ax.axis.index()])
                        .assign(&from);
                }
                TaskKind::Compute {
                    node,
                    index_box,
                    inputs,
                    output,
                    accumulate,
                } => self.compute(task.id, *node, index_box, inputs, output, *accumulate)?,
            }
        }
        Ok(self.hbm)
    }

    fn source(&self, task: TaskId, operand: &Operand) -> Result<Source<'_>, ExecError> {
        match operand {
            Operand::Hbm { tensor, .. } => Ok(Source::Hbm(&self.hbm[tensor.0 as usize])),
            Operand::Sram {
                buffer,
                tensor,
                region,
            } => Ok(Source::Slab(resident(&self.slabs, task, *buffer, *tensor, region)?)),
        }
    }

    fn compute(
        &mut self,
        task: TaskId,
        node: NodeId,
        index_box: &Region,
        inputs: &[Operand],
        output: &Operand,
        accumulate: bool,
    ) -> Result<(), ExecError> {
        let graph = self.graph;
        let bound = graph.bound(node, &self.pipeline.shapes);
        let op = bound.op;
        let combine = combine_of(op);
        if accumulate && combine == Combine::Assign {
            return Err(ExecError::Accumulate { node });
        }
        let index_sizes = bound.index_sizes();
        let accesses = (0..inputs.len())
            .map(|i| (bound.input_access(i), bound.input_shape(i)))
            .collect::<Vec<_>>();
        let out_access = bound.output_access();
        let out_shape = bound.output_shape();
        let out_region = output.region();
        let out_origin = out_region.origin();

        let mut acc = if accumulate {
            let current = self.source(task, output)?;
            let mut a = ArrayD::zeros(IxDyn(&to_usizes(&out_region.sizes())));
            for (local, v) in a.indexed_iter_mut() {
                let coord = local
                    .slice()
                    .iter()
                    .zip(&out_origin)
                    .map(|(&l, &o)| l as u32 + o)
                    .collect::<Vec<_>>();
                *v = current.get(&coord).ok_or(ExecError::Escapes { task })?;
            }
            a
        } else {
            ArrayD::from_elem(IxDyn(&to_usizes(&out_region.sizes())), combine.identity())
        };

        {
            let sources = inputs
                .iter()
                .map(|i| self.source(task, i))
                .collect::<Result<Vec<_>, _>>()?;
            let mut values = vec![None; inputs.len()];
            // Reduction dimensions come last in every index space, so row-major
            // order visits each output element's reduction points in nest order.
            for point in index_box.0.iter().cloned().multi_cartesian_product() {
                for (v, (src, (access, shape))) in values.iter_mut().zip(sources.iter().zip(&accesses)) {
                    *v = operand_coord(access, &point, &index_sizes, shape).and_then(|c| src.get(&c));
                }
                let Some(x) = contribution(op, &values) else {
                    continue;
                };
                let local = operand_coord(&out_access, &point, &index_sizes, &out_shape)
                    .and_then(|c| {
                        c.iter()
                            .zip(&out_region.0)
                            .map(|(&c, r)| r.contains(&c).then(|| (c - r.start) as usize))
                            .collect::<Option<Vec<_>>>()
                    })
                    .ok_or(ExecError::Escapes { task })?;
                combine.apply(&mut acc[IxDyn(&local)], x);
            }
        }

        match output {
            Operand::Hbm { tensor, region } => {
                let w = window(region, &vec![0; region.rank()]);
                self.hbm[tensor.0 as usize]
                    .slice_each_axis_mut(|ax| w[ax.axis.index()])
                    .assign(&acc);
            }
            Operand::Sram {
                buffer,
                tensor,
                region,
            } => match self.slabs.get_mut(buffer) {
                Some(s) if s.tensor == *tensor && s.region.contains(region) => {
                    let w = window(region, &s.region.origin());
                    s.data
                        .slice_each_axis_mut(|ax| w[ax.axis.index()])
                        .assign(&acc);
                }
                _ => {
                    self.slabs.insert(
                        *buffer,
                        Slab {
                            tensor: *tensor,
                            region: region.clone(),
                            data: acc,
                        },
                    );
                }
            },
        }
        Ok(())
    }
}

/// Run `pipeline` and return the final contents of every tensor in HBM.
pub fn execute(
    graph: &Graph,
    pipeline: &Pipeline,
    inputs: &HashMap<TensorId, ArrayD<f32>>,
) -> Result<Vec<ArrayD<f32>>, ExecError> {
    Executor::new(graph, pipeline, inputs)?.run()
}

/// Small integer values for every graph input, representable in its dtype.
pub fn random_inputs(graph: &Graph, shapes: &[Shape], seed: u64) -> HashMap<TensorId, ArrayD<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    graph
        .graph_inputs()
        .map(|t| {
            let (lo, hi) = match graph.tensor(t).dtype {
                Dtype::Uint8 | Dtype::Uint16 | Dtype::Uint32 => (0, 4),
                _ => (-3, 4),
            };
            let shape = dims(&shapes[t.0 as usize]);
            let data = ArrayD::from_shape_simple_fn(IxDyn(&shape), || rng.gen_range(lo..hi) as f32);
            (t, data)
        })
        .collect()
}

/// Schedule, emit and execute `graph` under `config`.
pub fn run<Tgt: Target>(
    graph: &Graph,
    config: &SchedulerConfig,
    shapes: &[Shape],
    inputs: &HashMap<TensorId, ArrayD<f32>>,
) -> Result<Vec<ArrayD<f32>>, VerifyError> {
    let scheduled = schedule::<Tgt>(graph, config)?;
    let pipeline = emit_with_shapes(graph, &scheduled, shapes.to_vec())?;
    debug!(
        "{} bundles, {} tasks, {} fetches",
        scheduled.bundles.len(),
        pipeline.tasks.len(),
        pipeline.fetch_count()
    );
    Ok(execute(graph, &pipeline, inputs)?)
}

/// Run `graph` under both configs on the same random inputs and require every
/// observable tensor to come out identical.
pub fn compare_runs<Tgt: Target>(
    graph: &Graph,
    baseline: &SchedulerConfig,
    variant: &SchedulerConfig,
    seed: u64,
) -> Result<(), VerifyError> {
    compare_runs_with_shapes::<Tgt>(graph, baseline, variant, &graph.max_shapes(), seed)
}

pub fn compare_runs_with_shapes<Tgt: Target>(
    graph: &Graph,
    baseline: &SchedulerConfig,
    variant: &SchedulerConfig,
    shapes: &[Shape],
    seed: u64,
) -> Result<(), VerifyError> {
    let inputs = random_inputs(graph, shapes, seed);
    let (a, b) = rayon::join(
        || run::<Tgt>(graph, baseline, shapes, &inputs),
        || run::<Tgt>(graph, variant, shapes, &inputs),
    );
    let (a, b) = (a?, b?);
    let mut compared = 0;
    for t in graph.tensor_ids().filter(|&t| graph.is_observable(t)) {
        let (x, y) = (&a[t.0 as usize], &b[t.0 as usize]);
        if let Some((index, (&p, &q))) = x
            .indexed_iter()
            .zip(y.iter())
            .map(|((i, p), q)| (i, (p, q)))
            .find(|(_, (p, q))| p != q)
        {
            return Err(VerifyError::Mismatch {
                tensor: graph.tensor(t).name.clone(),
                index: index.slice().to_vec(),
                baseline: p,
                variant: q,
            });
        }
        compared += 1;
    }
    info!("{} observable tensors match", compared);
    Ok(())
}

/// Shapes of every tensor with graph inputs bound to `inputs`.
pub fn bound_shapes(graph: &Graph, inputs: &[(TensorId, Shape)]) -> Result<Vec<Shape>, VerifyError> {
    let inputs = inputs.iter().cloned().collect::<HashMap<_, _>>();
    graph
        .bind_shapes(&inputs)
        .map_err(|e| VerifyError::Emit(EmitError::Shapes(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ops::{AvgPoolGrad, BatchGemm, Conv, ConvParams, Dedw, Dedx, Reshape, Transpose};
    use crate::datadeps::{Unit, ValidationError, Validator};
    use crate::pipeline::emit;
    use crate::scheduler::Scheduled;
    use crate::shape;
    use crate::slicing::Axis;
    use crate::target::Gaudi2Target;

    fn small(capacity: u64) -> SchedulerConfig {
        SchedulerConfig {
            sram_capacity_bytes: capacity,
            cost_model: false,
            ..SchedulerConfig::default()
        }
    }

    fn scheduled(graph: &Graph, config: &SchedulerConfig) -> Scheduled {
        schedule::<Gaudi2Target>(graph, config).unwrap()
    }

    /// Nodes run inside bundles.
    fn bundled_nodes(s: &Scheduled) -> usize {
        s.bundles
            .values()
            .map(|b| b.strategy.members.nodes().len())
            .sum()
    }

    fn check(graph: &Graph, baseline: &SchedulerConfig, variant: &SchedulerConfig) {
        for seed in 0..2 {
            if let Err(e) = compare_runs::<Gaudi2Target>(graph, baseline, variant, seed) {
                panic!("seed {seed}: {e}");
            }
        }
    }

    #[test]
    fn test_round_to_dtypes() {
        assert_eq!(round_to(Dtype::Uint8, 300.2), 255.0);
        assert_eq!(round_to(Dtype::Sint8, -1.6), -2.0);
        assert_eq!(round_to(Dtype::Bfloat16, 1.0 + 1.0 / 1024.0), 1.0);
        assert_eq!(round_to(Dtype::Float32, 0.1), 0.1);
    }

    #[test]
    fn test_unbundled_gemm_matches_hand_result() {
        let mut g = Graph::new();
        let a = g.create_tensor("a", shape![2, 2], Dtype::Float32, false).unwrap();
        let b = g.create_tensor("b", shape![2, 2], Dtype::Float32, false).unwrap();
        let y = g.apply("mm", Op::gemm(), &[a, b]).unwrap();
        g.freeze().unwrap();
        let s = schedule::<Gaudi2Target>(&g, &SchedulerConfig::unsliced()).unwrap();
        let p = emit(&g, &s).unwrap();
        let inputs = HashMap::from([
            (a, ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1., 2., 3., 4.]).unwrap()),
            (b, ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![5., 6., 7., 8.]).unwrap()),
        ]);
        let out = execute(&g, &p, &inputs).unwrap();
        assert_eq!(out[y.0 as usize].iter().copied().collect::<Vec<_>>(), vec![19., 22., 43., 50.]);
    }

    #[test]
    fn test_stale_buffer_is_reported() {
        let mut g = Graph::new();
        let a = g.create_tensor("a", shape![32, 32], Dtype::Float32, false).unwrap();
        let b = g.create_tensor("b", shape![32, 32], Dtype::Float32, false).unwrap();
        g.apply("mm", Op::gemm(), &[a, b]).unwrap();
        g.freeze().unwrap();
        let s = schedule::<Gaudi2Target>(&g, &small(1 << 20)).unwrap();
        let mut p = emit(&g, &s).unwrap();
        p.tasks.retain(|t| !matches!(t.kind, TaskKind::Fetch { .. }));
        for t in &mut p.tasks {
            t.waits.clear();
        }
        let inputs = random_inputs(&g, &p.shapes, 0);
        assert!(matches!(
            execute(&g, &p, &inputs),
            Err(ExecError::StaleBuffer { .. })
        ));
    }

    // gemm -> reshape -> transpose -> avg-pool backward, with and without
    // bundle expansion.
    #[test]
    fn test_gemm_into_pool_grad_with_expansion_toggled() {
        let mut g = Graph::new();
        let x = g.create_tensor("x", shape![24, 16], Dtype::Float32, false).unwrap();
        let w = g.create_tensor("w", shape![16, 40], Dtype::Float32, false).unwrap();
        let y = g.apply("mm", Op::gemm(), &[x, w]).unwrap();
        let r = g
            .apply("reshape", Op::Reshape(Reshape { shape: shape![1, 4, 6, 40] }), &[y])
            .unwrap();
        let t = g
            .apply("transpose", Op::Transpose(Transpose { perm: vec![0, 2, 1, 3] }), &[r])
            .unwrap();
        let params = ConvParams {
            stride: [2, 2],
            ..ConvParams::default()
        };
        g.apply(
            "pool_grad",
            Op::AvgPoolGrad(AvgPoolGrad {
                window: [2, 2],
                params,
                input_hw: [12, 8],
            }),
            &[t],
        )
        .unwrap();
        g.freeze().unwrap();
        let on = small(4096);
        let off = SchedulerConfig {
            bundle_expansion: false,
            ..small(4096)
        };
        for config in [&on, &off] {
            let s = scheduled(&g, config);
            assert_eq!(s.bundles.len(), 1);
            assert!(s.bundles.values().all(|b| b.strategy.slice_count() > 1));
        }
        // With room for everything, only expansion brings the consumers along.
        let roomy_on = small(1 << 20);
        let roomy_off = SchedulerConfig {
            bundle_expansion: false,
            ..small(1 << 20)
        };
        assert!(bundled_nodes(&scheduled(&g, &roomy_on)) > 1);
        assert_eq!(bundled_nodes(&scheduled(&g, &roomy_off)), 1);
        check(&g, &on, &off);
        check(&g, &SchedulerConfig::unsliced(), &on);
        check(&g, &roomy_off, &roomy_on);
    }

    // dedx and dedw share dy.
    #[test]
    fn test_dedx_dedw_pair_with_expansion_toggled() {
        let mut g = Graph::new();
        let params = ConvParams::same_padding([3, 3]);
        let dy = g.create_tensor("dy", shape![4, 8, 8, 2], Dtype::Float32, false).unwrap();
        let w = g.create_tensor("w", shape![3, 3, 2, 2], Dtype::Float32, false).unwrap();
        let x = g.create_tensor("x", shape![4, 8, 8, 2], Dtype::Float32, false).unwrap();
        g.apply(
            "dedx",
            Op::Dedx(Dedx {
                params,
                input_hw: [8, 8],
            }),
            &[dy, w],
        )
        .unwrap();
        g.apply(
            "dedw",
            Op::Dedw(Dedw {
                params,
                kernel: [3, 3],
            }),
            &[dy, x],
        )
        .unwrap();
        g.freeze().unwrap();
        let dedx = g.find_node("dedx").unwrap();
        let dedw = g.find_node("dedw").unwrap();
        // 4 KiB holds neither op whole, but holds both per batch entry.
        let on = SchedulerConfig {
            layered_brain: true,
            ..small(4096)
        };
        let off = SchedulerConfig {
            bundle_expansion: false,
            ..on.clone()
        };
        let paired = scheduled(&g, &on);
        let b = paired.bundle_of(dedx).unwrap();
        assert_eq!(b.strategy.members.slave.map(|s| s.node), Some(dedw));
        assert_eq!(b.strategy.axis, Axis::Batch);
        assert!(b.strategy.slice_count() > 1);
        let apart = scheduled(&g, &off);
        assert!(apart.bundles.values().all(|b| b.strategy.members.slave.is_none()));
        check(&g, &on, &off);
        check(&g, &SchedulerConfig::unsliced(), &on);
    }

    #[test]
    fn test_gemms_sharing_both_operands_with_cost_model_toggled() {
        let mut g = Graph::new();
        let a = g.create_tensor("a", shape![32, 48], Dtype::Float32, false).unwrap();
        let b = g.create_tensor("b", shape![48, 32], Dtype::Float32, false).unwrap();
        g.apply("mm0", Op::gemm(), &[a, b]).unwrap();
        g.apply("mm1", Op::gemm(), &[a, b]).unwrap();
        g.freeze().unwrap();
        let with_cost = SchedulerConfig {
            cost_model: true,
            ..small(8192)
        };
        check(&g, &small(8192), &with_cost);
        check(&g, &SchedulerConfig::unsliced(), &with_cost);
    }

    // conv -> add -> conv -> reshape -> relu -> conv, with a control edge
    // keeping the last conv out of the first bundle.
    #[test]
    fn test_conv_chain_with_control_edge() {
        let mut g = Graph::new();
        let params = ConvParams::same_padding([3, 3]);
        let x = g.create_tensor("x", shape![2, 6, 6, 4], Dtype::Float32, false).unwrap();
        let w0 = g.create_tensor("w0", shape![3, 3, 4, 4], Dtype::Float32, false).unwrap();
        let bias = g.create_tensor("bias", shape![2, 6, 6, 4], Dtype::Float32, false).unwrap();
        let w1 = g.create_tensor("w1", shape![3, 3, 4, 4], Dtype::Float32, false).unwrap();
        let w2 = g.create_tensor("w2", shape![1, 1, 4, 4], Dtype::Float32, false).unwrap();
        let c0 = g.apply("conv0", Op::Conv(Conv { params }), &[x, w0]).unwrap();
        let s = g.apply("add", Op::eltwise(EltwiseFn::Add), &[c0, bias]).unwrap();
        let c1 = g.apply("conv1", Op::Conv(Conv { params }), &[s, w1]).unwrap();
        let r = g
            .apply("reshape", Op::Reshape(Reshape { shape: shape![2, 36, 1, 4] }), &[c1])
            .unwrap();
        let a = g.apply("relu", Op::eltwise(EltwiseFn::Relu), &[r]).unwrap();
        g.apply("conv2", Op::Conv(Conv::default()), &[a, w2]).unwrap();
        let add = g.find_node("add").unwrap();
        let conv2 = g.find_node("conv2").unwrap();
        g.add_control_edge(add, conv2).unwrap();
        g.freeze().unwrap();
        let with_cost = SchedulerConfig {
            cost_model: true,
            ..small(4096)
        };
        check(&g, &small(4096), &with_cost);
        check(&g, &SchedulerConfig::unsliced(), &small(4096));
    }

    #[test]
    fn test_batch_gemm_non_divisible_widths() {
        // The shared right operand lets the rows be sliced; 1 KiB fits 13 of
        // them, leaving a short last slice.
        let config = SchedulerConfig {
            bgemm_flatten_to_gemm: true,
            ..small(1024)
        };
        for width in [50, 100] {
            let mut g = Graph::new();
            let a = g.create_tensor("a", shape![2, width, 4], Dtype::Float32, false).unwrap();
            let b = g.create_tensor("b", shape![1, 4, 3], Dtype::Float32, false).unwrap();
            g.apply("bgemm", Op::BatchGemm(BatchGemm::default()), &[a, b]).unwrap();
            g.freeze().unwrap();
            let s = scheduled(&g, &config);
            let b = s.bundles.values().next().unwrap();
            assert_eq!(b.strategy.axis, Axis::NonCommon);
            assert!(b.strategy.slice_count() > 1);
            let space = g.index_space(b.bundle.anchor);
            assert!(b.strategy.sliced.iter().any(|sd| {
                let size = space[usize::from(sd.index_dim)].size;
                sd.chunk < size && size % sd.chunk != 0
            }));
            check(&g, &SchedulerConfig::unsliced(), &config);
        }
    }

    #[test]
    fn test_padded_conv_sliced_spatially() {
        let mut g = Graph::new();
        let params = ConvParams::same_padding([3, 3]);
        let x = g.create_tensor("x", shape![1, 16, 16, 2], Dtype::Float32, false).unwrap();
        let w = g.create_tensor("w", shape![3, 3, 2, 1], Dtype::Float32, false).unwrap();
        g.apply("conv", Op::Conv(Conv { params }), &[x, w]).unwrap();
        g.freeze().unwrap();
        for capacity in [2048, 1024] {
            let s = scheduled(&g, &small(capacity));
            let b = s.bundles.values().next().unwrap();
            assert_eq!(b.strategy.axis, Axis::Spatial);
            assert!(b.strategy.slice_count() > 1);
            check(&g, &SchedulerConfig::unsliced(), &small(capacity));
        }
    }

    // Pairing mm0 with mm1 on their shared input would put mm1 before the neg
    // it depends on. The persistent output keeps neg out of mm0's bundle.
    #[test]
    fn test_shared_mme_creates_cycle() {
        let mut g = Graph::new();
        let a = g.create_tensor("a", shape![16, 16], Dtype::Float32, false).unwrap();
        let b = g.create_tensor("b", shape![16, 16], Dtype::Float32, false).unwrap();
        let y0 = g.apply("mm0", Op::gemm(), &[a, b]).unwrap();
        let n = g.apply("neg", Op::eltwise(EltwiseFn::Neg), &[y0]).unwrap();
        g.apply("mm1", Op::gemm(), &[a, n]).unwrap();
        g.set_persistent(y0, true).unwrap();
        g.freeze().unwrap();
        let (mm0, mm1) = (g.find_node("mm0").unwrap(), g.find_node("mm1").unwrap());
        assert_eq!(
            Validator::new(&g).check(&[mm0, mm1]),
            Err(ValidationError::Cycle(vec![mm0, mm1]))
        );
        let s = schedule::<Gaudi2Target>(&g, &small(4096)).unwrap();
        // The slave was shrunk away and ordered after its master.
        assert_eq!(s.control_edges, vec![(mm0, mm1)]);
        let b0 = s.bundle_of(mm0).unwrap();
        assert_ne!(s.bundle_of(mm1).map(|b| b.bundle.id), Some(b0.bundle.id));
        assert!(b0.strategy.members.slave.is_none());
        let mut pos = HashMap::new();
        for (i, unit) in s.units.iter().enumerate() {
            match unit {
                Unit::Node(n) => {
                    pos.insert(*n, i);
                }
                Unit::Bundle(id) => {
                    for n in s.bundles[id].strategy.members.nodes() {
                        pos.insert(n, i);
                    }
                }
            }
        }
        for n in g.node_ids() {
            for &t in &g.node(n).inputs {
                if let Some(p) = g.tensor(t).producer() {
                    assert!(pos[&p] <= pos[&n], "{} runs before its input", g.node(n).name);
                }
            }
        }
        check(&g, &SchedulerConfig::unsliced(), &small(4096));
    }

    #[test]
    fn test_dynamic_shapes_match_unsliced() {
        let mut g = Graph::new();
        let x = g
            .create_dynamic_tensor("x", shape![8, 32], shape![64, 32], Dtype::Float32, false)
            .unwrap();
        let w = g.create_tensor("w", shape![32, 16], Dtype::Float32, false).unwrap();
        let y = g.apply("mm", Op::gemm(), &[x, w]).unwrap();
        g.apply("relu", Op::eltwise(EltwiseFn::Relu), &[y]).unwrap();
        g.freeze().unwrap();
        let shapes = bound_shapes(&g, &[(x, shape![24, 32])]).unwrap();
        compare_runs_with_shapes::<Gaudi2Target>(
            &g,
            &SchedulerConfig::unsliced(),
            &small(6144),
            &shapes,
            3,
        )
        .unwrap();
    }
}
