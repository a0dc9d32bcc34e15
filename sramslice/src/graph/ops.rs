use enum_dispatch::enum_dispatch;
use nonzero::nonzero as nz;
use serde::{Deserialize, Serialize};

use crate::common::{DimSize, Dtype, Shape};
use crate::graph::access::{AccessMap, DimAccess, DimRole, IndexDim};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum OpKind {
    MatrixEngine,
    Elementwise,
    Reduction,
    ShapeOnly,
}

/// What the slicer may do with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub struct Capabilities {
    pub common_dim_slicing: bool,
    pub spatial_slicing: bool,
    pub shape_only: bool,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("expected {expected} inputs, got {got}")]
    Arity { expected: usize, got: usize },
    #[error("input {slot} has rank {got}, expected {expected}")]
    Rank {
        slot: usize,
        expected: usize,
        got: usize,
    },
    #[error("incompatible operand shapes: {0}")]
    Incompatible(&'static str),
}

/// Shape transfer and slicing semantics of an operator.
///
/// `inputs` and `output` are the operand shapes of a particular node; index
/// spaces and access maps depend on them (e.g. for broadcasting).
#[enum_dispatch]
pub trait OpSemantics {
    fn name(&self) -> &'static str;
    fn kind(&self) -> OpKind;
    fn arity(&self) -> usize;
    fn capabilities(&self) -> Capabilities;
    fn infer_output_shape(&self, inputs: &[&[DimSize]]) -> Result<Shape, ShapeError>;

    fn output_dtype(&self, inputs: &[Dtype]) -> Dtype {
        inputs[0]
    }

    fn index_space(&self, inputs: &[&[DimSize]], output: &[DimSize]) -> Vec<IndexDim>;
    fn input_access(&self, slot: usize, inputs: &[&[DimSize]], output: &[DimSize]) -> AccessMap;

    fn output_access(&self, _inputs: &[&[DimSize]], output: &[DimSize]) -> AccessMap {
        AccessMap::identity(output.len())
    }
}

#[enum_dispatch(OpSemantics)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Op {
    Gemm,
    BatchGemm,
    Conv,
    Dedx,
    Dedw,
    Elementwise,
    Cast,
    Reduce,
    Pool,
    AvgPoolGrad,
    Reshape,
    Transpose,
}

/// `A[M,K] x B[K,N] -> [M,N]`, with either operand optionally stored transposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub struct Gemm {
    pub transpose_a: bool,
    pub transpose_b: bool,
}

/// `A[Ba,M,K] x B[Bb,K,N] -> [B,M,N]` where each of `Ba` and `Bb` is `B` or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub struct BatchGemm {
    pub transpose_a: bool,
    pub transpose_b: bool,
}

/// Window geometry shared by convolutions and pooling. Indices are `[h, w]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ConvParams {
    pub stride: [u32; 2],
    pub dilation: [u32; 2],
    pub pad_before: [u32; 2],
    pub pad_after: [u32; 2],
}

/// NHWC forward convolution: `x[N,H,W,C] * w[R,S,C,K] -> [N,OH,OW,K]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub struct Conv {
    pub params: ConvParams,
}

/// Gradient of a convolution w.r.t. its input: `dy[N,OH,OW,K] * w[R,S,C,K] -> [N,H,W,C]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Dedx {
    pub params: ConvParams,
    pub input_hw: [u32; 2],
}

/// Gradient of a convolution w.r.t. its weights: `dy[N,OH,OW,K] * x[N,H,W,C] -> [R,S,C,K]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Dedw {
    pub params: ConvParams,
    pub kernel: [u32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum EltwiseFn {
    Identity,
    Relu,
    Neg,
    Abs,
    Square,
    Add,
    Sub,
    Mul,
    Max,
    Min,
    /// `dy * (x > 0)`, with inputs `[dy, x]`.
    ReluGrad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Elementwise {
    pub func: EltwiseFn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Cast {
    pub to: Dtype,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ReduceKind {
    Sum,
    Max,
}

/// Reduce one axis, keeping it as a size-1 dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Reduce {
    pub axis: u8,
    pub kind: ReduceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum PoolKind {
    Max,
    Avg,
}

/// NHWC 2-D pooling: `x[N,H,W,C] -> [N,OH,OW,C]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Pool {
    pub kind: PoolKind,
    pub window: [u32; 2],
    pub params: ConvParams,
}

/// Gradient of an average pool: `dy[N,OH,OW,C] -> [N,H,W,C]`. Every window
/// position receives `dy / (window[0] * window[1])`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct AvgPoolGrad {
    pub window: [u32; 2],
    pub params: ConvParams,
    pub input_hw: [u32; 2],
}

/// Reinterpret the input's row-major elements with a new shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Reshape {
    pub shape: Shape,
}

/// Output dimension `i` is input dimension `perm[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Transpose {
    pub perm: Vec<u8>,
}

impl Default for ConvParams {
    fn default() -> Self {
        ConvParams {
            stride: [1, 1],
            dilation: [1, 1],
            pad_before: [0, 0],
            pad_after: [0, 0],
        }
    }
}

impl ConvParams {
    pub fn same_padding(kernel: [u32; 2]) -> Self {
        ConvParams {
            pad_before: [(kernel[0] - 1) / 2, (kernel[1] - 1) / 2],
            pad_after: [kernel[0] / 2, kernel[1] / 2],
            ..ConvParams::default()
        }
    }

    /// Output size along spatial dimension `i` for an input of size `input`.
    pub fn out_size(&self, i: usize, input: u32, kernel: u32) -> Option<u32> {
        let effective = kernel.checked_sub(1)? * self.dilation[i] + 1;
        let padded = input + self.pad_before[i] + self.pad_after[i];
        if padded < effective || self.stride[i] == 0 {
            return None;
        }
        Some((padded - effective) / self.stride[i] + 1)
    }

    fn window(&self, i: usize, out: u8, kernel: u8) -> DimAccess {
        DimAccess::Window {
            out,
            kernel,
            stride: self.stride[i],
            dilation: self.dilation[i],
            pad_before: self.pad_before[i],
        }
    }

    fn transposed(&self, i: usize, pos: u8, kernel: u8) -> DimAccess {
        DimAccess::TransposedWindow {
            pos,
            kernel,
            stride: self.stride[i],
            dilation: self.dilation[i],
            pad_before: self.pad_before[i],
        }
    }
}

fn check_arity(expected: usize, inputs: &[&[DimSize]]) -> Result<(), ShapeError> {
    if inputs.len() != expected {
        return Err(ShapeError::Arity {
            expected,
            got: inputs.len(),
        });
    }
    Ok(())
}

fn check_rank(slot: usize, expected: usize, shape: &[DimSize]) -> Result<(), ShapeError> {
    if shape.len() != expected {
        return Err(ShapeError::Rank {
            slot,
            expected,
            got: shape.len(),
        });
    }
    Ok(())
}

fn dim(size: u32) -> Result<DimSize, ShapeError> {
    DimSize::new(size).ok_or(ShapeError::Incompatible("zero-sized dimension"))
}

fn matmul_operand(transposed: bool, rows: u8, cols: u8) -> [DimAccess; 2] {
    if transposed {
        [DimAccess::Direct(cols), DimAccess::Direct(rows)]
    } else {
        [DimAccess::Direct(rows), DimAccess::Direct(cols)]
    }
}

impl OpSemantics for Gemm {
    fn name(&self) -> &'static str {
        "gemm"
    }

    fn kind(&self) -> OpKind {
        OpKind::MatrixEngine
    }

    fn arity(&self) -> usize {
        2
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            common_dim_slicing: true,
            ..Capabilities::default()
        }
    }

    fn infer_output_shape(&self, inputs: &[&[DimSize]]) -> Result<Shape, ShapeError> {
        check_arity(2, inputs)?;
        check_rank(0, 2, inputs[0])?;
        check_rank(1, 2, inputs[1])?;
        let (m, ka) = if self.transpose_a {
            (inputs[0][1], inputs[0][0])
        } else {
            (inputs[0][0], inputs[0][1])
        };
        let (kb, n) = if self.transpose_b {
            (inputs[1][1], inputs[1][0])
        } else {
            (inputs[1][0], inputs[1][1])
        };
        if ka != kb {
            return Err(ShapeError::Incompatible("gemm contraction sizes differ"));
        }
        Ok(vec![m, n])
    }

    fn index_space(&self, inputs: &[&[DimSize]], output: &[DimSize]) -> Vec<IndexDim> {
        let k = if self.transpose_a {
            inputs[0][0]
        } else {
            inputs[0][1]
        };
        vec![
            IndexDim::parallel(output[0].get(), DimRole::NonCommon),
            IndexDim::parallel(output[1].get(), DimRole::NonCommon),
            IndexDim::reduction(k.get(), DimRole::Common),
        ]
    }

    fn input_access(&self, slot: usize, _: &[&[DimSize]], _: &[DimSize]) -> AccessMap {
        match slot {
            0 => AccessMap::Dims(matmul_operand(self.transpose_a, 0, 2).to_vec()),
            _ => AccessMap::Dims(matmul_operand(self.transpose_b, 2, 1).to_vec()),
        }
    }
}

impl OpSemantics for BatchGemm {
    fn name(&self) -> &'static str {
        "batch_gemm"
    }

    fn kind(&self) -> OpKind {
        OpKind::MatrixEngine
    }

    fn arity(&self) -> usize {
        2
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            common_dim_slicing: true,
            ..Capabilities::default()
        }
    }

    fn infer_output_shape(&self, inputs: &[&[DimSize]]) -> Result<Shape, ShapeError> {
        check_arity(2, inputs)?;
        check_rank(0, 3, inputs[0])?;
        check_rank(1, 3, inputs[1])?;
        let (ba, bb) = (inputs[0][0], inputs[1][0]);
        if ba != bb && ba.get() != 1 && bb.get() != 1 {
            return Err(ShapeError::Incompatible("batch sizes neither match nor broadcast"));
        }
        let g = Gemm {
            transpose_a: self.transpose_a,
            transpose_b: self.transpose_b,
        };
        let mn = g.infer_output_shape(&[&inputs[0][1..], &inputs[1][1..]])?;
        Ok(vec![ba.max(bb), mn[0], mn[1]])
    }

    fn index_space(&self, inputs: &[&[DimSize]], output: &[DimSize]) -> Vec<IndexDim> {
        let k = if self.transpose_a {
            inputs[0][1]
        } else {
            inputs[0][2]
        };
        vec![
            IndexDim::parallel(output[0].get(), DimRole::Batch),
            IndexDim::parallel(output[1].get(), DimRole::NonCommon),
            IndexDim::parallel(output[2].get(), DimRole::NonCommon),
            IndexDim::reduction(k.get(), DimRole::Common),
        ]
    }

    fn input_access(&self, slot: usize, inputs: &[&[DimSize]], output: &[DimSize]) -> AccessMap {
        let batch = if inputs[slot][0] == output[0] {
            DimAccess::Direct(0)
        } else {
            DimAccess::Broadcast
        };
        let rest = match slot {
            0 => matmul_operand(self.transpose_a, 1, 3),
            _ => matmul_operand(self.transpose_b, 3, 2),
        };
        AccessMap::Dims(vec![batch, rest[0], rest[1]])
    }
}

impl OpSemantics for Conv {
    fn name(&self) -> &'static str {
        "conv"
    }

    fn kind(&self) -> OpKind {
        OpKind::MatrixEngine
    }

    fn arity(&self) -> usize {
        2
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            common_dim_slicing: true,
            spatial_slicing: true,
            shape_only: false,
        }
    }

    fn infer_output_shape(&self, inputs: &[&[DimSize]]) -> Result<Shape, ShapeError> {
        check_arity(2, inputs)?;
        check_rank(0, 4, inputs[0])?;
        check_rank(1, 4, inputs[1])?;
        let (x, w) = (inputs[0], inputs[1]);
        if x[3] != w[2] {
            return Err(ShapeError::Incompatible("conv channel counts differ"));
        }
        let oh = self
            .params
            .out_size(0, x[1].get(), w[0].get())
            .ok_or(ShapeError::Incompatible("conv kernel taller than padded input"))?;
        let ow = self
            .params
            .out_size(1, x[2].get(), w[1].get())
            .ok_or(ShapeError::Incompatible("conv kernel wider than padded input"))?;
        Ok(vec![x[0], dim(oh)?, dim(ow)?, w[3]])
    }

    // [N, OH, OW, K | C, R, S]
    fn index_space(&self, inputs: &[&[DimSize]], output: &[DimSize]) -> Vec<IndexDim> {
        let w = inputs[1];
        vec![
            IndexDim::parallel(output[0].get(), DimRole::Batch),
            IndexDim::parallel(output[1].get(), DimRole::Spatial),
            IndexDim::parallel(output[2].get(), DimRole::Spatial),
            IndexDim::parallel(output[3].get(), DimRole::NonCommon),
            IndexDim::reduction(w[2].get(), DimRole::Common),
            IndexDim::reduction(w[0].get(), DimRole::Filter),
            IndexDim::reduction(w[1].get(), DimRole::Filter),
        ]
    }

    fn input_access(&self, slot: usize, _: &[&[DimSize]], _: &[DimSize]) -> AccessMap {
        match slot {
            0 => AccessMap::Dims(vec![
                DimAccess::Direct(0),
                self.params.window(0, 1, 5),
                self.params.window(1, 2, 6),
                DimAccess::Direct(4),
            ]),
            _ => AccessMap::Dims(vec![
                DimAccess::Direct(5),
                DimAccess::Direct(6),
                DimAccess::Direct(4),
                DimAccess::Direct(3),
            ]),
        }
    }
}

impl OpSemantics for Dedx {
    fn name(&self) -> &'static str {
        "dedx"
    }

    fn kind(&self) -> OpKind {
        OpKind::MatrixEngine
    }

    fn arity(&self) -> usize {
        2
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            common_dim_slicing: true,
            spatial_slicing: true,
            shape_only: false,
        }
    }

    fn infer_output_shape(&self, inputs: &[&[DimSize]]) -> Result<Shape, ShapeError> {
        check_arity(2, inputs)?;
        check_rank(0, 4, inputs[0])?;
        check_rank(1, 4, inputs[1])?;
        let (dy, w) = (inputs[0], inputs[1]);
        if dy[3] != w[3] {
            return Err(ShapeError::Incompatible("dedx filter counts differ"));
        }
        for i in 0..2 {
            let expected = self.params.out_size(i, self.input_hw[i], w[i].get());
            if expected != Some(dy[i + 1].get()) {
                return Err(ShapeError::Incompatible(
                    "dedx input size doesn't produce the gradient's spatial size",
                ));
            }
        }
        Ok(vec![
            dy[0],
            dim(self.input_hw[0])?,
            dim(self.input_hw[1])?,
            w[2],
        ])
    }

    // [N, H, W, C | K, R, S]
    fn index_space(&self, inputs: &[&[DimSize]], output: &[DimSize]) -> Vec<IndexDim> {
        let w = inputs[1];
        vec![
            IndexDim::parallel(output[0].get(), DimRole::Batch),
            IndexDim::parallel(output[1].get(), DimRole::Spatial),
            IndexDim::parallel(output[2].get(), DimRole::Spatial),
            IndexDim::parallel(output[3].get(), DimRole::NonCommon),
            IndexDim::reduction(w[3].get(), DimRole::Common),
            IndexDim::reduction(w[0].get(), DimRole::Filter),
            IndexDim::reduction(w[1].get(), DimRole::Filter),
        ]
    }

    fn input_access(&self, slot: usize, _: &[&[DimSize]], _: &[DimSize]) -> AccessMap {
        match slot {
            0 => AccessMap::Dims(vec![
                DimAccess::Direct(0),
                self.params.transposed(0, 1, 5),
                self.params.transposed(1, 2, 6),
                DimAccess::Direct(4),
            ]),
            _ => AccessMap::Dims(vec![
                DimAccess::Direct(5),
                DimAccess::Direct(6),
                DimAccess::Direct(3),
                DimAccess::Direct(4),
            ]),
        }
    }
}

impl OpSemantics for Dedw {
    fn name(&self) -> &'static str {
        "dedw"
    }

    fn kind(&self) -> OpKind {
        OpKind::MatrixEngine
    }

    fn arity(&self) -> usize {
        2
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            common_dim_slicing: true,
            spatial_slicing: true,
            shape_only: false,
        }
    }

    fn infer_output_shape(&self, inputs: &[&[DimSize]]) -> Result<Shape, ShapeError> {
        check_arity(2, inputs)?;
        check_rank(0, 4, inputs[0])?;
        check_rank(1, 4, inputs[1])?;
        let (dy, x) = (inputs[0], inputs[1]);
        if dy[0] != x[0] {
            return Err(ShapeError::Incompatible("dedw batch sizes differ"));
        }
        for i in 0..2 {
            let expected = self.params.out_size(i, x[i + 1].get(), self.kernel[i]);
            if expected != Some(dy[i + 1].get()) {
                return Err(ShapeError::Incompatible(
                    "dedw kernel doesn't produce the gradient's spatial size",
                ));
            }
        }
        Ok(vec![dim(self.kernel[0])?, dim(self.kernel[1])?, x[3], dy[3]])
    }

    // [R, S, C, K | N, OH, OW]
    fn index_space(&self, inputs: &[&[DimSize]], output: &[DimSize]) -> Vec<IndexDim> {
        let dy = inputs[0];
        vec![
            IndexDim::parallel(output[0].get(), DimRole::Filter),
            IndexDim::parallel(output[1].get(), DimRole::Filter),
            IndexDim::parallel(output[2].get(), DimRole::NonCommon),
            IndexDim::parallel(output[3].get(), DimRole::NonCommon),
            IndexDim::reduction(dy[0].get(), DimRole::Common),
            IndexDim::reduction(dy[1].get(), DimRole::Common),
            IndexDim::reduction(dy[2].get(), DimRole::Common),
        ]
    }

    fn input_access(&self, slot: usize, _: &[&[DimSize]], _: &[DimSize]) -> AccessMap {
        match slot {
            0 => AccessMap::Dims(vec![
                DimAccess::Direct(4),
                DimAccess::Direct(5),
                DimAccess::Direct(6),
                DimAccess::Direct(3),
            ]),
            _ => AccessMap::Dims(vec![
                DimAccess::Direct(4),
                self.params.window(0, 5, 0),
                self.params.window(1, 6, 1),
                DimAccess::Direct(2),
            ]),
        }
    }
}

impl EltwiseFn {
    pub fn arity(&self) -> usize {
        match self {
            EltwiseFn::Identity
            | EltwiseFn::Relu
            | EltwiseFn::Neg
            | EltwiseFn::Abs
            | EltwiseFn::Square => 1,
            EltwiseFn::Add
            | EltwiseFn::Sub
            | EltwiseFn::Mul
            | EltwiseFn::Max
            | EltwiseFn::Min
            | EltwiseFn::ReluGrad => 2,
        }
    }
}

fn elementwise_index_space(output: &[DimSize]) -> Vec<IndexDim> {
    output
        .iter()
        .map(|d| IndexDim::parallel(d.get(), DimRole::Elementwise))
        .collect()
}

impl OpSemantics for Elementwise {
    fn name(&self) -> &'static str {
        match self.func {
            EltwiseFn::Identity => "identity",
            EltwiseFn::Relu => "relu",
            EltwiseFn::Neg => "neg",
            EltwiseFn::Abs => "abs",
            EltwiseFn::Square => "square",
            EltwiseFn::Add => "add",
            EltwiseFn::Sub => "sub",
            EltwiseFn::Mul => "mul",
            EltwiseFn::Max => "max",
            EltwiseFn::Min => "min",
            EltwiseFn::ReluGrad => "relu_grad",
        }
    }

    fn kind(&self) -> OpKind {
        OpKind::Elementwise
    }

    fn arity(&self) -> usize {
        self.func.arity()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn infer_output_shape(&self, inputs: &[&[DimSize]]) -> Result<Shape, ShapeError> {
        check_arity(self.arity(), inputs)?;
        let rank = inputs[0].len();
        for (slot, s) in inputs.iter().enumerate() {
            check_rank(slot, rank, s)?;
        }
        (0..rank)
            .map(|d| {
                let widest = inputs.iter().map(|s| s[d]).max().unwrap_or(inputs[0][d]);
                if inputs.iter().all(|s| s[d] == widest || s[d].get() == 1) {
                    Ok(widest)
                } else {
                    Err(ShapeError::Incompatible("elementwise operands don't broadcast"))
                }
            })
            .collect()
    }

    fn index_space(&self, _: &[&[DimSize]], output: &[DimSize]) -> Vec<IndexDim> {
        elementwise_index_space(output)
    }

    fn input_access(&self, slot: usize, inputs: &[&[DimSize]], output: &[DimSize]) -> AccessMap {
        AccessMap::Dims(
            inputs[slot]
                .iter()
                .zip(output)
                .enumerate()
                .map(|(d, (i, o))| {
                    if i == o {
                        DimAccess::Direct(d as u8)
                    } else {
                        DimAccess::Broadcast
                    }
                })
                .collect(),
        )
    }
}

impl OpSemantics for Cast {
    fn name(&self) -> &'static str {
        "cast"
    }

    fn kind(&self) -> OpKind {
        OpKind::Elementwise
    }

    fn arity(&self) -> usize {
        1
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn infer_output_shape(&self, inputs: &[&[DimSize]]) -> Result<Shape, ShapeError> {
        check_arity(1, inputs)?;
        Ok(inputs[0].to_vec())
    }

    fn output_dtype(&self, _inputs: &[Dtype]) -> Dtype {
        self.to
    }

    fn index_space(&self, _: &[&[DimSize]], output: &[DimSize]) -> Vec<IndexDim> {
        elementwise_index_space(output)
    }

    fn input_access(&self, _: usize, _: &[&[DimSize]], output: &[DimSize]) -> AccessMap {
        AccessMap::identity(output.len())
    }
}

impl OpSemantics for Reduce {
    fn name(&self) -> &'static str {
        match self.kind {
            ReduceKind::Sum => "reduce_sum",
            ReduceKind::Max => "reduce_max",
        }
    }

    fn kind(&self) -> OpKind {
        OpKind::Reduction
    }

    fn arity(&self) -> usize {
        1
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn infer_output_shape(&self, inputs: &[&[DimSize]]) -> Result<Shape, ShapeError> {
        check_arity(1, inputs)?;
        let axis = usize::from(self.axis);
        if axis >= inputs[0].len() {
            return Err(ShapeError::Incompatible("reduction axis out of range"));
        }
        let mut out = inputs[0].to_vec();
        out[axis] = nz!(1u32);
        Ok(out)
    }

    fn index_space(&self, inputs: &[&[DimSize]], _: &[DimSize]) -> Vec<IndexDim> {
        inputs[0]
            .iter()
            .enumerate()
            .map(|(d, s)| {
                if d == usize::from(self.axis) {
                    IndexDim::reduction(s.get(), DimRole::Reduced)
                } else {
                    IndexDim::parallel(s.get(), DimRole::Elementwise)
                }
            })
            .collect()
    }

    fn input_access(&self, _: usize, inputs: &[&[DimSize]], _: &[DimSize]) -> AccessMap {
        AccessMap::identity(inputs[0].len())
    }

    fn output_access(&self, _: &[&[DimSize]], output: &[DimSize]) -> AccessMap {
        AccessMap::Dims(
            (0..output.len())
                .map(|d| {
                    if d == usize::from(self.axis) {
                        DimAccess::Broadcast
                    } else {
                        DimAccess::Direct(d as u8)
                    }
                })
                .collect(),
        )
    }
}

impl OpSemantics for Pool {
    fn name(&self) -> &'static str {
        match self.kind {
            PoolKind::Max => "maxpool_2d_fwd",
            PoolKind::Avg => "avgpool_2d_fwd",
        }
    }

    fn kind(&self) -> OpKind {
        OpKind::Reduction
    }

    fn arity(&self) -> usize {
        1
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            spatial_slicing: true,
            ..Capabilities::default()
        }
    }

    fn infer_output_shape(&self, inputs: &[&[DimSize]]) -> Result<Shape, ShapeError> {
        check_arity(1, inputs)?;
        check_rank(0, 4, inputs[0])?;
        let x = inputs[0];
        let oh = self
            .params
            .out_size(0, x[1].get(), self.window[0])
            .ok_or(ShapeError::Incompatible("pool window taller than padded input"))?;
        let ow = self
            .params
            .out_size(1, x[2].get(), self.window[1])
            .ok_or(ShapeError::Incompatible("pool window wider than padded input"))?;
        Ok(vec![x[0], dim(oh)?, dim(ow)?, x[3]])
    }

    // [N, OH, OW, C | R, S]
    fn index_space(&self, _: &[&[DimSize]], output: &[DimSize]) -> Vec<IndexDim> {
        vec![
            IndexDim::parallel(output[0].get(), DimRole::Batch),
            IndexDim::parallel(output[1].get(), DimRole::Spatial),
            IndexDim::parallel(output[2].get(), DimRole::Spatial),
            IndexDim::parallel(output[3].get(), DimRole::Elementwise),
            IndexDim::reduction(self.window[0], DimRole::Filter),
            IndexDim::reduction(self.window[1], DimRole::Filter),
        ]
    }

    fn input_access(&self, _: usize, _: &[&[DimSize]], _: &[DimSize]) -> AccessMap {
        AccessMap::Dims(vec![
            DimAccess::Direct(0),
            self.params.window(0, 1, 4),
            self.params.window(1, 2, 5),
            DimAccess::Direct(3),
        ])
    }
}

impl OpSemantics for AvgPoolGrad {
    fn name(&self) -> &'static str {
        "avgpool_2d_bwd"
    }

    fn kind(&self) -> OpKind {
        OpKind::Reduction
    }

    fn arity(&self) -> usize {
        1
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            spatial_slicing: true,
            ..Capabilities::default()
        }
    }

    fn infer_output_shape(&self, inputs: &[&[DimSize]]) -> Result<Shape, ShapeError> {
        check_arity(1, inputs)?;
        check_rank(0, 4, inputs[0])?;
        let dy = inputs[0];
        for i in 0..2 {
            let expected = self.params.out_size(i, self.input_hw[i], self.window[i]);
            if expected != Some(dy[i + 1].get()) {
                return Err(ShapeError::Incompatible(
                    "pool input size doesn't produce the gradient's spatial size",
                ));
            }
        }
        Ok(vec![
            dy[0],
            dim(self.input_hw[0])?,
            dim(self.input_hw[1])?,
            dy[3],
        ])
    }

    // [N, H, W, C | R, S]
    fn index_space(&self, _: &[&[DimSize]], output: &[DimSize]) -> Vec<IndexDim> {
        vec![
            IndexDim::parallel(output[0].get(), DimRole::Batch),
            IndexDim::parallel(output[1].get(), DimRole::Spatial),
            IndexDim::parallel(output[2].get(), DimRole::Spatial),
            IndexDim::parallel(output[3].get(), DimRole::Elementwise),
            IndexDim::reduction(self.window[0], DimRole::Filter),
            IndexDim::reduction(self.window[1], DimRole::Filter),
        ]
    }

    fn input_access(&self, _: usize, _: &[&[DimSize]], _: &[DimSize]) -> AccessMap {
        AccessMap::Dims(vec![
            DimAccess::Direct(0),
            self.params.transposed(0, 1, 4),
            self.params.transposed(1, 2, 5),
            DimAccess::Direct(3),
        ])
    }
}

impl OpSemantics for Reshape {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn kind(&self) -> OpKind {
        OpKind::ShapeOnly
    }

    fn arity(&self) -> usize {
        1
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            shape_only: true,
            ..Capabilities::default()
        }
    }

    fn infer_output_shape(&self, inputs: &[&[DimSize]]) -> Result<Shape, ShapeError> {
        check_arity(1, inputs)?;
        if crate::common::volume(inputs[0]) != crate::common::volume(&self.shape) {
            return Err(ShapeError::Incompatible("reshape changes the element count"));
        }
        Ok(self.shape.clone())
    }

    fn index_space(&self, _: &[&[DimSize]], output: &[DimSize]) -> Vec<IndexDim> {
        elementwise_index_space(output)
    }

    fn input_access(&self, _: usize, _: &[&[DimSize]], _: &[DimSize]) -> AccessMap {
        AccessMap::Flat
    }
}

impl OpSemantics for Transpose {
    fn name(&self) -> &'static str {
        "transpose"
    }

    fn kind(&self) -> OpKind {
        OpKind::Elementwise
    }

    fn arity(&self) -> usize {
        1
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn infer_output_shape(&self, inputs: &[&[DimSize]]) -> Result<Shape, ShapeError> {
        check_arity(1, inputs)?;
        let input = inputs[0];
        let mut seen = vec![false; input.len()];
        if self.perm.len() != input.len() {
            return Err(ShapeError::Incompatible("permutation rank differs from input"));
        }
        for &p in &self.perm {
            let p = usize::from(p);
            if p >= input.len() || seen[p] {
                return Err(ShapeError::Incompatible("not a permutation"));
            }
            seen[p] = true;
        }
        Ok(self.perm.iter().map(|&p| input[usize::from(p)]).collect())
    }

    fn index_space(&self, _: &[&[DimSize]], output: &[DimSize]) -> Vec<IndexDim> {
        elementwise_index_space(output)
    }

    fn input_access(&self, _: usize, inputs: &[&[DimSize]], _: &[DimSize]) -> AccessMap {
        let mut dims = vec![DimAccess::Broadcast; inputs[0].len()];
        for (out_dim, &in_dim) in self.perm.iter().enumerate() {
            dims[usize::from(in_dim)] = DimAccess::Direct(out_dim as u8);
        }
        AccessMap::Dims(dims)
    }
}

impl Op {
    pub fn is_matrix_engine(&self) -> bool {
        self.kind() == OpKind::MatrixEngine
    }

    /// Whether the node may join a matrix-engine node's producer or consumer chain.
    pub fn is_chainable(&self) -> bool {
        !self.is_matrix_engine()
    }

    pub fn is_conv_family(&self) -> bool {
        matches!(self, Op::Conv(_) | Op::Dedx(_) | Op::Dedw(_))
    }

    pub fn gemm() -> Self {
        Op::Gemm(Gemm::default())
    }

    pub fn eltwise(func: EltwiseFn) -> Self {
        Op::Elementwise(Elementwise { func })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape;

    fn shapes(v: &[Shape]) -> Vec<&[DimSize]> {
        v.iter().map(|s| s.as_slice()).collect()
    }

    #[test]
    fn test_gemm_transposed_shape() {
        let op = Op::Gemm(Gemm {
            transpose_a: true,
            transpose_b: false,
        });
        let ins = [shape![16, 8], shape![16, 4]];
        assert_eq!(op.infer_output_shape(&shapes(&ins)), Ok(shape![8, 4]));
    }

    #[test]
    fn test_batch_gemm_broadcasts_batch() {
        let op = Op::BatchGemm(BatchGemm::default());
        let ins = [shape![3, 5, 2], shape![1, 2, 7]];
        let out = op.infer_output_shape(&shapes(&ins)).unwrap();
        assert_eq!(out, shape![3, 5, 7]);
        assert_eq!(
            op.input_access(1, &shapes(&ins), &out),
            AccessMap::Dims(vec![
                DimAccess::Broadcast,
                DimAccess::Direct(3),
                DimAccess::Direct(2)
            ])
        );
    }

    #[test]
    fn test_conv_and_gradients_agree_on_shapes() {
        let params = ConvParams {
            stride: [2, 2],
            ..ConvParams::same_padding([3, 3])
        };
        let x = shape![2, 9, 9, 4];
        let w = shape![3, 3, 4, 6];
        let y = Op::Conv(Conv { params })
            .infer_output_shape(&[&x, &w])
            .unwrap();
        assert_eq!(y, shape![2, 5, 5, 6]);
        let dx = Op::Dedx(Dedx {
            params,
            input_hw: [9, 9],
        })
        .infer_output_shape(&[&y, &w])
        .unwrap();
        assert_eq!(dx, x);
        let dw = Op::Dedw(Dedw {
            params,
            kernel: [3, 3],
        })
        .infer_output_shape(&[&y, &x])
        .unwrap();
        assert_eq!(dw, w);
    }

    #[test]
    fn test_reshape_rejects_volume_change() {
        let op = Op::Reshape(Reshape { shape: shape![4, 4] });
        assert!(op.infer_output_shape(&[&shape![3, 5]]).is_err());
    }

    #[test]
    fn test_transpose_access_inverts_perm() {
        let op = Op::Transpose(Transpose { perm: vec![2, 0, 1] });
        let x = shape![2, 3, 4];
        let y = op.infer_output_shape(&[&x]).unwrap();
        assert_eq!(y, shape![4, 2, 3]);
        assert_eq!(
            op.input_access(0, &[&x], &y),
            AccessMap::Dims(vec![
                DimAccess::Direct(1),
                DimAccess::Direct(2),
                DimAccess::Direct(0)
            ])
        );
    }

    #[test]
    fn test_reduce_keeps_axis() {
        let op = Op::Reduce(Reduce {
            axis: 1,
            kind: ReduceKind::Sum,
        });
        assert_eq!(op.infer_output_shape(&[&shape![2, 5]]), Ok(shape![2, 1]));
        assert_eq!(op.kind(), OpKind::Reduction);
        assert!(op.is_chainable());
    }

    #[test]
    fn test_zero_sized_windows_and_inputs_are_errors() {
        let dy = shape![1, 4, 4, 2];
        let pool = Op::AvgPoolGrad(AvgPoolGrad {
            window: [0, 2],
            params: ConvParams::default(),
            input_hw: [4, 8],
        });
        assert!(pool.infer_output_shape(&[&dy]).is_err());
        let pool = Op::AvgPoolGrad(AvgPoolGrad {
            window: [1, 1],
            params: ConvParams::default(),
            input_hw: [0, 4],
        });
        assert!(pool.infer_output_shape(&[&dy]).is_err());
        assert_eq!(ConvParams::default().out_size(0, 4, 0), None);
    }
}
