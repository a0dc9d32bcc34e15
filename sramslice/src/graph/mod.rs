//! The node/tensor graph the scheduler operates on.
//!
//! Nodes and tensors live in arenas owned by [Graph] and are addressed by stable
//! indices ([NodeId], [TensorId]). All dependency analysis works on these
//! indices, so a tensor bound to two input slots of one node is just two edges.

pub mod access;
pub mod ops;

use itertools::Itertools;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display};

use crate::common::{volume, DimSize, Dtype, Shape};
use crate::utils::layered_toposort;
use access::{AccessMap, IndexDim};
use ops::{Op, OpSemantics, ShapeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct TensorId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct NodeId(pub u32);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum MemoryHint {
    #[default]
    Unconstrained,
    ForceSram,
    ForceHbm,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tensor {
    pub name: String,
    pub dtype: Dtype,
    /// The maximum shape. Equal to the actual shape unless the tensor is dynamic.
    pub shape: Shape,
    pub min_shape: Option<Shape>,
    /// Must keep a full-size backing store reachable by the caller.
    pub persistent: bool,
    pub hint: MemoryHint,
    producer: Option<NodeId>,
    consumers: Vec<NodeId>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub inputs: Vec<TensorId>,
    pub output: TensorId,
}

/// A node together with one concrete shape per operand.
#[derive(Debug, Clone)]
pub struct BoundNode<'g> {
    pub op: &'g Op,
    pub inputs: Vec<Shape>,
    pub output: Shape,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Graph {
    tensors: Vec<Tensor>,
    nodes: Vec<Node>,
    control_edges: Vec<(NodeId, NodeId)>,
    frozen: bool,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("the graph is frozen")]
    Frozen,
    #[error("unknown tensor {0}")]
    UnknownTensor(TensorId),
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("tensor {0} already has a producer")]
    AlreadyProduced(TensorId),
    #[error("node {node} reads its own output")]
    SelfLoop { node: String },
    #[error("node {node}: {source}")]
    Shape {
        node: String,
        #[source]
        source: ShapeError,
    },
    #[error("node {node} produces {expected:?} but its output tensor has shape {actual:?}")]
    OutputShape {
        node: String,
        expected: Vec<u32>,
        actual: Vec<u32>,
    },
    #[error("dependency cycle through node {0}")]
    Cycle(NodeId),
    #[error("shape {actual:?} of tensor {tensor} is outside {min:?}..={max:?}")]
    ShapeOutOfRange {
        tensor: TensorId,
        actual: Vec<u32>,
        min: Vec<u32>,
        max: Vec<u32>,
    },
}

impl Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl Tensor {
    pub fn producer(&self) -> Option<NodeId> {
        self.producer
    }

    pub fn consumers(&self) -> &[NodeId] {
        &self.consumers
    }

    pub fn is_dynamic(&self) -> bool {
        self.min_shape.as_ref().is_some_and(|m| m != &self.shape)
    }

    /// Bytes of the tensor at its maximum shape.
    pub fn bytes(&self) -> u64 {
        volume(&self.shape) * u64::from(self.dtype.size())
    }

    pub fn shape_u32s(&self) -> Vec<u32> {
        crate::common::shape_to_u32s(&self.shape)
    }
}

impl BoundNode<'_> {
    fn input_refs(&self) -> Vec<&[DimSize]> {
        self.inputs.iter().map(|s| s.as_slice()).collect()
    }

    pub fn index_space(&self) -> Vec<IndexDim> {
        self.op.index_space(&self.input_refs(), &self.output)
    }

    pub fn index_sizes(&self) -> Vec<u32> {
        self.index_space().iter().map(|d| d.size).collect()
    }

    pub fn input_access(&self, slot: usize) -> AccessMap {
        self.op.input_access(slot, &self.input_refs(), &self.output)
    }

    pub fn output_access(&self) -> AccessMap {
        self.op.output_access(&self.input_refs(), &self.output)
    }

    pub fn input_shape(&self, slot: usize) -> Vec<u32> {
        crate::common::shape_to_u32s(&self.inputs[slot])
    }

    pub fn output_shape(&self) -> Vec<u32> {
        crate::common::shape_to_u32s(&self.output)
    }
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    pub fn create_tensor(
        &mut self,
        name: impl Into<String>,
        shape: Shape,
        dtype: Dtype,
        persistent: bool,
    ) -> Result<TensorId, GraphError> {
        self.push_tensor(name.into(), shape, None, dtype, persistent)
    }

    /// Create a tensor whose actual shape is only known at run time, anywhere
    /// between `min_shape` and `max_shape`.
    pub fn create_dynamic_tensor(
        &mut self,
        name: impl Into<String>,
        min_shape: Shape,
        max_shape: Shape,
        dtype: Dtype,
        persistent: bool,
    ) -> Result<TensorId, GraphError> {
        self.push_tensor(name.into(), max_shape, Some(min_shape), dtype, persistent)
    }

    fn push_tensor(
        &mut self,
        name: String,
        shape: Shape,
        min_shape: Option<Shape>,
        dtype: Dtype,
        persistent: bool,
    ) -> Result<TensorId, GraphError> {
        if self.frozen {
            return Err(GraphError::Frozen);
        }
        let id = TensorId(self.tensors.len() as u32);
        self.tensors.push(Tensor {
            name,
            dtype,
            shape,
            min_shape,
            persistent,
            hint: MemoryHint::Unconstrained,
            producer: None,
            consumers: vec![],
        });
        Ok(id)
    }

    pub fn set_memory_hint(&mut self, tensor: TensorId, hint: MemoryHint) -> Result<(), GraphError> {
        if self.frozen {
            return Err(GraphError::Frozen);
        }
        self.tensors
            .get_mut(tensor.0 as usize)
            .ok_or(GraphError::UnknownTensor(tensor))?
            .hint = hint;
        Ok(())
    }

    pub fn set_persistent(&mut self, tensor: TensorId, persistent: bool) -> Result<(), GraphError> {
        if self.frozen {
            return Err(GraphError::Frozen);
        }
        self.tensors
            .get_mut(tensor.0 as usize)
            .ok_or(GraphError::UnknownTensor(tensor))?
            .persistent = persistent;
        Ok(())
    }

    /// Add a node producing the existing tensor `output`.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: Op,
        inputs: &[TensorId],
        output: TensorId,
    ) -> Result<NodeId, GraphError> {
        let name = name.into();
        if self.frozen {
            return Err(GraphError::Frozen);
        }
        for &t in inputs.iter().chain([&output]) {
            if t.0 as usize >= self.tensors.len() {
                return Err(GraphError::UnknownTensor(t));
            }
        }
        if inputs.contains(&output) {
            return Err(GraphError::SelfLoop { node: name });
        }
        if self.tensor(output).producer.is_some() {
            return Err(GraphError::AlreadyProduced(output));
        }
        let expected = {
            let shapes = inputs
                .iter()
                .map(|&t| self.tensor(t).shape.as_slice())
                .collect::<Vec<_>>();
            op.infer_output_shape(&shapes)
                .map_err(|source| GraphError::Shape {
                    node: name.clone(),
                    source,
                })?
        };
        if expected != self.tensor(output).shape {
            return Err(GraphError::OutputShape {
                node: name,
                expected: crate::common::shape_to_u32s(&expected),
                actual: self.tensor(output).shape_u32s(),
            });
        }

        let id = NodeId(self.nodes.len() as u32);
        for &t in inputs.iter().unique() {
            self.tensors[t.0 as usize].consumers.push(id);
        }
        self.tensors[output.0 as usize].producer = Some(id);
        self.nodes.push(Node {
            name,
            op,
            inputs: inputs.to_vec(),
            output,
        });
        Ok(id)
    }

    /// Add a node along with a fresh, non-persistent output tensor of the
    /// inferred shape. Returns the output tensor.
    ///
    /// If any input is dynamic, so is the output.
    pub fn apply(
        &mut self,
        name: impl Into<String>,
        op: Op,
        inputs: &[TensorId],
    ) -> Result<TensorId, GraphError> {
        let name = name.into();
        for &t in inputs {
            if t.0 as usize >= self.tensors.len() {
                return Err(GraphError::UnknownTensor(t));
            }
        }
        let max_shapes = inputs
            .iter()
            .map(|&t| self.tensor(t).shape.as_slice())
            .collect::<Vec<_>>();
        let shape = op
            .infer_output_shape(&max_shapes)
            .map_err(|source| GraphError::Shape {
                node: name.clone(),
                source,
            })?;
        let min_shape = if inputs.iter().any(|&t| self.tensor(t).is_dynamic()) {
            let min_shapes = inputs
                .iter()
                .map(|&t| {
                    let tensor = self.tensor(t);
                    tensor.min_shape.as_ref().unwrap_or(&tensor.shape).as_slice()
                })
                .collect::<Vec<_>>();
            op.infer_output_shape(&min_shapes).ok()
        } else {
            None
        };
        let dtype = op.output_dtype(
            &inputs
                .iter()
                .map(|&t| self.tensor(t).dtype)
                .collect::<Vec<_>>(),
        );
        let output = self.push_tensor(format!("{name}.out"), shape, min_shape, dtype, false)?;
        self.add_node(name, op, inputs, output)?;
        Ok(output)
    }

    /// Force `to` to run after `from`.
    pub fn add_control_edge(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        if self.frozen {
            return Err(GraphError::Frozen);
        }
        for n in [from, to] {
            if n.0 as usize >= self.nodes.len() {
                return Err(GraphError::UnknownNode(n));
            }
        }
        if !self.control_edges.contains(&(from, to)) {
            self.control_edges.push((from, to));
        }
        Ok(())
    }

    /// Check the graph is acyclic and prevent further mutation.
    pub fn freeze(&mut self) -> Result<(), GraphError> {
        self.topo_order()?;
        self.frozen = true;
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.0 as usize]
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    pub fn tensor_ids(&self) -> impl Iterator<Item = TensorId> + '_ {
        (0..self.tensors.len() as u32).map(TensorId)
    }

    pub fn control_edges(&self) -> &[(NodeId, NodeId)] {
        &self.control_edges
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.node_ids().find(|&n| self.node(n).name == name)
    }

    /// Tensors a caller can observe after execution: persistent tensors and
    /// tensors nothing consumes.
    pub fn is_observable(&self, tensor: TensorId) -> bool {
        let t = self.tensor(tensor);
        t.persistent || t.consumers.is_empty()
    }

    pub fn graph_inputs(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.tensor_ids()
            .filter(|&t| self.tensor(t).producer.is_none())
    }

    pub fn input_shapes(&self, node: NodeId) -> Vec<&[DimSize]> {
        self.node(node)
            .inputs
            .iter()
            .map(|&t| self.tensor(t).shape.as_slice())
            .collect()
    }

    pub fn index_space(&self, node: NodeId) -> Vec<IndexDim> {
        let n = self.node(node);
        n.op
            .index_space(&self.input_shapes(node), &self.tensor(n.output).shape)
    }

    pub fn input_access(&self, node: NodeId, slot: usize) -> AccessMap {
        let n = self.node(node);
        n.op
            .input_access(slot, &self.input_shapes(node), &self.tensor(n.output).shape)
    }

    pub fn output_access(&self, node: NodeId) -> AccessMap {
        let n = self.node(node);
        n.op
            .output_access(&self.input_shapes(node), &self.tensor(n.output).shape)
    }

    /// The maximum shape of every tensor, indexed by [TensorId].
    pub fn max_shapes(&self) -> Vec<Shape> {
        self.tensors.iter().map(|t| t.shape.clone()).collect()
    }

    /// The minimum shape of every tensor, indexed by [TensorId].
    pub fn min_shapes(&self) -> Vec<Shape> {
        self.tensors
            .iter()
            .map(|t| t.min_shape.clone().unwrap_or_else(|| t.shape.clone()))
            .collect()
    }

    /// A node's operand shapes taken from `shapes` rather than the tensors'
    /// maximum shapes.
    pub fn bound(&self, node: NodeId, shapes: &[Shape]) -> BoundNode<'_> {
        let n = self.node(node);
        BoundNode {
            op: &n.op,
            inputs: n
                .inputs
                .iter()
                .map(|t| shapes[t.0 as usize].clone())
                .collect(),
            output: shapes[n.output.0 as usize].clone(),
        }
    }

    /// Data and control successors, sorted and deduplicated.
    pub fn successors(&self, node: NodeId) -> Vec<NodeId> {
        let data = self.tensor(self.node(node).output).consumers.iter().copied();
        let control = self
            .control_edges
            .iter()
            .filter(|(from, _)| *from == node)
            .map(|(_, to)| *to);
        data.chain(control).sorted().dedup().collect()
    }

    /// Data and control predecessors, sorted and deduplicated.
    pub fn predecessors(&self, node: NodeId) -> Vec<NodeId> {
        let data = self
            .node(node)
            .inputs
            .iter()
            .filter_map(|&t| self.tensor(t).producer);
        let control = self
            .control_edges
            .iter()
            .filter(|(_, to)| *to == node)
            .map(|(from, _)| *from);
        data.chain(control).sorted().dedup().collect()
    }

    /// A deterministic topological order over data and control edges: nodes
    /// by depth, lowest index first within a depth.
    pub fn topo_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut dag = DiGraphMap::with_capacity(self.nodes.len(), self.nodes.len());
        for n in self.node_ids() {
            dag.add_node(n);
        }
        for n in self.node_ids() {
            for s in self.successors(n) {
                dag.add_edge(n, s, ());
            }
        }
        layered_toposort(&dag, |n| n).map_err(|c| GraphError::Cycle(c.node_id()))
    }

    /// Infer every tensor's actual shape from the actual shapes of graph inputs.
    ///
    /// Inputs missing from `inputs` take their maximum shape. Every inferred
    /// shape must lie between the tensor's minimum and maximum shapes.
    pub fn bind_shapes(&self, inputs: &HashMap<TensorId, Shape>) -> Result<Vec<Shape>, GraphError> {
        let mut shapes = self
            .tensors
            .iter()
            .enumerate()
            .map(|(i, t)| {
                inputs
                    .get(&TensorId(i as u32))
                    .cloned()
                    .unwrap_or_else(|| t.shape.clone())
            })
            .collect::<Vec<_>>();
        for n in self.topo_order()? {
            let node = self.node(n);
            let in_shapes = node
                .inputs
                .iter()
                .map(|t| shapes[t.0 as usize].as_slice())
                .collect::<Vec<_>>();
            let out = node
                .op
                .infer_output_shape(&in_shapes)
                .map_err(|source| GraphError::Shape {
                    node: node.name.clone(),
                    source,
                })?;
            shapes[node.output.0 as usize] = out;
        }
        for (i, t) in self.tensors.iter().enumerate() {
            let actual = &shapes[i];
            let min = t.min_shape.as_ref().unwrap_or(&t.shape);
            let in_range = actual.len() == t.shape.len()
                && actual
                    .iter()
                    .zip(min.iter().zip(&t.shape))
                    .all(|(a, (lo, hi))| lo <= a && a <= hi);
            if !in_range {
                return Err(GraphError::ShapeOutOfRange {
                    tensor: TensorId(i as u32),
                    actual: crate::common::shape_to_u32s(actual),
                    min: crate::common::shape_to_u32s(min),
                    max: t.shape_u32s(),
                });
            }
        }
        Ok(shapes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ops::{EltwiseFn, Reshape};
    use crate::shape;

    #[test]
    fn test_duplicate_operand_counts_one_consumer() {
        let mut g = Graph::new();
        let a = g.create_tensor("a", shape![4, 4], Dtype::Float32, false).unwrap();
        let sq = g.apply("sq", Op::gemm(), &[a, a]).unwrap();
        assert_eq!(g.tensor(a).consumers(), &[NodeId(0)]);
        assert_eq!(g.node(NodeId(0)).inputs, vec![a, a]);
        assert_eq!(g.tensor(sq).producer(), Some(NodeId(0)));
    }

    #[test]
    fn test_add_node_checks_output_shape() {
        let mut g = Graph::new();
        let a = g.create_tensor("a", shape![4, 8], Dtype::Float32, false).unwrap();
        let b = g.create_tensor("b", shape![8, 2], Dtype::Float32, false).unwrap();
        let bad = g.create_tensor("c", shape![4, 4], Dtype::Float32, true).unwrap();
        assert!(matches!(
            g.add_node("mm", Op::gemm(), &[a, b], bad),
            Err(GraphError::OutputShape { .. })
        ));
    }

    #[test]
    fn test_control_edge_cycle_fails_freeze() {
        let mut g = Graph::new();
        let a = g.create_tensor("a", shape![4], Dtype::Float32, false).unwrap();
        let b = g.apply("relu", Op::eltwise(EltwiseFn::Relu), &[a]).unwrap();
        g.apply("neg", Op::eltwise(EltwiseFn::Neg), &[b]).unwrap();
        g.add_control_edge(NodeId(1), NodeId(0)).unwrap();
        assert!(matches!(g.freeze(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_frozen_graph_rejects_mutation() {
        let mut g = Graph::new();
        g.create_tensor("a", shape![4], Dtype::Float32, false).unwrap();
        g.freeze().unwrap();
        assert_eq!(
            g.create_tensor("b", shape![4], Dtype::Float32, false),
            Err(GraphError::Frozen)
        );
    }

    #[test]
    fn test_topo_order_follows_control_edges_then_ids() {
        let mut g = Graph::new();
        let a = g.create_tensor("a", shape![4], Dtype::Float32, false).unwrap();
        let x = g.apply("x", Op::eltwise(EltwiseFn::Relu), &[a]).unwrap();
        g.apply("y", Op::eltwise(EltwiseFn::Neg), &[a]).unwrap();
        g.apply("z", Op::eltwise(EltwiseFn::Abs), &[x]).unwrap();
        g.apply("w", Op::eltwise(EltwiseFn::Abs), &[a]).unwrap();
        g.add_control_edge(NodeId(1), NodeId(0)).unwrap();
        assert_eq!(
            g.topo_order().unwrap(),
            vec![NodeId(1), NodeId(3), NodeId(0), NodeId(2)]
        );
        g.add_control_edge(NodeId(2), NodeId(1)).unwrap();
        assert!(matches!(g.topo_order(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_bind_shapes_follows_dynamic_batch() {
        let mut g = Graph::new();
        let x = g
            .create_dynamic_tensor("x", shape![1, 6], shape![8, 6], Dtype::Float32, false)
            .unwrap();
        let y = g.apply("relu", Op::eltwise(EltwiseFn::Relu), &[x]).unwrap();
        assert!(g.tensor(y).is_dynamic());
        let shapes = g
            .bind_shapes(&HashMap::from([(x, shape![3, 6])]))
            .unwrap();
        assert_eq!(shapes[y.0 as usize], shape![3, 6]);
        assert!(g
            .bind_shapes(&HashMap::from([(x, shape![9, 6])]))
            .is_err());
    }

    #[test]
    fn test_reshape_output_is_not_dynamic_when_input_static() {
        let mut g = Graph::new();
        let x = g.create_tensor("x", shape![4, 6], Dtype::Bfloat16, false).unwrap();
        let y = g
            .apply("r", Op::Reshape(Reshape { shape: shape![2, 12] }), &[x])
            .unwrap();
        assert!(!g.tensor(y).is_dynamic());
        assert_eq!(g.tensor(y).dtype, Dtype::Bfloat16);
    }
}
