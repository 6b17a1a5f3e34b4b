//! Typed computation graph handed to `Program::build`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};
use crate::hashing::FingerprintHasher;
use crate::layout::{Format, Layout};
use crate::ops;
use crate::tensor::HostTensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Operation families. The set is closed; each kind must have a reference implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationKind {
    Parameter,
    Constant,
    ElementwiseBinary,
    ElementwiseUnary,
    MatMul,
    Reduce,
    Reshape,
    Reorder,
}

impl OperationKind {
    pub const ALL: [OperationKind; 8] = [
        OperationKind::Parameter,
        OperationKind::Constant,
        OperationKind::ElementwiseBinary,
        OperationKind::ElementwiseUnary,
        OperationKind::MatMul,
        OperationKind::Reduce,
        OperationKind::Reshape,
        OperationKind::Reorder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Parameter => "parameter",
            OperationKind::Constant => "constant",
            OperationKind::ElementwiseBinary => "elementwise_binary",
            OperationKind::ElementwiseUnary => "elementwise_unary",
            OperationKind::MatMul => "matmul",
            OperationKind::Reduce => "reduce",
            OperationKind::Reshape => "reshape",
            OperationKind::Reorder => "reorder",
        }
    }

    /// Kinds that never dispatch to a backend: sources are filled by the engine and
    /// reshapes alias their input buffer.
    pub fn is_executable(self) -> bool {
        !matches!(
            self,
            OperationKind::Parameter | OperationKind::Constant | OperationKind::Reshape
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Relu,
    Exp,
    Tanh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceKind {
    Sum,
    Max,
}

/// Reduction over the innermost axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReduceSpec {
    pub kind: ReduceKind,
    pub keep_dims: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReshapeDim {
    Explicit(usize),
    /// Takes whatever extent keeps the element count; at most one per reshape.
    Infer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatMulSpec {
    pub transpose_lhs: bool,
    pub transpose_rhs: bool,
}

/// Operation kind plus its parameter block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpSpec {
    Parameter,
    Constant(HostTensor),
    ElementwiseBinary(BinaryOp),
    ElementwiseUnary(UnaryOp),
    MatMul(MatMulSpec),
    Reduce(ReduceSpec),
    Reshape(Vec<ReshapeDim>),
    Reorder { target: Format },
}

impl OpSpec {
    pub fn kind(&self) -> OperationKind {
        match self {
            OpSpec::Parameter => OperationKind::Parameter,
            OpSpec::Constant(_) => OperationKind::Constant,
            OpSpec::ElementwiseBinary(_) => OperationKind::ElementwiseBinary,
            OpSpec::ElementwiseUnary(_) => OperationKind::ElementwiseUnary,
            OpSpec::MatMul(_) => OperationKind::MatMul,
            OpSpec::Reduce(_) => OperationKind::Reduce,
            OpSpec::Reshape(_) => OperationKind::Reshape,
            OpSpec::Reorder { .. } => OperationKind::Reorder,
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            OpSpec::Parameter | OpSpec::Constant(_) => 0,
            OpSpec::ElementwiseUnary(_)
            | OpSpec::Reduce(_)
            | OpSpec::Reshape(_)
            | OpSpec::Reorder { .. } => 1,
            OpSpec::ElementwiseBinary(_) | OpSpec::MatMul(_) => 2,
        }
    }
}

/// One operation of the graph. Inputs refer to the single output of earlier nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub op: OpSpec,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<Layout>,
}

impl Node {
    pub fn kind(&self) -> OperationKind {
        self.op.kind()
    }

    /// Layout of the value this node produces.
    pub fn output(&self) -> &Layout {
        &self.outputs[0]
    }

    /// Stable hash of everything that determines a node's compiled form apart from concrete
    /// shapes: operation, parameters and declared layouts.
    pub fn signature(&self, input_layouts: &[Layout]) -> u64 {
        let mut hasher = FingerprintHasher::new();
        hasher.write_str(self.kind().as_str());
        hasher.write_serialized(&self.op);
        hasher.write_serialized(input_layouts);
        hasher.write_serialized(&self.outputs);
        hasher.finish()
    }
}

/// Validated DAG of nodes in dependency order.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Arc<Node>>,
    outputs: Vec<NodeId>,
    positions: HashMap<NodeId, usize>,
}

impl Graph {
    /// Validates and wraps the nodes. Nodes must be listed so that every input refers to an
    /// earlier node.
    pub fn new(nodes: Vec<Node>, outputs: Vec<NodeId>) -> RuntimeResult<Self> {
        let mut positions = HashMap::with_capacity(nodes.len());
        for (position, node) in nodes.iter().enumerate() {
            validate_node(node, &positions, &nodes)?;
            if positions.insert(node.id, position).is_some() {
                return Err(invalid(format!("node id {} is used twice", node.id)));
            }
        }
        if outputs.is_empty() {
            return Err(invalid("graph declares no outputs".to_string()));
        }
        for output in &outputs {
            if !positions.contains_key(output) {
                return Err(invalid(format!("graph output {output} is not a node")));
            }
        }
        Ok(Self {
            nodes: nodes.into_iter().map(Arc::new).collect(),
            outputs,
            positions,
        })
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    pub fn node(&self, id: NodeId) -> Option<&Arc<Node>> {
        self.position(id).map(|position| &self.nodes[position])
    }

    pub fn parameters(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes
            .iter()
            .filter(|node| node.kind() == OperationKind::Parameter)
    }

    /// Input positions of the node at `position`.
    pub fn input_positions(&self, position: usize) -> Vec<usize> {
        self.nodes[position]
            .inputs
            .iter()
            .filter_map(|input| self.position(*input))
            .collect()
    }

    /// Declared layouts of a node's inputs, in operand order.
    pub fn input_layouts(&self, node: &Node) -> Vec<Layout> {
        node.inputs
            .iter()
            .filter_map(|input| self.node(*input))
            .map(|producer| producer.output().clone())
            .collect()
    }

    pub fn is_output(&self, id: NodeId) -> bool {
        self.outputs.contains(&id)
    }
}

fn invalid(reason: String) -> RuntimeError {
    RuntimeError::InvalidGraph { reason }
}

fn validate_node(
    node: &Node,
    positions: &HashMap<NodeId, usize>,
    nodes: &[Node],
) -> RuntimeResult<()> {
    if node.outputs.len() != 1 {
        return Err(invalid(format!(
            "node {} declares {} outputs; every operation produces exactly one",
            node.id,
            node.outputs.len()
        )));
    }
    if node.inputs.len() != node.op.arity() {
        return Err(invalid(format!(
            "node {} ({}) takes {} inputs, got {}",
            node.id,
            node.kind().as_str(),
            node.op.arity(),
            node.inputs.len()
        )));
    }
    let mut input_layouts = Vec::with_capacity(node.inputs.len());
    for input in &node.inputs {
        let Some(position) = positions.get(input) else {
            return Err(invalid(format!(
                "node {} refers to {input}, which is not an earlier node",
                node.id
            )));
        };
        input_layouts.push(nodes[*position].output().clone());
    }
    if node.kind() == OperationKind::Parameter {
        return Ok(());
    }
    let inferred = ops::infer_output_layout(&node.op, &input_layouts)
        .map_err(|reason| invalid(format!("node {}: {reason}", node.id)))?;
    let declared = node.output();
    if inferred.dtype != declared.dtype || inferred.shape.rank() != declared.shape.rank() {
        return Err(invalid(format!(
            "node {} declares output {declared}, operation produces {inferred}",
            node.id
        )));
    }
    Ok(())
}

/// Incremental graph construction with output layouts derived from the inputs.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> NodeId {
        NodeId(self.nodes.len() as u32)
    }

    fn layout_of(&self, id: NodeId) -> RuntimeResult<Layout> {
        self.nodes
            .iter()
            .find(|node| node.id == id)
            .map(|node| node.output().clone())
            .ok_or_else(|| invalid(format!("{id} is not part of this graph")))
    }

    /// Appends a node with an explicit output layout.
    pub fn push(&mut self, op: OpSpec, inputs: &[NodeId], output: Layout) -> NodeId {
        let id = self.next_id();
        self.nodes.push(Node {
            id,
            op,
            inputs: inputs.to_vec(),
            outputs: vec![output],
        });
        id
    }

    /// Appends a node whose output layout is inferred from its inputs.
    pub fn add(&mut self, op: OpSpec, inputs: &[NodeId]) -> RuntimeResult<NodeId> {
        let layouts = inputs
            .iter()
            .map(|input| self.layout_of(*input))
            .collect::<RuntimeResult<Vec<_>>>()?;
        let output = ops::infer_output_layout(&op, &layouts).map_err(invalid)?;
        Ok(self.push(op, inputs, output))
    }

    pub fn parameter(&mut self, layout: Layout) -> NodeId {
        self.push(OpSpec::Parameter, &[], layout)
    }

    pub fn constant(&mut self, tensor: HostTensor) -> NodeId {
        let layout = Layout::fixed(tensor.dtype(), &tensor.dims);
        self.push(OpSpec::Constant(tensor), &[], layout)
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: NodeId, rhs: NodeId) -> RuntimeResult<NodeId> {
        self.add(OpSpec::ElementwiseBinary(op), &[lhs, rhs])
    }

    pub fn unary(&mut self, op: UnaryOp, input: NodeId) -> RuntimeResult<NodeId> {
        self.add(OpSpec::ElementwiseUnary(op), &[input])
    }

    pub fn matmul(&mut self, lhs: NodeId, rhs: NodeId) -> RuntimeResult<NodeId> {
        self.add(
            OpSpec::MatMul(MatMulSpec {
                transpose_lhs: false,
                transpose_rhs: false,
            }),
            &[lhs, rhs],
        )
    }

    pub fn reduce(&mut self, kind: ReduceKind, input: NodeId) -> RuntimeResult<NodeId> {
        self.add(
            OpSpec::Reduce(ReduceSpec {
                kind,
                keep_dims: false,
            }),
            &[input],
        )
    }

    pub fn reshape(&mut self, input: NodeId, dims: Vec<ReshapeDim>) -> RuntimeResult<NodeId> {
        self.add(OpSpec::Reshape(dims), &[input])
    }

    pub fn reorder(&mut self, input: NodeId, target: Format) -> RuntimeResult<NodeId> {
        self.add(OpSpec::Reorder { target }, &[input])
    }

    pub fn finish(self, outputs: &[NodeId]) -> RuntimeResult<Graph> {
        Graph::new(self.nodes, outputs.to_vec())
    }
}
