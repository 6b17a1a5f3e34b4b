use serde::{Deserialize, Serialize};

use primrt::backend::{
    decode_payload, encode_payload, BackendError, BackendKind, BackendResult, ConcreteShapes,
    FinalizedForm, Implementation, StreamId,
};
use primrt::graph::{BinaryOp, MatMulSpec, Node, OpSpec, OperationKind, ReduceSpec, UnaryOp};
use primrt::layout::{DType, Layout};
use primrt::ops;
use primrt::tensor::{TensorView, TensorViewMut};

use crate::kernels;

/// What a reference instance runs, minus any constant payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefKernel {
    Parameter,
    Constant,
    Binary(BinaryOp),
    Unary(UnaryOp),
    MatMul(MatMulSpec),
    Reduce(ReduceSpec),
    Reshape,
    Reorder,
}

impl RefKernel {
    pub fn for_op(op: &OpSpec) -> Self {
        match op {
            OpSpec::Parameter => RefKernel::Parameter,
            OpSpec::Constant(_) => RefKernel::Constant,
            OpSpec::ElementwiseBinary(op) => RefKernel::Binary(*op),
            OpSpec::ElementwiseUnary(op) => RefKernel::Unary(*op),
            OpSpec::MatMul(spec) => RefKernel::MatMul(*spec),
            OpSpec::Reduce(spec) => RefKernel::Reduce(*spec),
            OpSpec::Reshape(_) => RefKernel::Reshape,
            OpSpec::Reorder { .. } => RefKernel::Reorder,
        }
    }

    pub fn kind(self) -> OperationKind {
        match self {
            RefKernel::Parameter => OperationKind::Parameter,
            RefKernel::Constant => OperationKind::Constant,
            RefKernel::Binary(_) => OperationKind::ElementwiseBinary,
            RefKernel::Unary(_) => OperationKind::ElementwiseUnary,
            RefKernel::MatMul(_) => OperationKind::MatMul,
            RefKernel::Reduce(_) => OperationKind::Reduce,
            RefKernel::Reshape => OperationKind::Reshape,
            RefKernel::Reorder => OperationKind::Reorder,
        }
    }

    fn accepts(self, dtype: DType) -> bool {
        match self {
            RefKernel::Unary(UnaryOp::Exp | UnaryOp::Tanh) => dtype.is_float(),
            RefKernel::Unary(UnaryOp::Neg | UnaryOp::Abs) | RefKernel::MatMul(_) => {
                dtype != DType::U8
            }
            _ => true,
        }
    }
}

/// Registered name of the reference descriptor for `kind`.
pub fn reference_name(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Parameter => "ref.parameter",
        OperationKind::Constant => "ref.constant",
        OperationKind::ElementwiseBinary => "ref.elementwise_binary",
        OperationKind::ElementwiseUnary => "ref.elementwise_unary",
        OperationKind::MatMul => "ref.matmul",
        OperationKind::Reduce => "ref.reduce",
        OperationKind::Reshape => "ref.reshape",
        OperationKind::Reorder => "ref.reorder",
    }
}

#[derive(Serialize, Deserialize)]
struct RefPayload {
    kernel: RefKernel,
    shapes: ConcreteShapes,
}

/// Plain sequential loops over logical row-major data.
#[derive(Debug, Clone)]
pub struct ReferenceImplementation {
    kernel: RefKernel,
    shapes: Option<ConcreteShapes>,
}

impl ReferenceImplementation {
    pub fn for_node(node: &Node) -> Self {
        Self {
            kernel: RefKernel::for_op(&node.op),
            shapes: None,
        }
    }

    pub fn kernel(&self) -> RefKernel {
        self.kernel
    }

    fn form(&self, shapes: &ConcreteShapes) -> FinalizedForm {
        FinalizedForm::new(reference_name(self.kernel.kind()), shapes, &self.kernel)
    }
}

pub(crate) fn create(node: &Node) -> Box<dyn Implementation> {
    Box::new(ReferenceImplementation::for_node(node))
}

impl Implementation for ReferenceImplementation {
    fn name(&self) -> &str {
        reference_name(self.kernel.kind())
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Reference
    }

    fn supports(&self, inputs: &[Layout], outputs: &[Layout]) -> bool {
        inputs
            .iter()
            .chain(outputs)
            .all(|layout| self.kernel.accepts(layout.dtype))
    }

    fn finalize(&mut self, shapes: &ConcreteShapes, op: &OpSpec) -> BackendResult<FinalizedForm> {
        if RefKernel::for_op(op) != self.kernel {
            return Err(BackendError::unimplemented(
                "finalize",
                format!("{:?} instance cannot run {:?}", self.kernel, op.kind()),
            ));
        }
        if self.kernel != RefKernel::Parameter {
            let inputs: Vec<&[usize]> = shapes.inputs.iter().map(|dims| dims.as_slice()).collect();
            let expected = ops::infer_output_shape(op, &inputs)
                .map_err(|reason| BackendError::unimplemented("finalize", reason))?;
            if shapes.outputs.len() != 1 || shapes.outputs[0] != expected {
                return Err(BackendError::execution(format!(
                    "declared outputs {:?} disagree with inferred {expected:?}",
                    shapes.outputs
                )));
            }
        }
        self.shapes = Some(shapes.clone());
        Ok(self.form(shapes))
    }

    fn execute(
        &self,
        inputs: &[TensorView<'_>],
        outputs: &mut [TensorViewMut<'_>],
        _stream: StreamId,
    ) -> BackendResult<()> {
        if self.shapes.is_none() {
            return Err(BackendError::execution(format!(
                "{} executed before finalize",
                self.name()
            )));
        }
        let [output] = outputs else {
            return Err(BackendError::execution("expected exactly one output"));
        };
        match (self.kernel, inputs) {
            (RefKernel::Binary(op), [lhs, rhs]) => {
                kernels::elementwise_binary(op, lhs, rhs, output)
            }
            (RefKernel::Unary(op), [input]) => kernels::elementwise_unary(op, input, output),
            (RefKernel::MatMul(spec), [lhs, rhs]) => kernels::matmul(&spec, lhs, rhs, output),
            (RefKernel::Reduce(spec), [input]) => kernels::reduce(spec.kind, input, output),
            (RefKernel::Reorder, [input]) => kernels::copy(input, output),
            (RefKernel::Parameter | RefKernel::Constant, []) | (RefKernel::Reshape, [_]) => Ok(()),
            (kernel, inputs) => Err(BackendError::execution(format!(
                "{kernel:?} got {} inputs",
                inputs.len()
            ))),
        }
    }

    fn serialize(&self) -> BackendResult<Vec<u8>> {
        let shapes = self
            .shapes
            .clone()
            .ok_or_else(|| BackendError::payload("instance is not finalized"))?;
        encode_payload(&RefPayload {
            kernel: self.kernel,
            shapes,
        })
    }

    fn deserialize(&mut self, payload: &[u8]) -> BackendResult<FinalizedForm> {
        let payload: RefPayload = decode_payload(payload)?;
        if payload.kernel != self.kernel {
            return Err(BackendError::payload(format!(
                "payload holds {:?}, node needs {:?}",
                payload.kernel, self.kernel
            )));
        }
        let form = self.form(&payload.shapes);
        self.shapes = Some(payload.shapes);
        Ok(form)
    }

    fn clone_boxed(&self) -> Box<dyn Implementation> {
        Box::new(self.clone())
    }
}
