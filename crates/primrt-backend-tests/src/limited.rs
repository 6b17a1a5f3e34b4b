//! A high-priority binary implementation that only accepts extents up to a bound. It forces
//! the re-selection path once a dynamic node grows past the bound.

use primrt::backend::{
    BackendError, BackendKind, BackendResult, ConcreteShapes, FinalizedForm, Implementation,
    StreamId,
};
use primrt::graph::{BinaryOp, Node, OpSpec, OperationKind};
use primrt::layout::{DType, Dim, Format, Layout};
use primrt::tensor::{TensorView, TensorViewMut};
use primrt::ImplementationDescriptor;

pub const LIMITED_NAME: &str = "test.limited_binary";
pub const LIMITED_MAX_EXTENT: usize = 4;

#[derive(Debug, Clone)]
pub struct LimitedBinary {
    op: Option<BinaryOp>,
    finalized: bool,
}

fn create(node: &Node) -> Box<dyn Implementation> {
    let op = match node.op {
        OpSpec::ElementwiseBinary(op) => Some(op),
        _ => None,
    };
    Box::new(LimitedBinary { op, finalized: false })
}

pub fn limited_descriptor() -> ImplementationDescriptor {
    ImplementationDescriptor::new(
        LIMITED_NAME,
        OperationKind::ElementwiseBinary,
        BackendKind::GenericKernel,
        create,
    )
    .priority(100)
    .support(DType::F32, Format::RowMajor)
}

fn within_bound(layout: &Layout) -> bool {
    layout.dtype == DType::F32
        && layout.shape.dims().iter().all(|dim| match dim {
            Dim::Fixed(extent) => *extent <= LIMITED_MAX_EXTENT,
            _ => true,
        })
}

impl Implementation for LimitedBinary {
    fn name(&self) -> &str {
        LIMITED_NAME
    }

    fn backend(&self) -> BackendKind {
        BackendKind::GenericKernel
    }

    fn supports(&self, inputs: &[Layout], outputs: &[Layout]) -> bool {
        self.op.is_some() && inputs.iter().chain(outputs).all(within_bound)
    }

    fn finalize(&mut self, shapes: &ConcreteShapes, _op: &OpSpec) -> BackendResult<FinalizedForm> {
        self.finalized = true;
        Ok(FinalizedForm::new(LIMITED_NAME, shapes, &self.op))
    }

    fn execute(
        &self,
        inputs: &[TensorView<'_>],
        outputs: &mut [TensorViewMut<'_>],
        _stream: StreamId,
    ) -> BackendResult<()> {
        let (Some(op), [lhs, rhs], [out]) = (self.op, inputs, outputs) else {
            return Err(BackendError::execution("limited binary expects two inputs"));
        };
        let (lhs, rhs) = (lhs.as_f32()?, rhs.as_f32()?);
        for ((o, a), b) in out.as_f32_mut()?.iter_mut().zip(lhs).zip(rhs) {
            *o = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Maximum => a.max(*b),
                BinaryOp::Minimum => a.min(*b),
            };
        }
        Ok(())
    }

    fn serialize(&self) -> BackendResult<Vec<u8>> {
        Err(BackendError::payload("limited binary is not persistable"))
    }

    fn deserialize(&mut self, _payload: &[u8]) -> BackendResult<FinalizedForm> {
        Err(BackendError::payload("limited binary is not persistable"))
    }

    fn clone_boxed(&self) -> Box<dyn Implementation> {
        Box::new(self.clone())
    }
}
