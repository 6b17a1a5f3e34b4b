//! A binary implementation that accepts every F32 layout and then refuses to finalize. It
//! drives the finalize fallback path.

use primrt::backend::{
    BackendError, BackendKind, BackendResult, ConcreteShapes, FinalizedForm, Implementation,
    ImplementationFactory, StreamId,
};
use primrt::graph::{Node, OpSpec, OperationKind};
use primrt::layout::{DType, Format, Layout};
use primrt::tensor::{TensorView, TensorViewMut};
use primrt::ImplementationDescriptor;

pub const FAILING_NAME: &str = "test.failing_binary";

#[derive(Debug, Clone, Copy)]
pub struct FailingBinary {
    backend: BackendKind,
}

fn create_generic(_node: &Node) -> Box<dyn Implementation> {
    Box::new(FailingBinary {
        backend: BackendKind::GenericKernel,
    })
}

fn create_reference(_node: &Node) -> Box<dyn Implementation> {
    Box::new(FailingBinary {
        backend: BackendKind::Reference,
    })
}

/// Outranks every other binary implementation so it is always tried first. Any backend
/// other than `Reference` registers as a `GenericKernel`.
pub fn failing_descriptor(backend: BackendKind) -> ImplementationDescriptor {
    let (backend, factory): (BackendKind, ImplementationFactory) = match backend {
        BackendKind::Reference => (BackendKind::Reference, create_reference),
        _ => (BackendKind::GenericKernel, create_generic),
    };
    ImplementationDescriptor::new(FAILING_NAME, OperationKind::ElementwiseBinary, backend, factory)
        .priority(200)
        .support(DType::F32, Format::RowMajor)
        .support(DType::F32, Format::Any)
}

impl Implementation for FailingBinary {
    fn name(&self) -> &str {
        FAILING_NAME
    }

    fn backend(&self) -> BackendKind {
        self.backend
    }

    fn supports(&self, inputs: &[Layout], outputs: &[Layout]) -> bool {
        inputs
            .iter()
            .chain(outputs)
            .all(|layout| layout.dtype == DType::F32)
    }

    fn finalize(&mut self, _shapes: &ConcreteShapes, _op: &OpSpec) -> BackendResult<FinalizedForm> {
        Err(BackendError::unimplemented(
            "elementwise_binary",
            "kernel generation failed",
        ))
    }

    fn execute(
        &self,
        _inputs: &[TensorView<'_>],
        _outputs: &mut [TensorViewMut<'_>],
        _stream: StreamId,
    ) -> BackendResult<()> {
        Err(BackendError::execution("failing binary was never finalized"))
    }

    fn serialize(&self) -> BackendResult<Vec<u8>> {
        Err(BackendError::payload("failing binary is not persistable"))
    }

    fn deserialize(&mut self, _payload: &[u8]) -> BackendResult<FinalizedForm> {
        Err(BackendError::payload("failing binary is not persistable"))
    }

    fn clone_boxed(&self) -> Box<dyn Implementation> {
        Box::new(*self)
    }
}
