//! Generic-kernel backend: elementwise and reduce operations split across the rayon pool.
//!
//! Every task applies the reference per-element and per-row helpers, so results are
//! bit-identical to the reference backend regardless of how work is chunked.

pub mod compiler;

use std::sync::Arc;

use primrt::backend::{
    decode_payload, encode_payload, BackendError, BackendKind, BackendResult, ConcreteShapes,
    FinalizedForm, Implementation, StreamId,
};
use primrt::graph::{BinaryOp, Node, OpSpec, OperationKind, ReduceSpec, UnaryOp};
use primrt::layout::{element_count, DType, Format, Layout};
use primrt::ops;
use primrt::tensor::{TensorView, TensorViewMut};
use primrt::{ImplementationDescriptor, ImplementationRegistry, RegistryBuilder, RuntimeResult};
use primrt_backend_ref_cpu::kernels::{binary_f32, reduce_row_f32, unary_f32};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::compiler::KernelPlan;

pub const PARALLEL_PRIORITY: i32 = 10;
pub const PARALLEL_FORMATS: [Format; 2] = [Format::RowMajor, Format::Nhwc];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParallelKernel {
    Binary(BinaryOp),
    Unary(UnaryOp),
    Reduce(ReduceSpec),
}

impl ParallelKernel {
    fn for_op(op: &OpSpec) -> Option<Self> {
        match op {
            OpSpec::ElementwiseBinary(op) => Some(ParallelKernel::Binary(*op)),
            OpSpec::ElementwiseUnary(op) => Some(ParallelKernel::Unary(*op)),
            OpSpec::Reduce(spec) => Some(ParallelKernel::Reduce(*spec)),
            _ => None,
        }
    }
}

const PARALLEL_KINDS: [OperationKind; 3] = [
    OperationKind::ElementwiseBinary,
    OperationKind::ElementwiseUnary,
    OperationKind::Reduce,
];

fn kernel_name(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::ElementwiseBinary => "parallel.elementwise_binary",
        OperationKind::ElementwiseUnary => "parallel.elementwise_unary",
        OperationKind::Reduce => "parallel.reduce",
        _ => "parallel.unsupported",
    }
}

#[derive(Serialize, Deserialize)]
struct ParallelPayload {
    plan: KernelPlan,
    shapes: ConcreteShapes,
}

#[derive(Debug, Clone)]
pub struct ParallelImplementation {
    name: &'static str,
    kernel: Option<ParallelKernel>,
    compiled: Option<(Arc<KernelPlan>, ConcreteShapes)>,
}

fn create(node: &Node) -> Box<dyn Implementation> {
    let kernel = ParallelKernel::for_op(&node.op);
    Box::new(ParallelImplementation {
        name: kernel_name(node.kind()),
        kernel,
        compiled: None,
    })
}

impl ParallelImplementation {
    fn kernel(&self) -> BackendResult<ParallelKernel> {
        self.kernel.ok_or_else(|| {
            BackendError::unimplemented("parallel", "operation has no parallel kernel")
        })
    }

    fn form(&self, plan: &KernelPlan, shapes: &ConcreteShapes) -> FinalizedForm {
        FinalizedForm::new(self.name, shapes, plan)
    }
}

impl Implementation for ParallelImplementation {
    fn name(&self) -> &str {
        self.name
    }

    fn backend(&self) -> BackendKind {
        BackendKind::GenericKernel
    }

    fn supports(&self, inputs: &[Layout], outputs: &[Layout]) -> bool {
        self.kernel.is_some()
            && inputs
                .iter()
                .chain(outputs)
                .all(|layout| layout.dtype == DType::F32 && layout.shape.rank() > 0)
    }

    fn finalize(&mut self, shapes: &ConcreteShapes, op: &OpSpec) -> BackendResult<FinalizedForm> {
        let kernel = self.kernel()?;
        if ParallelKernel::for_op(op) != Some(kernel) {
            return Err(BackendError::unimplemented(
                "parallel",
                format!("{kernel:?} instance cannot run {:?}", op.kind()),
            ));
        }
        let inputs: Vec<&[usize]> = shapes.inputs.iter().map(|dims| dims.as_slice()).collect();
        let expected = ops::infer_output_shape(op, &inputs)
            .map_err(|reason| BackendError::unimplemented("parallel", reason))?;
        if shapes.outputs.len() != 1 || shapes.outputs[0] != expected {
            return Err(BackendError::execution(format!(
                "declared outputs {:?} disagree with inferred {expected:?}",
                shapes.outputs
            )));
        }
        let elements = element_count(&expected)
            .ok_or_else(|| BackendError::execution(format!("extents {expected:?} overflow")))?;
        let inner = inputs
            .first()
            .and_then(|dims| dims.last().copied())
            .unwrap_or(1);
        let plan = compiler::compile(kernel, elements, inner)?;
        let form = self.form(&plan, shapes);
        self.compiled = Some((plan, shapes.clone()));
        Ok(form)
    }

    fn execute(
        &self,
        inputs: &[TensorView<'_>],
        outputs: &mut [TensorViewMut<'_>],
        _stream: StreamId,
    ) -> BackendResult<()> {
        let (plan, _) = self
            .compiled
            .as_ref()
            .ok_or_else(|| {
                BackendError::execution(format!("{} executed before finalize", self.name))
            })?;
        let [output] = outputs else {
            return Err(BackendError::execution("expected exactly one output"));
        };
        let out = output.as_f32_mut()?;
        if out.len() != plan.elements {
            return Err(BackendError::execution(format!(
                "output holds {} elements, plan expects {}",
                out.len(),
                plan.elements
            )));
        }
        let chunk = plan.chunk;
        match (plan.kernel, inputs) {
            (ParallelKernel::Binary(op), [lhs, rhs]) => {
                let (lhs, rhs) = (lhs.as_f32()?, rhs.as_f32()?);
                if lhs.len() != out.len() || rhs.len() != out.len() {
                    return Err(BackendError::execution("binary operand lengths disagree"));
                }
                out.par_chunks_mut(chunk)
                    .zip(lhs.par_chunks(chunk))
                    .zip(rhs.par_chunks(chunk))
                    .for_each(|((out, lhs), rhs)| {
                        for ((o, a), b) in out.iter_mut().zip(lhs).zip(rhs) {
                            *o = binary_f32(op, *a, *b);
                        }
                    });
                Ok(())
            }
            (ParallelKernel::Unary(op), [input]) => {
                let input = input.as_f32()?;
                if input.len() != out.len() {
                    return Err(BackendError::execution("unary operand length disagrees"));
                }
                out.par_chunks_mut(chunk)
                    .zip(input.par_chunks(chunk))
                    .for_each(|(out, input)| {
                        for (o, x) in out.iter_mut().zip(input) {
                            *o = unary_f32(op, *x);
                        }
                    });
                Ok(())
            }
            (ParallelKernel::Reduce(spec), [input]) => {
                let input = input.as_f32()?;
                let inner = plan.inner;
                if input.len() != out.len() * inner {
                    return Err(BackendError::execution("reduce operand length disagrees"));
                }
                if inner == 0 {
                    out.fill(reduce_row_f32(spec.kind, &[]));
                    return Ok(());
                }
                out.par_chunks_mut(chunk)
                    .zip(input.par_chunks(chunk * inner))
                    .for_each(|(out, rows)| {
                        for (o, row) in out.iter_mut().zip(rows.chunks(inner)) {
                            *o = reduce_row_f32(spec.kind, row);
                        }
                    });
                Ok(())
            }
            (kernel, inputs) => Err(BackendError::execution(format!(
                "{kernel:?} got {} inputs",
                inputs.len()
            ))),
        }
    }

    fn serialize(&self) -> BackendResult<Vec<u8>> {
        let (plan, shapes) = self
            .compiled
            .as_ref()
            .ok_or_else(|| BackendError::payload("instance is not finalized"))?;
        encode_payload(&ParallelPayload {
            plan: **plan,
            shapes: shapes.clone(),
        })
    }

    fn deserialize(&mut self, payload: &[u8]) -> BackendResult<FinalizedForm> {
        let payload: ParallelPayload = decode_payload(payload)?;
        if Some(payload.plan.kernel) != self.kernel {
            return Err(BackendError::payload(format!(
                "payload holds {:?}, node needs {:?}",
                payload.plan.kernel, self.kernel
            )));
        }
        let plan = compiler::adopt(payload.plan)?;
        let form = self.form(&plan, &payload.shapes);
        self.compiled = Some((plan, payload.shapes));
        Ok(form)
    }

    fn clone_boxed(&self) -> Box<dyn Implementation> {
        Box::new(self.clone())
    }
}

/// The parallel descriptors alone.
pub fn descriptors() -> Vec<ImplementationDescriptor> {
    PARALLEL_KINDS
        .iter()
        .map(|kind| {
            ImplementationDescriptor::new(
                kernel_name(*kind),
                *kind,
                BackendKind::GenericKernel,
                create,
            )
            .priority(PARALLEL_PRIORITY)
            .support_all(&[DType::F32], &PARALLEL_FORMATS)
        })
        .collect()
}

/// Registers the reference implementations followed by the parallel kernels.
pub fn register(builder: &mut RegistryBuilder) -> RuntimeResult<()> {
    primrt_backend_ref_cpu::register(builder)?;
    for descriptor in descriptors() {
        builder.register(descriptor)?;
    }
    Ok(())
}

pub fn registry() -> RuntimeResult<Arc<ImplementationRegistry>> {
    let mut builder = RegistryBuilder::new();
    register(&mut builder)?;
    Ok(Arc::new(builder.build()?))
}
