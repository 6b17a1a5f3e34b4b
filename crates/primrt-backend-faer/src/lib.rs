//! Vendor-library backend: `MatMul` on f32 row-major operands through faer's GEMM.

use std::sync::Arc;

use faer::linalg::matmul::matmul;
use faer::mat::{MatMut, MatRef};
use faer::{Accum, Par};
use primrt::backend::{
    decode_payload, encode_payload, BackendError, BackendKind, BackendResult, ConcreteShapes,
    FinalizedForm, Implementation, StreamId,
};
use primrt::graph::{MatMulSpec, Node, OpSpec, OperationKind};
use primrt::layout::{DType, Format, Layout};
use primrt::ops::matmul_extents;
use primrt::tensor::{TensorView, TensorViewMut};
use primrt::{ImplementationDescriptor, ImplementationRegistry, RegistryBuilder, RuntimeResult};
use serde::{Deserialize, Serialize};

pub const FAER_MATMUL: &str = "faer.matmul";
pub const FAER_PRIORITY: i32 = 20;

fn faer_parallelism() -> Par {
    let par = faer::get_global_parallelism();
    if par.degree() == 1 {
        Par::Seq
    } else {
        par
    }
}

/// Problem extents fixed at finalize time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GemmPlan {
    pub spec: MatMulSpec,
    pub m: usize,
    pub k: usize,
    pub n: usize,
}

#[derive(Serialize, Deserialize)]
struct GemmPayload {
    plan: GemmPlan,
    shapes: ConcreteShapes,
}

#[derive(Debug, Clone)]
pub struct FaerMatMul {
    spec: Option<MatMulSpec>,
    plan: Option<(GemmPlan, ConcreteShapes)>,
}

fn create(node: &Node) -> Box<dyn Implementation> {
    let spec = match node.op {
        OpSpec::MatMul(spec) => Some(spec),
        _ => None,
    };
    Box::new(FaerMatMul { spec, plan: None })
}

fn operand<'a>(data: &'a [f32], rows: usize, cols: usize, transposed: bool) -> MatRef<'a, f32> {
    if transposed {
        MatRef::from_row_major_slice(data, cols, rows).transpose()
    } else {
        MatRef::from_row_major_slice(data, rows, cols)
    }
}

/// `out = op(lhs) * op(rhs)` with every buffer in logical row-major order.
fn gemm(plan: &GemmPlan, lhs: &[f32], rhs: &[f32], out: &mut [f32]) -> BackendResult<()> {
    let GemmPlan { spec, m, k, n } = *plan;
    if lhs.len() != m * k || rhs.len() != k * n || out.len() != m * n {
        return Err(BackendError::execution(format!(
            "gemm operand sizes {}/{}/{} do not match m={m} k={k} n={n}",
            lhs.len(),
            rhs.len(),
            out.len()
        )));
    }
    if m == 0 || n == 0 {
        return Ok(());
    }
    if k == 0 {
        out.fill(0.0);
        return Ok(());
    }
    let a = operand(lhs, m, k, spec.transpose_lhs);
    let b = operand(rhs, k, n, spec.transpose_rhs);
    // C^T = B^T * A^T written column-major (n x m) shares its buffer with row-major C.
    let mut out_view = MatMut::from_column_major_slice_mut(out, n, m);
    matmul(&mut out_view, Accum::Replace, b.transpose(), a.transpose(), 1.0f32, faer_parallelism());
    Ok(())
}

impl FaerMatMul {
    fn spec(&self) -> BackendResult<MatMulSpec> {
        self.spec
            .ok_or_else(|| BackendError::unimplemented("faer", "only MatMul is backed by faer"))
    }
}

impl Implementation for FaerMatMul {
    fn name(&self) -> &str {
        FAER_MATMUL
    }

    fn backend(&self) -> BackendKind {
        BackendKind::VendorLibrary
    }

    fn supports(&self, inputs: &[Layout], outputs: &[Layout]) -> bool {
        self.spec.is_some()
            && inputs.iter().chain(outputs).all(|layout| {
                layout.dtype == DType::F32
                    && layout.format == Format::RowMajor
                    && layout.shape.rank() == 2
            })
    }

    fn finalize(&mut self, shapes: &ConcreteShapes, op: &OpSpec) -> BackendResult<FinalizedForm> {
        let spec = self.spec()?;
        if *op != OpSpec::MatMul(spec) {
            return Err(BackendError::unimplemented("faer", format!("cannot run {:?}", op.kind())));
        }
        let [lhs, rhs] = shapes.inputs.as_slice() else {
            return Err(BackendError::execution("matmul expects two input shapes"));
        };
        let (m, k, n) = matmul_extents(&spec, lhs, rhs).map_err(BackendError::execution)?;
        if shapes.outputs.len() != 1 || shapes.outputs[0].as_slice() != [m, n] {
            return Err(BackendError::execution(format!(
                "declared outputs {:?} disagree with [{m}, {n}]",
                shapes.outputs
            )));
        }
        let plan = GemmPlan { spec, m, k, n };
        tracing::trace!(m, k, n, ?spec, "finalized faer gemm");
        self.plan = Some((plan, shapes.clone()));
        Ok(FinalizedForm::new(FAER_MATMUL, shapes, &plan))
    }

    fn execute(
        &self,
        inputs: &[TensorView<'_>],
        outputs: &mut [TensorViewMut<'_>],
        _stream: StreamId,
    ) -> BackendResult<()> {
        let (plan, _) = self
            .plan
            .as_ref()
            .ok_or_else(|| BackendError::execution("faer matmul executed before finalize"))?;
        let ([lhs, rhs], [out]) = (inputs, outputs) else {
            return Err(BackendError::execution("faer matmul expects two inputs and one output"));
        };
        gemm(plan, lhs.as_f32()?, rhs.as_f32()?, out.as_f32_mut()?)
    }

    fn serialize(&self) -> BackendResult<Vec<u8>> {
        let (plan, shapes) = self
            .plan
            .as_ref()
            .ok_or_else(|| BackendError::payload("instance is not finalized"))?;
        encode_payload(&GemmPayload {
            plan: *plan,
            shapes: shapes.clone(),
        })
    }

    fn deserialize(&mut self, payload: &[u8]) -> BackendResult<FinalizedForm> {
        let payload: GemmPayload = decode_payload(payload)?;
        if Some(payload.plan.spec) != self.spec {
            return Err(BackendError::payload(format!(
                "payload holds {:?}, node needs {:?}",
                payload.plan.spec, self.spec
            )));
        }
        let form = FinalizedForm::new(FAER_MATMUL, &payload.shapes, &payload.plan);
        self.plan = Some((payload.plan, payload.shapes));
        Ok(form)
    }

    fn clone_boxed(&self) -> Box<dyn Implementation> {
        Box::new(self.clone())
    }
}

pub fn descriptors() -> Vec<ImplementationDescriptor> {
    vec![ImplementationDescriptor::new(
        FAER_MATMUL,
        OperationKind::MatMul,
        BackendKind::VendorLibrary,
        create,
    )
    .priority(FAER_PRIORITY)
    .support(DType::F32, Format::RowMajor)]
}

/// Registers the reference implementations followed by faer's GEMM.
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

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(transpose_lhs: bool, transpose_rhs: bool, m: usize, k: usize, n: usize) -> GemmPlan {
        GemmPlan {
            spec: MatMulSpec {
                transpose_lhs,
                transpose_rhs,
            },
            m,
            k,
            n,
        }
    }

    #[test]
    fn gemm_matches_hand_computed_product() {
        let lhs = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let rhs = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let mut out = [0.0f32; 4];
        gemm(&plan(false, false, 2, 3, 2), &lhs, &rhs, &mut out).expect("gemm");
        assert_eq!(out, [58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn gemm_honours_transposed_operands() {
        // lhs stored as [3, 2], rhs stored as [2, 3]; same product as above.
        let lhs = [1.0, 4.0, 2.0, 5.0, 3.0, 6.0];
        let rhs = [7.0, 9.0, 11.0, 8.0, 10.0, 12.0];
        let mut out = [0.0f32; 4];
        gemm(&plan(true, true, 2, 3, 2), &lhs, &rhs, &mut out).expect("gemm");
        assert_eq!(out, [58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn empty_contraction_yields_zeros() {
        let mut out = [7.0f32; 6];
        gemm(&plan(false, false, 2, 0, 3), &[], &[], &mut out).expect("gemm");
        assert_eq!(out, [0.0; 6]);
    }

    #[test]
    fn size_mismatch_is_an_execution_error() {
        let mut out = [0.0f32; 4];
        let err = gemm(&plan(false, false, 2, 3, 2), &[1.0; 5], &[1.0; 6], &mut out).unwrap_err();
        assert!(matches!(err, BackendError::Execution { .. }));
    }
}
