//! Scalar kernels. Other backends call the per-element and per-row helpers so their
//! results stay bit-identical to these loops.

use primrt::backend::{BackendError, BackendResult};
use primrt::graph::{BinaryOp, MatMulSpec, ReduceKind, UnaryOp};
use primrt::ops::matmul_extents;
use primrt::tensor::{DataMut, DataRef, TensorView, TensorViewMut};

pub fn binary_f32(op: BinaryOp, lhs: f32, rhs: f32) -> f32 {
    match op {
        BinaryOp::Add => lhs + rhs,
        BinaryOp::Sub => lhs - rhs,
        BinaryOp::Mul => lhs * rhs,
        BinaryOp::Div => lhs / rhs,
        BinaryOp::Maximum => lhs.max(rhs),
        BinaryOp::Minimum => lhs.min(rhs),
    }
}

pub fn binary_i32(op: BinaryOp, lhs: i32, rhs: i32) -> BackendResult<i32> {
    Ok(match op {
        BinaryOp::Add => lhs.wrapping_add(rhs),
        BinaryOp::Sub => lhs.wrapping_sub(rhs),
        BinaryOp::Mul => lhs.wrapping_mul(rhs),
        BinaryOp::Div => lhs
            .checked_div(rhs)
            .ok_or_else(|| BackendError::execution(format!("integer division {lhs} / {rhs}")))?,
        BinaryOp::Maximum => lhs.max(rhs),
        BinaryOp::Minimum => lhs.min(rhs),
    })
}

pub fn binary_u8(op: BinaryOp, lhs: u8, rhs: u8) -> BackendResult<u8> {
    Ok(match op {
        BinaryOp::Add => lhs.wrapping_add(rhs),
        BinaryOp::Sub => lhs.wrapping_sub(rhs),
        BinaryOp::Mul => lhs.wrapping_mul(rhs),
        BinaryOp::Div => lhs
            .checked_div(rhs)
            .ok_or_else(|| BackendError::execution(format!("integer division {lhs} / 0")))?,
        BinaryOp::Maximum => lhs.max(rhs),
        BinaryOp::Minimum => lhs.min(rhs),
    })
}

pub fn unary_f32(op: UnaryOp, value: f32) -> f32 {
    match op {
        UnaryOp::Neg => -value,
        UnaryOp::Abs => value.abs(),
        UnaryOp::Relu => value.max(0.0),
        UnaryOp::Exp => value.exp(),
        UnaryOp::Tanh => value.tanh(),
    }
}

pub fn unary_i32(op: UnaryOp, value: i32) -> BackendResult<i32> {
    match op {
        UnaryOp::Neg => Ok(value.wrapping_neg()),
        UnaryOp::Abs => Ok(value.wrapping_abs()),
        UnaryOp::Relu => Ok(value.max(0)),
        UnaryOp::Exp | UnaryOp::Tanh => Err(BackendError::unimplemented(
            "elementwise_unary",
            format!("{op:?} on I32"),
        )),
    }
}

pub fn unary_u8(op: UnaryOp, value: u8) -> BackendResult<u8> {
    match op {
        UnaryOp::Relu => Ok(value),
        other => Err(BackendError::unimplemented(
            "elementwise_unary",
            format!("{other:?} on U8"),
        )),
    }
}

pub fn reduce_row_f32(kind: ReduceKind, row: &[f32]) -> f32 {
    match kind {
        ReduceKind::Sum => row.iter().fold(0.0, |acc, value| acc + value),
        ReduceKind::Max => row.iter().copied().fold(f32::NEG_INFINITY, f32::max),
    }
}

pub fn reduce_row_i32(kind: ReduceKind, row: &[i32]) -> i32 {
    match kind {
        ReduceKind::Sum => row.iter().fold(0i32, |acc, value| acc.wrapping_add(*value)),
        ReduceKind::Max => row.iter().copied().fold(i32::MIN, i32::max),
    }
}

pub fn reduce_row_u8(kind: ReduceKind, row: &[u8]) -> u8 {
    match kind {
        ReduceKind::Sum => row.iter().fold(0u8, |acc, value| acc.wrapping_add(*value)),
        ReduceKind::Max => row.iter().copied().fold(0, u8::max),
    }
}

pub(crate) fn check_len(what: &str, expected: usize, actual: usize) -> BackendResult<()> {
    if expected != actual {
        return Err(BackendError::execution(format!(
            "{what}: expected {expected} elements, got {actual}"
        )));
    }
    Ok(())
}

fn mismatch(op: &str) -> BackendError {
    BackendError::execution(format!("{op}: operand dtypes disagree"))
}

pub fn elementwise_binary(
    op: BinaryOp,
    lhs: &TensorView<'_>,
    rhs: &TensorView<'_>,
    out: &mut TensorViewMut<'_>,
) -> BackendResult<()> {
    match (lhs.data, rhs.data, &mut out.data) {
        (DataRef::F32(a), DataRef::F32(b), DataMut::F32(o)) => {
            check_len("elementwise_binary", o.len(), a.len())?;
            check_len("elementwise_binary", o.len(), b.len())?;
            for ((o, a), b) in o.iter_mut().zip(a).zip(b) {
                *o = binary_f32(op, *a, *b);
            }
            Ok(())
        }
        (DataRef::I32(a), DataRef::I32(b), DataMut::I32(o)) => {
            check_len("elementwise_binary", o.len(), a.len())?;
            check_len("elementwise_binary", o.len(), b.len())?;
            for ((o, a), b) in o.iter_mut().zip(a).zip(b) {
                *o = binary_i32(op, *a, *b)?;
            }
            Ok(())
        }
        (DataRef::U8(a), DataRef::U8(b), DataMut::U8(o)) => {
            check_len("elementwise_binary", o.len(), a.len())?;
            check_len("elementwise_binary", o.len(), b.len())?;
            for ((o, a), b) in o.iter_mut().zip(a).zip(b) {
                *o = binary_u8(op, *a, *b)?;
            }
            Ok(())
        }
        _ => Err(mismatch("elementwise_binary")),
    }
}

pub fn elementwise_unary(
    op: UnaryOp,
    input: &TensorView<'_>,
    out: &mut TensorViewMut<'_>,
) -> BackendResult<()> {
    match (input.data, &mut out.data) {
        (DataRef::F32(x), DataMut::F32(o)) => {
            check_len("elementwise_unary", o.len(), x.len())?;
            for (o, x) in o.iter_mut().zip(x) {
                *o = unary_f32(op, *x);
            }
            Ok(())
        }
        (DataRef::I32(x), DataMut::I32(o)) => {
            check_len("elementwise_unary", o.len(), x.len())?;
            for (o, x) in o.iter_mut().zip(x) {
                *o = unary_i32(op, *x)?;
            }
            Ok(())
        }
        (DataRef::U8(x), DataMut::U8(o)) => {
            check_len("elementwise_unary", o.len(), x.len())?;
            for (o, x) in o.iter_mut().zip(x) {
                *o = unary_u8(op, *x)?;
            }
            Ok(())
        }
        _ => Err(mismatch("elementwise_unary")),
    }
}

/// Reduces the innermost axis; `out` holds one value per row.
pub fn reduce(
    kind: ReduceKind,
    input: &TensorView<'_>,
    out: &mut TensorViewMut<'_>,
) -> BackendResult<()> {
    let inner = input.dims.last().copied().unwrap_or(1);
    match (input.data, &mut out.data) {
        (DataRef::F32(x), DataMut::F32(o)) => {
            check_len("reduce", o.len() * inner, x.len())?;
            for (row, o) in o.iter_mut().enumerate() {
                *o = reduce_row_f32(kind, &x[row * inner..(row + 1) * inner]);
            }
            Ok(())
        }
        (DataRef::I32(x), DataMut::I32(o)) => {
            check_len("reduce", o.len() * inner, x.len())?;
            for (row, o) in o.iter_mut().enumerate() {
                *o = reduce_row_i32(kind, &x[row * inner..(row + 1) * inner]);
            }
            Ok(())
        }
        (DataRef::U8(x), DataMut::U8(o)) => {
            check_len("reduce", o.len() * inner, x.len())?;
            for (row, o) in o.iter_mut().enumerate() {
                *o = reduce_row_u8(kind, &x[row * inner..(row + 1) * inner]);
            }
            Ok(())
        }
        _ => Err(mismatch("reduce")),
    }
}

/// Naive `m x k x n` product, accumulating over `k` in ascending order.
pub fn matmul(
    spec: &MatMulSpec,
    lhs: &TensorView<'_>,
    rhs: &TensorView<'_>,
    out: &mut TensorViewMut<'_>,
) -> BackendResult<()> {
    let (m, k, n) = matmul_extents(spec, lhs.dims, rhs.dims).map_err(BackendError::execution)?;
    let lhs_at = |i: usize, p: usize| if spec.transpose_lhs { p * m + i } else { i * k + p };
    let rhs_at = |p: usize, j: usize| if spec.transpose_rhs { j * k + p } else { p * n + j };
    match (lhs.data, rhs.data, &mut out.data) {
        (DataRef::F32(a), DataRef::F32(b), DataMut::F32(o)) => {
            check_len("matmul", m * k, a.len())?;
            check_len("matmul", k * n, b.len())?;
            check_len("matmul", m * n, o.len())?;
            for i in 0..m {
                for j in 0..n {
                    let mut acc = 0.0f32;
                    for p in 0..k {
                        acc += a[lhs_at(i, p)] * b[rhs_at(p, j)];
                    }
                    o[i * n + j] = acc;
                }
            }
            Ok(())
        }
        (DataRef::I32(a), DataRef::I32(b), DataMut::I32(o)) => {
            check_len("matmul", m * k, a.len())?;
            check_len("matmul", k * n, b.len())?;
            check_len("matmul", m * n, o.len())?;
            for i in 0..m {
                for j in 0..n {
                    let mut acc = 0i32;
                    for p in 0..k {
                        acc = acc.wrapping_add(a[lhs_at(i, p)].wrapping_mul(b[rhs_at(p, j)]));
                    }
                    o[i * n + j] = acc;
                }
            }
            Ok(())
        }
        _ => Err(mismatch("matmul")),
    }
}

/// Element-order-preserving copy. Tensors handed to kernels are always in logical order,
/// so a reorder only materializes the value under its new format tag.
pub fn copy(input: &TensorView<'_>, out: &mut TensorViewMut<'_>) -> BackendResult<()> {
    match (input.data, &mut out.data) {
        (DataRef::F32(x), DataMut::F32(o)) => copy_checked(x, o),
        (DataRef::I32(x), DataMut::I32(o)) => copy_checked(x, o),
        (DataRef::U8(x), DataMut::U8(o)) => copy_checked(x, o),
        _ => Err(mismatch("reorder")),
    }
}

fn copy_checked<T: Copy>(src: &[T], dst: &mut [T]) -> BackendResult<()> {
    check_len("reorder", dst.len(), src.len())?;
    dst.copy_from_slice(src);
    Ok(())
}
