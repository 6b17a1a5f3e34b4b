//! Shape inference for the operation catalogue.
//!
//! Two flavours: `infer_output_layout` works on declared (possibly ranged) layouts while the
//! graph is assembled, `infer_output_shape` on the concrete extents of one invocation.

use crate::graph::{MatMulSpec, OpSpec, ReduceSpec, ReshapeDim, UnaryOp};
use crate::layout::{element_count, DType, Dim, Dims, Format, Layout, Shape};

pub fn infer_output_layout(op: &OpSpec, inputs: &[Layout]) -> Result<Layout, String> {
    expect_arity(op, inputs.len())?;
    match op {
        OpSpec::Parameter => Err("parameters declare their own layout".to_string()),
        OpSpec::Constant(tensor) => Ok(Layout::fixed(tensor.dtype(), &tensor.dims)),
        OpSpec::ElementwiseBinary(_) => {
            let (lhs, rhs) = (&inputs[0], &inputs[1]);
            if lhs.dtype != rhs.dtype {
                return Err(format!("operand dtypes differ: {lhs} vs {rhs}"));
            }
            if lhs.shape.rank() != rhs.shape.rank() {
                return Err(format!("operand ranks differ: {lhs} vs {rhs}"));
            }
            let dims = lhs
                .shape
                .dims()
                .iter()
                .zip(rhs.shape.dims())
                .map(|(a, b)| merge_dim(*a, *b))
                .collect::<Result<Vec<_>, _>>()?;
            let format = if lhs.format == Format::Any {
                rhs.format
            } else {
                lhs.format
            };
            Ok(Layout::new(Shape::new(dims), lhs.dtype, format))
        }
        OpSpec::ElementwiseUnary(unary) => {
            let input = &inputs[0];
            check_unary_dtype(*unary, input.dtype)?;
            Ok(input.clone())
        }
        OpSpec::MatMul(spec) => {
            let (lhs, rhs) = (&inputs[0], &inputs[1]);
            if lhs.dtype != rhs.dtype {
                return Err(format!("operand dtypes differ: {lhs} vs {rhs}"));
            }
            if lhs.dtype == DType::U8 {
                return Err("matmul does not accept u8 operands".to_string());
            }
            if lhs.shape.rank() != 2 || rhs.shape.rank() != 2 {
                return Err(format!("matmul expects rank-2 operands, got {lhs} and {rhs}"));
            }
            let [m, k_lhs] = oriented(lhs.shape.dims(), spec.transpose_lhs);
            let [k_rhs, n] = oriented(rhs.shape.dims(), spec.transpose_rhs);
            merge_dim(k_lhs, k_rhs).map_err(|err| format!("contraction extents: {err}"))?;
            Ok(Layout::new(Shape::new(vec![m, n]), lhs.dtype, lhs.format))
        }
        OpSpec::Reduce(spec) => {
            let input = &inputs[0];
            if input.shape.rank() == 0 {
                return Err("reduce needs at least one axis".to_string());
            }
            let mut dims = input.shape.dims().to_vec();
            reduce_last(&mut dims, spec, Dim::Fixed(1));
            Ok(Layout::new(Shape::new(dims), input.dtype, input.format))
        }
        OpSpec::Reshape(target) => {
            let input = &inputs[0];
            let explicit = explicit_product(target)?;
            let infer_slot = target.iter().position(|dim| *dim == ReshapeDim::Infer);
            let total = input
                .shape
                .static_dims()
                .and_then(|dims| element_count(&dims));
            let dims = target
                .iter()
                .map(|dim| match (dim, total) {
                    (ReshapeDim::Explicit(value), _) => Ok(Dim::Fixed(*value)),
                    (ReshapeDim::Infer, Some(total)) => {
                        infer_extent(total, explicit).map(Dim::Fixed)
                    }
                    (ReshapeDim::Infer, None) => Ok(Dim::Unbounded),
                })
                .collect::<Result<Vec<_>, _>>()?;
            if let (None, Some(total)) = (infer_slot, total) {
                if total != explicit {
                    return Err(format!(
                        "cannot reshape {} elements into {explicit}",
                        total
                    ));
                }
            }
            Ok(Layout::new(Shape::new(dims), input.dtype, input.format))
        }
        OpSpec::Reorder { target } => {
            if *target == Format::Any {
                return Err("reorder needs a concrete target format".to_string());
            }
            Ok(inputs[0].clone().with_format(*target))
        }
    }
}

/// Output extents of `op` for one concrete set of input extents.
pub fn infer_output_shape(op: &OpSpec, inputs: &[&[usize]]) -> Result<Dims, String> {
    expect_arity(op, inputs.len())?;
    match op {
        OpSpec::Parameter => Err("parameter extents come from bindings".to_string()),
        OpSpec::Constant(tensor) => Ok(tensor.dims.clone()),
        OpSpec::ElementwiseBinary(_) => {
            if inputs[0] != inputs[1] {
                return Err(format!(
                    "operand extents differ: {:?} vs {:?}",
                    inputs[0], inputs[1]
                ));
            }
            Ok(Dims::from_slice(inputs[0]))
        }
        OpSpec::ElementwiseUnary(_) | OpSpec::Reorder { .. } => Ok(Dims::from_slice(inputs[0])),
        OpSpec::MatMul(spec) => {
            let (m, _, n) = matmul_extents(spec, inputs[0], inputs[1])?;
            Ok(Dims::from_slice(&[m, n]))
        }
        OpSpec::Reduce(spec) => {
            if inputs[0].is_empty() {
                return Err("reduce needs at least one axis".to_string());
            }
            let mut dims = inputs[0].to_vec();
            reduce_last(&mut dims, spec, 1);
            Ok(Dims::from_vec(dims))
        }
        OpSpec::Reshape(target) => {
            let total = element_count(inputs[0])
                .ok_or_else(|| format!("extents {:?} overflow", inputs[0]))?;
            let explicit = explicit_product(target)?;
            let mut out = Dims::with_capacity(target.len());
            let mut inferred = false;
            for dim in target {
                match dim {
                    ReshapeDim::Explicit(value) => out.push(*value),
                    ReshapeDim::Infer => {
                        inferred = true;
                        out.push(infer_extent(total, explicit)?);
                    }
                }
            }
            if !inferred && total != explicit {
                return Err(format!("cannot reshape {total} elements into {out:?}"));
            }
            Ok(out)
        }
    }
}

/// `(m, k, n)` of a concrete matmul, honouring the transpose flags.
pub fn matmul_extents(
    spec: &MatMulSpec,
    lhs: &[usize],
    rhs: &[usize],
) -> Result<(usize, usize, usize), String> {
    if lhs.len() != 2 || rhs.len() != 2 {
        return Err(format!("matmul expects rank-2 operands, got {lhs:?} and {rhs:?}"));
    }
    let (m, k) = if spec.transpose_lhs {
        (lhs[1], lhs[0])
    } else {
        (lhs[0], lhs[1])
    };
    let (k_rhs, n) = if spec.transpose_rhs {
        (rhs[1], rhs[0])
    } else {
        (rhs[0], rhs[1])
    };
    if k != k_rhs {
        return Err(format!("contraction extents differ: {k} vs {k_rhs}"));
    }
    Ok((m, k, n))
}

fn expect_arity(op: &OpSpec, actual: usize) -> Result<(), String> {
    if op.arity() != actual {
        return Err(format!(
            "{} takes {} inputs, got {actual}",
            op.kind().as_str(),
            op.arity()
        ));
    }
    Ok(())
}

fn check_unary_dtype(op: UnaryOp, dtype: DType) -> Result<(), String> {
    match op {
        UnaryOp::Exp | UnaryOp::Tanh if !dtype.is_float() => {
            Err(format!("{op:?} needs a floating-point operand, got {dtype:?}"))
        }
        UnaryOp::Neg | UnaryOp::Abs if dtype == DType::U8 => {
            Err(format!("{op:?} is undefined for unsigned operands"))
        }
        _ => Ok(()),
    }
}

fn oriented(dims: &[Dim], transpose: bool) -> [Dim; 2] {
    if transpose {
        [dims[1], dims[0]]
    } else {
        [dims[0], dims[1]]
    }
}

fn reduce_last<T>(dims: &mut Vec<T>, spec: &ReduceSpec, unit: T) {
    dims.pop();
    if spec.keep_dims {
        dims.push(unit);
    }
}

fn explicit_product(target: &[ReshapeDim]) -> Result<usize, String> {
    let mut infer_count = 0usize;
    let mut product = 1usize;
    for dim in target {
        match dim {
            ReshapeDim::Explicit(value) => {
                product = product
                    .checked_mul(*value)
                    .ok_or_else(|| "reshape extents overflow".to_string())?;
            }
            ReshapeDim::Infer => infer_count += 1,
        }
    }
    if infer_count > 1 {
        return Err("reshape may infer at most one extent".to_string());
    }
    Ok(product)
}

fn infer_extent(total: usize, explicit: usize) -> Result<usize, String> {
    if explicit == 0 || total % explicit != 0 {
        return Err(format!("cannot infer extent: {total} elements over {explicit}"));
    }
    Ok(total / explicit)
}

/// Tightest dimension compatible with both operands.
fn merge_dim(a: Dim, b: Dim) -> Result<Dim, String> {
    match (a, b) {
        (Dim::Unbounded, other) | (other, Dim::Unbounded) => Ok(other),
        (Dim::Fixed(x), Dim::Fixed(y)) => {
            if x == y {
                Ok(Dim::Fixed(x))
            } else {
                Err(format!("extents {x} and {y} differ"))
            }
        }
        (Dim::Fixed(x), range @ Dim::Range { .. }) | (range @ Dim::Range { .. }, Dim::Fixed(x)) => {
            if range.contains(x) {
                Ok(Dim::Fixed(x))
            } else {
                Err(format!("extent {x} is outside {range}"))
            }
        }
        (Dim::Range { min: a_min, max: a_max }, Dim::Range { min: b_min, max: b_max }) => {
            let min = a_min.max(b_min);
            let max = a_max.min(b_max);
            if min > max {
                Err(format!("ranges {a} and {b} do not overlap"))
            } else {
                Ok(Dim::Range { min, max })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BinaryOp, ReduceKind};

    #[test]
    fn binary_layout_intersects_ranges() {
        let lhs = Layout::dynamic(DType::F32, vec![Dim::range(1, 8), Dim::Fixed(4)]);
        let rhs = Layout::dynamic(DType::F32, vec![Dim::range(4, 16), Dim::range(2, 6)]);
        let out = infer_output_layout(&OpSpec::ElementwiseBinary(BinaryOp::Add), &[lhs, rhs])
            .expect("layout");
        assert_eq!(out.shape.dims(), &[Dim::range(4, 8), Dim::Fixed(4)]);
    }

    #[test]
    fn matmul_shape_honours_transpose() {
        let spec = MatMulSpec {
            transpose_lhs: true,
            transpose_rhs: false,
        };
        let out = infer_output_shape(&OpSpec::MatMul(spec), &[&[3, 2], &[3, 5]]).expect("shape");
        assert_eq!(out.as_slice(), &[2, 5]);
        assert!(infer_output_shape(&OpSpec::MatMul(spec), &[&[2, 3], &[3, 5]]).is_err());
    }

    #[test]
    fn reshape_infers_single_extent() {
        let op = OpSpec::Reshape(vec![ReshapeDim::Infer, ReshapeDim::Explicit(4)]);
        let out = infer_output_shape(&op, &[&[2, 2, 4]]).expect("shape");
        assert_eq!(out.as_slice(), &[4, 4]);
        let bad = OpSpec::Reshape(vec![ReshapeDim::Explicit(3), ReshapeDim::Explicit(3)]);
        assert!(infer_output_shape(&bad, &[&[2, 4]]).is_err());
    }

    #[test]
    fn reduce_drops_innermost_axis() {
        let op = OpSpec::Reduce(ReduceSpec {
            kind: ReduceKind::Sum,
            keep_dims: false,
        });
        let out = infer_output_shape(&op, &[&[3, 7]]).expect("shape");
        assert_eq!(out.as_slice(), &[3]);
    }

    #[test]
    fn exp_rejects_integer_operands() {
        let input = Layout::fixed(DType::I32, &[4]);
        assert!(infer_output_layout(&OpSpec::ElementwiseUnary(UnaryOp::Exp), &[input]).is_err());
    }
}
