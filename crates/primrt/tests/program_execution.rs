use std::collections::HashMap;
use std::sync::Arc;

use primrt::engine::{CancellationToken, ExecuteOptions};
use primrt::graph::{BinaryOp, GraphBuilder, ReduceKind, ReshapeDim, UnaryOp};
use primrt::instance::InstanceState;
use primrt::layout::{DType, Dim, Format, Layout};
use primrt::{Bindings, DeviceCaps, HostTensor, Program, RuntimeConfig, RuntimeError};

fn reference_program(
    builder: GraphBuilder,
    outputs: &[primrt::NodeId],
    config: RuntimeConfig,
) -> Program {
    primrt_backend_tests::init_tracing();
    let graph = builder.finish(outputs).expect("graph");
    let registry = primrt_backend_ref_cpu::registry().expect("registry");
    Program::build(graph, registry, DeviceCaps::host(), config).expect("program")
}

#[test]
fn chain_with_reshape_produces_row_sums() {
    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::fixed(DType::F32, &[2, 6]));
    let negated = builder.unary(UnaryOp::Neg, x).expect("neg");
    let reshaped = builder
        .reshape(negated, vec![ReshapeDim::Explicit(4), ReshapeDim::Infer])
        .expect("reshape");
    let sums = builder.reduce(ReduceKind::Sum, reshaped).expect("reduce");
    let mut program = reference_program(builder, &[sums], RuntimeConfig::default());

    let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
    let input = HostTensor::from_f32(&[2, 6], values).expect("tensor");
    let bindings: Bindings = HashMap::from([(x, input)]);
    let outputs = program.execute(&bindings).expect("execute");

    assert_eq!(outputs[0].dims.as_slice(), [4]);
    assert_eq!(outputs[0].as_f32(), Some(&[-3.0f32, -12.0, -21.0, -30.0][..]));
    assert!(program.plan().conflicts().is_empty());
}

#[test]
fn reorder_keeps_logical_values_and_records_conversion() {
    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::fixed(DType::F32, &[4, 4]).with_format(Format::Blocked16));
    let doubled = builder.binary(BinaryOp::Add, x, x).expect("add");
    let reordered = builder.reorder(doubled, Format::RowMajor).expect("reorder");
    let mut program = reference_program(builder, &[reordered], RuntimeConfig::default());

    assert!(program.conversions().iter().any(|conversion| conversion.node == doubled));
    assert!(program
        .conversions()
        .iter()
        .all(|conversion| conversion.implementation.starts_with("ref.")));

    let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
    let bindings: Bindings =
        HashMap::from([(x, HostTensor::from_f32(&[4, 4], values.clone()).expect("tensor"))]);
    let outputs = program.execute(&bindings).expect("execute");
    let expected: Vec<f32> = values.iter().map(|v| v * 2.0).collect();
    assert_eq!(outputs[0].as_f32(), Some(expected.as_slice()));
}

#[test]
fn multi_stream_plan_never_shares_live_slots() {
    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::fixed(DType::F32, &[16]));
    let mut branches = Vec::new();
    for op in [UnaryOp::Neg, UnaryOp::Abs, UnaryOp::Tanh, UnaryOp::Exp] {
        let first = builder.unary(op, x).expect("unary");
        branches.push(builder.unary(UnaryOp::Neg, first).expect("unary"));
    }
    let left = builder.binary(BinaryOp::Add, branches[0], branches[1]).expect("add");
    let right = builder.binary(BinaryOp::Mul, branches[2], branches[3]).expect("mul");
    let joined = builder.binary(BinaryOp::Maximum, left, right).expect("max");
    let config = RuntimeConfig::default().with_streams(3);
    let mut program = reference_program(builder, &[joined], config);

    assert!(program.plan().conflicts().is_empty());
    assert!(program.plan().slots().len() <= program.graph().len());
    assert!(program.schedule().cross_stream_edges() > 0);

    let bindings: Bindings = HashMap::from([(x, HostTensor::full_f32(&[16], -0.5))]);
    let first = program.execute(&bindings).expect("first");
    let second = program.execute(&bindings).expect("second");
    assert_eq!(first, second);
}

#[test]
fn cancelled_token_aborts_before_any_instance_runs() {
    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::fixed(DType::F32, &[4]));
    let y = builder.unary(UnaryOp::Abs, x).expect("abs");
    let mut program = reference_program(builder, &[y], RuntimeConfig::default());
    let bindings: Bindings = HashMap::from([(x, HostTensor::full_f32(&[4], -2.0))]);

    let token = CancellationToken::new();
    token.cancel();
    let err = program
        .execute_with(&bindings, &ExecuteOptions::with_cancellation(token))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Aborted { completed: 0 }), "{err}");
    assert!(!program.is_poisoned());

    let outputs = program.execute(&bindings).expect("execute after abort");
    assert_eq!(outputs[0].as_f32(), Some(&[2.0f32; 4][..]));
}

#[test]
fn bindings_are_validated_before_execution() {
    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::fixed(DType::F32, &[4, 4]));
    let y = builder.parameter(Layout::dynamic(DType::F32, vec![Dim::range(1, 4), Dim::Fixed(4)]));
    let sum = builder.binary(BinaryOp::Add, x, y).expect("add");
    let mut program = reference_program(builder, &[sum], RuntimeConfig::default());

    let only_x: Bindings = HashMap::from([(x, HostTensor::full_f32(&[4, 4], 1.0))]);
    let err = program.execute(&only_x).unwrap_err();
    assert!(matches!(err, RuntimeError::MissingBinding { node } if node == y), "{err}");

    let oversized: Bindings = HashMap::from([
        (x, HostTensor::full_f32(&[4, 4], 1.0)),
        (y, HostTensor::full_f32(&[5, 4], 1.0)),
    ]);
    let err = program.execute(&oversized).unwrap_err();
    assert!(matches!(err, RuntimeError::ShapeOutOfRange { node, .. } if node == y), "{err}");
    assert!(!program.is_poisoned());
}

#[test]
fn dynamic_instance_waits_for_first_execution() {
    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::dynamic(DType::F32, vec![Dim::range(1, 64)]));
    let y = builder.unary(UnaryOp::Neg, x).expect("neg");
    let mut program = reference_program(builder, &[y], RuntimeConfig::default());
    assert_eq!(program.instance_state(y), Some(InstanceState::Bound));

    for extent in [3usize, 3, 40] {
        let bindings: Bindings = HashMap::from([(x, HostTensor::full_f32(&[extent], 1.5))]);
        let outputs = program.execute(&bindings).expect("execute");
        assert_eq!(outputs[0].len(), extent);
    }
    assert_eq!(program.instance_state(y), Some(InstanceState::Ready));
    let stats = program.instance_stats(y).expect("stats");
    assert_eq!(stats.executions, 3);
    assert_eq!(stats.respecializations, 1);
}

#[test]
fn shared_registry_serves_many_programs() {
    let registry = primrt_backend_ref_cpu::registry().expect("registry");
    for extent in 1..4usize {
        let mut builder = GraphBuilder::new();
        let x = builder.parameter(Layout::fixed(DType::I32, &[extent]));
        let y = builder.binary(BinaryOp::Mul, x, x).expect("mul");
        let graph = builder.finish(&[y]).expect("graph");
        let mut program = Program::build(
            graph,
            Arc::clone(&registry),
            DeviceCaps::host(),
            RuntimeConfig::default(),
        )
        .expect("program");
        let values: Vec<i32> = (0..extent as i32).collect();
        let input = HostTensor::from_i32(&[extent], values).expect("tensor");
        let bindings: Bindings = HashMap::from([(x, input)]);
        let outputs = program.execute(&bindings).expect("execute");
        let squares: Vec<i32> = (0..extent as i32).map(|v| v * v).collect();
        assert_eq!(outputs[0].data, primrt::tensor::TensorData::I32(squares));
    }
}

#[test]
fn revisited_shapes_come_from_the_implementation_cache() {
    for (capacity, expected_hits, expected_finalizations) in [(8usize, 1u64, 2u64), (0, 0, 3)] {
        let mut builder = GraphBuilder::new();
        let x = builder.parameter(Layout::dynamic(DType::F32, vec![Dim::range(1, 64)]));
        let y = builder.unary(UnaryOp::Abs, x).expect("abs");
        let config = RuntimeConfig::default().with_impl_cache_capacity(capacity);
        let mut program = reference_program(builder, &[y], config);

        for extent in [3usize, 40, 3] {
            let bindings: Bindings = HashMap::from([(x, HostTensor::full_f32(&[extent], -1.0))]);
            let outputs = program.execute(&bindings).expect("execute");
            assert_eq!(outputs[0].as_f32().map(<[f32]>::len), Some(extent));
        }
        let stats = program.instance_stats(y).expect("stats");
        assert_eq!(stats.respecializations, 2, "capacity {capacity}");
        assert_eq!(stats.impl_cache_hits, expected_hits, "capacity {capacity}");
        assert_eq!(stats.finalizations, expected_finalizations, "capacity {capacity}");
    }
}
