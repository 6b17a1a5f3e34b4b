use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};

use primrt::graph::{Graph, GraphBuilder, NodeId, ReduceKind, UnaryOp};
use primrt::layout::{DType, Dim, Layout};
use primrt::artifact::ArtifactStore;
use primrt::{Bindings, DeviceCaps, HostTensor, Program, RegistryBuilder, RuntimeConfig};

fn scratch_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("primrt-{tag}-{}", std::process::id()))
}

fn tanh_max() -> Result<(Graph, NodeId, NodeId)> {
    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::fixed(DType::F32, &[3, 5]));
    let squashed = builder.unary(UnaryOp::Tanh, x)?;
    let peak = builder.reduce(ReduceKind::Max, squashed)?;
    Ok((builder.finish(&[peak])?, x, peak))
}

#[test]
fn artifact_dir_survives_program_rebuilds() -> Result<()> {
    primrt_backend_tests::init_tracing();
    let dir = scratch_dir("artifact-dir");
    let _ = std::fs::remove_dir_all(&dir);
    let registry = primrt_backend_parallel::registry()?;
    let config = RuntimeConfig {
        artifact_dir: Some(dir.clone()),
        ..RuntimeConfig::default()
    };

    let (graph, x, peak) = tanh_max()?;
    let values: Vec<f32> = (0..15).map(|v| v as f32 * 0.1 - 0.7).collect();
    let bindings: Bindings = HashMap::from([(x, HostTensor::from_f32(&[3, 5], values)?)]);

    let mut first = Program::build(
        graph.clone(),
        registry.clone(),
        DeviceCaps::host(),
        config.clone(),
    )?;
    ensure!(first.artifact_hits() == 0);
    let expected = first.execute(&bindings)?;
    let written = std::fs::read_dir(&dir).context("artifact dir")?.count();
    ensure!(written == graph.len(), "{written} artifact files for {} nodes", graph.len());

    let mut second = Program::build(graph.clone(), registry, DeviceCaps::host(), config)?;
    ensure!(second.artifact_hits() == graph.len());
    ensure!(second.instance_stats(peak).context("stats")?.finalizations == 0);
    ensure!(second.execute(&bindings)? == expected);

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[test]
fn disabled_cache_never_touches_the_store() {
    let dir = scratch_dir("artifact-disabled");
    let _ = std::fs::remove_dir_all(&dir);
    let registry = primrt_backend_ref_cpu::registry().expect("registry");
    let config = RuntimeConfig {
        artifact_cache: false,
        artifact_dir: Some(dir.clone()),
        ..RuntimeConfig::default()
    };

    let (graph, _, _) = tanh_max().expect("graph");
    for _ in 0..2 {
        let program = Program::build(
            graph.clone(),
            registry.clone(),
            DeviceCaps::host(),
            config.clone(),
        )
        .expect("build");
        assert_eq!(program.artifact_hits(), 0);
    }
    assert!(!dir.exists());
}

#[test]
fn dynamic_nodes_are_not_persisted_at_build() {
    let registry = primrt_backend_ref_cpu::registry().expect("registry");
    let mut builder = GraphBuilder::new();
    let x = builder.parameter(Layout::dynamic(DType::F32, vec![Dim::range(1, 16)]));
    let y = builder.unary(UnaryOp::Abs, x).expect("abs");
    let graph = builder.finish(&[y]).expect("graph");
    let program = Program::build(graph, registry, DeviceCaps::host(), RuntimeConfig::default())
        .expect("build");

    let exported = program.export_artifacts().expect("export");
    assert!(exported.is_empty(), "exported {} artifacts", exported.len());
}

#[test]
fn bumped_implementation_version_invalidates_artifacts() -> Result<()> {
    primrt_backend_tests::init_tracing();
    let store = Arc::new(ArtifactStore::in_memory());
    let (graph, x, peak) = tanh_max()?;
    let bindings: Bindings = HashMap::from([(x, HostTensor::full_f32(&[3, 5], 0.25))]);

    let stale = primrt_backend_ref_cpu::registry()?;
    let mut first = Program::build_with(
        graph.clone(),
        stale,
        DeviceCaps::host(),
        RuntimeConfig::default(),
        Arc::clone(&store),
    )?;
    let expected = first.execute(&bindings)?;
    ensure!(store.len() == graph.len());

    let mut builder = RegistryBuilder::new();
    for descriptor in primrt_backend_ref_cpu::descriptors() {
        builder.register(descriptor.version(2))?;
    }
    let bumped = Arc::new(builder.build()?);
    let mut second = Program::build_with(
        graph.clone(),
        Arc::clone(&bumped),
        DeviceCaps::host(),
        RuntimeConfig::default(),
        Arc::clone(&store),
    )?;
    ensure!(second.artifact_hits() == 0);
    ensure!(second.instance_stats(peak).context("stats")?.finalizations == 1);
    ensure!(second.execute(&bindings)? == expected);

    // The rejected entries were overwritten at the new version.
    let third = Program::build_with(
        graph.clone(),
        bumped,
        DeviceCaps::host(),
        RuntimeConfig::default(),
        store,
    )?;
    ensure!(third.artifact_hits() == graph.len());
    Ok(())
}
