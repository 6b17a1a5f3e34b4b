use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::artifact::{self, ArtifactBlob, ArtifactStore};
use crate::backend::{ConcreteShapes, DeviceCaps, FinalizedForm};
use crate::config::RuntimeConfig;
use crate::engine::{self, ExecuteOptions, ExecutionContext, StreamSchedule};
use crate::error::{RuntimeError, RuntimeResult};
use crate::graph::{Graph, Node, NodeId, OpSpec};
use crate::instance::{
    ImplCache, InstanceState, InstanceStats, PrimitiveInstance, SpecializeContext,
};
use crate::layout::{format_layouts, Dims, Layout};
use crate::memory::{plan_memory, MemoryPlan, MemoryPool, PlanOptions};
use crate::profiling;
use crate::registry::ImplementationRegistry;
use crate::tensor::HostTensor;

/// Parameter values for one execution, keyed by parameter node.
pub type Bindings = HashMap<NodeId, HostTensor>;

/// An instance bound to an implementation that only accepts its inputs after a format
/// conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatConversion {
    pub node: NodeId,
    pub implementation: String,
    pub inputs: String,
}

#[derive(Debug, Clone)]
struct Poison {
    node: NodeId,
    reason: String,
}

/// A graph compiled against a registry and device: bound instances, a memory plan with
/// its pool, and a stream schedule.
///
/// Each instance sits behind its own lock. Executions take `&mut self`, so one program
/// never runs two invocations at once.
pub struct Program {
    graph: Arc<Graph>,
    registry: Arc<ImplementationRegistry>,
    device: DeviceCaps,
    config: RuntimeConfig,
    artifacts: Option<Arc<ArtifactStore>>,
    instances: Vec<Mutex<PrimitiveInstance>>,
    plan: MemoryPlan,
    pool: MemoryPool,
    schedule: StreamSchedule,
    impl_cache: Option<ImplCache>,
    conversions: Vec<FormatConversion>,
    artifact_hits: usize,
    poisoned: Option<Poison>,
}

impl Program {
    /// Builds with the artifact store described by `config`, if any.
    pub fn build(
        graph: Graph,
        registry: Arc<ImplementationRegistry>,
        device: DeviceCaps,
        config: RuntimeConfig,
    ) -> RuntimeResult<Self> {
        let artifacts = match (&config.artifact_dir, config.artifact_cache) {
            (Some(dir), true) => match ArtifactStore::with_dir(dir) {
                Ok(store) => Some(Arc::new(store)),
                Err(err) => {
                    tracing::warn!(
                        dir = %dir.display(),
                        error = %err,
                        "artifact directory unavailable"
                    );
                    None
                }
            },
            _ => None,
        };
        Self::assemble(Arc::new(graph), registry, device, config, artifacts)
    }

    /// Builds against a caller-owned artifact store, shared across programs.
    pub fn build_with(
        graph: Graph,
        registry: Arc<ImplementationRegistry>,
        device: DeviceCaps,
        config: RuntimeConfig,
        artifacts: Arc<ArtifactStore>,
    ) -> RuntimeResult<Self> {
        Self::assemble(Arc::new(graph), registry, device, config, Some(artifacts))
    }

    fn assemble(
        graph: Arc<Graph>,
        registry: Arc<ImplementationRegistry>,
        device: DeviceCaps,
        config: RuntimeConfig,
        artifacts: Option<Arc<ArtifactStore>>,
    ) -> RuntimeResult<Self> {
        let streams = config.stream_count();
        let _span = tracing::info_span!("primrt.build", nodes = graph.len(), streams).entered();
        let _scope = profiling::compile_scope("primrt.build");

        let impl_cache = ImplCache::new(config.impl_cache_capacity);
        let store = artifacts.as_deref().filter(|_| config.artifact_cache);
        let mut instances = Vec::with_capacity(graph.len());
        let mut conversions = Vec::new();
        let mut artifact_hits = 0;
        {
            let ctx = SpecializeContext {
                registry: &registry,
                device: &device,
                cache: impl_cache.as_ref(),
            };
            for node in graph.nodes() {
                let declared = graph.input_layouts(node);
                let (instance, restored) = build_instance(node, declared, &ctx, store)?;
                if restored {
                    artifact_hits += 1;
                }
                if instance.requires_conversion() {
                    let conversion = FormatConversion {
                        node: node.id,
                        implementation: instance
                            .implementation_name()
                            .unwrap_or_default()
                            .to_string(),
                        inputs: format_layouts(instance.declared_inputs()),
                    };
                    tracing::debug!(
                        node = %conversion.node,
                        implementation = %conversion.implementation,
                        inputs = %conversion.inputs,
                        "implementation needs a format conversion"
                    );
                    conversions.push(conversion);
                }
                instances.push(instance);
            }
        }

        let plan = plan_memory(&graph, &PlanOptions { streams })?;
        let pool = MemoryPool::allocate(&plan, config.max_pool_bytes)?;
        for (node, instance) in graph.nodes().iter().zip(instances.iter_mut()) {
            let input_slots = node
                .inputs
                .iter()
                .map(|input| slot_of(&plan, *input))
                .collect::<RuntimeResult<Vec<_>>>()?;
            let output_slot = slot_of(&plan, node.id)?;
            if let OpSpec::Constant(tensor) = &node.op {
                pool.ensure_capacity(output_slot, tensor.len())?;
                pool.write(output_slot)?
                    .copy_from(&tensor.data)
                    .map_err(|source| RuntimeError::ExecutionFailure {
                        node: node.id,
                        op: node.kind(),
                        shapes: vec![tensor.dims.clone()],
                        source,
                    })?;
            }
            instance.attach_slots(input_slots, output_slot);
        }
        let schedule = StreamSchedule::new(&graph, streams);

        tracing::info!(
            instances = instances.len(),
            slots = plan.slots().len(),
            pool_bytes = pool.allocated_bytes(),
            artifact_hits,
            conversions = conversions.len(),
            cross_stream_edges = schedule.cross_stream_edges(),
            "program built"
        );
        Ok(Self {
            graph,
            registry,
            device,
            config,
            artifacts,
            instances: instances.into_iter().map(Mutex::new).collect(),
            plan,
            pool,
            schedule,
            impl_cache,
            conversions,
            artifact_hits,
            poisoned: None,
        })
    }

    pub fn execute(&mut self, bindings: &Bindings) -> RuntimeResult<Vec<HostTensor>> {
        self.execute_with(bindings, &ExecuteOptions::default())
    }

    /// Runs every instance once and returns the graph outputs in declaration order.
    pub fn execute_with(
        &mut self,
        bindings: &Bindings,
        options: &ExecuteOptions,
    ) -> RuntimeResult<Vec<HostTensor>> {
        if let Some(poison) = &self.poisoned {
            return Err(RuntimeError::ProgramPoisoned {
                node: poison.node,
                reason: poison.reason.clone(),
            });
        }
        let _span = tracing::debug_span!("primrt.execute", nodes = self.graph.len()).entered();
        self.check_bindings(bindings)?;

        let ctx = ExecutionContext {
            graph: &self.graph,
            instances: &self.instances,
            pool: &self.pool,
            schedule: &self.schedule,
            specialize: SpecializeContext {
                registry: &self.registry,
                device: &self.device,
                cache: self.impl_cache.as_ref(),
            },
            bindings,
            cancel: options.cancel.as_ref(),
        };
        let extents = match engine::run(&ctx) {
            Ok(extents) => extents,
            Err(err) => {
                if err.poisons_program() {
                    self.poison(&err);
                }
                return Err(err);
            }
        };

        self.graph
            .outputs()
            .iter()
            .map(|id| self.read_output(*id, &extents))
            .collect()
    }

    fn check_bindings(&self, bindings: &Bindings) -> RuntimeResult<()> {
        for node in self.graph.parameters() {
            let binding = bindings
                .get(&node.id)
                .ok_or(RuntimeError::MissingBinding { node: node.id })?;
            let declared = node.output();
            if binding.dtype() != declared.dtype {
                return Err(RuntimeError::InvalidGraph {
                    reason: format!(
                        "binding for {} is {:?}, parameter is declared {}",
                        node.id,
                        binding.dtype(),
                        declared
                    ),
                });
            }
            if !declared.shape.accepts(&binding.dims) {
                return Err(RuntimeError::ShapeOutOfRange {
                    node: node.id,
                    expected: declared.shape.clone(),
                    actual: binding.dims.clone(),
                });
            }
        }
        Ok(())
    }

    fn read_output(&self, id: NodeId, extents: &[Dims]) -> RuntimeResult<HostTensor> {
        let position = self.graph.position(id).ok_or_else(|| RuntimeError::InvalidGraph {
            reason: format!("output {id} is not a node of the graph"),
        })?;
        let dims = &extents[position];
        let slot = slot_of(&self.plan, id)?;
        let data = self
            .pool
            .read(slot)?
            .prefix(dims.iter().product())
            .map_err(|source| RuntimeError::ExecutionFailure {
                node: id,
                op: self.graph.nodes()[position].kind(),
                shapes: vec![dims.clone()],
                source,
            })?;
        HostTensor::new(dims, data)
    }

    fn poison(&mut self, err: &RuntimeError) {
        let failed = self
            .instances
            .iter()
            .map(lock_instance)
            .find(|instance| instance.state() == InstanceState::Failed)
            .map(|instance| instance.id());
        let node = failed
            .or_else(|| err.node())
            .or_else(|| self.graph.outputs().first().copied())
            .unwrap_or(NodeId(0));
        tracing::warn!(node = %node, error = %err, "program poisoned");
        self.poisoned = Some(Poison {
            node,
            reason: err.to_string(),
        });
    }

    /// Discards every instance, the plan and the pool, and builds them again from the
    /// same graph, registry, device and configuration.
    pub fn rebuild(&mut self) -> RuntimeResult<()> {
        let rebuilt = Self::assemble(
            Arc::clone(&self.graph),
            Arc::clone(&self.registry),
            self.device.clone(),
            self.config.clone(),
            self.artifacts.clone(),
        )?;
        *self = rebuilt;
        Ok(())
    }

    /// Serializes every `Ready` instance. Instances still waiting on runtime extents are
    /// skipped.
    pub fn export_artifacts(&self) -> RuntimeResult<Vec<(NodeId, ArtifactBlob)>> {
        let mut blobs = Vec::new();
        for instance in &self.instances {
            let instance = lock_instance(instance);
            if instance.state() != InstanceState::Ready {
                continue;
            }
            blobs.push((
                instance.id(),
                artifact::serialize(&instance, &self.registry, &self.device)?,
            ));
        }
        Ok(blobs)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn device(&self) -> &DeviceCaps {
        &self.device
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn plan(&self) -> &MemoryPlan {
        &self.plan
    }

    pub fn schedule(&self) -> &StreamSchedule {
        &self.schedule
    }

    pub fn pool_bytes(&self) -> usize {
        self.pool.allocated_bytes()
    }

    pub fn conversions(&self) -> &[FormatConversion] {
        &self.conversions
    }

    pub fn artifact_hits(&self) -> usize {
        self.artifact_hits
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    pub fn instance_state(&self, id: NodeId) -> Option<InstanceState> {
        self.with_instance(id, |instance| instance.state())
    }

    pub fn instance_stats(&self, id: NodeId) -> Option<InstanceStats> {
        self.with_instance(id, |instance| instance.stats())
    }

    pub fn bound_implementation(&self, id: NodeId) -> Option<String> {
        self.with_instance(id, |instance| instance.implementation_name().map(str::to_string))
            .flatten()
    }

    pub fn finalized_form(&self, id: NodeId) -> Option<FinalizedForm> {
        self.with_instance(id, |instance| instance.finalized().cloned())
            .flatten()
    }

    fn with_instance<T>(&self, id: NodeId, f: impl FnOnce(&PrimitiveInstance) -> T) -> Option<T> {
        let position = self.graph.position(id)?;
        let instance = lock_instance(&self.instances[position]);
        Some(f(&instance))
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("nodes", &self.graph.len())
            .field("slots", &self.plan.slots().len())
            .field("streams", &self.schedule.stream_count())
            .field("artifact_hits", &self.artifact_hits)
            .field("poisoned", &self.poisoned.as_ref().map(|poison| poison.node))
            .finish()
    }
}

fn lock_instance(instance: &Mutex<PrimitiveInstance>) -> MutexGuard<'_, PrimitiveInstance> {
    instance.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn slot_of(plan: &MemoryPlan, id: NodeId) -> RuntimeResult<usize> {
    plan.slot_for(id).ok_or_else(|| RuntimeError::InvalidGraph {
        reason: format!("memory plan has no slot for {id}"),
    })
}

/// Restores an instance from the artifact store or binds it fresh. Instances whose
/// extents are all static are finalized here and written back to the store.
fn build_instance(
    node: &Arc<Node>,
    declared: Vec<Layout>,
    ctx: &SpecializeContext<'_>,
    store: Option<&ArtifactStore>,
) -> RuntimeResult<(PrimitiveInstance, bool)> {
    let key = node.signature(&declared);
    if let Some(store) = store {
        match store.get(key) {
            Some(blob) => {
                let restored = artifact::deserialize(
                    &blob,
                    Arc::clone(node),
                    declared.clone(),
                    ctx.registry,
                    ctx.device,
                );
                match restored {
                    Ok(instance) => {
                        profiling::cache_event("primrt.artifact_hit");
                        return Ok((instance, true));
                    }
                    Err(err) => {
                        profiling::cache_event("primrt.artifact_rejected");
                        tracing::debug!(node = %node.id, error = %err, "artifact rejected");
                    }
                }
            }
            None => profiling::cache_event("primrt.artifact_miss"),
        }
    }

    let mut instance = PrimitiveInstance::new(Arc::clone(node), declared);
    instance.bind(ctx.registry, ctx.device)?;
    let Some(shapes) = static_shapes(node, instance.declared_inputs()) else {
        return Ok((instance, false));
    };
    instance.prepare(&shapes, ctx)?;
    if let Some(store) = store {
        let written = artifact::serialize(&instance, ctx.registry, ctx.device)
            .map_err(|err| err.to_string())
            .and_then(|blob| store.put(key, blob).map_err(|err| err.to_string()));
        if let Err(reason) = written {
            tracing::warn!(node = %node.id, %reason, "artifact not stored");
        }
    }
    Ok((instance, false))
}

fn static_shapes(node: &Node, declared: &[Layout]) -> Option<ConcreteShapes> {
    let inputs = declared
        .iter()
        .map(|layout| layout.shape.static_dims())
        .collect::<Option<Vec<_>>>()?;
    let output = match &node.op {
        OpSpec::Constant(tensor) => tensor.dims.clone(),
        _ => node.output().shape.static_dims()?,
    };
    Some(ConcreteShapes::new(inputs, vec![output]))
}
