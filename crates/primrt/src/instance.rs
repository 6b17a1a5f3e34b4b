//! Runtime counterpart of a graph node and its specialisation state machine.
//!
//! ```text
//! Unbound -> Bound -> Ready <-> Stale
//!              |        |
//!              |        +-> Executing -> Ready
//!              +-> Failed (from any state on unrecoverable errors)
//! ```

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::backend::{ConcreteShapes, DeviceCaps, FinalizedForm, Implementation};
use crate::error::{RuntimeError, RuntimeResult};
use crate::graph::{Node, NodeId, OperationKind};
use crate::layout::{format_layouts, Layout};
use crate::profiling;
use crate::registry::{DescriptorId, ImplementationRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    Unbound,
    Bound,
    Ready,
    Stale,
    Executing,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceStats {
    /// Successful `Implementation::finalize` calls.
    pub finalizations: u64,
    /// Completed Stale -> Ready transitions.
    pub respecializations: u64,
    /// Times the bound implementation was replaced after the initial bind.
    pub reselections: u64,
    pub impl_cache_hits: u64,
    pub executions: u64,
}

/// What `PrimitiveInstance::prepare` had to do before the instance could run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Finalized,
    Respecialized { reselected: bool },
}

struct CachedImplementation {
    descriptor: DescriptorId,
    requires_conversion: bool,
    implementation: Box<dyn Implementation>,
    form: FinalizedForm,
}

/// LRU of finalized implementations keyed by node signature and concrete shapes.
pub struct ImplCache {
    entries: Mutex<LruCache<(u64, ConcreteShapes), CachedImplementation>>,
}

impl ImplCache {
    /// Returns `None` for a zero capacity, which disables caching.
    pub fn new(capacity: usize) -> Option<Self> {
        let capacity = NonZeroUsize::new(capacity)?;
        Some(Self {
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, signature: u64, shapes: &ConcreteShapes) -> Option<CachedImplementation> {
        let mut entries = self.entries.lock().ok()?;
        let entry = entries.get(&(signature, shapes.clone()))?;
        Some(CachedImplementation {
            descriptor: entry.descriptor,
            requires_conversion: entry.requires_conversion,
            implementation: entry.implementation.clone_boxed(),
            form: entry.form.clone(),
        })
    }

    fn put(&self, signature: u64, entry: CachedImplementation) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put((signature, entry.form.shapes.clone()), entry);
        }
    }
}

/// Everything a (re)specialisation may consult.
#[derive(Clone, Copy)]
pub struct SpecializeContext<'a> {
    pub registry: &'a ImplementationRegistry,
    pub device: &'a DeviceCaps,
    pub cache: Option<&'a ImplCache>,
}

pub struct PrimitiveInstance {
    node: Arc<Node>,
    signature: u64,
    declared_inputs: Vec<Layout>,
    state: InstanceState,
    descriptor: Option<DescriptorId>,
    bound: Option<Box<dyn Implementation>>,
    requires_conversion: bool,
    finalized: Option<FinalizedForm>,
    input_slots: Vec<usize>,
    output_slot: Option<usize>,
    stats: InstanceStats,
}

impl PrimitiveInstance {
    pub fn new(node: Arc<Node>, declared_inputs: Vec<Layout>) -> Self {
        let signature = node.signature(&declared_inputs);
        Self {
            node,
            signature,
            declared_inputs,
            state: InstanceState::Unbound,
            descriptor: None,
            bound: None,
            requires_conversion: false,
            finalized: None,
            input_slots: Vec::new(),
            output_slot: None,
            stats: InstanceStats::default(),
        }
    }

    /// Ready instance reconstructed from a stored artifact.
    pub(crate) fn restored(
        node: Arc<Node>,
        declared_inputs: Vec<Layout>,
        descriptor: DescriptorId,
        implementation: Box<dyn Implementation>,
        form: FinalizedForm,
    ) -> Self {
        let mut instance = Self::new(node, declared_inputs);
        instance.descriptor = Some(descriptor);
        instance.bound = Some(implementation);
        instance.finalized = Some(form);
        instance.state = InstanceState::Ready;
        instance
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn kind(&self) -> OperationKind {
        self.node.kind()
    }

    pub fn signature(&self) -> u64 {
        self.signature
    }

    pub fn declared_inputs(&self) -> &[Layout] {
        &self.declared_inputs
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn stats(&self) -> InstanceStats {
        self.stats
    }

    pub fn descriptor(&self) -> Option<DescriptorId> {
        self.descriptor
    }

    pub fn implementation(&self) -> Option<&dyn Implementation> {
        self.bound.as_deref()
    }

    pub fn implementation_name(&self) -> Option<&str> {
        self.bound.as_ref().map(|implementation| implementation.name())
    }

    pub fn requires_conversion(&self) -> bool {
        self.requires_conversion
    }

    pub fn finalized(&self) -> Option<&FinalizedForm> {
        self.finalized.as_ref()
    }

    /// Input extents of the last specialisation.
    pub fn last_input_shapes(&self) -> Option<&[crate::layout::Dims]> {
        self.finalized.as_ref().map(|form| form.shapes.inputs.as_slice())
    }

    pub fn input_slots(&self) -> &[usize] {
        &self.input_slots
    }

    pub fn output_slot(&self) -> Option<usize> {
        self.output_slot
    }

    pub(crate) fn attach_slots(&mut self, input_slots: Vec<usize>, output_slot: usize) {
        self.input_slots = input_slots;
        self.output_slot = Some(output_slot);
    }

    /// Unbound -> Bound: the first candidate whose implementation accepts the declared
    /// layouts.
    pub fn bind(
        &mut self,
        registry: &ImplementationRegistry,
        device: &DeviceCaps,
    ) -> RuntimeResult<()> {
        let outputs = &self.node.outputs;
        let candidates = match registry.candidates(&self.node, &self.declared_inputs, device) {
            Ok(candidates) => candidates,
            Err(err) => {
                self.state = InstanceState::Failed;
                return Err(err);
            }
        };
        for selection in candidates {
            let descriptor = registry.descriptor(selection.descriptor);
            let implementation = descriptor.instantiate(&self.node);
            if !implementation.supports(&self.declared_inputs, outputs) {
                tracing::debug!(
                    node = %self.node.id,
                    implementation = descriptor.name,
                    "candidate declined declared layouts"
                );
                continue;
            }
            tracing::debug!(
                node = %self.node.id,
                op = self.node.kind().as_str(),
                implementation = descriptor.name,
                requires_conversion = selection.requires_conversion,
                "bound implementation"
            );
            self.descriptor = Some(selection.descriptor);
            self.bound = Some(implementation);
            self.requires_conversion = selection.requires_conversion;
            self.state = InstanceState::Bound;
            return Ok(());
        }
        self.state = InstanceState::Failed;
        let mut layouts = self.declared_inputs.clone();
        layouts.extend(outputs.iter().cloned());
        Err(RuntimeError::NoCompatibleImplementation {
            node: self.node.id,
            op: self.node.kind(),
            layouts: format_layouts(&layouts),
        })
    }

    pub fn needs_reshape(&self, shapes: &ConcreteShapes) -> bool {
        self.finalized
            .as_ref()
            .map_or(true, |form| form.shapes != *shapes)
    }

    /// Brings the instance to `Ready` for `shapes`, finalizing or re-specialising as needed.
    pub fn prepare(
        &mut self,
        shapes: &ConcreteShapes,
        ctx: &SpecializeContext<'_>,
    ) -> RuntimeResult<Transition> {
        match self.state {
            InstanceState::Ready if !self.needs_reshape(shapes) => Ok(Transition::Unchanged),
            InstanceState::Ready | InstanceState::Stale => {
                self.state = InstanceState::Stale;
                tracing::debug!(
                    node = %self.node.id,
                    from = ?self.last_input_shapes(),
                    to = ?shapes.inputs,
                    "instance stale"
                );
                let reselected = self.specialize(shapes, ctx)?;
                self.stats.respecializations += 1;
                Ok(Transition::Respecialized { reselected })
            }
            InstanceState::Bound => {
                self.specialize(shapes, ctx)?;
                Ok(Transition::Finalized)
            }
            InstanceState::Failed => Err(RuntimeError::ProgramPoisoned {
                node: self.node.id,
                reason: "instance failed earlier".to_string(),
            }),
            InstanceState::Unbound | InstanceState::Executing => Err(RuntimeError::NotReady {
                node: self.node.id,
                state: self.state,
            }),
        }
    }

    /// Finalizes for `shapes`, falling back through the registry when the bound
    /// implementation declines or fails. Returns whether the implementation changed.
    ///
    /// While the bound implementation supports `shapes`, only cache entries it produced
    /// are reused; another implementation is taken from the cache only on re-selection.
    fn specialize(
        &mut self,
        shapes: &ConcreteShapes,
        ctx: &SpecializeContext<'_>,
    ) -> RuntimeResult<bool> {
        let node = Arc::clone(&self.node);
        let (inputs, outputs) = shapes.layouts(&self.declared_inputs, &node.outputs);
        let bound_supports = self
            .bound
            .as_ref()
            .is_some_and(|bound| bound.supports(&inputs, &outputs));

        if let Some(cache) = ctx.cache {
            match cache.get(self.signature, shapes) {
                Some(hit) if !bound_supports || self.descriptor == Some(hit.descriptor) => {
                    profiling::cache_event("primrt.impl_cache_hit");
                    let reselected = self.descriptor != Some(hit.descriptor);
                    if reselected {
                        self.stats.reselections += 1;
                    }
                    self.stats.impl_cache_hits += 1;
                    self.descriptor = Some(hit.descriptor);
                    self.requires_conversion = hit.requires_conversion;
                    self.bound = Some(hit.implementation);
                    self.finalized = Some(hit.form);
                    self.state = InstanceState::Ready;
                    return Ok(reselected);
                }
                _ => profiling::cache_event("primrt.impl_cache_miss"),
            }
        }

        let _scope = profiling::compile_scope("primrt.finalize");
        let mut failures: Vec<String> = Vec::new();

        if let (Some(current), Some(bound)) = (self.descriptor, self.bound.as_mut()) {
            if bound_supports {
                match bound.finalize(shapes, &node.op) {
                    Ok(form) => {
                        self.install(current, self.requires_conversion, form, ctx);
                        return Ok(false);
                    }
                    Err(err) => failures.push(format!("{}: {err}", bound.name())),
                }
            } else {
                tracing::debug!(
                    node = %node.id,
                    implementation = bound.name(),
                    inputs = %format_layouts(&inputs),
                    "bound implementation does not support concrete layouts"
                );
            }
        }

        self.state = InstanceState::Bound;
        let candidates = match ctx.registry.candidates(&node, &self.declared_inputs, ctx.device) {
            Ok(candidates) => candidates,
            Err(err) => {
                self.state = InstanceState::Failed;
                return Err(err);
            }
        };
        for selection in candidates {
            if Some(selection.descriptor) == self.descriptor {
                continue;
            }
            let descriptor = ctx.registry.descriptor(selection.descriptor);
            let mut implementation = descriptor.instantiate(&node);
            if !implementation.supports(&inputs, &outputs) {
                continue;
            }
            match implementation.finalize(shapes, &node.op) {
                Ok(form) => {
                    tracing::debug!(
                        node = %node.id,
                        implementation = descriptor.name,
                        "reselected implementation"
                    );
                    if self.descriptor.is_some() {
                        self.stats.reselections += 1;
                    }
                    self.bound = Some(implementation);
                    self.install(selection.descriptor, selection.requires_conversion, form, ctx);
                    return Ok(true);
                }
                Err(err) => failures.push(format!("{}: {err}", descriptor.name)),
            }
        }

        self.state = InstanceState::Failed;
        let reason = if failures.is_empty() {
            "no candidate supports the concrete layouts".to_string()
        } else {
            failures.join("; ")
        };
        Err(RuntimeError::FinalizationFailure {
            node: node.id,
            op: node.kind(),
            shapes: shapes.all(),
            reason,
        })
    }

    fn install(
        &mut self,
        descriptor: DescriptorId,
        requires_conversion: bool,
        form: FinalizedForm,
        ctx: &SpecializeContext<'_>,
    ) {
        self.stats.finalizations += 1;
        if let (Some(cache), Some(bound)) = (ctx.cache, self.bound.as_ref()) {
            cache.put(
                self.signature,
                CachedImplementation {
                    descriptor,
                    requires_conversion,
                    implementation: bound.clone_boxed(),
                    form: form.clone(),
                },
            );
        }
        self.descriptor = Some(descriptor);
        self.requires_conversion = requires_conversion;
        self.finalized = Some(form);
        self.state = InstanceState::Ready;
    }

    pub(crate) fn begin_execute(&mut self) -> RuntimeResult<()> {
        if self.state != InstanceState::Ready {
            return Err(RuntimeError::NotReady {
                node: self.node.id,
                state: self.state,
            });
        }
        self.state = InstanceState::Executing;
        Ok(())
    }

    pub(crate) fn finish_execute(&mut self) {
        self.stats.executions += 1;
        self.state = InstanceState::Ready;
    }

    pub(crate) fn mark_failed(&mut self) {
        self.state = InstanceState::Failed;
    }

    /// Returns an executing instance to `Ready` after a non-poisoning failure.
    pub(crate) fn abort_execute(&mut self) {
        if self.state == InstanceState::Executing {
            self.state = InstanceState::Ready;
        }
    }
}

impl std::fmt::Debug for PrimitiveInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimitiveInstance")
            .field("node", &self.node.id)
            .field("op", &self.node.kind())
            .field("state", &self.state)
            .field("implementation", &self.implementation_name())
            .field("stats", &self.stats)
            .finish()
    }
}
