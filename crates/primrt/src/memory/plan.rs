//! Liveness-based slot assignment for the values of a graph.
//!
//! Every node produces one buffer. Buffers are grouped through identity aliases (reshape
//! shares its input's storage), the group lives from its first producer to its last
//! access, and groups with disjoint lifetimes and equal dtype share a slot. Parameters,
//! constants and graph outputs always get a slot of their own.

use std::collections::HashMap;

use thiserror::Error;

use crate::graph::{Graph, NodeId, OperationKind};
use crate::layout::DType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub start: usize,
    pub end: usize,
}

impl LiveRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &LiveRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    fn union(self, other: LiveRange) -> LiveRange {
        LiveRange::new(self.start.min(other.start), self.end.max(other.end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasKind {
    None,
    Identity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUsage(u8);

impl BufferUsage {
    const PARAMETER: u8 = 1;
    const RESULT: u8 = 2;
    const TEMPORARY: u8 = 4;
    const CONSTANT: u8 = 8;

    pub fn empty() -> Self {
        BufferUsage(0)
    }

    pub fn parameter() -> Self {
        BufferUsage(Self::PARAMETER)
    }

    pub fn result() -> Self {
        BufferUsage(Self::RESULT)
    }

    pub fn temporary() -> Self {
        BufferUsage(Self::TEMPORARY)
    }

    pub fn constant() -> Self {
        BufferUsage(Self::CONSTANT)
    }

    pub fn contains_parameter(self) -> bool {
        (self.0 & Self::PARAMETER) != 0
    }

    pub fn contains_result(self) -> bool {
        (self.0 & Self::RESULT) != 0
    }

    pub fn contains_temporary(self) -> bool {
        (self.0 & Self::TEMPORARY) != 0
    }

    pub fn contains_constant(self) -> bool {
        (self.0 & Self::CONSTANT) != 0
    }

    /// Buffers that must keep a slot to themselves.
    pub fn is_dedicated(self) -> bool {
        (self.0 & (Self::PARAMETER | Self::RESULT | Self::CONSTANT)) != 0
    }

    pub fn merge(mut self, other: BufferUsage) -> Self {
        self.0 |= other.0;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSpec {
    pub node: NodeId,
    pub position: usize,
    pub dtype: DType,
    /// Element capacity any admissible binding needs; `None` when a dim is unbounded.
    pub capacity: Option<usize>,
    pub usage: BufferUsage,
    pub alias_group: usize,
    pub alias_kind: AliasKind,
    pub alias_of: Option<NodeId>,
    /// Lifetime of the whole alias group this buffer belongs to.
    pub live_range: LiveRange,
    pub slot: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSlot {
    pub id: usize,
    pub dtype: DType,
    pub capacity: Option<usize>,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOptions {
    /// Number of streams the program executes on. With more than one, slot reuse also
    /// requires a happens-before relation through graph edges.
    pub streams: usize,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self { streams: 1 }
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("node {node} aliases a {source_dtype:?} buffer as {dtype:?}")]
    AliasTypeMismatch {
        node: NodeId,
        dtype: DType,
        source_dtype: DType,
    },
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPlan {
    buffers: Vec<BufferSpec>,
    positions: HashMap<NodeId, usize>,
    slots: Vec<BufferSlot>,
}

impl MemoryPlan {
    pub fn buffers(&self) -> &[BufferSpec] {
        &self.buffers
    }

    pub fn slots(&self) -> &[BufferSlot] {
        &self.slots
    }

    pub fn buffer_for(&self, node: NodeId) -> Option<&BufferSpec> {
        self.positions
            .get(&node)
            .and_then(|position| self.buffers.get(*position))
    }

    pub fn slot_for(&self, node: NodeId) -> Option<usize> {
        self.buffer_for(node).map(|buffer| buffer.slot)
    }

    /// Pairs of buffers whose lifetimes overlap yet share a slot. Always empty for plans
    /// produced by `plan_memory`; exposed for verification.
    pub fn conflicts(&self) -> Vec<(NodeId, NodeId)> {
        let mut conflicts = Vec::new();
        for (idx, a) in self.buffers.iter().enumerate() {
            for b in &self.buffers[idx + 1..] {
                if a.slot == b.slot
                    && a.alias_group != b.alias_group
                    && a.live_range.overlaps(&b.live_range)
                {
                    conflicts.push((a.node, b.node));
                }
            }
        }
        conflicts
    }
}

/// Transitive predecessor sets of a graph, one bitset per node position.
#[derive(Debug, Clone)]
pub struct Reachability {
    words: usize,
    ancestors: Vec<Vec<u64>>,
}

impl Reachability {
    pub fn new(graph: &Graph) -> Self {
        let count = graph.len();
        let words = count.div_ceil(64).max(1);
        let mut ancestors: Vec<Vec<u64>> = Vec::with_capacity(count);
        for position in 0..count {
            let mut bits = vec![0u64; words];
            for input in graph.input_positions(position) {
                bits[input / 64] |= 1u64 << (input % 64);
                for (word, inherited) in bits.iter_mut().zip(&ancestors[input]) {
                    *word |= inherited;
                }
            }
            ancestors.push(bits);
        }
        Self { words, ancestors }
    }

    /// True when `earlier` must complete before `later` starts.
    pub fn happens_before(&self, earlier: usize, later: usize) -> bool {
        earlier / 64 < self.words
            && (self.ancestors[later][earlier / 64] >> (earlier % 64)) & 1 == 1
    }
}

struct AliasGroup {
    root: usize,
    dtype: DType,
    capacity: Option<usize>,
    usage: BufferUsage,
    range: LiveRange,
    accessors: Vec<usize>,
}

pub fn plan_memory(graph: &Graph, options: &PlanOptions) -> Result<MemoryPlan, PlanError> {
    let mut plan = MemoryPlan::default();
    let count = graph.len();

    for (position, node) in graph.nodes().iter().enumerate() {
        let layout = node.output();
        let mut usage = match node.kind() {
            OperationKind::Parameter => BufferUsage::parameter(),
            OperationKind::Constant => BufferUsage::constant(),
            _ => BufferUsage::temporary(),
        };
        if graph.is_output(node.id) {
            usage = usage.merge(BufferUsage::result());
        }
        plan.buffers.push(BufferSpec {
            node: node.id,
            position,
            dtype: layout.dtype,
            capacity: layout.capacity_elements(),
            usage,
            alias_group: position,
            alias_kind: AliasKind::None,
            alias_of: None,
            live_range: LiveRange::new(position, position),
            slot: 0,
        });
        plan.positions.insert(node.id, position);
    }

    let accessors = compute_live_ranges(graph, &mut plan, count);
    let groups = compute_alias_groups(graph, &mut plan, &accessors)?;
    let reachability = (options.streams > 1).then(|| Reachability::new(graph));
    assign_slots(&mut plan, groups, reachability.as_ref());

    tracing::debug!(
        buffers = plan.buffers.len(),
        slots = plan.slots.len(),
        streams = options.streams,
        "memory plan"
    );
    Ok(plan)
}

/// Extends each buffer's range to its last consumer; outputs live past the last node.
/// Returns the positions that touch each buffer.
fn compute_live_ranges(graph: &Graph, plan: &mut MemoryPlan, count: usize) -> Vec<Vec<usize>> {
    let mut accessors: Vec<Vec<usize>> = (0..count).map(|position| vec![position]).collect();
    for position in 0..count {
        for input in graph.input_positions(position) {
            let range = &mut plan.buffers[input].live_range;
            range.end = range.end.max(position);
            accessors[input].push(position);
        }
    }
    for output in graph.outputs() {
        if let Some(position) = graph.position(*output) {
            plan.buffers[position].live_range.end = count;
        }
    }
    accessors
}

fn compute_alias_groups(
    graph: &Graph,
    plan: &mut MemoryPlan,
    accessors: &[Vec<usize>],
) -> Result<Vec<AliasGroup>, PlanError> {
    let mut roots: Vec<usize> = (0..plan.buffers.len()).collect();
    for (position, node) in graph.nodes().iter().enumerate() {
        if node.kind() != OperationKind::Reshape {
            continue;
        }
        let Some(source) = graph.input_positions(position).first().copied() else {
            continue;
        };
        let root = roots[source];
        if plan.buffers[root].dtype != plan.buffers[position].dtype {
            return Err(PlanError::AliasTypeMismatch {
                node: node.id,
                dtype: plan.buffers[position].dtype,
                source_dtype: plan.buffers[root].dtype,
            });
        }
        roots[position] = root;
        let buffer = &mut plan.buffers[position];
        buffer.alias_kind = AliasKind::Identity;
        buffer.alias_of = Some(graph.nodes()[source].id);
    }

    let mut groups: Vec<AliasGroup> = Vec::new();
    let mut group_of_root: HashMap<usize, usize> = HashMap::new();
    for (position, root) in roots.iter().copied().enumerate() {
        let buffer = &plan.buffers[position];
        let index = *group_of_root.entry(root).or_insert_with(|| {
            groups.push(AliasGroup {
                root,
                dtype: buffer.dtype,
                capacity: Some(0),
                usage: BufferUsage::empty(),
                range: buffer.live_range,
                accessors: Vec::new(),
            });
            groups.len() - 1
        });
        let group = &mut groups[index];
        group.capacity = match (group.capacity, buffer.capacity) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        group.usage = group.usage.merge(buffer.usage);
        group.range = group.range.union(buffer.live_range);
        group.accessors.extend(accessors[position].iter().copied());
    }

    for (position, root) in roots.iter().enumerate() {
        let group = &groups[group_of_root[root]];
        let buffer = &mut plan.buffers[position];
        buffer.alias_group = group.root;
        buffer.live_range = group.range;
    }
    Ok(groups)
}

fn assign_slots(
    plan: &mut MemoryPlan,
    groups: Vec<AliasGroup>,
    reachability: Option<&Reachability>,
) {
    let mut slots: Vec<BufferSlot> = Vec::new();
    let mut slot_end: Vec<usize> = Vec::new();
    let mut slot_accessors: Vec<Vec<usize>> = Vec::new();
    let mut shareable: HashMap<DType, Vec<usize>> = HashMap::new();
    let mut slot_of_root: HashMap<usize, usize> = HashMap::new();

    let mut ordered = groups;
    ordered.sort_by_key(|group| group.range.start);
    for group in ordered {
        let dedicated = group.usage.is_dedicated();
        let reusable = if dedicated {
            None
        } else {
            shareable.get(&group.dtype).and_then(|candidates| {
                candidates.iter().copied().find(|slot| {
                    slot_end[*slot] < group.range.start
                        && reachability.map_or(true, |reach| {
                            slot_accessors[*slot]
                                .iter()
                                .all(|access| reach.happens_before(*access, group.root))
                        })
                })
            })
        };
        let slot_id = match reusable {
            Some(slot) => {
                let spec = &mut slots[slot];
                spec.capacity = match (spec.capacity, group.capacity) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    _ => None,
                };
                spec.usage = spec.usage.merge(group.usage);
                slot
            }
            None => {
                let id = slots.len();
                slots.push(BufferSlot {
                    id,
                    dtype: group.dtype,
                    capacity: group.capacity,
                    usage: group.usage,
                });
                slot_end.push(0);
                slot_accessors.push(Vec::new());
                if !dedicated {
                    shareable.entry(group.dtype).or_default().push(id);
                }
                id
            }
        };
        slot_end[slot_id] = slot_end[slot_id].max(group.range.end);
        slot_accessors[slot_id].extend(group.accessors.iter().copied());
        slot_of_root.insert(group.root, slot_id);
    }

    for buffer in &mut plan.buffers {
        buffer.slot = slot_of_root[&buffer.alias_group];
    }
    plan.slots = slots;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BinaryOp, GraphBuilder, ReshapeDim, UnaryOp};
    use crate::layout::{Dim, Layout};

    fn chain_graph() -> Graph {
        // x -> neg -> relu -> abs -> exp (output)
        let mut builder = GraphBuilder::new();
        let x = builder.parameter(Layout::fixed(DType::F32, &[4, 4]));
        let a = builder.unary(UnaryOp::Neg, x).expect("neg");
        let b = builder.unary(UnaryOp::Relu, a).expect("relu");
        let c = builder.unary(UnaryOp::Abs, b).expect("abs");
        let d = builder.unary(UnaryOp::Exp, c).expect("exp");
        builder.finish(&[d]).expect("graph")
    }

    #[test]
    fn chain_reuses_slots_without_conflicts() {
        let graph = chain_graph();
        let plan = plan_memory(&graph, &PlanOptions::default()).expect("plan");
        assert!(plan.conflicts().is_empty());
        // param, output and two ping-pong temporaries (neg/abs share, relu alone).
        assert_eq!(plan.slots().len(), 4);
        let slot_a = plan.slot_for(NodeId(1)).expect("slot");
        let slot_c = plan.slot_for(NodeId(3)).expect("slot");
        assert_eq!(slot_a, slot_c);
        assert_ne!(plan.slot_for(NodeId(0)), plan.slot_for(NodeId(4)));
    }

    #[test]
    fn reshape_aliases_source_slot() {
        let mut builder = GraphBuilder::new();
        let x = builder.parameter(Layout::fixed(DType::F32, &[2, 8]));
        let y = builder.unary(UnaryOp::Neg, x).expect("neg");
        let r = builder
            .reshape(y, vec![ReshapeDim::Explicit(4), ReshapeDim::Infer])
            .expect("reshape");
        let z = builder.unary(UnaryOp::Relu, r).expect("relu");
        let graph = builder.finish(&[z]).expect("graph");
        let plan = plan_memory(&graph, &PlanOptions::default()).expect("plan");

        let alias = plan.buffer_for(r).expect("alias buffer");
        assert_eq!(alias.alias_kind, AliasKind::Identity);
        assert_eq!(alias.alias_of, Some(y));
        assert_eq!(plan.slot_for(r), plan.slot_for(y));
        assert_eq!(plan.buffer_for(y).map(|b| b.live_range), Some(LiveRange::new(1, 3)));
        assert!(plan.conflicts().is_empty());
    }

    #[test]
    fn ranged_dims_size_slots_by_upper_bound() {
        let mut builder = GraphBuilder::new();
        let layout = Layout::dynamic(DType::F32, vec![Dim::range(1, 8), Dim::Fixed(4)]);
        let x = builder.parameter(layout.clone());
        let y = builder.parameter(layout);
        let sum = builder.binary(BinaryOp::Add, x, y).expect("add");
        let graph = builder.finish(&[sum]).expect("graph");
        let plan = plan_memory(&graph, &PlanOptions::default()).expect("plan");
        for slot in plan.slots() {
            assert_eq!(slot.capacity, Some(32));
        }
    }

    #[test]
    fn parallel_branches_do_not_share_across_streams() {
        // Two independent branches off one parameter. Single-stream order allows the
        // second branch to reuse the first branch's temporaries; with several streams the
        // branches may run concurrently, so they must not.
        let mut builder = GraphBuilder::new();
        let x = builder.parameter(Layout::fixed(DType::F32, &[8]));
        let a1 = builder.unary(UnaryOp::Neg, x).expect("a1");
        let a2 = builder.unary(UnaryOp::Abs, a1).expect("a2");
        let b1 = builder.unary(UnaryOp::Relu, x).expect("b1");
        let b2 = builder.unary(UnaryOp::Tanh, b1).expect("b2");
        let out = builder.binary(BinaryOp::Add, a2, b2).expect("join");
        let graph = builder.finish(&[out]).expect("graph");

        let single = plan_memory(&graph, &PlanOptions { streams: 1 }).expect("plan");
        assert_eq!(single.slot_for(a1), single.slot_for(b1));

        let multi = plan_memory(&graph, &PlanOptions { streams: 2 }).expect("plan");
        let a_slots = [multi.slot_for(a1), multi.slot_for(a2)];
        for b in [b1, b2] {
            assert!(!a_slots.contains(&multi.slot_for(b)), "{b} shares a slot across branches");
        }
        assert!(multi.conflicts().is_empty());
    }
}
