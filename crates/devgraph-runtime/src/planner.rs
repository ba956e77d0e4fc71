//! Concurrency planning.
//!
//! Partitions a graph's nodes into dispatch groups by greedy topological
//! layering: group `k` holds every node whose producers all lie in groups
//! `0..k`. Nodes inside one group may run on different command streams in
//! any order; groups run one after another behind a barrier.

use devgraph_graph::{ComputeGraph, GraphNode, TensorId, TensorRef};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Node indices that may be dispatched without ordering among themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchGroup {
    nodes: Vec<usize>,
}

impl DispatchGroup {
    /// Node indices in ascending order.
    #[must_use]
    pub fn nodes(&self) -> &[usize] {
        &self.nodes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn contains(&self, node: usize) -> bool {
        self.nodes.binary_search(&node).is_ok()
    }
}

/// One element of the flattened plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyEntry {
    Node(usize),
    /// All preceding nodes must complete before any following node starts.
    Barrier,
}

impl fmt::Display for ConcurrencyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(i) => write!(f, "{i}"),
            Self::Barrier => write!(f, "|"),
        }
    }
}

/// An ordered partition of a graph's nodes into dispatch groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConcurrencyPlan {
    groups: Vec<DispatchGroup>,
    fingerprint: u64,
    node_count: usize,
    memory_validated: bool,
}

impl ConcurrencyPlan {
    #[must_use]
    pub fn groups(&self) -> &[DispatchGroup] {
        &self.groups
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Fingerprint of the graph this plan was computed for.
    #[must_use]
    pub const fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    #[must_use]
    pub const fn node_count(&self) -> usize {
        self.node_count
    }

    /// Whether aliasing between nodes was checked.
    #[must_use]
    pub const fn memory_validated(&self) -> bool {
        self.memory_validated
    }

    /// A plan with at most one group orders nothing and is not worth using.
    #[must_use]
    pub fn is_trivial(&self) -> bool {
        self.groups.len() <= 1
    }

    /// Whether this plan was computed for a graph with `graph`'s structure.
    #[must_use]
    pub fn matches(&self, graph: &ComputeGraph) -> bool {
        self.fingerprint == graph.fingerprint()
    }

    /// Index of the group holding `node`.
    #[must_use]
    pub fn group_of(&self, node: usize) -> Option<usize> {
        self.groups.iter().position(|g| g.contains(node))
    }

    /// The plan flattened into node indices with a barrier between groups.
    #[must_use]
    pub fn concurrency_list(&self) -> Vec<ConcurrencyEntry> {
        let mut list = Vec::with_capacity(self.node_count + self.groups.len());
        for (i, group) in self.groups.iter().enumerate() {
            if i > 0 {
                list.push(ConcurrencyEntry::Barrier);
            }
            list.extend(group.nodes.iter().copied().map(ConcurrencyEntry::Node));
        }
        list
    }
}

impl fmt::Display for ConcurrencyPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, group) in self.groups.iter().enumerate() {
            let nodes: Vec<String> = group.nodes.iter().map(ToString::to_string).collect();
            writeln!(f, "group {i}: [{}]", nodes.join(", "))?;
        }
        Ok(())
    }
}

/// Direct producers of every node: the latest earlier node writing each of
/// its sources.
#[must_use]
pub fn producers(graph: &ComputeGraph) -> Vec<Vec<usize>> {
    let mut writer: HashMap<TensorId, usize> = HashMap::new();
    let mut deps = Vec::with_capacity(graph.len());
    for (i, node) in graph.nodes().iter().enumerate() {
        let mut d: Vec<usize> =
            node.srcs.iter().filter_map(|s| writer.get(&s.id).copied()).collect();
        d.sort_unstable();
        d.dedup();
        deps.push(d);
        writer.insert(node.dst.id, i);
    }
    deps
}

fn written(node: &GraphNode) -> Option<&TensorRef> {
    node.writes_memory().then_some(&node.dst)
}

fn read(node: &GraphNode) -> &[TensorRef] {
    if node.writes_memory() { &node.srcs } else { &[] }
}

fn conflicts(a: &GraphNode, b: &GraphNode) -> bool {
    let clobbers = |w: Option<&TensorRef>, other: &GraphNode| {
        w.is_some_and(|w| {
            written(other).is_some_and(|o| w.overlaps(o))
                || read(other).iter().any(|r| w.overlaps(r))
        })
    };
    clobbers(written(a), b) || clobbers(written(b), a)
}

/// Earlier nodes each node must follow because their memory ranges
/// overlap with at least one side writing.
#[must_use]
pub fn memory_hazards(graph: &ComputeGraph) -> Vec<Vec<usize>> {
    let nodes = graph.nodes();
    (0..nodes.len())
        .map(|j| (0..j).filter(|&i| conflicts(&nodes[i], &nodes[j])).collect())
        .collect()
}

/// Compute the concurrency plan for `graph`.
///
/// Deterministic: the same graph always yields the same plan.
#[must_use]
pub fn plan_concurrency(graph: &ComputeGraph, validate_memory_safety: bool) -> ConcurrencyPlan {
    let mut deps = producers(graph);
    if validate_memory_safety {
        for (j, hazards) in memory_hazards(graph).into_iter().enumerate() {
            deps[j].extend(hazards);
        }
    }

    // Every dependency points at an earlier node, so one forward pass
    // assigns each node the round in which greedy layering would pick it.
    let mut level: Vec<usize> = Vec::with_capacity(deps.len());
    for d in &deps {
        let l = d.iter().map(|&i| level[i] + 1).max().unwrap_or(0);
        level.push(l);
    }
    let group_count = level.iter().max().map_or(0, |&m| m + 1);
    let mut groups = vec![DispatchGroup::default(); group_count];
    for (node, &l) in level.iter().enumerate() {
        groups[l].nodes.push(node);
    }

    let plan = ConcurrencyPlan {
        groups,
        fingerprint: graph.fingerprint(),
        node_count: graph.len(),
        memory_validated: validate_memory_safety,
    };
    debug!(
        nodes = plan.node_count,
        groups = plan.group_count(),
        validated = validate_memory_safety,
        "computed concurrency plan"
    );
    plan
}

/// Remembers the most recent plan.
#[derive(Debug, Default)]
pub struct ConcurrencyPlanner {
    last: Option<ConcurrencyPlan>,
}

impl ConcurrencyPlanner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan `graph`, replacing any previous plan.
    pub fn plan(&mut self, graph: &ComputeGraph, validate_memory_safety: bool) -> &ConcurrencyPlan {
        self.last.insert(plan_concurrency(graph, validate_memory_safety))
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.last.is_some()
    }

    /// Groups in the last plan, or 0 when there is none.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.last.as_ref().map_or(0, ConcurrencyPlan::group_count)
    }

    #[must_use]
    pub fn current(&self) -> Option<&ConcurrencyPlan> {
        self.last.as_ref()
    }

    pub fn clear(&mut self) {
        self.last = None;
    }
}
