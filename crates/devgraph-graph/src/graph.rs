//! The ordered operation graph.

use crate::op::OpKind;
use crate::tensor::TensorRef;
use std::hash::{DefaultHasher, Hash, Hasher};

/// One operation: reads `srcs`, writes `dst`.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub op: OpKind,
    pub srcs: Vec<TensorRef>,
    pub dst: TensorRef,
}

impl GraphNode {
    #[must_use]
    pub fn new(op: OpKind, srcs: Vec<TensorRef>, dst: TensorRef) -> Self {
        Self { op, srcs, dst }
    }

    /// Whether executing this node writes memory.
    #[must_use]
    pub const fn writes_memory(&self) -> bool {
        !self.op.is_noop()
    }
}

/// Operation nodes in a valid sequential (topological) order, plus the
/// leaf tensors that no node produces.
///
/// Dependencies are implicit: a node depends on the latest earlier node
/// whose destination is one of its sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputeGraph {
    nodes: Vec<GraphNode>,
    leafs: Vec<TensorRef>,
}

impl ComputeGraph {
    #[must_use]
    pub fn new(nodes: Vec<GraphNode>, leafs: Vec<TensorRef>) -> Self {
        Self { nodes, leafs }
    }

    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    #[must_use]
    pub fn node(&self, index: usize) -> Option<&GraphNode> {
        self.nodes.get(index)
    }

    #[must_use]
    pub fn leafs(&self) -> &[TensorRef] {
        &self.leafs
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a node. This is a structural edit: plans computed before it
    /// no longer describe the graph.
    pub fn push_node(&mut self, node: GraphNode) {
        self.nodes.push(node);
    }

    /// Remove and return the last node.
    pub fn pop_node(&mut self) -> Option<GraphNode> {
        self.nodes.pop()
    }

    /// Hash of the graph's structure: node order, operation kinds, and the
    /// identity and memory placement of every operand.
    ///
    /// Equal graphs always hash equal; any structural edit changes the
    /// fingerprint with overwhelming probability.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.nodes.len().hash(&mut hasher);
        for node in &self.nodes {
            node.op.hash(&mut hasher);
            node.srcs.len().hash(&mut hasher);
            for tensor in node.srcs.iter().chain(std::iter::once(&node.dst)) {
                tensor.id.hash(&mut hasher);
                tensor.addr.hash(&mut hasher);
                tensor.nbytes.hash(&mut hasher);
                tensor.dtype.hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}
