use std::error::Error;
use std::fmt::{self, Debug, Display};

use anyhow::bail;
use itertools::Itertools;

use crate::tree::NodeIdx::{self, Internal as Int, Leaf};
use crate::Result;

/// Tree-topology errors raised while assembling nodes or finalising a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    NoChildren,
    ChildCountMismatch { children: usize, lengths: usize },
    DuplicateChild(NodeIdx),
    AlreadyParented(NodeIdx),
    UnknownNode(NodeIdx),
    IndexOutOfRange { index: usize, leaf_count: usize },
    DuplicateLeafIndex { index: usize },
    NoCommonAncestor,
}

impl Display for StructuralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuralError::NoChildren => {
                write!(f, "An internal node must have at least one child")
            }
            StructuralError::ChildCountMismatch { children, lengths } => write!(
                f,
                "Number of children ({}) must equal number of branch lengths ({})",
                children, lengths
            ),
            StructuralError::DuplicateChild(idx) => {
                write!(f, "{} appears more than once among the children", idx)
            }
            StructuralError::AlreadyParented(idx) => write!(f, "{} already has a parent", idx),
            StructuralError::UnknownNode(idx) => {
                write!(f, "{} does not belong to this arena", idx)
            }
            StructuralError::IndexOutOfRange { index, leaf_count } => write!(
                f,
                "Leaf index {} is outside the valid range for {} leaves",
                index, leaf_count
            ),
            StructuralError::DuplicateLeafIndex { index } => {
                write!(f, "Leaf index {} appears more than once", index)
            }
            StructuralError::NoCommonAncestor => {
                write!(f, "The nodes do not have a common ancestor")
            }
        }
    }
}

impl Error for StructuralError {}

/// Closed two-case node payload: a taxon leaf or a clade over child handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Leaf { index: usize },
    Internal { children: Vec<NodeIdx> },
}

#[derive(Clone)]
pub struct Node {
    pub idx: NodeIdx,
    pub parent: Option<NodeIdx>,
    pub blen: f64,
    pub kind: NodeKind,
}

impl Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            NodeKind::Leaf { index } => write!(f, "{} for taxon {}", self.idx, index),
            NodeKind::Internal { .. } => write!(f, "{}", self.idx),
        }
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            NodeKind::Leaf { index } => writeln!(
                f,
                "{:?} (taxon {}):{}, parent: {:?}",
                self.idx, index, self.blen, self.parent
            ),
            NodeKind::Internal { children } => writeln!(
                f,
                "{:?}:{}, parent: {:?}, children: {:?}",
                self.idx, self.blen, self.parent, children
            ),
        }
    }
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }

    /// Taxon index for leaves, None for internal nodes.
    pub fn index(&self) -> Option<usize> {
        match self.kind {
            NodeKind::Leaf { index } => Some(index),
            NodeKind::Internal { .. } => None,
        }
    }

    pub fn children(&self) -> &[NodeIdx] {
        match &self.kind {
            NodeKind::Leaf { .. } => &[],
            NodeKind::Internal { children } => children,
        }
    }

    fn new_leaf(idx: NodeIdx, index: usize) -> Self {
        Self {
            idx,
            parent: None,
            blen: 0.0,
            kind: NodeKind::Leaf { index },
        }
    }

    fn new_internal(idx: NodeIdx, children: Vec<NodeIdx>) -> Self {
        Self {
            idx,
            parent: None,
            blen: 0.0,
            kind: NodeKind::Internal { children },
        }
    }

    fn link_parent(&mut self, parent: &NodeIdx, blen: f64) {
        debug_assert!(matches!(parent, Int(_)));
        self.parent = Some(*parent);
        self.blen = blen;
    }
}

/// Bottom-up construction arena. Nodes are addressed by [NodeIdx] handles and
/// linked to their parent exactly once; the arena moves into
/// [Tree](crate::tree::Tree) when the root is chosen.
#[derive(Debug, Clone, Default)]
pub struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Creates a leaf node for the given taxon index.
    pub fn leaf(&mut self, index: usize) -> NodeIdx {
        let idx = Leaf(self.nodes.len());
        self.nodes.push(Node::new_leaf(idx, index));
        idx
    }

    /// Creates an internal node over the given children, setting each child's
    /// parent handle and branch length.
    ///
    /// Fails if the child list is empty, the length counts mismatch, a handle
    /// repeats or is foreign to this arena, or a child already has a parent.
    pub fn internal(&mut self, children: Vec<NodeIdx>, lengths: Vec<f64>) -> Result<NodeIdx> {
        if children.is_empty() {
            bail!(StructuralError::NoChildren);
        }
        if children.len() != lengths.len() {
            bail!(StructuralError::ChildCountMismatch {
                children: children.len(),
                lengths: lengths.len(),
            });
        }
        if let Some(dup) = children.iter().duplicates().next() {
            bail!(StructuralError::DuplicateChild(*dup));
        }
        for child in &children {
            match self.nodes.get(usize::from(child)) {
                Some(node) if node.idx != *child => bail!(StructuralError::UnknownNode(*child)),
                Some(node) if node.parent.is_some() => {
                    bail!(StructuralError::AlreadyParented(*child))
                }
                Some(_) => {}
                None => bail!(StructuralError::UnknownNode(*child)),
            }
        }
        let idx = Int(self.nodes.len());
        for (child, blen) in children.iter().zip(lengths.iter()) {
            self.nodes[usize::from(child)].link_parent(&idx, *blen);
        }
        self.nodes.push(Node::new_internal(idx, children));
        Ok(idx)
    }

    pub fn node(&self, idx: &NodeIdx) -> &Node {
        &self.nodes[usize::from(idx)]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }
}
