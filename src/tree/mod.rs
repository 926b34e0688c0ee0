use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};

use anyhow::bail;

use crate::f64_h;
use crate::Result;
use NodeIdx::{Internal as Int, Leaf};

mod cluster_matrix;
pub mod newick;
pub mod nj_builder;
pub mod tree_builder;
mod tree_node;
pub mod upgma_builder;

pub use cluster_matrix::ValidationError;
pub use nj_builder::NeighborJoiningBuilder;
pub use tree_builder::TreeBuilder;
pub use tree_node::{Node, NodeArena, NodeKind, StructuralError};
pub use upgma_builder::UpgmaBuilder;

#[derive(Debug, PartialEq, Clone, Copy, PartialOrd, Eq, Ord, Hash)]
pub enum NodeIdx {
    Internal(usize),
    Leaf(usize),
}

impl From<NodeIdx> for usize {
    fn from(node_idx: NodeIdx) -> usize {
        match node_idx {
            Int(idx) => idx,
            Leaf(idx) => idx,
        }
    }
}

impl From<&NodeIdx> for usize {
    fn from(node_idx: &NodeIdx) -> usize {
        usize::from(*node_idx)
    }
}

impl Display for NodeIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Int(idx) => write!(f, "internal node {}", idx),
            Leaf(idx) => write!(f, "leaf node {}", idx),
        }
    }
}

/// A rooted phylogenetic tree over taxa `0..leaf_count-1`.
///
/// Owns its node arena and is immutable once constructed; all queries are
/// read-only. Two trees compare equal when their topologies and branch
/// lengths match, regardless of child order at any clade.
#[derive(Debug, Clone)]
pub struct Tree {
    root: NodeIdx,
    nodes: Vec<Node>,
    leaves: Vec<NodeIdx>,
}

impl Tree {
    /// Finalises `arena` into a tree rooted at `root`.
    ///
    /// The root must be unparented, and the taxon indices of the leaves
    /// reachable from it must form an exact permutation of `0..leaf_count-1`;
    /// a gap, duplicate, or out-of-range index fails construction, nothing is
    /// reindexed.
    pub fn new(arena: NodeArena, root: NodeIdx) -> Result<Self> {
        let nodes = arena.into_nodes();
        match nodes.get(usize::from(root)) {
            Some(node) if node.idx != root => bail!(StructuralError::UnknownNode(root)),
            Some(node) if node.parent.is_some() => bail!(StructuralError::AlreadyParented(root)),
            Some(_) => {}
            None => bail!(StructuralError::UnknownNode(root)),
        }

        let collected = preorder_leaves(&nodes, root);
        let leaf_count = collected.len();
        let mut leaves: Vec<Option<NodeIdx>> = vec![None; leaf_count];
        for leaf in collected {
            let index = match nodes[usize::from(leaf)].kind {
                NodeKind::Leaf { index } => index,
                NodeKind::Internal { .. } => unreachable!(),
            };
            if index >= leaf_count {
                bail!(StructuralError::IndexOutOfRange { index, leaf_count });
            }
            if leaves[index].is_some() {
                bail!(StructuralError::DuplicateLeafIndex { index });
            }
            leaves[index] = Some(leaf);
        }
        let leaves = leaves.into_iter().flatten().collect();
        Ok(Self {
            root,
            nodes,
            leaves,
        })
    }

    /// Parses a Newick string into a tree, see [newick::from_newick].
    pub fn from_newick(text: &str, labels: Option<&[&str]>) -> Result<Self> {
        newick::from_newick(text, labels)
    }

    pub fn root(&self) -> NodeIdx {
        self.root
    }

    pub fn node(&self, idx: &NodeIdx) -> &Node {
        &self.nodes[usize::from(idx)]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Leaf handles in taxon order, so `leaves()[i]` is the leaf for taxon `i`.
    pub fn leaves(&self) -> &[NodeIdx] {
        &self.leaves
    }

    /// Handles of all nodes reachable from the root in pre-order.
    pub fn preorder(&self) -> Vec<NodeIdx> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(cur) = stack.pop() {
            order.push(cur);
            for child in self.node(&cur).children().iter().rev() {
                stack.push(*child);
            }
        }
        order
    }

    /// Patristic distance between taxa `i` and `j`.
    pub fn distance(&self, i: usize, j: usize) -> Result<f64> {
        let (a, b) = (self.leaf(i)?, self.leaf(j)?);
        self.node_distance(&a, &b)
    }

    /// Edge count between taxa `i` and `j`.
    pub fn topological_distance(&self, i: usize, j: usize) -> Result<usize> {
        let (a, b) = (self.leaf(i)?, self.leaf(j)?);
        self.node_topological_distance(&a, &b)
    }

    /// Patristic distance between two arena nodes: branch lengths are summed
    /// along both root-ward walks to the lowest common ancestor.
    pub fn node_distance(&self, a: &NodeIdx, b: &NodeIdx) -> Result<f64> {
        let lca = self.lowest_common_ancestor(a, b)?;
        let (blen_a, _) = self.walk_to(a, &lca);
        let (blen_b, _) = self.walk_to(b, &lca);
        Ok(blen_a + blen_b)
    }

    /// Edge count between two arena nodes.
    pub fn node_topological_distance(&self, a: &NodeIdx, b: &NodeIdx) -> Result<usize> {
        let lca = self.lowest_common_ancestor(a, b)?;
        let (_, steps_a) = self.walk_to(a, &lca);
        let (_, steps_b) = self.walk_to(b, &lca);
        Ok(steps_a + steps_b)
    }

    /// Deepest node that is an ancestor of both `a` and `b`: the two
    /// root-ward paths are compared from the root end inward.
    pub fn lowest_common_ancestor(&self, a: &NodeIdx, b: &NodeIdx) -> Result<NodeIdx> {
        let path_a = self.path_to_root(a);
        let path_b = self.path_to_root(b);
        let mut lca = None;
        for (x, y) in path_a.iter().rev().zip(path_b.iter().rev()) {
            if x == y {
                lca = Some(*x);
            } else {
                break;
            }
        }
        match lca {
            Some(idx) => Ok(idx),
            None => bail!(StructuralError::NoCommonAncestor),
        }
    }

    fn leaf(&self, index: usize) -> Result<NodeIdx> {
        match self.leaves.get(index) {
            Some(idx) => Ok(*idx),
            None => bail!(StructuralError::IndexOutOfRange {
                index,
                leaf_count: self.leaves.len(),
            }),
        }
    }

    fn path_to_root(&self, idx: &NodeIdx) -> Vec<NodeIdx> {
        let mut path = vec![*idx];
        let mut cur = *idx;
        while let Some(parent) = self.node(&cur).parent {
            path.push(parent);
            cur = parent;
        }
        path
    }

    // `ancestor` must lie on the root-ward path of `from`.
    fn walk_to(&self, from: &NodeIdx, ancestor: &NodeIdx) -> (f64, usize) {
        let mut blen_sum = 0.0;
        let mut steps = 0;
        let mut cur = *from;
        while cur != *ancestor {
            let node = self.node(&cur);
            blen_sum += node.blen;
            steps += 1;
            cur = node.parent.unwrap();
        }
        (blen_sum, steps)
    }

    fn shape(&self, idx: &NodeIdx) -> Shape {
        let node = self.node(idx);
        let kind = match &node.kind {
            NodeKind::Leaf { index } => ShapeKind::Leaf(*index),
            NodeKind::Internal { children } => {
                let mut shapes: Vec<Shape> = children.iter().map(|c| self.shape(c)).collect();
                shapes.sort();
                ShapeKind::Clade(shapes)
            }
        };
        Shape {
            kind,
            blen: f64_h::from(node.blen),
        }
    }
}

fn preorder_leaves(nodes: &[Node], root: NodeIdx) -> Vec<NodeIdx> {
    let mut order = Vec::new();
    let mut stack = vec![root];
    while let Some(cur) = stack.pop() {
        let node = &nodes[usize::from(cur)];
        if node.is_leaf() {
            order.push(cur);
        }
        for child in node.children().iter().rev() {
            stack.push(*child);
        }
    }
    order
}

// Canonical per-subtree key: children sort by their own keys, so comparison
// and hashing ignore child order and always agree with each other.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Shape {
    kind: ShapeKind,
    blen: f64_h,
}

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
enum ShapeKind {
    Leaf(usize),
    Clade(Vec<Shape>),
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.shape(&self.root) == other.shape(&other.root)
    }
}

impl Eq for Tree {}

impl Hash for Tree {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shape(&self.root).hash(state);
    }
}

impl Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", newick::to_newick(self))
    }
}
