//! Static tree overlay topology and the per-rank context derived from it.
//!
//! The topology is discovered once, at construction time, and never mutated
//! for the lifetime of an instance. Every rank precomputes its own subtree
//! idset once rather than rewalking the tree on each message.

use std::collections::HashMap;

use crate::idset::{Idset, Rank};

/// One node of the static topology tree.
#[derive(Clone, Debug)]
pub struct TopologyNode {
    pub rank: Rank,
    pub children: Vec<TopologyNode>,
}

impl TopologyNode {
    pub fn leaf(rank: Rank) -> Self {
        Self {
            rank,
            children: Vec::new(),
        }
    }

    pub fn with_children(rank: Rank, children: Vec<TopologyNode>) -> Self {
        Self { rank, children }
    }
}

/// The full overlay tree, plus a precomputed index from rank to its
/// location (parent, direct children, subtree idset).
#[derive(Clone, Debug)]
pub struct Topology {
    root: TopologyNode,
    index: HashMap<Rank, NodeInfo>,
}

#[derive(Clone, Debug)]
struct NodeInfo {
    parent: Option<Rank>,
    children: Vec<Rank>,
    subtree: Idset,
}

impl Topology {
    /// Build the topology and precompute every rank's subtree idset in one
    /// bottom-up pass.
    pub fn new(root: TopologyNode) -> Self {
        let mut index = HashMap::new();
        let subtree = Self::index_node(&root, None, &mut index);
        debug_assert!(subtree.contains(root.rank));
        Self { root, index }
    }

    fn index_node(
        node: &TopologyNode,
        parent: Option<Rank>,
        index: &mut HashMap<Rank, NodeInfo>,
    ) -> Idset {
        let mut subtree = Idset::singleton(node.rank);
        let mut children = Vec::with_capacity(node.children.len());
        for child in &node.children {
            let child_subtree = Self::index_node(child, Some(node.rank), index);
            subtree.union_with(&child_subtree);
            children.push(child.rank);
        }
        index.insert(
            node.rank,
            NodeInfo {
                parent,
                children,
                subtree: subtree.clone(),
            },
        );
        subtree
    }

    pub fn root_rank(&self) -> Rank {
        self.root.rank
    }

    pub fn is_root(&self, rank: Rank) -> bool {
        rank == self.root.rank
    }

    pub fn parent_of(&self, rank: Rank) -> Option<Rank> {
        self.index.get(&rank).and_then(|info| info.parent)
    }

    pub fn children_of(&self, rank: Rank) -> &[Rank] {
        self.index
            .get(&rank)
            .map(|info| info.children.as_slice())
            .unwrap_or(&[])
    }

    /// The subtree rooted at `rank`: `rank` itself plus all descendants.
    pub fn subtree_of(&self, rank: Rank) -> Option<&Idset> {
        self.index.get(&rank).map(|info| &info.subtree)
    }

    pub fn contains_rank(&self, rank: Rank) -> bool {
        self.index.contains_key(&rank)
    }

    /// The lowest common ancestor of a rank set: the topologically highest
    /// rank whose subtree contains every rank in `ranks`.
    /// Walks from any member of `ranks` up through ancestors, stopping at the
    /// first whose subtree is a superset. Returns `None` if `ranks` is empty
    /// or references an unknown rank.
    pub fn lca(&self, ranks: &Idset) -> Option<Rank> {
        let start = ranks.iter().next()?;
        let mut candidate = start;
        loop {
            let subtree = self.subtree_of(candidate)?;
            if ranks.is_subset(subtree) {
                return Some(candidate);
            }
            candidate = self.parent_of(candidate)?;
        }
    }
}

/// Immutable, rank-scoped view handed to every handler: own rank, the full
/// topology, and a precomputed idset `subtree`.
#[derive(Clone, Debug)]
pub struct Context {
    pub rank: Rank,
    pub topology: Topology,
}

impl Context {
    pub fn new(rank: Rank, topology: Topology) -> Self {
        assert!(
            topology.contains_rank(rank),
            "rank {rank} is not part of the topology"
        );
        Self { rank, topology }
    }

    pub fn is_root(&self) -> bool {
        self.topology.is_root(self.rank)
    }

    pub fn subtree(&self) -> &Idset {
        self.topology
            .subtree_of(self.rank)
            .expect("own rank is always indexed")
    }

    pub fn parent(&self) -> Option<Rank> {
        self.topology.parent_of(self.rank)
    }

    pub fn children(&self) -> &[Rank] {
        self.topology.children_of(self.rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Topology {
        // 0 -> [1, 2, 3]
        Topology::new(TopologyNode::with_children(
            0,
            vec![
                TopologyNode::leaf(1),
                TopologyNode::leaf(2),
                TopologyNode::leaf(3),
            ],
        ))
    }

    #[test]
    fn subtree_union_invariant() {
        let topo = sample();
        let root_subtree = topo.subtree_of(0).unwrap();
        assert_eq!(root_subtree, &Idset::from_ranks([0, 1, 2, 3]));
        for child in [1, 2, 3] {
            assert_eq!(topo.subtree_of(child).unwrap(), &Idset::singleton(child));
        }
    }

    #[test]
    fn lca_full_span_is_root() {
        let topo = sample();
        assert_eq!(topo.lca(&Idset::from_ranks([0, 1, 2, 3])), Some(0));
        assert_eq!(topo.lca(&Idset::singleton(2)), Some(2));
    }

    #[test]
    fn single_rank_system() {
        let topo = Topology::new(TopologyNode::leaf(0));
        let ctx = Context::new(0, topo);
        assert!(ctx.is_root());
        assert_eq!(ctx.subtree(), &Idset::singleton(0));
        assert!(ctx.children().is_empty());
    }
}
