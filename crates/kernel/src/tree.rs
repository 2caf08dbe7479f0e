//! Tree node model and accessors.
//!
//! The tree is built elsewhere (see [`crate::treebuild`] for the fixture
//! builder); the walk only consumes it. Nodes are addressed by `i64` handles
//! with `-1` as the "no node" sentinel, and the traversal is sibling-threaded:
//! following `sibling` from any node skips its entire subtree, so a walk is a
//! single cursor moving either down (`first` child) or sideways (`sibling`).

/// Length of the node list carried by a query. The export coalescing rule
/// depends on this being exactly 2.
pub const NODELIST_LEN: usize = 2;

/// Maximum number of particles stored directly in a leaf before it splits.
pub const LEAF_CAPACITY: usize = 8;

/// What hangs below a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeChildren {
    /// Leaf holding the indices of the local particles inside it.
    Particles(Vec<u32>),
    /// Placeholder for a sub-domain owned by another rank. Cannot be
    /// descended locally; a walk that needs it must export the query.
    Pseudo {
        /// Index into [`Tree::top_leaves`].
        top_leaf: u32,
    },
    /// Interior node. `first` is the handle of the first child; the
    /// remaining children follow its sibling chain, and the last child's
    /// sibling is this node's own sibling.
    Nodes {
        /// Handle of the first child node.
        first: i64,
        /// Number of children on the sibling chain.
        count: u8,
    },
}

/// A single tree node.
#[derive(Debug, Clone)]
pub struct TreeNode {
    /// Geometric centre of the node's cube.
    pub center: [f64; 3],
    /// Full side length of the node's cube.
    pub len: f64,
    /// Next node in walk order at this level or above; `-1` terminates.
    pub sibling: i64,
    /// Largest smoothing length of any particle below this node. Only
    /// meaningful when [`Tree::hmax_valid`] is set.
    pub hmax: f64,
    /// Part of the globally replicated top tree.
    pub top_level: bool,
    /// Interior top-tree node (has top-tree nodes below it).
    pub internal_top_level: bool,
    /// Children discriminator.
    pub children: NodeChildren,
}

/// One leaf of the replicated top tree: who owns it and where their copy of
/// the node lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopLeaf {
    /// Owning rank.
    pub task: u32,
    /// Node handle of this leaf in the owner's tree.
    pub treenode: i64,
}

/// A spatial tree over the local particle set plus the replicated top tree.
#[derive(Debug, Clone)]
pub struct Tree {
    /// Node storage; handle `no` indexes this array directly.
    pub nodes: Vec<TreeNode>,
    /// Map from pseudo-node identifier to (owner rank, remote node handle).
    pub top_leaves: Vec<TopLeaf>,
    /// Periodic box side length; `0` disables wrapping.
    pub box_size: f64,
    /// Bitmask of particle types indexed by this tree.
    pub mask: u32,
    /// Whether per-node `hmax` values have been computed. Symmetric walks
    /// require this.
    pub hmax_valid: bool,
    /// Number of particles in the local table the tree was built over.
    pub num_particles: usize,
}

impl Tree {
    /// Handle of the root node.
    #[inline]
    pub fn root(&self) -> i64 {
        0
    }

    /// Whether the tree has been built.
    pub fn is_allocated(&self) -> bool {
        !self.nodes.is_empty()
    }

    /// Resolve a node handle.
    ///
    /// # Panics
    /// Panics when the handle does not name a tree node. Particle and pseudo
    /// handles never appear in the `no` slot of a well-formed walk; reaching
    /// one here means the tree lost its interior structure.
    #[inline]
    pub fn node(&self, no: i64) -> &TreeNode {
        assert!(
            no >= 0 && (no as usize) < self.nodes.len(),
            "walk handle {} is not a tree node (have {} nodes)",
            no,
            self.nodes.len()
        );
        &self.nodes[no as usize]
    }

    /// Look up a top leaf by pseudo-node identifier.
    #[inline]
    pub fn top_leaf(&self, t: u32) -> TopLeaf {
        self.top_leaves[t as usize]
    }

    /// Reverse lookup: top-leaf identifier of the top-tree leaf at `treenode`.
    pub fn top_leaf_of_node(&self, treenode: i64) -> Option<u32> {
        self.top_leaves
            .iter()
            .position(|l| l.treenode == treenode)
            .map(|i| i as u32)
    }

    /// Descend the replicated top tree to the leaf containing `pos`.
    ///
    /// Children of an interior node sit on the sibling chain in octant order
    /// (x fastest), so the octant index doubles as a chain offset.
    pub fn locate_top_leaf(&self, pos: &[f64; 3]) -> Option<u32> {
        let mut no = self.root();
        loop {
            let node = self.node(no);
            if !node.internal_top_level {
                return match node.children {
                    NodeChildren::Pseudo { top_leaf } => Some(top_leaf),
                    _ => self.top_leaf_of_node(no),
                };
            }
            let first = match node.children {
                NodeChildren::Nodes { first, .. } => first,
                _ => return None,
            };
            let mut oct = 0usize;
            for d in 0..3 {
                if pos[d] >= node.center[d] {
                    oct |= 1 << d;
                }
            }
            no = first;
            for _ in 0..oct {
                no = self.node(no).sibling;
            }
        }
    }
}
