//! Deterministic tree builder for fixtures and end-to-end validation.
//!
//! The walk engine consumes the tree interface; production codes bring their
//! own builder. This one is small but honest: a replicated top tree of fixed
//! depth whose leaves are either pseudo nodes (remote sub-domains) or local
//! octrees, with the sibling threading the descent relies on.
//!
//! Every rank builds the identical top tree in the identical order, so a top
//! leaf's node handle is the same on every rank and can be shipped in a
//! query's node list as-is.

use crate::particle::ParticleSet;
use crate::tree::{NodeChildren, TopLeaf, Tree, TreeNode, LEAF_CAPACITY};

/// Parameters for [`build_tree`].
#[derive(Debug, Clone)]
pub struct TreeBuildParams {
    /// Periodic box side length.
    pub box_size: f64,
    /// Depth of the replicated top tree; `8^top_levels` top leaves.
    pub top_levels: u32,
    /// The building rank.
    pub rank: u32,
    /// Total number of ranks. Top leaves are assigned to ranks in
    /// contiguous blocks.
    pub ntask: u32,
    /// Bitmask of particle types the tree indexes.
    pub mask: u32,
    /// Aggregate per-node `hmax` from particle smoothing lengths.
    pub with_hmax: bool,
}

/// Splitting deeper than this keeps overfull leaves instead (degenerate,
/// coincident particles).
const MAX_DEPTH: u32 = 40;

struct Builder<'a> {
    p: &'a ParticleSet,
    params: &'a TreeBuildParams,
    n_top_leaves: u64,
    nodes: Vec<TreeNode>,
    top_leaves: Vec<TopLeaf>,
}

/// Build the rank-local tree: replicated top tree, pseudo leaves for remote
/// sub-domains, local octrees below owned top leaves.
///
/// `p` holds only this rank's particles; any that fall outside the rank's
/// top leaves are simply not indexed.
pub fn build_tree(p: &ParticleSet, params: &TreeBuildParams) -> Tree {
    assert!(params.box_size > 0.0, "tree needs a positive box size");
    assert!(params.ntask >= 1, "tree needs at least one rank");
    let n_top_leaves = 8u64.pow(params.top_levels);
    assert!(
        n_top_leaves >= params.ntask as u64,
        "top tree too shallow: {} leaves for {} ranks",
        n_top_leaves,
        params.ntask
    );

    let mut b = Builder {
        p,
        params,
        n_top_leaves,
        nodes: Vec::new(),
        top_leaves: Vec::new(),
    };

    // Phase 1: the replicated top tree. Do not touch particles yet so that
    // node handles only depend on the (shared) geometry.
    let half = 0.5 * params.box_size;
    b.add_top_node([half; 3], params.box_size, 0, -1);

    // Phase 2: hang local particles below the top leaves this rank owns.
    for t in 0..b.top_leaves.len() {
        let leaf = b.top_leaves[t];
        if leaf.task != params.rank {
            continue;
        }
        let idx = leaf.treenode as usize;
        let (center, len) = (b.nodes[idx].center, b.nodes[idx].len);
        let mine: Vec<u32> = (0..p.len() as u32)
            .filter(|&i| in_box(&p.pos[i as usize], &center, len))
            .collect();
        b.expand(idx, mine, 0);
    }

    // Phase 3: per-node hmax, bottom up.
    if params.with_hmax {
        b.fill_hmax(0);
    }

    let tree = Tree {
        nodes: b.nodes,
        top_leaves: b.top_leaves,
        box_size: params.box_size,
        mask: params.mask,
        hmax_valid: params.with_hmax,
        num_particles: p.len(),
    };
    tracing::debug!(
        "built tree: {} nodes, {} top leaves, {} particles, rank {}/{}",
        tree.nodes.len(),
        tree.top_leaves.len(),
        p.len(),
        params.rank,
        params.ntask
    );
    tree
}

/// Half-open box membership, matching the octant split below.
fn in_box(pos: &[f64; 3], center: &[f64; 3], len: f64) -> bool {
    let half = 0.5 * len;
    (0..3).all(|d| pos[d] >= center[d] - half && pos[d] < center[d] + half)
}

/// Centre of octant `oct` (bit 0 = x, bit 1 = y, bit 2 = z).
fn octant_center(center: &[f64; 3], len: f64, oct: usize) -> [f64; 3] {
    let quarter = 0.25 * len;
    let mut c = *center;
    for d in 0..3 {
        c[d] += if oct & (1 << d) != 0 { quarter } else { -quarter };
    }
    c
}

impl Builder<'_> {
    /// Recursively allocate the top tree. Children are created right-to-left
    /// so each child's sibling handle is known when it is pushed; the walk
    /// still sees them left-to-right through the `first` link.
    fn add_top_node(&mut self, center: [f64; 3], len: f64, depth: u32, sibling: i64) -> i64 {
        let idx = self.nodes.len() as i64;
        let internal = depth < self.params.top_levels;
        self.nodes.push(TreeNode {
            center,
            len,
            sibling,
            hmax: 0.0,
            top_level: true,
            internal_top_level: internal,
            children: NodeChildren::Particles(Vec::new()),
        });

        if internal {
            let mut next = sibling;
            let mut first = -1;
            for oct in (0..8).rev() {
                first = self.add_top_node(
                    octant_center(&center, len, oct),
                    0.5 * len,
                    depth + 1,
                    next,
                );
                next = first;
            }
            self.nodes[idx as usize].children = NodeChildren::Nodes { first, count: 8 };
        } else {
            // A top leaf: owned locally (expanded later) or a stand-in for a
            // peer's sub-domain.
            let leaf_id = self.top_leaves.len() as u64;
            let task = (leaf_id * self.params.ntask as u64 / self.n_top_leaves) as u32;
            self.top_leaves.push(TopLeaf {
                task,
                treenode: idx,
            });
            if task != self.params.rank {
                self.nodes[idx as usize].children = NodeChildren::Pseudo {
                    top_leaf: leaf_id as u32,
                };
            }
        }
        idx
    }

    /// Turn `node_idx` into the root of an octree over `parts`.
    fn expand(&mut self, node_idx: usize, parts: Vec<u32>, depth: u32) {
        if parts.len() <= LEAF_CAPACITY || depth >= MAX_DEPTH {
            self.nodes[node_idx].children = NodeChildren::Particles(parts);
            return;
        }

        let (center, len, sibling) =
            (self.nodes[node_idx].center, self.nodes[node_idx].len, self.nodes[node_idx].sibling);

        let mut buckets: [Vec<u32>; 8] = Default::default();
        for i in parts {
            let pos = &self.p.pos[i as usize];
            let mut oct = 0usize;
            for d in 0..3 {
                if pos[d] >= center[d] {
                    oct |= 1 << d;
                }
            }
            buckets[oct].push(i);
        }

        let mut next = sibling;
        let mut children = [0i64; 8];
        for oct in (0..8).rev() {
            let ci = self.nodes.len() as i64;
            self.nodes.push(TreeNode {
                center: octant_center(&center, len, oct),
                len: 0.5 * len,
                sibling: next,
                hmax: 0.0,
                top_level: false,
                internal_top_level: false,
                children: NodeChildren::Particles(Vec::new()),
            });
            children[oct] = ci;
            next = ci;
        }
        self.nodes[node_idx].children = NodeChildren::Nodes {
            first: children[0],
            count: 8,
        };

        for (oct, bucket) in IntoIterator::into_iter(buckets).enumerate() {
            self.expand(children[oct] as usize, bucket, depth + 1);
        }
    }

    /// Post-order hmax aggregation. Pseudo leaves stay at zero: their owners
    /// hold the real values.
    fn fill_hmax(&mut self, node_idx: usize) -> f64 {
        let hmax = match self.nodes[node_idx].children.clone() {
            NodeChildren::Particles(list) => list
                .iter()
                .map(|&i| self.p.hsml[i as usize])
                .fold(0.0, f64::max),
            NodeChildren::Pseudo { .. } => 0.0,
            NodeChildren::Nodes { first, count } => {
                let mut h: f64 = 0.0;
                let mut no = first;
                for _ in 0..count {
                    h = h.max(self.fill_hmax(no as usize));
                    no = self.nodes[no as usize].sibling;
                }
                h
            }
        };
        self.nodes[node_idx].hmax = hmax;
        hmax
    }
}
