//! Rank-local machinery of the distributed tree-walk engine.
//!
//! This crate holds everything a single rank needs to evaluate neighbour
//! interactions against its own tree; the distributed driver (phase
//! scheduling, export exchange, convergence loops) lives in the
//! `orchestrator` crate.
//!
//! # Modules
//! - [`particle`] -- struct-of-arrays particle table.
//! - [`tree`] -- node model, sibling-threaded traversal, top-leaf map.
//! - [`treebuild`] -- deterministic fixture tree builder.
//! - [`cull`] -- periodic node/search-sphere intersection test.
//! - [`walk`] -- visitor contract, pair-enumeration dispatcher, descent.
//! - [`export`] -- per-thread export table with node-list coalescing.
//! - [`queue`] -- order-preserving work-queue builder.
//! - [`scatter`] -- shared per-particle output buffers for kernels.

#![warn(missing_docs)]

pub mod cull;
pub mod export;
pub mod particle;
pub mod queue;
pub mod scatter;
pub mod tree;
pub mod treebuild;
pub mod walk;

pub use cull::{cull_node, nearest};
pub use export::{ExportFull, ExportRecord, ExportRegion};
pub use particle::ParticleSet;
pub use queue::{build_queue, WorkSet};
pub use scatter::ScatterBuf;
pub use tree::{NodeChildren, TopLeaf, Tree, TreeNode, LEAF_CAPACITY, NODELIST_LEN};
pub use treebuild::{build_tree, TreeBuildParams};
pub use walk::{
    add_counters, init_query, init_result, treefind, visit_ngbiter, visit_nolist_ngbiter,
    LocalWalk, NgbIter, PostContext, QueryHead, ReduceMode, ResultHead, Symmetry, TreeWalk,
    WalkMode, WalkQuery, WalkResult,
};
