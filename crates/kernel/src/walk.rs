//! Visitor contract, pair-enumeration dispatcher, and the tree descent.
//!
//! A concrete kernel (density, neighbour counting, feedback, ...) implements
//! [`TreeWalk`]; the engine drives it through three phases:
//!
//! - **top-tree**: enumerate the sub-domains a query must visit and queue
//!   exports for their owners;
//! - **primary**: pure local work over the rank's own subtree;
//! - **ghosts**: evaluate queries imported from other ranks, entering the
//!   tree at the node(s) named by the query.
//!
//! Query and result payloads are `repr(C)` [`Pod`] structs that begin with a
//! fixed head ([`QueryHead`] / [`ResultHead`]), so the wire layer can move
//! them as bytes while the engine fills in position, node list, and identity.

use bytemuck::{Pod, Zeroable};

use crate::cull::{cull_node, nearest};
use crate::export::{ExportFull, ExportRegion};
use crate::particle::ParticleSet;
use crate::tree::{NodeChildren, Tree, NODELIST_LEN};

/// Which phase of the walk a thread is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkMode {
    /// Enumerate exports by walking only the replicated top tree.
    TopTree,
    /// Local work over the rank's own subtree.
    Primary,
    /// Evaluate queries imported from peer ranks.
    Ghosts,
}

/// Distance convention for the neighbour search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symmetry {
    /// Search up to the query's own radius.
    Asymmetric,
    /// Search up to `max(query radius, neighbour radius)`; requires the
    /// tree's cached per-node `hmax`.
    Symmetric,
}

/// How a partial result is merged into the owning particle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceMode {
    /// The local contribution, produced exactly once per particle.
    Primary,
    /// A contribution returned from a peer rank.
    Ghosts,
}

/// Fixed head of every query payload. The engine owns these fields; kernels
/// fill the rest of their payload in [`TreeWalk::fill`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct QueryHead {
    /// Query position.
    pub pos: [f64; 3],
    /// Identity of the originating particle (debug echo).
    pub id: u64,
    /// Entry nodes to walk; second slot `-1` when unused.
    pub nodelist: [i64; NODELIST_LEN],
}

/// Fixed head of every result payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ResultHead {
    /// Identity echo of the originating query.
    pub id: u64,
}

/// Query payloads: `Pod` plus access to the fixed head.
pub trait WalkQuery: Pod + Send + Sync {
    /// The engine-owned head.
    fn head(&self) -> &QueryHead;
    /// Mutable access for query initialisation.
    fn head_mut(&mut self) -> &mut QueryHead;
}

/// Result payloads: `Pod` plus access to the fixed head.
pub trait WalkResult: Pod + Send + Sync {
    /// The engine-owned head.
    fn head(&self) -> &ResultHead;
    /// Mutable access for result initialisation.
    fn head_mut(&mut self) -> &mut ResultHead;
}

impl WalkQuery for QueryHead {
    fn head(&self) -> &QueryHead {
        self
    }
    fn head_mut(&mut self) -> &mut QueryHead {
        self
    }
}

impl WalkResult for ResultHead {
    fn head(&self) -> &ResultHead {
        self
    }
    fn head_mut(&mut self) -> &mut ResultHead {
        self
    }
}

/// Neighbour-iteration state shared between the dispatcher and the kernel.
///
/// [`TreeWalk::ngb_setup`] seeds `hsml`, `mask` and `symmetric`; the
/// dispatcher then fills `other`, `r`, `r2` and `dist` once per in-range
/// neighbour. List-free kernels may shrink `hsml` mid-walk.
#[derive(Debug, Clone)]
pub struct NgbIter {
    /// Current search radius.
    pub hsml: f64,
    /// Bitmask of acceptable particle types.
    pub mask: u32,
    /// Distance convention.
    pub symmetric: Symmetry,
    /// Index of the current neighbour.
    pub other: usize,
    /// Squared distance to the current neighbour.
    pub r2: f64,
    /// Distance to the current neighbour.
    pub r: f64,
    /// Separation vector, pointing from the neighbour to the query.
    pub dist: [f64; 3],
}

impl NgbIter {
    /// Fresh iterator awaiting [`TreeWalk::ngb_setup`].
    pub fn new() -> Self {
        Self {
            hsml: 0.0,
            mask: 0,
            symmetric: Symmetry::Asymmetric,
            other: usize::MAX,
            r2: 0.0,
            r: 0.0,
            dist: [0.0; 3],
        }
    }
}

impl Default for NgbIter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread context handed to [`TreeWalk::postprocess`].
///
/// Kernels that adapt their search radius push unconverged particles onto
/// `redo`; the driver concatenates the per-thread lists in thread order into
/// the next pass's queue.
#[derive(Debug, Clone)]
pub struct PostContext {
    /// Particles to re-walk next convergence pass.
    pub redo: Vec<u32>,
    /// Largest neighbour count seen by this thread.
    pub max_ngb: f64,
    /// Smallest neighbour count seen by this thread.
    pub min_ngb: f64,
}

impl PostContext {
    /// Empty context with extrema ready for min/max folding.
    pub fn new() -> Self {
        Self {
            redo: Vec::new(),
            max_ngb: 0.0,
            min_ngb: 1e50,
        }
    }

    /// Fold a neighbour count into the extrema.
    pub fn record_ngb(&mut self, numngb: f64) {
        if numngb > self.max_ngb {
            self.max_ngb = numngb;
        }
        if numngb < self.min_ngb {
            self.min_ngb = numngb;
        }
    }
}

impl Default for PostContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A tree-walk kernel: the capability set the engine is polymorphic over.
///
/// Implementations must be cheap to call and free of engine re-entry; in
/// particular no method may perform communication, and writes are confined
/// to the result payload and the kernel's own scatter buffers.
pub trait TreeWalk: Sync {
    /// Query payload shipped to peer ranks.
    type Query: WalkQuery;
    /// Result payload shipped back.
    type Result: WalkResult;

    /// Short label for logs and diagnostics.
    const LABEL: &'static str;

    /// Whether [`haswork`](Self::haswork) filters the active set. When
    /// `false` (and the caller vouches for a garbage-free active list) the
    /// queue builder adopts the caller's list without copying.
    const HAS_WORK_FILTER: bool = false;

    /// Whether [`preprocess`](Self::preprocess) does anything; the driver
    /// skips the hook loop entirely when it does not.
    const HAS_PREPROCESS: bool = false;

    /// Whether [`postprocess`](Self::postprocess) does anything.
    const HAS_POSTPROCESS: bool = false;

    /// Work predicate over active particles.
    fn haswork(&self, _p: &ParticleSet, _i: u32) -> bool {
        true
    }

    /// Populate kernel-specific query fields. The head (position, identity,
    /// node list) is already set.
    fn fill(&self, p: &ParticleSet, i: u32, q: &mut Self::Query);

    /// Seed the iterator for a query: search radius, type mask, symmetry.
    fn ngb_setup(&self, q: &Self::Query, iter: &mut NgbIter);

    /// One in-range neighbour. `iter` carries `other`, `r`, `r2`, `dist`.
    fn ngb_visit(&self, q: &Self::Query, r: &mut Self::Result, iter: &mut NgbIter, p: &ParticleSet);

    /// Merge a partial result into the owning particle `i`. Called once in
    /// [`ReduceMode::Primary`] and once per returning rank in
    /// [`ReduceMode::Ghosts`].
    fn reduce(&self, i: u32, r: &Self::Result, mode: ReduceMode, p: &ParticleSet);

    /// Optional per-particle hook before the walk.
    fn preprocess(&self, _p: &ParticleSet, _i: u32) {}

    /// Optional per-particle hook after the walk.
    fn postprocess(&self, _p: &ParticleSet, _i: u32, _ctx: &mut PostContext) {}

    /// Evaluate one query. The default is the buffered pair enumeration;
    /// kernels that adapt `hsml` mid-walk override this with
    /// [`visit_nolist_ngbiter`].
    fn visit(
        &self,
        q: &Self::Query,
        r: &mut Self::Result,
        lw: &mut LocalWalk<'_>,
    ) -> Result<(), ExportFull>
    where
        Self: Sized,
    {
        visit_ngbiter(self, q, r, lw)
    }
}

/// Per-thread walk state: mode, target, candidate buffer, export region and
/// interaction counters.
pub struct LocalWalk<'a> {
    /// Phase this thread is executing.
    pub mode: WalkMode,
    /// Local particle being walked; `None` for imported (ghost) queries.
    pub target: Option<u32>,
    /// The tree being walked.
    pub tree: &'a Tree,
    /// The local particle table.
    pub particles: &'a ParticleSet,
    exports: Option<ExportRegion<'a>>,
    ngblist: Vec<u32>,
    /// Candidate interactions accumulated in the primary phase.
    pub ninteractions: u64,
    /// Largest per-query candidate count (primary phase).
    pub max_ninteractions: u64,
    /// Smallest per-query candidate count (primary phase).
    pub min_ninteractions: u64,
}

impl<'a> LocalWalk<'a> {
    /// Walk state without an export region (primary and ghost phases).
    pub fn new(mode: WalkMode, tree: &'a Tree, particles: &'a ParticleSet, ngblist: bool) -> Self {
        Self {
            mode,
            target: None,
            tree,
            particles,
            exports: None,
            ngblist: if ngblist {
                Vec::with_capacity(tree.num_particles)
            } else {
                Vec::new()
            },
            ninteractions: 0,
            max_ninteractions: 0,
            min_ninteractions: u64::MAX,
        }
    }

    /// Walk state carrying this thread's export region (top-tree phase).
    pub fn with_exports(
        tree: &'a Tree,
        particles: &'a ParticleSet,
        exports: ExportRegion<'a>,
    ) -> Self {
        let mut lw = Self::new(WalkMode::TopTree, tree, particles, false);
        lw.exports = Some(exports);
        lw
    }

    /// This thread's export region, if it carries one.
    pub fn exports(&self) -> Option<&ExportRegion<'a>> {
        self.exports.as_ref()
    }

    /// Mutable access to the export region.
    pub fn exports_mut(&mut self) -> Option<&mut ExportRegion<'a>> {
        self.exports.as_mut()
    }

    /// Give the export region back (end of the top-tree phase).
    pub fn take_exports(&mut self) -> Option<ExportRegion<'a>> {
        self.exports.take()
    }

    /// Queue an export of the current target to the owner of `top_leaf`.
    ///
    /// # Panics
    /// Panics outside the top-tree phase: only the export enumeration may
    /// export.
    pub fn export_particle(&mut self, top_leaf: u32) -> Result<(), ExportFull> {
        if self.mode != WalkMode::TopTree {
            panic!("export attempted from the {:?} phase", self.mode);
        }
        let target = self.target.expect("top-tree walk has a local target");
        let tree = self.tree;
        self.exports
            .as_mut()
            .expect("top-tree walk carries an export region")
            .push(tree, target, top_leaf)
    }
}

/// Fold a query's candidate count into the thread counters. Only the
/// primary phase counts: exports are enumerated elsewhere and ghost work is
/// accounted by the exporting rank.
pub fn add_counters(lw: &mut LocalWalk<'_>, ninteractions: u64) {
    if lw.mode == WalkMode::Primary {
        if lw.max_ninteractions < ninteractions {
            lw.max_ninteractions = ninteractions;
        }
        if lw.min_ninteractions > ninteractions {
            lw.min_ninteractions = ninteractions;
        }
        lw.ninteractions += ninteractions;
    }
}

/// Build a query for particle `i`. `nodelist` of `None` means "start at the
/// local root" (primary and top-tree phases).
pub fn init_query<V: TreeWalk>(
    v: &V,
    p: &ParticleSet,
    tree: &Tree,
    i: u32,
    nodelist: Option<[i64; NODELIST_LEN]>,
) -> V::Query {
    let mut q = V::Query::zeroed();
    let head = q.head_mut();
    head.pos = p.pos[i as usize];
    head.id = p.id[i as usize];
    head.nodelist = nodelist.unwrap_or([tree.root(), -1]);
    v.fill(p, i, &mut q);
    q
}

/// Zeroed result carrying the query's identity echo.
pub fn init_result<V: TreeWalk>(q: &V::Query) -> V::Result {
    let mut r = V::Result::zeroed();
    r.head_mut().id = q.head().id;
    r
}

/// Buffered pair enumeration: walk each entry node, gather candidates, then
/// run the kernel over the in-range ones.
///
/// # Panics
/// Panics when the kernel requests particle types the tree does not contain,
/// or a symmetric walk runs against a tree without computed `hmax`.
pub fn visit_ngbiter<V: TreeWalk>(
    v: &V,
    q: &V::Query,
    r: &mut V::Result,
    lw: &mut LocalWalk<'_>,
) -> Result<(), ExportFull> {
    let mut iter = NgbIter::new();
    v.ngb_setup(q, &mut iter);

    let tree = lw.tree;
    if tree.mask & iter.mask != iter.mask {
        panic!(
            "{} walks particles with mask {:#x} but the tree mask is only {:#x}",
            V::LABEL,
            iter.mask,
            tree.mask
        );
    }
    if iter.symmetric == Symmetry::Symmetric && !tree.hmax_valid {
        panic!("{} tried a symmetric walk without computing hmax", V::LABEL);
    }

    let box_size = tree.box_size;
    let head = *q.head();
    let mut ninteractions: u64 = 0;

    for inode in 0..NODELIST_LEN {
        let start = head.nodelist[inode];
        if start < 0 {
            break;
        }
        let numcand = treefind(&head.pos, &iter, start, lw)?;

        // Export successful; now filter the candidates that are actually
        // inside and hand them to the kernel.
        let p = lw.particles;
        for k in 0..numcand {
            let other = lw.ngblist[k] as usize;

            if p.garbage[other] {
                continue;
            }
            // The particle type may have changed since the tree was built.
            if p.type_bit(other) & iter.mask == 0 {
                continue;
            }

            let dist = match iter.symmetric {
                Symmetry::Symmetric => p.hsml[other].max(iter.hsml),
                Symmetry::Asymmetric => iter.hsml,
            };
            let h2 = dist * dist;
            let mut r2 = 0.0;
            for d in 0..3 {
                // The separation vector points from `other` to the query.
                iter.dist[d] = nearest(head.pos[d] - p.pos[other][d], box_size);
                r2 += iter.dist[d] * iter.dist[d];
                if r2 > h2 {
                    break;
                }
            }
            if r2 > h2 {
                continue;
            }

            iter.r2 = r2;
            iter.r = r2.sqrt();
            iter.other = other;
            v.ngb_visit(q, r, &mut iter, p);
        }

        ninteractions += numcand as u64;
    }

    add_counters(lw, ninteractions);
    Ok(())
}

/// List-free pair enumeration for kernels that adapt the search radius
/// mid-walk: candidates are evaluated in place instead of being buffered.
/// Asymmetric searches only.
pub fn visit_nolist_ngbiter<V: TreeWalk>(
    v: &V,
    q: &V::Query,
    r: &mut V::Result,
    lw: &mut LocalWalk<'_>,
) -> Result<(), ExportFull> {
    let mut iter = NgbIter::new();
    v.ngb_setup(q, &mut iter);

    let tree = lw.tree;
    let box_size = tree.box_size;
    let head = *q.head();
    let mut ninteractions: u64 = 0;

    let nlist = match lw.mode {
        WalkMode::Ghosts => NODELIST_LEN,
        _ => 1,
    };
    for inode in 0..nlist {
        let start = head.nodelist[inode];
        if start < 0 {
            break;
        }
        let mut no = start;
        while no >= 0 {
            let node = tree.node(no);

            // Imported queries start from the encompassing top-level node;
            // reaching another one means the branch is exhausted.
            if lw.mode == WalkMode::Ghosts && node.top_level && no != start {
                break;
            }

            if !cull_node(&head.pos, &iter, node, box_size) {
                no = node.sibling;
                continue;
            }

            match &node.children {
                NodeChildren::Particles(list) => {
                    if lw.mode != WalkMode::TopTree {
                        let p = lw.particles;
                        for &cand in list {
                            let other = cand as usize;
                            if p.garbage[other] {
                                continue;
                            }
                            if p.type_bit(other) & iter.mask == 0 {
                                continue;
                            }
                            // Re-read hsml each candidate: the kernel may
                            // have narrowed it.
                            let h2 = iter.hsml * iter.hsml;
                            let mut r2 = 0.0;
                            for d in 0..3 {
                                iter.dist[d] =
                                    nearest(head.pos[d] - p.pos[other][d], box_size);
                                r2 += iter.dist[d] * iter.dist[d];
                                if r2 > h2 {
                                    break;
                                }
                            }
                            if r2 > h2 {
                                continue;
                            }
                            iter.r2 = r2;
                            iter.r = r2.sqrt();
                            iter.other = other;
                            v.ngb_visit(q, r, &mut iter, p);
                            ninteractions += 1;
                        }
                    }
                    no = node.sibling;
                }
                NodeChildren::Pseudo { top_leaf } => {
                    let top_leaf = *top_leaf;
                    let sibling = node.sibling;
                    match lw.mode {
                        WalkMode::TopTree => {
                            lw.export_particle(top_leaf)?;
                            no = sibling;
                        }
                        WalkMode::Primary => {
                            // Already queued for export by the top-tree phase.
                            no = sibling;
                        }
                        WalkMode::Ghosts => {
                            panic!(
                                "pseudo node {} reached while walking an imported query from node {}",
                                no, start
                            );
                        }
                    }
                }
                NodeChildren::Nodes { first, .. } => {
                    if lw.mode == WalkMode::TopTree && !node.internal_top_level {
                        // The export enumeration never opens local branches.
                        no = node.sibling;
                    } else {
                        no = *first;
                    }
                }
            }
        }
    }

    add_counters(lw, ninteractions);
    Ok(())
}

/// Descend the tree from `startnode`, appending candidate particles to the
/// thread's buffer and exporting pseudo nodes in the top-tree phase.
/// Returns the candidate count, or [`ExportFull`] when the thread's export
/// region overflows (top-tree phase only).
///
/// # Panics
/// Panics on a pseudo node in the ghost phase: the exporting rank only names
/// entry nodes it owns, so an imported walk can never cross a sub-domain
/// boundary.
pub fn treefind(
    pos: &[f64; 3],
    iter: &NgbIter,
    startnode: i64,
    lw: &mut LocalWalk<'_>,
) -> Result<usize, ExportFull> {
    lw.ngblist.clear();
    let tree = lw.tree;
    let box_size = tree.box_size;

    let mut no = startnode;
    while no >= 0 {
        let node = tree.node(no);

        // Imported queries start from the encompassing top-level node;
        // reaching another one means the branch is exhausted.
        if lw.mode == WalkMode::Ghosts && node.top_level && no != startnode {
            break;
        }

        if !cull_node(pos, iter, node, box_size) {
            no = node.sibling;
            continue;
        }

        match &node.children {
            NodeChildren::Particles(list) => {
                if lw.mode != WalkMode::TopTree {
                    lw.ngblist.extend_from_slice(list);
                }
                no = node.sibling;
            }
            NodeChildren::Pseudo { top_leaf } => {
                let top_leaf = *top_leaf;
                let sibling = node.sibling;
                match lw.mode {
                    WalkMode::TopTree => {
                        lw.export_particle(top_leaf)?;
                        no = sibling;
                    }
                    WalkMode::Primary => {
                        // Already queued for export by the top-tree phase.
                        no = sibling;
                    }
                    WalkMode::Ghosts => {
                        panic!(
                            "pseudo node {} reached while walking an imported query from node {}",
                            no, startnode
                        );
                    }
                }
            }
            NodeChildren::Nodes { first, .. } => {
                if lw.mode == WalkMode::TopTree && !node.internal_top_level {
                    // The export enumeration never opens local branches.
                    no = node.sibling;
                } else {
                    no = *first;
                }
            }
        }
    }

    Ok(lw.ngblist.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::treebuild::{build_tree, TreeBuildParams};

    /// Counts in-range neighbours into the result payload.
    struct CountWalk {
        hsml: f64,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Pod, Zeroable)]
    struct CountQuery {
        head: QueryHead,
        hsml: f64,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Pod, Zeroable)]
    struct CountResult {
        head: ResultHead,
        ngb: u64,
    }

    impl WalkQuery for CountQuery {
        fn head(&self) -> &QueryHead {
            &self.head
        }
        fn head_mut(&mut self) -> &mut QueryHead {
            &mut self.head
        }
    }

    impl WalkResult for CountResult {
        fn head(&self) -> &ResultHead {
            &self.head
        }
        fn head_mut(&mut self) -> &mut ResultHead {
            &mut self.head
        }
    }

    impl TreeWalk for CountWalk {
        type Query = CountQuery;
        type Result = CountResult;
        const LABEL: &'static str = "COUNT";

        fn fill(&self, _p: &ParticleSet, _i: u32, q: &mut CountQuery) {
            q.hsml = self.hsml;
        }

        fn ngb_setup(&self, q: &CountQuery, iter: &mut NgbIter) {
            iter.hsml = q.hsml;
            iter.mask = 1;
            iter.symmetric = Symmetry::Asymmetric;
        }

        fn ngb_visit(
            &self,
            _q: &CountQuery,
            r: &mut CountResult,
            _iter: &mut NgbIter,
            _p: &ParticleSet,
        ) {
            r.ngb += 1;
        }

        fn reduce(&self, _i: u32, _r: &CountResult, _mode: ReduceMode, _p: &ParticleSet) {}
    }

    fn grid_particles(n_side: usize, box_size: f64) -> ParticleSet {
        let mut p = ParticleSet::new();
        let spacing = box_size / n_side as f64;
        let mut id = 0;
        for i in 0..n_side {
            for j in 0..n_side {
                for k in 0..n_side {
                    let pos = [
                        (i as f64 + 0.5) * spacing,
                        (j as f64 + 0.5) * spacing,
                        (k as f64 + 0.5) * spacing,
                    ];
                    p.push_particle(pos, 0, 0.2, id);
                    id += 1;
                }
            }
        }
        p
    }

    fn brute_count(p: &ParticleSet, i: usize, hsml: f64, box_size: f64) -> u64 {
        let mut n = 0;
        for j in 0..p.len() {
            if p.garbage[j] {
                continue;
            }
            let r2: f64 = (0..3)
                .map(|d| nearest(p.pos[i][d] - p.pos[j][d], box_size).powi(2))
                .sum();
            if r2 <= hsml * hsml {
                n += 1;
            }
        }
        n
    }

    fn single_rank_tree(p: &ParticleSet) -> crate::tree::Tree {
        build_tree(
            p,
            &TreeBuildParams {
                box_size: 1.0,
                top_levels: 1,
                rank: 0,
                ntask: 1,
                mask: 1,
                with_hmax: false,
            },
        )
    }

    #[test]
    fn primary_walk_matches_brute_force() {
        let p = grid_particles(5, 1.0);
        let tree = single_rank_tree(&p);
        let walk = CountWalk { hsml: 0.25 };

        let mut lw = LocalWalk::new(WalkMode::Primary, &tree, &p, true);
        for i in 0..p.len() as u32 {
            lw.target = Some(i);
            let q = init_query(&walk, &p, &tree, i, None);
            let mut r = init_result::<CountWalk>(&q);
            walk.visit(&q, &mut r, &mut lw).unwrap();
            assert_eq!(
                r.ngb,
                brute_count(&p, i as usize, 0.25, 1.0),
                "particle {} neighbour count",
                i
            );
        }
    }

    #[test]
    fn nolist_walk_matches_buffered_walk() {
        let p = grid_particles(4, 1.0);
        let tree = single_rank_tree(&p);
        let walk = CountWalk { hsml: 0.3 };

        let mut lw = LocalWalk::new(WalkMode::Primary, &tree, &p, true);
        for i in 0..p.len() as u32 {
            lw.target = Some(i);
            let q = init_query(&walk, &p, &tree, i, None);
            let mut buffered = init_result::<CountWalk>(&q);
            let mut nolist = init_result::<CountWalk>(&q);
            visit_ngbiter(&walk, &q, &mut buffered, &mut lw).unwrap();
            visit_nolist_ngbiter(&walk, &q, &mut nolist, &mut lw).unwrap();
            assert_eq!(buffered.ngb, nolist.ngb);
        }
    }

    #[test]
    fn garbage_particles_are_skipped() {
        let mut p = grid_particles(3, 1.0);
        let i = 13; // centre of the 3x3x3 grid
        let expected = brute_count(&p, i, 0.5, 1.0);
        p.garbage[0] = true;
        let tree = single_rank_tree(&p);
        let walk = CountWalk { hsml: 0.5 };

        let mut lw = LocalWalk::new(WalkMode::Primary, &tree, &p, true);
        lw.target = Some(i as u32);
        let q = init_query(&walk, &p, &tree, i as u32, None);
        let mut r = init_result::<CountWalk>(&q);
        walk.visit(&q, &mut r, &mut lw).unwrap();
        assert_eq!(r.ngb, expected - 1);
    }

    #[test]
    fn periodic_wrap_pairs_opposite_faces() {
        // Two particles a distance 2*eps apart through the boundary.
        let eps = 0.05;
        let mut p = ParticleSet::new();
        p.push_particle([eps, 0.5, 0.5], 0, 0.2, 0);
        p.push_particle([1.0 - eps, 0.5, 0.5], 0, 0.2, 1);
        let tree = single_rank_tree(&p);

        // 2*eps <= hsml: counted.
        let walk = CountWalk { hsml: 2.0 * eps + 1e-9 };
        let mut lw = LocalWalk::new(WalkMode::Primary, &tree, &p, true);
        lw.target = Some(0);
        let q = init_query(&walk, &p, &tree, 0, None);
        let mut r = init_result::<CountWalk>(&q);
        walk.visit(&q, &mut r, &mut lw).unwrap();
        assert_eq!(r.ngb, 2);

        // 2*eps > hsml: only the particle itself.
        let walk = CountWalk { hsml: 2.0 * eps - 1e-9 };
        let q = init_query(&walk, &p, &tree, 0, None);
        let mut r = init_result::<CountWalk>(&q);
        walk.visit(&q, &mut r, &mut lw).unwrap();
        assert_eq!(r.ngb, 1);
    }

    #[test]
    #[should_panic(expected = "tree mask")]
    fn mask_wider_than_tree_is_fatal() {
        struct WideMask;
        impl TreeWalk for WideMask {
            type Query = QueryHead;
            type Result = ResultHead;
            const LABEL: &'static str = "WIDE";
            fn fill(&self, _p: &ParticleSet, _i: u32, _q: &mut QueryHead) {}
            fn ngb_setup(&self, _q: &QueryHead, iter: &mut NgbIter) {
                iter.hsml = 0.1;
                iter.mask = 0b11; // tree only carries type 0
            }
            fn ngb_visit(
                &self,
                _q: &QueryHead,
                _r: &mut ResultHead,
                _iter: &mut NgbIter,
                _p: &ParticleSet,
            ) {
            }
            fn reduce(&self, _i: u32, _r: &ResultHead, _mode: ReduceMode, _p: &ParticleSet) {}
        }

        let p = grid_particles(2, 1.0);
        let tree = single_rank_tree(&p);
        let mut lw = LocalWalk::new(WalkMode::Primary, &tree, &p, true);
        lw.target = Some(0);
        let walk = WideMask;
        let q = init_query(&walk, &p, &tree, 0, None);
        let mut r = init_result::<WideMask>(&q);
        let _ = walk.visit(&q, &mut r, &mut lw);
    }

    #[test]
    #[should_panic(expected = "without computing hmax")]
    fn symmetric_walk_needs_hmax() {
        struct Sym;
        impl TreeWalk for Sym {
            type Query = QueryHead;
            type Result = ResultHead;
            const LABEL: &'static str = "SYM";
            fn fill(&self, _p: &ParticleSet, _i: u32, _q: &mut QueryHead) {}
            fn ngb_setup(&self, _q: &QueryHead, iter: &mut NgbIter) {
                iter.hsml = 0.1;
                iter.mask = 1;
                iter.symmetric = Symmetry::Symmetric;
            }
            fn ngb_visit(
                &self,
                _q: &QueryHead,
                _r: &mut ResultHead,
                _iter: &mut NgbIter,
                _p: &ParticleSet,
            ) {
            }
            fn reduce(&self, _i: u32, _r: &ResultHead, _mode: ReduceMode, _p: &ParticleSet) {}
        }

        let p = grid_particles(2, 1.0);
        let tree = single_rank_tree(&p); // with_hmax: false
        let mut lw = LocalWalk::new(WalkMode::Primary, &tree, &p, true);
        lw.target = Some(0);
        let walk = Sym;
        let q = init_query(&walk, &p, &tree, 0, None);
        let mut r = init_result::<Sym>(&q);
        let _ = walk.visit(&q, &mut r, &mut lw);
    }

    #[test]
    #[should_panic(expected = "export attempted from")]
    fn export_outside_toptree_is_fatal() {
        let p = grid_particles(2, 1.0);
        let tree = single_rank_tree(&p);
        let mut lw = LocalWalk::new(WalkMode::Primary, &tree, &p, false);
        lw.target = Some(0);
        let _ = lw.export_particle(0);
    }
}
