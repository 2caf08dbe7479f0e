//! Reference validation for the distributed tree-walk engine.
//!
//! This crate drives the engine end-to-end on the in-process communicator
//! (ranks as threads) and compares against brute-force solutions from
//! [`analytical`]. The scenarios cover the single-rank baseline, the
//! mirror-split two-rank case, forced export-buffer overflow, adaptive
//! radius convergence, the symmetric-walk guard, and export coalescing.

pub mod analytical;

#[cfg(test)]
mod tests;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

use bytemuck::{Pod, Zeroable};
use kernel::{
    build_tree, visit_nolist_ngbiter, ExportFull, LocalWalk, NgbIter, ParticleSet, PostContext,
    QueryHead, ReduceMode, ResultHead, ScatterBuf, Symmetry, TreeBuildParams, TreeWalk, WalkQuery,
    WalkResult,
};
use orchestrator::{hsml_loop, narrow_down, EngineParams, LocalComm, LocalUniverse, WalkEngine, MAXITER};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Box side length shared by every scenario.
pub const BOX_SIZE: f64 = 1.0;

/// Outcome of one validation scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario name.
    pub name: &'static str,
    /// Whether every check held.
    pub passed: bool,
    /// Human-readable findings.
    pub detail: String,
}

impl ScenarioResult {
    fn pass(name: &'static str, detail: String) -> Self {
        Self {
            name,
            passed: true,
            detail,
        }
    }

    fn fail(name: &'static str, detail: String) -> Self {
        Self {
            name,
            passed: false,
            detail,
        }
    }
}

// ---------------------------------------------------------------------------
// Reference kernels
// ---------------------------------------------------------------------------

/// Neighbour-counting kernel: integer counts plus a float accumulator whose
/// bit pattern exposes any ordering difference.
pub struct CountWalk {
    hsml: f64,
    /// Per-particle neighbour counts.
    pub counts: ScatterBuf<u64>,
    /// Per-particle kernel-weight sums (order-sensitive check value).
    pub weights: ScatterBuf<f64>,
}

impl CountWalk {
    /// Counting kernel with a fixed search radius over `n` particles.
    pub fn new(hsml: f64, n: usize) -> Self {
        Self {
            hsml,
            counts: ScatterBuf::new(n, 0),
            weights: ScatterBuf::new(n, 0.0),
        }
    }
}

/// Query payload of [`CountWalk`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CountQuery {
    head: QueryHead,
    hsml: f64,
}

/// Result payload of [`CountWalk`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CountResult {
    head: ResultHead,
    ngb: u64,
    wsum: f64,
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

    fn ngb_visit(&self, q: &CountQuery, r: &mut CountResult, iter: &mut NgbIter, _p: &ParticleSet) {
        r.ngb += 1;
        r.wsum += 1.0 - iter.r / q.hsml;
    }

    fn reduce(&self, i: u32, r: &CountResult, mode: ReduceMode, _p: &ParticleSet) {
        match mode {
            ReduceMode::Primary => {
                self.counts.set(i as usize, r.ngb);
                self.weights.set(i as usize, r.wsum);
            }
            ReduceMode::Ghosts => {
                self.counts.update(i as usize, |c| c + r.ngb);
                self.weights.update(i as usize, |w| w + r.wsum);
            }
        }
    }
}

/// Symmetric variant of the counting kernel, for the hmax guard scenario.
struct SymmetricCountWalk(CountWalk);

impl TreeWalk for SymmetricCountWalk {
    type Query = CountQuery;
    type Result = CountResult;
    const LABEL: &'static str = "SYMCOUNT";

    fn fill(&self, p: &ParticleSet, i: u32, q: &mut CountQuery) {
        self.0.fill(p, i, q)
    }
    fn ngb_setup(&self, q: &CountQuery, iter: &mut NgbIter) {
        self.0.ngb_setup(q, iter);
        iter.symmetric = Symmetry::Symmetric;
    }
    fn ngb_visit(&self, q: &CountQuery, r: &mut CountResult, it: &mut NgbIter, p: &ParticleSet) {
        self.0.ngb_visit(q, r, it, p)
    }
    fn reduce(&self, i: u32, r: &CountResult, mode: ReduceMode, p: &ParticleSet) {
        self.0.reduce(i, r, mode, p)
    }
}

/// Density-style adaptive kernel: walks list-free, re-queues particles whose
/// neighbour count misses the target, and narrows the radius between passes.
pub struct AdaptiveNgbWalk {
    /// Neighbour-count target.
    pub target: f64,
    /// Acceptable deviation from the target.
    pub tolerance: f64,
    /// Working search radii.
    pub hsml: ScatterBuf<f64>,
    /// Latest neighbour counts.
    pub numngb: ScatterBuf<f64>,
    left: ScatterBuf<f64>,
    right: ScatterBuf<f64>,
}

impl AdaptiveNgbWalk {
    /// Adaptive kernel over `n` particles, starting all radii at
    /// `initial_hsml`.
    pub fn new(n: usize, initial_hsml: f64, target: f64, tolerance: f64) -> Self {
        Self {
            target,
            tolerance,
            hsml: ScatterBuf::new(n, initial_hsml),
            numngb: ScatterBuf::new(n, 0.0),
            left: ScatterBuf::new(n, 0.0),
            right: ScatterBuf::new(n, 1e30),
        }
    }
}

/// Query payload of [`AdaptiveNgbWalk`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct NgbQuery {
    head: QueryHead,
    hsml: f64,
}

/// Result payload of [`AdaptiveNgbWalk`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct NgbResult {
    head: ResultHead,
    numngb: f64,
}

impl WalkQuery for NgbQuery {
    fn head(&self) -> &QueryHead {
        &self.head
    }
    fn head_mut(&mut self) -> &mut QueryHead {
        &mut self.head
    }
}

impl WalkResult for NgbResult {
    fn head(&self) -> &ResultHead {
        &self.head
    }
    fn head_mut(&mut self) -> &mut ResultHead {
        &mut self.head
    }
}

impl TreeWalk for AdaptiveNgbWalk {
    type Query = NgbQuery;
    type Result = NgbResult;
    const LABEL: &'static str = "ADAPTNGB";
    const HAS_POSTPROCESS: bool = true;

    fn fill(&self, _p: &ParticleSet, i: u32, q: &mut NgbQuery) {
        q.hsml = self.hsml.get(i as usize);
    }

    fn ngb_setup(&self, q: &NgbQuery, iter: &mut NgbIter) {
        iter.hsml = q.hsml;
        iter.mask = 1;
        iter.symmetric = Symmetry::Asymmetric;
    }

    fn ngb_visit(&self, _q: &NgbQuery, r: &mut NgbResult, _iter: &mut NgbIter, _p: &ParticleSet) {
        r.numngb += 1.0;
    }

    fn visit(
        &self,
        q: &NgbQuery,
        r: &mut NgbResult,
        lw: &mut LocalWalk<'_>,
    ) -> Result<(), ExportFull> {
        visit_nolist_ngbiter(self, q, r, lw)
    }

    fn reduce(&self, i: u32, r: &NgbResult, mode: ReduceMode, _p: &ParticleSet) {
        match mode {
            ReduceMode::Primary => self.numngb.set(i as usize, r.numngb),
            ReduceMode::Ghosts => self.numngb.update(i as usize, |n| n + r.numngb),
        }
    }

    fn postprocess(&self, _p: &ParticleSet, i: u32, ctx: &mut PostContext) {
        let i = i as usize;
        let n = self.numngb.get(i);
        ctx.record_ngb(n);
        if (n - self.target).abs() <= self.tolerance {
            return;
        }

        let mut left = self.left.get(i);
        let mut right = self.right.get(i);
        let h = self.hsml.get(i);
        if n < self.target - self.tolerance {
            left = left.max(h);
        } else {
            right = right.min(h);
        }

        let new_hsml = if left > 0.0 && right < BOX_SIZE {
            (0.5 * (left.powi(3) + right.powi(3))).cbrt()
        } else {
            let (guess, _) =
                narrow_down(&mut right, &mut left, &[h], &[n], 1, self.target, BOX_SIZE);
            guess
        };

        self.left.set(i, left);
        self.right.set(i, right);
        self.hsml.set(i, new_hsml);
        ctx.redo.push(i as u32);
    }
}

// ---------------------------------------------------------------------------
// Fixtures and cluster scaffolding
// ---------------------------------------------------------------------------

/// `n` uniformly random particles in the unit box.
pub fn random_particles(n: usize, seed: u64, hsml: f64) -> ParticleSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut p = ParticleSet::new();
    for id in 0..n {
        p.push_particle(
            [rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()],
            0,
            hsml,
            id as u64,
        );
    }
    p
}

/// Build-parameter boilerplate for the scenario trees.
pub fn tree_params(rank: usize, ntask: usize) -> TreeBuildParams {
    TreeBuildParams {
        box_size: BOX_SIZE,
        top_levels: 1,
        rank: rank as u32,
        ntask: ntask as u32,
        mask: 1,
        with_hmax: false,
    }
}

/// Split a global particle set between ranks by top-leaf ownership.
pub fn domain_split(all: &ParticleSet, ntask: usize) -> Vec<ParticleSet> {
    let probe = build_tree(&ParticleSet::new(), &tree_params(0, ntask));
    let mut parts: Vec<ParticleSet> = (0..ntask).map(|_| ParticleSet::new()).collect();
    for i in 0..all.len() {
        let leaf = probe.locate_top_leaf(&all.pos[i]).expect("in box");
        let owner = probe.top_leaf(leaf).task as usize;
        parts[owner].push_particle(all.pos[i], all.ptype[i], all.hsml[i], all.id[i]);
    }
    parts
}

/// Run one closure per rank over a fresh `LocalUniverse`.
pub fn run_cluster<R, F>(nranks: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(usize, &LocalComm) -> R + Sync,
{
    let comms = LocalUniverse::new(nranks);
    let f = &f;
    thread::scope(|s| {
        comms
            .iter()
            .enumerate()
            .map(|(rank, comm)| s.spawn(move || f(rank, comm)))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

/// Per-particle engine output of a counting run, keyed by particle id, plus
/// the walk's iteration count, export total, and interaction total.
pub struct CountRunOutput {
    /// `(count, weight bits)` indexed by particle id.
    pub by_id: Vec<(u64, u64)>,
    /// Outer iterations per rank.
    pub nexportfull: Vec<u64>,
    /// Export records per rank.
    pub nexport_sum: Vec<u64>,
    /// Primary-phase candidate interactions per rank.
    pub ninteractions: Vec<u64>,
}

/// Run the counting kernel over `all` on `ntask` ranks.
pub fn run_count_cluster(
    all: &ParticleSet,
    ntask: usize,
    hsml: f64,
    bunch_size: Option<usize>,
    threads: usize,
) -> CountRunOutput {
    let outs = run_cluster(ntask, |rank, comm| {
        let mine = domain_split(all, ntask).swap_remove(rank);
        let tree = build_tree(&mine, &tree_params(rank, ntask));
        let walk = CountWalk::new(hsml, mine.len());
        let params = EngineParams {
            threads: Some(threads),
            bunch_size,
            ..EngineParams::default()
        };
        let mut engine = WalkEngine::new(comm, params);
        let stats = engine.run(&walk, &tree, &mine, None).expect("walk ok");
        let per: Vec<(u64, u64, u64)> = (0..mine.len())
            .map(|i| (mine.id[i], walk.counts.get(i), walk.weights.get(i).to_bits()))
            .collect();
        (per, stats.nexportfull, stats.nexport_sum, stats.ninteractions)
    });

    let mut out = CountRunOutput {
        by_id: vec![(0, 0); all.len()],
        nexportfull: Vec::new(),
        nexport_sum: Vec::new(),
        ninteractions: Vec::new(),
    };
    for (per, full, exports, inter) in outs {
        for (id, count, bits) in per {
            out.by_id[id as usize] = (count, bits);
        }
        out.nexportfull.push(full);
        out.nexport_sum.push(exports);
        out.ninteractions.push(inter);
    }
    out
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// S1: single rank, 100 particles, Hsml 0.2 -- per-particle counts equal the
/// brute-force result.
pub fn s1_single_rank_baseline() -> ScenarioResult {
    let name = "S1 single-rank baseline";
    let all = random_particles(100, 1001, 0.2);
    let expected = analytical::brute_force_counts(&all, 0.2, BOX_SIZE);
    let got = run_count_cluster(&all, 1, 0.2, None, 2);
    for (id, &exp) in expected.iter().enumerate() {
        if got.by_id[id].0 != exp {
            return ScenarioResult::fail(
                name,
                format!("particle {}: engine {} vs brute force {}", id, got.by_id[id].0, exp),
            );
        }
    }
    // With one rank the primary candidates are the only candidates; the
    // accepted pairs can never exceed them.
    let pairs = analytical::total_pairs(&expected);
    if got.ninteractions[0] < pairs {
        return ScenarioResult::fail(
            name,
            format!("candidate total {} below pair total {}", got.ninteractions[0], pairs),
        );
    }
    ScenarioResult::pass(name, format!("100 particles, {} pairs", pairs))
}

/// S2: the same particles mirror-split over two ranks -- merged counts equal
/// the single-rank ones.
pub fn s2_two_rank_merge() -> ScenarioResult {
    let name = "S2 two-rank merge";
    let all = random_particles(100, 1002, 0.2);
    let single = run_count_cluster(&all, 1, 0.2, None, 2);
    let double = run_count_cluster(&all, 2, 0.2, None, 2);
    for id in 0..all.len() {
        if single.by_id[id].0 != double.by_id[id].0 {
            return ScenarioResult::fail(
                name,
                format!(
                    "particle {}: 1-rank count {} vs 2-rank count {}",
                    id, single.by_id[id].0, double.by_id[id].0
                ),
            );
        }
    }
    let exported: u64 = double.nexport_sum.iter().sum();
    ScenarioResult::pass(name, format!("{} exports across the split", exported))
}

/// S3: BunchSize 16 on 1024 particles -- multiple outer iterations, results
/// bitwise identical to the unbounded run.
pub fn s3_forced_overflow() -> ScenarioResult {
    let name = "S3 forced overflow";
    let all = random_particles(1024, 1003, 0.2);
    let unbounded = run_count_cluster(&all, 2, 0.2, None, 2);
    let squeezed = run_count_cluster(&all, 2, 0.2, Some(16), 2);
    if squeezed.by_id != unbounded.by_id {
        return ScenarioResult::fail(name, "results depend on BunchSize".into());
    }
    let max_full = *squeezed.nexportfull.iter().max().expect("two ranks");
    if max_full < 2 {
        return ScenarioResult::fail(
            name,
            format!("expected >= 2 outer iterations, saw {}", max_full),
        );
    }
    ScenarioResult::pass(name, format!("{} outer iterations, bitwise equal", max_full))
}

/// S4: the adaptive loop drives every particle to 32 +/- 2 neighbours
/// within the iteration ceiling.
pub fn s4_hsml_convergence() -> ScenarioResult {
    let name = "S4 hsml convergence";
    let all = random_particles(2000, 1004, 0.05);
    let outs = run_cluster(2, |rank, comm| {
        let mine = domain_split(&all, 2).swap_remove(rank);
        let tree = build_tree(&mine, &tree_params(rank, 2));
        let walk = AdaptiveNgbWalk::new(mine.len(), 0.05, 32.0, 2.0);
        let params = EngineParams {
            threads: Some(2),
            no_ngblist: true,
            ..EngineParams::default()
        };
        let mut engine = WalkEngine::new(comm, params);
        let stats = hsml_loop(&mut engine, &walk, &tree, &mine, None, true, MAXITER)
            .expect("hsml loop converges");
        let worst = (0..mine.len())
            .map(|i| (walk.numngb.get(i) - 32.0).abs())
            .fold(0.0f64, f64::max);
        (stats.passes, worst)
    });
    for (passes, worst) in &outs {
        if *passes > MAXITER {
            return ScenarioResult::fail(name, format!("{} passes", passes));
        }
        if *worst > 2.0 {
            return ScenarioResult::fail(
                name,
                format!("worst deviation {} neighbours", worst),
            );
        }
    }
    let passes = outs.iter().map(|o| o.0).max().expect("two ranks");
    ScenarioResult::pass(name, format!("converged in {} passes", passes))
}

/// S5: a symmetric walk against a tree without computed hmax must abort
/// with the documented diagnostic.
pub fn s5_symmetric_guard() -> ScenarioResult {
    let name = "S5 symmetric hmax guard";
    let all = random_particles(32, 1005, 0.2);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let comms = LocalUniverse::new(1);
        let tree = build_tree(&all, &tree_params(0, 1)); // hmax not computed
        let walk = SymmetricCountWalk(CountWalk::new(0.2, all.len()));
        let mut engine = WalkEngine::new(
            &comms[0],
            EngineParams {
                threads: Some(2),
                ..EngineParams::default()
            },
        );
        let _ = engine.run(&walk, &tree, &all, None);
    }));
    match outcome {
        Err(payload) => {
            let msg = payload
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_default();
            if msg.contains("without computing hmax") {
                ScenarioResult::pass(name, format!("aborted: {}", msg))
            } else {
                ScenarioResult::fail(name, format!("wrong diagnostic: {}", msg))
            }
        }
        Ok(()) => ScenarioResult::fail(name, "symmetric walk ran without hmax".into()),
    }
}

/// S6: one particle visiting two remote nodes on the same peer rank
/// consecutively produces exactly one export record per node pair.
pub fn s6_export_coalescing() -> ScenarioResult {
    let name = "S6 export coalescing";
    let mut all = ParticleSet::new();
    all.push_particle([0.75, 0.75, 0.75], 0, 0.4, 0);
    all.push_particle([0.25, 0.25, 0.25], 0, 0.1, 1);
    let out = run_count_cluster(&all, 2, 0.9, None, 2);
    // Each rank holds one particle seeing all four of the peer's top
    // leaves: pairwise coalescing leaves two records per rank.
    if out.nexport_sum != vec![2, 2] {
        return ScenarioResult::fail(
            name,
            format!("export records per rank: {:?}", out.nexport_sum),
        );
    }
    ScenarioResult::pass(name, "4 pseudo visits -> 2 records per rank".into())
}

/// Run every scenario in order.
pub fn run_all_scenarios() -> Vec<ScenarioResult> {
    vec![
        s1_single_rank_baseline(),
        s2_two_rank_merge(),
        s3_forced_overflow(),
        s4_hsml_convergence(),
        s5_symmetric_guard(),
        s6_export_coalescing(),
    ]
}
