//! Multi-rank engine validation on the in-process mailbox backend: each
//! rank is a thread holding its own particles, its own tree, and one
//! `WalkEngine`, all joined through a `LocalUniverse`.

use std::thread;

use bytemuck::{Pod, Zeroable};
use kernel::{
    build_tree, nearest, NgbIter, ParticleSet, QueryHead, ReduceMode, ResultHead, ScatterBuf,
    Symmetry, Tree, TreeBuildParams, TreeWalk, WalkQuery, WalkResult,
};
use orchestrator::{EngineParams, LocalComm, LocalUniverse, WalkEngine};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const NTHREAD: usize = 2;

// ---------------------------------------------------------------------------
// A neighbour-count kernel with a deterministic float accumulator, so
// "bitwise identical" means something.
// ---------------------------------------------------------------------------

struct CountWalk {
    hsml: f64,
    counts: ScatterBuf<u64>,
    weights: ScatterBuf<f64>,
}

impl CountWalk {
    fn new(hsml: f64, n: usize) -> Self {
        Self {
            hsml,
            counts: ScatterBuf::new(n, 0),
            weights: ScatterBuf::new(n, 0.0),
        }
    }
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
            // The local pass assigns, so a re-evaluation cannot double-count.
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

// ---------------------------------------------------------------------------
// Cluster scaffolding
// ---------------------------------------------------------------------------

fn run_cluster<R, F>(nranks: usize, f: F) -> Vec<R>
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

fn build_params(rank: usize, ntask: usize) -> TreeBuildParams {
    TreeBuildParams {
        box_size: 1.0,
        top_levels: 1,
        rank: rank as u32,
        ntask: ntask as u32,
        mask: 1,
        with_hmax: false,
    }
}

/// Split a global particle set by top-leaf ownership.
fn domain_split(all: &ParticleSet, ntask: usize) -> Vec<ParticleSet> {
    let probe = build_tree(&ParticleSet::new(), &build_params(0, ntask));
    let mut parts: Vec<ParticleSet> = (0..ntask).map(|_| ParticleSet::new()).collect();
    for i in 0..all.len() {
        let leaf = probe.locate_top_leaf(&all.pos[i]).expect("in box");
        let owner = probe.top_leaf(leaf).task as usize;
        parts[owner].push_particle(all.pos[i], all.ptype[i], all.hsml[i], all.id[i]);
    }
    parts
}

fn random_particles(n: usize, seed: u64) -> ParticleSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut p = ParticleSet::new();
    for id in 0..n {
        p.push_particle(
            [rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()],
            0,
            0.1,
            id as u64,
        );
    }
    p
}

fn brute_count(all: &ParticleSet, pos: &[f64; 3], hsml: f64) -> u64 {
    (0..all.len())
        .filter(|&j| {
            let r2: f64 = (0..3)
                .map(|d| nearest(pos[d] - all.pos[j][d], 1.0).powi(2))
                .sum();
            r2 <= hsml * hsml
        })
        .count() as u64
}

fn engine_params(bunch_size: Option<usize>) -> EngineParams {
    EngineParams {
        threads: Some(NTHREAD),
        bunch_size,
        ..EngineParams::default()
    }
}

/// Run the count walk on one rank's slice; returns per-particle
/// (id, count, weight-bits) plus the walk's iteration and export totals.
fn run_count_rank(
    rank: usize,
    comm: &LocalComm,
    all: &ParticleSet,
    ntask: usize,
    hsml: f64,
    bunch_size: Option<usize>,
) -> (Vec<(u64, u64, u64)>, u64, u64) {
    let mine = domain_split(all, ntask).swap_remove(rank);
    let tree = build_tree(&mine, &build_params(rank, ntask));
    let walk = CountWalk::new(hsml, mine.len());
    let mut engine = WalkEngine::new(comm, engine_params(bunch_size));
    let stats = engine
        .run(&walk, &tree, &mine, None)
        .expect("walk must succeed");
    let per_particle = (0..mine.len())
        .map(|i| {
            (
                mine.id[i],
                walk.counts.get(i),
                walk.weights.get(i).to_bits(),
            )
        })
        .collect();
    (per_particle, stats.nexportfull, stats.nexport_sum)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn two_rank_counts_match_brute_force() {
    let all = random_particles(240, 42);
    let hsml = 0.3;
    let outs = run_cluster(2, |rank, comm| {
        run_count_rank(rank, comm, &all, 2, hsml, None)
    });

    let mut checked = 0;
    for (per_particle, nexportfull, _) in &outs {
        assert_eq!(*nexportfull, 1, "no overflow expected with a default table");
        for &(id, count, _) in per_particle {
            let expected = brute_count(&all, &all.pos[id as usize], hsml);
            assert_eq!(count, expected, "particle id {}", id);
            checked += 1;
        }
    }
    assert_eq!(checked, all.len());
}

#[test]
fn three_rank_counts_match_brute_force() {
    let all = random_particles(300, 7);
    let hsml = 0.25;
    let outs = run_cluster(3, |rank, comm| {
        run_count_rank(rank, comm, &all, 3, hsml, None)
    });
    for (per_particle, _, _) in &outs {
        for &(id, count, _) in per_particle {
            assert_eq!(count, brute_count(&all, &all.pos[id as usize], hsml));
        }
    }
}

#[test]
fn forced_overflow_is_bitwise_identical_to_unbounded() {
    let all = random_particles(1024, 9);
    let hsml = 0.2;

    let unbounded = run_cluster(2, |rank, comm| {
        run_count_rank(rank, comm, &all, 2, hsml, None)
    });
    let squeezed = run_cluster(2, |rank, comm| {
        run_count_rank(rank, comm, &all, 2, hsml, Some(16))
    });

    let mut overflowed = false;
    for rank in 0..2 {
        let (full, n_full, _) = &unbounded[rank];
        let (tight, n_tight, _) = &squeezed[rank];
        assert_eq!(*n_full, 1);
        if *n_tight >= 2 {
            overflowed = true;
        }
        assert_eq!(full, tight, "rank {} results must not depend on BunchSize", rank);
    }
    assert!(overflowed, "BunchSize 16 on 1024 particles must overflow");
}

#[test]
fn single_remote_particle_coalesces_into_two_records() {
    // One rank-0 particle that sees all four of rank 1's top leaves: the
    // consecutive same-destination exports must pairwise coalesce.
    let mut all = ParticleSet::new();
    all.push_particle([0.75, 0.75, 0.75], 0, 0.4, 0);
    all.push_particle([0.25, 0.25, 0.25], 0, 0.1, 1);

    let outs = run_cluster(2, |rank, comm| {
        run_count_rank(rank, comm, &all, 2, 0.9, None)
    });

    // Octants with z >= 0.5 belong to rank 0, so particle 0 is rank 0's.
    assert_eq!(
        outs[0].2, 2,
        "four pseudo visits on one peer coalesce into two records"
    );
    assert_eq!(outs[1].2, 2, "the mirror walk coalesces the same way");
}

#[test]
fn constant_false_haswork_is_a_noop() {
    struct NoWork(CountWalk);
    impl TreeWalk for NoWork {
        type Query = CountQuery;
        type Result = CountResult;
        const LABEL: &'static str = "NOWORK";
        const HAS_WORK_FILTER: bool = true;

        fn haswork(&self, _p: &ParticleSet, _i: u32) -> bool {
            false
        }
        fn fill(&self, p: &ParticleSet, i: u32, q: &mut CountQuery) {
            self.0.fill(p, i, q)
        }
        fn ngb_setup(&self, q: &CountQuery, iter: &mut NgbIter) {
            self.0.ngb_setup(q, iter)
        }
        fn ngb_visit(&self, q: &CountQuery, r: &mut CountResult, it: &mut NgbIter, p: &ParticleSet) {
            self.0.ngb_visit(q, r, it, p)
        }
        fn reduce(&self, i: u32, r: &CountResult, mode: ReduceMode, p: &ParticleSet) {
            self.0.reduce(i, r, mode, p)
        }
    }

    let all = random_particles(64, 5);
    let outs = run_cluster(2, |rank, comm| {
        let mine = domain_split(&all, 2).swap_remove(rank);
        let tree = build_tree(&mine, &build_params(rank, 2));
        let walk = NoWork(CountWalk::new(0.3, mine.len()));
        let mut engine = WalkEngine::new(comm, engine_params(None));
        let stats = engine.run(&walk, &tree, &mine, None).expect("walk ok");
        let untouched = (0..mine.len()).all(|i| walk.0.counts.get(i) == 0);
        (stats.work_set_size, stats.nexport_sum, untouched)
    });
    for (wss, exports, untouched) in outs {
        assert_eq!(wss, 0);
        assert_eq!(exports, 0);
        assert!(untouched);
    }
}

#[test]
fn identical_reruns_are_idempotent() {
    // Primary reduce assigns and ghost contributions arrive once per run,
    // so running the same walk twice must leave the same state.
    let all = random_particles(128, 13);
    let hsml = 0.25;
    let outs = run_cluster(2, |rank, comm| {
        let mine = domain_split(&all, 2).swap_remove(rank);
        let tree = build_tree(&mine, &build_params(rank, 2));
        let walk = CountWalk::new(hsml, mine.len());
        let mut engine = WalkEngine::new(comm, engine_params(None));
        engine.run(&walk, &tree, &mine, None).expect("first run");
        let first: Vec<(u64, u64)> = (0..mine.len())
            .map(|i| (walk.counts.get(i), walk.weights.get(i).to_bits()))
            .collect();
        engine.run(&walk, &tree, &mine, None).expect("second run");
        let second: Vec<(u64, u64)> = (0..mine.len())
            .map(|i| (walk.counts.get(i), walk.weights.get(i).to_bits()))
            .collect();
        first == second
    });
    assert!(outs.into_iter().all(|same| same));
}

#[test]
#[should_panic(expected = "without computing hmax")]
fn symmetric_walk_without_hmax_aborts() {
    struct Sym(CountWalk);
    impl TreeWalk for Sym {
        type Query = CountQuery;
        type Result = CountResult;
        const LABEL: &'static str = "SYM";

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

    let all = random_particles(32, 3);
    let comms = LocalUniverse::new(1);
    let tree: Tree = build_tree(&all, &build_params(0, 1)); // with_hmax: false
    let walk = Sym(CountWalk::new(0.2, all.len()));
    let mut engine = WalkEngine::new(&comms[0], engine_params(None));
    let _ = engine.run(&walk, &tree, &all, None);
}
