//! The three parallel phase runners.
//!
//! Top-tree and primary share the fetch-add chunk scheduler; the top-tree
//! runner additionally honours the export back-pressure protocol (record the
//! buffer-full flag, unwind the interrupted particle, publish the last index
//! that fully succeeded). The secondary runner is a plain static partition
//! over the imported queries.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use kernel::{
    init_query, init_result, ExportFull, ExportRecord, ExportRegion, LocalWalk, ParticleSet,
    PostContext, ReduceMode, Tree, TreeWalk, WalkMode, WorkSet,
};

use crate::sched::ChunkedLoop;

/// One thread's region bookkeeping after the top-tree phase.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ThreadExports {
    /// Offset of the thread's region in the shared table.
    pub offset: usize,
    /// Records the thread committed.
    pub nexport: usize,
}

/// Aggregate outcome of one top-tree pass.
#[derive(Debug)]
pub(crate) struct ToptreeOutcome {
    /// Minimum over threads of the last fully exported queue index.
    pub last_succeeded: i64,
    /// Whether any thread ran out of export space.
    pub buffer_full: bool,
    /// Per-thread regions, in thread order.
    pub thread_exports: Vec<ThreadExports>,
    /// Total records committed this pass.
    pub nexport: usize,
}

/// Enumerate exports for queue positions `start..` until done or full.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_toptree<V: TreeWalk>(
    v: &V,
    tree: &Tree,
    p: &ParticleSet,
    ws: &WorkSet<'_>,
    start: usize,
    evaluated: &[AtomicBool],
    table: &mut [ExportRecord],
    nthread: usize,
    rank: u32,
) -> ToptreeOutcome {
    let localbunch = (table.len() / nthread).max(1);
    let cursor = AtomicUsize::new(start);
    let buffer_full = AtomicBool::new(false);

    let mut per_thread: Vec<(i64, usize)> = Vec::with_capacity(nthread);
    thread::scope(|s| {
        let handles: Vec<_> = table
            .chunks_mut(localbunch)
            .take(nthread)
            .map(|region| {
                let cursor = &cursor;
                let buffer_full = &buffer_full;
                s.spawn(move || {
                    let mut lw = LocalWalk::with_exports(tree, p, ExportRegion::new(region, rank));
                    let mut sched = ChunkedLoop::new(cursor, ws.len(), nthread);
                    let mut last_succeeded: i64 = start as i64 - 1;

                    'chunks: while let Some(range) = sched.next_chunk() {
                        for k in range {
                            // Skip particles whose exports were already
                            // committed by an earlier iteration.
                            if evaluated[k].load(Ordering::Relaxed) {
                                continue;
                            }
                            let i = ws.index(k);
                            lw.target = Some(i);
                            lw.exports_mut().expect("top-tree region").begin_particle();
                            let q = init_query(v, p, tree, i, None);
                            let mut r = init_result::<V>(&q);
                            match v.visit(&q, &mut r, &mut lw) {
                                Ok(()) => {
                                    let nthis = lw
                                        .exports()
                                        .expect("top-tree region")
                                        .n_this_particle();
                                    if nthis > 1000 {
                                        tracing::debug!(
                                            "{}: {} exports for one particle",
                                            V::LABEL,
                                            nthis
                                        );
                                    }
                                    last_succeeded = k as i64;
                                    evaluated[k].store(true, Ordering::Relaxed);
                                }
                                Err(ExportFull) => {
                                    buffer_full.store(true, Ordering::Relaxed);
                                    let region = lw.exports_mut().expect("top-tree region");
                                    tracing::info!(
                                        "{}: export buffer full with {} records; start {} last {} size {}",
                                        V::LABEL,
                                        region.nexport(),
                                        start,
                                        last_succeeded,
                                        ws.len()
                                    );
                                    region.rollback_particle(i);
                                    break 'chunks;
                                }
                            }
                        }
                    }

                    let region = lw.take_exports().expect("top-tree region");
                    (last_succeeded, region.nexport())
                })
            })
            .collect();
        for h in handles {
            per_thread.push(h.join().expect("top-tree thread panicked"));
        }
    });

    let mut outcome = ToptreeOutcome {
        last_succeeded: ws.len() as i64,
        buffer_full: buffer_full.load(Ordering::Relaxed),
        thread_exports: Vec::with_capacity(per_thread.len()),
        nexport: 0,
    };
    for (tid, (last, nexport)) in per_thread.iter().enumerate() {
        outcome.last_succeeded = outcome.last_succeeded.min(*last);
        outcome.thread_exports.push(ThreadExports {
            offset: tid * localbunch,
            nexport: *nexport,
        });
        outcome.nexport += nexport;
    }
    outcome
}

/// Interaction counters folded across one phase's threads.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PhaseCounters {
    pub ninteractions: u64,
    pub min_ninteractions: u64,
    pub max_ninteractions: u64,
}

/// Run the pure local walk over the whole work set and reduce in
/// [`ReduceMode::Primary`].
pub(crate) fn run_primary<V: TreeWalk>(
    v: &V,
    tree: &Tree,
    p: &ParticleSet,
    ws: &WorkSet<'_>,
    nthread: usize,
    no_ngblist: bool,
) -> PhaseCounters {
    let cursor = AtomicUsize::new(0);

    let mut merged = PhaseCounters {
        ninteractions: 0,
        min_ninteractions: u64::MAX,
        max_ninteractions: 0,
    };
    thread::scope(|s| {
        let handles: Vec<_> = (0..nthread)
            .map(|_| {
                let cursor = &cursor;
                s.spawn(move || {
                    let mut lw = LocalWalk::new(WalkMode::Primary, tree, p, !no_ngblist);
                    let mut sched = ChunkedLoop::new(cursor, ws.len(), nthread);
                    while let Some(range) = sched.next_chunk() {
                        for k in range {
                            let i = ws.index(k);
                            lw.target = Some(i);
                            let q = init_query(v, p, tree, i, None);
                            let mut r = init_result::<V>(&q);
                            v.visit(&q, &mut r, &mut lw)
                                .expect("local walk does not export");
                            v.reduce(i, &r, ReduceMode::Primary, p);
                        }
                    }
                    (lw.ninteractions, lw.min_ninteractions, lw.max_ninteractions)
                })
            })
            .collect();
        for h in handles {
            let (n, lo, hi) = h.join().expect("primary thread panicked");
            merged.ninteractions += n;
            merged.min_ninteractions = merged.min_ninteractions.min(lo);
            merged.max_ninteractions = merged.max_ninteractions.max(hi);
        }
    });
    merged
}

/// Evaluate imported queries in ghost mode, producing one result each.
pub(crate) fn run_secondary<V: TreeWalk>(
    v: &V,
    tree: &Tree,
    p: &ParticleSet,
    queries: &[V::Query],
    results: &mut [V::Result],
    nthread: usize,
) {
    assert_eq!(queries.len(), results.len());
    if queries.is_empty() {
        return;
    }
    let chunk = queries.len().div_ceil(nthread);
    thread::scope(|s| {
        for (qchunk, rchunk) in queries.chunks(chunk).zip(results.chunks_mut(chunk)) {
            s.spawn(move || {
                let mut lw = LocalWalk::new(WalkMode::Ghosts, tree, p, true);
                for (q, r) in qchunk.iter().zip(rchunk.iter_mut()) {
                    *r = init_result::<V>(q);
                    lw.target = None;
                    v.visit(q, r, &mut lw)
                        .expect("ghost walk does not export");
                }
            });
        }
    });
}

/// Parallel preprocess hook over the work set.
pub(crate) fn run_preprocess<V: TreeWalk>(
    v: &V,
    p: &ParticleSet,
    ws: &WorkSet<'_>,
    nthread: usize,
) {
    let cursor = AtomicUsize::new(0);
    thread::scope(|s| {
        for _ in 0..nthread {
            let cursor = &cursor;
            s.spawn(move || {
                let mut sched = ChunkedLoop::new(cursor, ws.len(), nthread);
                while let Some(range) = sched.next_chunk() {
                    for k in range {
                        v.preprocess(p, ws.index(k));
                    }
                }
            });
        }
    });
}

/// Parallel postprocess hook; returns the per-thread contexts in thread
/// order (redo lists are compacted by concatenation, as with the queue
/// builder's slabs).
pub(crate) fn run_postprocess<V: TreeWalk>(
    v: &V,
    p: &ParticleSet,
    ws: &WorkSet<'_>,
    nthread: usize,
) -> Vec<PostContext> {
    let cursor = AtomicUsize::new(0);
    let mut contexts = Vec::with_capacity(nthread);
    thread::scope(|s| {
        let handles: Vec<_> = (0..nthread)
            .map(|_| {
                let cursor = &cursor;
                s.spawn(move || {
                    let mut ctx = PostContext::new();
                    let mut sched = ChunkedLoop::new(cursor, ws.len(), nthread);
                    while let Some(range) = sched.next_chunk() {
                        for k in range {
                            v.postprocess(p, ws.index(k), &mut ctx);
                        }
                    }
                    ctx
                })
            })
            .collect();
        for h in handles {
            contexts.push(h.join().expect("postprocess thread panicked"));
        }
    });
    contexts
}
