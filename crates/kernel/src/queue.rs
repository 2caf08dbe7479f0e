//! Work-queue construction: from the caller's active set to the engine's
//! private work set.
//!
//! The builder filters garbage and work-predicate misses while preserving
//! the input order: each thread scans a contiguous slice of the input into
//! its own slab, and the slabs are concatenated in thread order. That static
//! slicing is load-bearing: the top-tree phase's monotonic resumption after
//! a buffer overflow assumes work-set order matches input order.

use std::thread;

use crate::particle::ParticleSet;

/// The engine-private work queue derived from the active set.
#[derive(Debug)]
pub enum WorkSet<'a> {
    /// Adopted from the caller unchanged (zero copy). The caller keeps
    /// ownership; teardown frees nothing.
    Borrowed(&'a [u32]),
    /// Filtered and compacted by the builder.
    Owned(Vec<u32>),
    /// Every particle index in `0..n`, in order.
    All(u32),
}

impl WorkSet<'_> {
    /// Number of queued particles.
    pub fn len(&self) -> usize {
        match self {
            WorkSet::Borrowed(s) => s.len(),
            WorkSet::Owned(v) => v.len(),
            WorkSet::All(n) => *n as usize,
        }
    }

    /// Return `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Particle index at queue position `k`.
    #[inline]
    pub fn index(&self, k: usize) -> u32 {
        match self {
            WorkSet::Borrowed(s) => s[k],
            WorkSet::Owned(v) => v[k],
            WorkSet::All(_) => k as u32,
        }
    }
}

/// Build the work queue for one walk.
///
/// With no `haswork` predicate and a caller-vouched garbage-free list, the
/// input is adopted verbatim. Otherwise each of `nthread` workers filters a
/// contiguous slice of the input into a bounded slab; slabs are concatenated
/// in thread order. A slab overflow is a programming error (the static
/// schedule bounds every slab by construction).
pub fn build_queue<'a>(
    p: &ParticleSet,
    active: Option<&'a [u32]>,
    haswork: Option<&(dyn Fn(u32) -> bool + Sync)>,
    may_have_garbage: bool,
    nthread: usize,
) -> WorkSet<'a> {
    let size = active.map_or(p.len(), |a| a.len());

    if haswork.is_none() && !may_have_garbage {
        return match active {
            Some(a) => WorkSet::Borrowed(a),
            None => WorkSet::All(p.len() as u32),
        };
    }

    let nthread = nthread.max(1);
    // Each thread owns at most `size / nthread + 1` inputs; give the slab a
    // little slack on top.
    let tsize = size / nthread + nthread;
    let sched = size / nthread + 1;

    let mut slabs: Vec<Vec<u32>> = Vec::with_capacity(nthread);
    thread::scope(|s| {
        let handles: Vec<_> = (0..nthread)
            .map(|tid| {
                let lo = (tid * sched).min(size);
                let hi = ((tid + 1) * sched).min(size);
                s.spawn(move || {
                    let mut slab = Vec::with_capacity(tsize);
                    for k in lo..hi {
                        let i = active.map_or(k as u32, |a| a[k]);
                        if p.garbage[i as usize] {
                            continue;
                        }
                        if let Some(f) = haswork {
                            if !f(i) {
                                continue;
                            }
                        }
                        debug_assert!(
                            slab.len() < tsize,
                            "queue slab overflow: tid {} tsize {} size {}",
                            tid,
                            tsize,
                            size
                        );
                        slab.push(i);
                    }
                    slab
                })
            })
            .collect();
        for h in handles {
            slabs.push(h.join().expect("queue builder thread panicked"));
        }
    });

    let total = slabs.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    for slab in slabs {
        out.extend_from_slice(&slab);
    }
    WorkSet::Owned(out)
}
