//! The outer driver: lifecycle and the iterate-until-all-done loop.
//!
//! One `WalkEngine` lives per rank. A `run` walks the active set to
//! completion: the top-tree phase enumerates exports (re-entered as often as
//! the export buffer demands), the primary phase does the local work exactly
//! once, and each iteration moves queries out, evaluates them as ghosts, and
//! reduces the returned results into their owning particles. All ranks stay
//! in the loop until a sum-allreduce reports that nobody's buffer filled.

use std::mem;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use bytemuck::Zeroable;
use thiserror::Error;

use kernel::{
    build_queue, ExportRecord, ParticleSet, ReduceMode, Tree, TreeWalk, WalkResult as _,
};

use crate::comm::Communicator;
use crate::config::EngineParams;
use crate::exchange::{exchange_counts, sparse_exchange, TAG_QUERY, TAG_RESULT};
use crate::runner::{
    run_postprocess, run_preprocess, run_primary, run_secondary, run_toptree, ToptreeOutcome,
};
use crate::stats::WalkStats;

/// Transfers above this many bytes upset some MPI implementations; the
/// export capacity is clamped so one query block never exceeds it.
const TRANSFER_CEILING: usize = 1024 * 1024 * 3092;

/// Errors detectable when a walk begins, plus convergence failure. Protocol
/// violations mid-walk are programming errors and panic instead.
#[derive(Debug, Error)]
pub enum WalkError {
    /// The tree was freed (or never built) before the walk.
    #[error("tree has been freed before this treewalk")]
    TreeNotAllocated,
    /// Query payloads must have 64-bit-aligned size for the wire format.
    #[error("query structure has size {0}, not aligned to a 64-bit boundary")]
    UnalignedQuery(usize),
    /// Result payloads must have 64-bit-aligned size for the wire format.
    #[error("result structure has size {0}, not aligned to a 64-bit boundary")]
    UnalignedResult(usize),
    /// Free memory does not even cover the bookkeeping margin.
    #[error("not enough memory for exporting any particles: need {needed} bytes, have {available}")]
    OutOfMemory {
        /// Bytes needed per export record.
        needed: usize,
        /// Bytes available for the table.
        available: usize,
    },
    /// The derived export capacity is uselessly small.
    #[error("only enough free memory to export {0} elements")]
    ExportBufferTooSmall(usize),
    /// The adaptive-radius loop hit its iteration ceiling.
    #[error("failed to converge smoothing lengths for {remaining} particles after {iterations} iterations")]
    NoConvergence {
        /// Unconverged particles across all ranks.
        remaining: i64,
        /// Passes taken.
        iterations: u64,
    },
}

/// Per-rank walk driver.
pub struct WalkEngine<'c, C: Communicator> {
    comm: &'c C,
    params: EngineParams,
    /// Completed `run` invocations, for log context.
    niteration: u64,
}

impl<'c, C: Communicator> WalkEngine<'c, C> {
    /// New driver on `comm` with the given parameters.
    pub fn new(comm: &'c C, params: EngineParams) -> Self {
        Self {
            comm,
            params,
            niteration: 0,
        }
    }

    /// The communicator this engine runs on.
    pub fn comm(&self) -> &'c C {
        self.comm
    }

    /// The engine parameters.
    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    /// Walk `active` (or every particle) to completion.
    pub fn run<V: TreeWalk>(
        &mut self,
        v: &V,
        tree: &Tree,
        p: &ParticleSet,
        active: Option<&[u32]>,
    ) -> Result<WalkStats, WalkError> {
        self.run_queue(v, tree, p, active, true)
    }

    /// Derive the export-record capacity for this walk's payload sizes.
    fn bunch_size(&self, qsize: usize, rsize: usize) -> Result<usize, WalkError> {
        if let Some(b) = self.params.bunch_size {
            return Ok(b);
        }
        let bytes_per_record = mem::size_of::<ExportRecord>()
            + qsize
            + self.params.import_buffer_boost * (qsize + rsize);

        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let mut free = (sys.available_memory() as usize).min(self.params.export_buffer_bytes);

        // Leave headroom for allocator overhead, as the exchange does.
        if free <= 4096 * 11 * bytes_per_record {
            return Err(WalkError::OutOfMemory {
                needed: bytes_per_record,
                available: free,
            });
        }
        free -= 4096 * 10 * bytes_per_record;

        let mut bunch = free / bytes_per_record;
        if bunch * qsize > TRANSFER_CEILING {
            bunch = TRANSFER_CEILING / qsize;
        }
        if bunch < 100 {
            return Err(WalkError::ExportBufferTooSmall(bunch));
        }
        Ok(bunch)
    }

    /// The full walk; `apply_filter` lets the convergence loop skip the
    /// work predicate when re-running an already-filtered redo queue.
    pub(crate) fn run_queue<V: TreeWalk>(
        &mut self,
        v: &V,
        tree: &Tree,
        p: &ParticleSet,
        active: Option<&[u32]>,
        apply_filter: bool,
    ) -> Result<WalkStats, WalkError> {
        if !tree.is_allocated() {
            return Err(WalkError::TreeNotAllocated);
        }
        let qsize = mem::size_of::<V::Query>();
        let rsize = mem::size_of::<V::Result>();
        // Send/receive must happen from 64-bit-aligned payloads.
        if qsize % 8 != 0 {
            return Err(WalkError::UnalignedQuery(qsize));
        }
        if rsize % 8 != 0 {
            return Err(WalkError::UnalignedResult(rsize));
        }

        let nthread = self.params.resolved_threads();
        let ntask = self.comm.size();
        let my_rank = self.comm.rank();

        // --- begin: work set, export table, evaluated mask ---
        let haswork = |i: u32| v.haswork(p, i);
        let haswork_dyn: &(dyn Fn(u32) -> bool + Sync) = &haswork;
        let ws = build_queue(
            p,
            active,
            if apply_filter && V::HAS_WORK_FILTER {
                Some(haswork_dyn)
            } else {
                None
            },
            !self.params.assume_no_garbage,
            nthread,
        );

        let wss = ws.len() as i64;
        let nmax = self.comm.allreduce_f64_max(wss as f64);
        let nmin = self.comm.allreduce_f64_min(wss as f64);
        let total = self.comm.allreduce_i64_sum(wss);
        if my_rank == 0 {
            tracing::info!(
                "treewalk {} iter {}: total part {} max/rank {} min/rank {} balance {:.3}",
                V::LABEL,
                self.niteration,
                total,
                nmax,
                nmin,
                nmax / ((total as f64 + 0.001) / ntask as f64),
            );
        }

        let bunch = self.bunch_size(qsize, rsize)?;
        let mut table = vec![ExportRecord::default(); bunch];
        let evaluated: Vec<AtomicBool> = (0..ws.len()).map(|_| AtomicBool::new(false)).collect();

        let mut stats = WalkStats::new(V::LABEL, ws.len());
        // One primary evaluation per active particle, by definition.
        stats.nlist_primary = ws.len() as u64;

        // --- optional preprocess ---
        if V::HAS_PREPROCESS {
            let t = Instant::now();
            run_preprocess(v, p, &ws, nthread);
            stats.time_preprocess += t.elapsed();
        }

        // --- iterate until every rank fits its exports ---
        let mut work_set_start: usize = 0;
        let mut first_pass = true;
        loop {
            // Top-tree: enumerate exports from the resume point.
            let t = Instant::now();
            let out: ToptreeOutcome = run_toptree(
                v,
                tree,
                p,
                &ws,
                work_set_start,
                &evaluated,
                &mut table,
                nthread,
                my_rank as u32,
            );
            stats.time_toptree += t.elapsed();
            // Resume below the slowest thread; anything above the minimum
            // is protected by the evaluated mask.
            work_set_start = (out.last_succeeded + 1).max(0) as usize;

            // Counts: who gets how many of our queries.
            let t = Instant::now();
            let mut send_count = vec![0usize; ntask];
            for te in &out.thread_exports {
                for rec in &table[te.offset..te.offset + te.nexport] {
                    send_count[rec.task as usize] += 1;
                }
            }
            stats.nexport_sum += out.nexport as u64;
            stats.nexport_ranks += send_count.iter().filter(|&&c| c > 0).count() as u64;
            let layout = exchange_counts(self.comm, send_count);
            stats.time_comm_counts += t.elapsed();
            debug_assert_eq!(layout.nexport, out.nexport);

            // Fill per-destination query blocks from the export table.
            let t = Instant::now();
            let mut sendq = vec![V::Query::zeroed(); layout.nexport];
            let mut placed = vec![0usize; ntask];
            for te in &out.thread_exports {
                for rec in &table[te.offset..te.offset + te.nexport] {
                    let task = rec.task as usize;
                    let pos = layout.send_offset[task] + placed[task];
                    placed[task] += 1;
                    sendq[pos] = kernel::init_query(v, p, tree, rec.index, Some(rec.nodelist));
                }
            }
            debug_assert_eq!(placed, layout.send_count);

            // Receives before sends, then overlap the primary walk with the
            // transfer.
            let (q_recvs, q_sends) = sparse_exchange(
                self.comm,
                TAG_QUERY,
                bytemuck::cast_slice(&sendq),
                &layout.send_count,
                &layout.send_offset,
                &layout.recv_count,
                &layout.recv_offset,
                qsize,
            );
            stats.time_comm_queries += t.elapsed();

            if first_pass {
                // The local walk runs exactly once: kernels are not
                // re-entrant against already-reduced particles.
                let t = Instant::now();
                let counters = run_primary(v, tree, p, &ws, nthread, self.params.no_ngblist);
                stats.ninteractions = counters.ninteractions;
                stats.min_ninteractions = counters.min_ninteractions;
                stats.max_ninteractions = counters.max_ninteractions;
                stats.time_primary += t.elapsed();
            }

            // Imported queries, evaluated as ghosts.
            let t = Instant::now();
            let import_bytes = q_recvs.complete();
            stats.time_wait += t.elapsed();

            let t = Instant::now();
            let queries: Vec<V::Query> = bytemuck::pod_collect_to_vec(&import_bytes);
            drop(import_bytes);
            let mut results: Vec<V::Result> = vec![V::Result::zeroed(); layout.nimport];
            run_secondary(v, tree, p, &queries, &mut results, nthread);
            stats.time_secondary += t.elapsed();

            // The query send buffer may only be released once the
            // transfers are done.
            let t = Instant::now();
            q_sends.complete();
            drop(sendq);

            // Results travel the swapped direction.
            let (r_recvs, r_sends) = sparse_exchange(
                self.comm,
                TAG_RESULT,
                bytemuck::cast_slice(&results),
                &layout.recv_count,
                &layout.recv_offset,
                &layout.send_count,
                &layout.send_offset,
                rsize,
            );
            let returned_bytes = r_recvs.complete();
            let returned: Vec<V::Result> = bytemuck::pod_collect_to_vec(&returned_bytes);
            drop(returned_bytes);
            stats.time_comm_results += t.elapsed();

            // Reduce returned partial results into their owners, in table
            // order: deterministic for a fixed rank count and top-leaf map.
            let t = Instant::now();
            let mut taken = vec![0usize; ntask];
            for te in &out.thread_exports {
                for rec in &table[te.offset..te.offset + te.nexport] {
                    let task = rec.task as usize;
                    let pos = layout.send_offset[task] + taken[task];
                    taken[task] += 1;
                    let res = &returned[pos];
                    debug_assert_eq!(
                        res.head().id,
                        p.id[rec.index as usize],
                        "mismatched ID for particle {} in treewalk reduction",
                        rec.index
                    );
                    v.reduce(rec.index, res, ReduceMode::Ghosts, p);
                }
            }
            stats.time_reduce += t.elapsed();
            r_sends.complete();

            stats.nexportfull += 1;
            first_pass = false;

            let done = self
                .comm
                .allreduce_i64_sum(if out.buffer_full { 0 } else { 1 });
            if done == ntask as i64 {
                break;
            }
        }

        // --- optional postprocess ---
        if V::HAS_POSTPROCESS {
            let t = Instant::now();
            let contexts = run_postprocess(v, p, &ws, nthread);
            for ctx in contexts {
                stats.redo.extend_from_slice(&ctx.redo);
                if ctx.max_ngb > stats.max_ngb {
                    stats.max_ngb = ctx.max_ngb;
                }
                if ctx.min_ngb < stats.min_ngb {
                    stats.min_ngb = ctx.min_ngb;
                }
            }
            stats.time_postprocess += t.elapsed();
        }

        stats.log_timings();
        self.niteration += 1;
        Ok(stats)
    }
}
