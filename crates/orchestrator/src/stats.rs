//! Per-walk counters and phase timings.

use std::time::Duration;

use crate::comm::Communicator;

/// Everything a walk reports back: counters, convergence state, and wall
/// time per phase.
#[derive(Debug, Clone)]
pub struct WalkStats {
    /// Label of the walk that produced these numbers.
    pub label: &'static str,
    /// Size of this rank's work set.
    pub work_set_size: u64,
    /// Outer iterations taken (1 unless the export buffer filled).
    pub nexportfull: u64,
    /// Export records emitted over all iterations, re-evaluations included.
    pub nexport_sum: u64,
    /// Distinct export destinations summed over iterations.
    pub nexport_ranks: u64,
    /// Candidate interactions in the primary phase.
    pub ninteractions: u64,
    /// Smallest per-particle candidate count (primary phase).
    pub min_ninteractions: u64,
    /// Largest per-particle candidate count (primary phase).
    pub max_ninteractions: u64,
    /// Primary evaluations: one per active particle.
    pub nlist_primary: u64,
    /// Particles queued for another convergence pass, in thread order.
    pub redo: Vec<u32>,
    /// Largest neighbour count reported by `postprocess`.
    pub max_ngb: f64,
    /// Smallest neighbour count reported by `postprocess`.
    pub min_ngb: f64,

    /// Wall time in the preprocess hook.
    pub time_preprocess: Duration,
    /// Wall time enumerating exports.
    pub time_toptree: Duration,
    /// Wall time in the primary walk.
    pub time_primary: Duration,
    /// Wall time evaluating imported queries.
    pub time_secondary: Duration,
    /// Wall time in the counts exchange.
    pub time_comm_counts: Duration,
    /// Wall time filling and posting query payloads.
    pub time_comm_queries: Duration,
    /// Wall time posting and draining result payloads.
    pub time_comm_results: Duration,
    /// Wall time blocked on imported queries.
    pub time_wait: Duration,
    /// Wall time reducing returned results.
    pub time_reduce: Duration,
    /// Wall time in the postprocess hook.
    pub time_postprocess: Duration,
}

impl WalkStats {
    /// Fresh stats for one walk invocation.
    pub fn new(label: &'static str, work_set_size: usize) -> Self {
        Self {
            label,
            work_set_size: work_set_size as u64,
            nexportfull: 0,
            nexport_sum: 0,
            nexport_ranks: 0,
            ninteractions: 0,
            min_ninteractions: u64::MAX,
            max_ninteractions: 0,
            nlist_primary: 0,
            redo: Vec::new(),
            max_ngb: 0.0,
            min_ngb: 1e50,
            time_preprocess: Duration::ZERO,
            time_toptree: Duration::ZERO,
            time_primary: Duration::ZERO,
            time_secondary: Duration::ZERO,
            time_comm_counts: Duration::ZERO,
            time_comm_queries: Duration::ZERO,
            time_comm_results: Duration::ZERO,
            time_wait: Duration::ZERO,
            time_reduce: Duration::ZERO,
            time_postprocess: Duration::ZERO,
        }
    }

    /// Reduce the counters across ranks and log one summary line on rank 0.
    pub fn log_summary<C: Communicator>(&self, comm: &C) {
        let min_i = comm.allreduce_f64_min(if self.min_ninteractions == u64::MAX {
            f64::INFINITY
        } else {
            self.min_ninteractions as f64
        });
        let max_i = comm.allreduce_f64_max(self.max_ninteractions as f64);
        let total_i = comm.allreduce_i64_sum(self.ninteractions as i64);
        let total_primary = comm.allreduce_i64_sum(self.nlist_primary as i64);
        let total_exports = comm.allreduce_i64_sum(self.nexport_sum as i64);
        if comm.rank() == 0 {
            let avg = total_i as f64 / (total_primary.max(1)) as f64;
            tracing::info!(
                "{} ngblist: min {} max {} avg {:.3}; exports per task {:.1}",
                self.label,
                if min_i.is_finite() { min_i } else { 0.0 },
                max_i,
                avg,
                total_exports as f64 / comm.size() as f64,
            );
        }
    }

    /// Log the per-phase wall-time breakdown for this rank.
    pub fn log_timings(&self) {
        tracing::debug!(
            "{} timings: pre {:?} toptree {:?} primary {:?} secondary {:?} \
             counts {:?} queries {:?} results {:?} wait {:?} reduce {:?} post {:?}",
            self.label,
            self.time_preprocess,
            self.time_toptree,
            self.time_primary,
            self.time_secondary,
            self.time_comm_counts,
            self.time_comm_queries,
            self.time_comm_results,
            self.time_wait,
            self.time_reduce,
            self.time_postprocess,
        );
    }
}
