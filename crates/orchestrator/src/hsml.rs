//! Convergence loop for adaptive search radii, and the bisection helper.
//!
//! Density-like kernels do not know the right smoothing length up front:
//! after each full walk they re-queue the particles whose neighbour count
//! missed the target, with a new radius from [`narrow_down`], until every
//! rank's redo queue drains. The loop owns two queue buffers per pass (the
//! one being walked and the one being filled) so compaction never aliases.

use kernel::{ParticleSet, Tree, TreeWalk};

use crate::comm::Communicator;
use crate::driver::{WalkEngine, WalkError};
use crate::stats::WalkStats;

/// Ceiling on convergence passes; exceeding it is fatal.
pub const MAXITER: u64 = 400;

/// Outcome of a converged adaptive-radius loop.
#[derive(Debug, Clone)]
pub struct HsmlLoopStats {
    /// Passes taken to converge.
    pub passes: u64,
    /// Global maximum neighbour count after the last pass that updated it.
    pub max_ngb: f64,
    /// Global minimum neighbour count after the last pass that updated it.
    pub min_ngb: f64,
    /// Stats of the final pass.
    pub last: WalkStats,
}

/// Run `engine` repeatedly on a shrinking redo queue until no rank re-queues
/// anything.
///
/// The kernel's `postprocess` hook drives convergence: it pushes unconverged
/// particles into its thread's redo list and records neighbour-count
/// extrema. With `update_hsml` unset the walk runs exactly once (the plain
/// non-adaptive case).
pub fn hsml_loop<C: Communicator, V: TreeWalk>(
    engine: &mut WalkEngine<'_, C>,
    v: &V,
    tree: &Tree,
    p: &ParticleSet,
    queue: Option<&[u32]>,
    update_hsml: bool,
    max_iter: u64,
) -> Result<HsmlLoopStats, WalkError> {
    let comm = engine.comm();
    let mut passes: u64 = 0;
    let mut redo: Option<Vec<u32>> = None;
    let mut global_max = 0.0f64;
    let mut global_min = 1e50f64;

    loop {
        let active = match &redo {
            Some(r) => Some(r.as_slice()),
            None => queue,
        };
        // Redo queues are already filtered; only the first pass applies the
        // kernel's work predicate.
        let stats = engine.run_queue(v, tree, p, active, passes == 0)?;
        passes += 1;

        if !update_hsml {
            stats.log_summary(comm);
            return Ok(HsmlLoopStats {
                passes,
                max_ngb: global_max,
                min_ngb: global_min,
                last: stats,
            });
        }

        let remaining = comm.allreduce_i64_sum(stats.redo.len() as i64);
        global_max = comm.allreduce_f64_max(stats.max_ngb);
        global_min = comm.allreduce_f64_min(stats.min_ngb);
        if comm.rank() == 0 {
            tracing::info!(
                "{} pass {}: {} particles left, max ngb {:.4} min ngb {:.4}",
                V::LABEL,
                passes,
                remaining,
                global_max,
                global_min
            );
        }
        stats.log_summary(comm);

        if remaining == 0 {
            return Ok(HsmlLoopStats {
                passes,
                max_ngb: global_max,
                min_ngb: global_min,
                last: stats,
            });
        }
        if passes > max_iter {
            return Err(WalkError::NoConvergence {
                remaining,
                iterations: passes,
            });
        }
        // The finished queue is dropped only after its successor exists.
        redo = Some(stats.redo);
    }
}

/// From the radii tried so far and the neighbour counts they produced, pick
/// the next search radius: bisection with a volume-extrapolated guess,
/// clamped to the current bracket.
///
/// `radius`/`numngb` hold the history (`maxcmpt` valid entries); `left` and
/// `right` are the bracket, updated in place. An unbounded right edge
/// (approaching the box size) grows aggressively, capped at 4x. Returns the
/// new radius and the index of the closest attempt.
pub fn narrow_down(
    right: &mut f64,
    left: &mut f64,
    radius: &[f64],
    numngb: &[f64],
    maxcmpt: usize,
    desnumngb: f64,
    box_size: f64,
) -> (f64, usize) {
    let mut close = 0;
    let mut ngbdist = (numngb[0] - desnumngb).abs();
    for j in 1..maxcmpt {
        let newdist = (numngb[j] - desnumngb).abs();
        if newdist < ngbdist {
            ngbdist = newdist;
            close = j;
        }
    }

    for j in 0..maxcmpt {
        if numngb[j] < desnumngb {
            *left = radius[j];
        }
        if numngb[j] > desnumngb {
            *right = radius[j];
            break;
        }
    }

    let mut hsml = radius[close];

    if *right > 0.99 * box_size {
        let mut dngbdv = 0.0;
        if maxcmpt > 1 && radius[maxcmpt - 1] > radius[maxcmpt - 2] {
            dngbdv = (numngb[maxcmpt - 1] - numngb[maxcmpt - 2])
                / (radius[maxcmpt - 1].powi(3) - radius[maxcmpt - 2].powi(3));
        }
        // Grow by at most a factor 4; unbounded brackets invite madness.
        let mut newhsml = 4.0 * hsml;
        if dngbdv > 0.0 {
            let dngb = desnumngb - numngb[maxcmpt - 1];
            let newvolume = hsml.powi(3) + dngb / dngbdv;
            if newvolume.cbrt() < newhsml {
                newhsml = newvolume.cbrt();
            }
        }
        hsml = newhsml;
    }
    if hsml > *right {
        hsml = *right;
    }

    if *left == 0.0 {
        // Extrapolate assuming locally constant density.
        let mut dngbdv = 0.0;
        if maxcmpt > 1 && radius[1] > radius[0] {
            dngbdv = (numngb[1] - numngb[0]) / (radius[1].powi(3) - radius[0].powi(3));
        }
        if maxcmpt == 1 && radius[0] > 0.0 {
            dngbdv = numngb[0] / radius[0].powi(3);
        }
        if dngbdv > 0.0 {
            let dngb = desnumngb - numngb[0];
            let newvolume = hsml.powi(3) + dngb / dngbdv;
            hsml = newvolume.cbrt();
        }
    }
    if hsml < *left {
        hsml = *left;
    }

    (hsml, close)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bisection_stays_inside_the_bracket() {
        let mut left = 0.1;
        let mut right = 0.4;
        let (h, close) = narrow_down(
            &mut right,
            &mut left,
            &[0.2],
            &[50.0],
            1,
            32.0,
            1.0,
        );
        // Too many neighbours: right edge tightens to the tried radius.
        assert_eq!(right, 0.2);
        assert_eq!(close, 0);
        assert!(h >= left && h <= right);
    }

    #[test]
    fn too_few_neighbours_grows_aggressively_while_unbounded() {
        let mut left = 0.0;
        let mut right = 1e30;
        let (h, _) = narrow_down(&mut right, &mut left, &[0.1], &[4.0], 1, 32.0, 1.0);
        assert_eq!(left, 0.1);
        // No bracket yet and a single attempt: the capped 4x growth applies.
        assert!((h - 0.4).abs() < 1e-12);
    }

    #[test]
    fn too_many_neighbours_shrinks_by_volume_extrapolation() {
        let mut left = 0.0;
        let mut right = 1e30;
        let (h, _) = narrow_down(&mut right, &mut left, &[0.2], &[256.0], 1, 32.0, 1.0);
        assert_eq!(right, 0.2);
        // Locally constant density: an 8x overshoot halves the radius.
        assert!((h - 0.1).abs() < 1e-12);
    }

    #[test]
    fn unbounded_right_growth_is_capped() {
        let mut left = 0.3;
        let mut right = 1.0; // right at the box size
        let (h, _) = narrow_down(&mut right, &mut left, &[0.3], &[1.0], 1, 32.0, 1.0);
        assert!(h <= 4.0 * 0.3 + 1e-12);
        assert!(h >= left);
    }

    #[test]
    fn closest_attempt_wins() {
        let mut left = 0.0;
        let mut right = 1e30;
        let (_, close) = narrow_down(
            &mut right,
            &mut left,
            &[0.1, 0.2, 0.3],
            &[10.0, 30.0, 70.0],
            3,
            32.0,
            0.0,
        );
        assert_eq!(close, 1);
        assert_eq!(left, 0.2);
        assert_eq!(right, 0.3);
    }
}
