//! Brute-force reference solutions.
//!
//! Everything here is deliberately O(n^2): the point is to have answers that
//! cannot be wrong in an interesting way, against which the tree-walk
//! results are compared exactly.

use kernel::{nearest, ParticleSet};

/// Count, for every particle, the particles within `hsml` (inclusive, self
/// included), under minimum-image wrapping in a cubic box.
pub fn brute_force_counts(all: &ParticleSet, hsml: f64, box_size: f64) -> Vec<u64> {
    (0..all.len())
        .map(|i| brute_force_count_at(all, &all.pos[i], hsml, box_size))
        .collect()
}

/// Count the particles within `hsml` of an arbitrary position.
pub fn brute_force_count_at(
    all: &ParticleSet,
    pos: &[f64; 3],
    hsml: f64,
    box_size: f64,
) -> u64 {
    let h2 = hsml * hsml;
    (0..all.len())
        .filter(|&j| {
            !all.garbage[j] && {
                let r2: f64 = (0..3)
                    .map(|d| nearest(pos[d] - all.pos[j][d], box_size).powi(2))
                    .sum();
                r2 <= h2
            }
        })
        .count() as u64
}

/// Total candidate interactions a single-process walk should report: for
/// the counting kernel every candidate is a tree-leaf particle of the right
/// type, so the brute-force pair total is a lower bound and the per-particle
/// counts are exact.
pub fn total_pairs(counts: &[u64]) -> u64 {
    counts.iter().sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_includes_self() {
        let mut p = ParticleSet::new();
        p.push_particle([0.5; 3], 0, 0.1, 0);
        assert_eq!(brute_force_counts(&p, 0.1, 1.0), vec![1]);
    }

    #[test]
    fn wrapped_pair_is_mutual() {
        let mut p = ParticleSet::new();
        p.push_particle([0.02, 0.5, 0.5], 0, 0.1, 0);
        p.push_particle([0.98, 0.5, 0.5], 0, 0.1, 1);
        let counts = brute_force_counts(&p, 0.05, 1.0);
        assert_eq!(counts, vec![2, 2]);
        // Without periodicity they cannot see each other.
        let counts = brute_force_counts(&p, 0.05, 0.0);
        assert_eq!(counts, vec![1, 1]);
    }

    #[test]
    fn garbage_is_invisible() {
        let mut p = ParticleSet::new();
        p.push_particle([0.5; 3], 0, 0.1, 0);
        p.push_particle([0.51, 0.5, 0.5], 0, 0.1, 1);
        p.garbage[1] = true;
        assert_eq!(brute_force_count_at(&p, &[0.5; 3], 0.1, 1.0), 1);
    }
}
