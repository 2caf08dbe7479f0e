//! Node culling: does a node's region intersect a query's search sphere?
//!
//! This test sits on the hot path of every descent, so it short-circuits per
//! axis before doing anything quadratic.

use crate::tree::TreeNode;
use crate::walk::{NgbIter, Symmetry};

/// `0.5 * (sqrt(3) - 1)`: converts a cube side into the margin between the
/// cube's circumscribing sphere and its half-extent.
pub const FACT1: f64 = 0.366025403785;

/// Wrap a separation to the nearest periodic image.
///
/// Assumes the raw separation lies within one box length of zero, which
/// holds whenever both endpoints are inside the box. `box_size == 0`
/// disables wrapping.
#[inline]
pub fn nearest(d: f64, box_size: f64) -> f64 {
    if box_size <= 0.0 {
        return d;
    }
    let half = 0.5 * box_size;
    if d > half {
        d - box_size
    } else if d < -half {
        d + box_size
    } else {
        d
    }
}

/// Return `true` if `node` must be opened for the query at `pos`, i.e. its
/// extended box intersects the search sphere.
///
/// A symmetric walk extends the radius to the node's cached `hmax` so that
/// pairs are found from either endpoint.
#[inline]
pub fn cull_node(pos: &[f64; 3], iter: &NgbIter, node: &TreeNode, box_size: f64) -> bool {
    let mut dist = match iter.symmetric {
        Symmetry::Symmetric => node.hmax.max(iter.hsml),
        Symmetry::Asymmetric => iter.hsml,
    } + 0.5 * node.len;

    let mut r2 = 0.0;
    for d in 0..3 {
        let dx = nearest(node.center[d] - pos[d], box_size);
        if dx > dist {
            return false;
        }
        if dx < -dist {
            return false;
        }
        r2 += dx * dx;
    }

    // Tighter test against the sphere enclosing the whole cube.
    dist += FACT1 * node.len;
    r2 <= dist * dist
}
