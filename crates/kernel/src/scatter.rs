//! Shared per-particle output buffers for visitor reductions.
//!
//! Walk kernels scatter their outputs (neighbour counts, densities, updated
//! search radii, ...) by particle index from inside parallel phases. The
//! engine's scheduling guarantees that any given index is written from at
//! most one thread at a time: primary reductions and postprocess hooks own
//! their queue entry, and ghost-return reductions run on a single thread.
//! [`ScatterBuf`] encodes that contract as plain unsynchronised loads and
//! stores behind a shared reference.

use std::cell::UnsafeCell;

/// Fixed-size buffer of `Copy` values, writable through `&self`.
///
/// Callers must uphold the engine contract above: concurrent access to the
/// *same* index is a data race. Distinct indices are always fine.
pub struct ScatterBuf<T> {
    cells: Vec<UnsafeCell<T>>,
}

unsafe impl<T: Send> Sync for ScatterBuf<T> {}

impl<T: Copy> ScatterBuf<T> {
    /// Allocate `n` slots, all set to `init`.
    pub fn new(n: usize, init: T) -> Self {
        Self {
            cells: (0..n).map(|_| UnsafeCell::new(init)).collect(),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Return `true` if the buffer has no slots.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Read slot `i`.
    #[inline]
    pub fn get(&self, i: usize) -> T {
        unsafe { *self.cells[i].get() }
    }

    /// Write slot `i`.
    #[inline]
    pub fn set(&self, i: usize, v: T) {
        unsafe {
            *self.cells[i].get() = v;
        }
    }

    /// Read-modify-write slot `i`.
    #[inline]
    pub fn update(&self, i: usize, f: impl FnOnce(T) -> T) {
        self.set(i, f(self.get(i)));
    }

    /// Copy the contents out.
    pub fn to_vec(&self) -> Vec<T> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }
}

impl<T: Copy + std::fmt::Debug> std::fmt::Debug for ScatterBuf<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.to_vec()).finish()
    }
}
