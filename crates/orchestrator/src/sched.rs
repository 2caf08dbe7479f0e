//! Hand-rolled chunked work scheduler.
//!
//! The top-tree phase cannot use an off-the-shelf parallel-for: a thread
//! must be able to break out mid-schedule when its export region fills,
//! without poisoning the iteration for the other threads. A shared fetch-add
//! cursor gives that for free, and the chunk size shrinks near the tail to
//! keep the finish balanced.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-thread view of a shared dynamic schedule over `0..size` (starting at
/// whatever the shared cursor holds).
pub struct ChunkedLoop<'a> {
    cursor: &'a AtomicUsize,
    size: usize,
    nthread: usize,
    chunk: usize,
}

impl<'a> ChunkedLoop<'a> {
    /// Join the schedule. Chunk size starts at `size / (4 * nthread)`,
    /// clamped to `[1, 100]`.
    pub fn new(cursor: &'a AtomicUsize, size: usize, nthread: usize) -> Self {
        let chunk = (size / (4 * nthread.max(1))).clamp(1, 100);
        Self {
            cursor,
            size,
            nthread: nthread.max(1),
            chunk,
        }
    }

    /// Claim the next chunk, or `None` when the work set is exhausted.
    pub fn next_chunk(&mut self) -> Option<Range<usize>> {
        let start = self.cursor.fetch_add(self.chunk, Ordering::Relaxed);
        if start >= self.size {
            return None;
        }
        let end = (start + self.chunk).min(self.size);
        // Halve the chunk as the tail approaches so late threads do not sit
        // on one oversized claim.
        if self.size < end + self.chunk * self.nthread && self.chunk >= 2 {
            self.chunk /= 2;
        }
        Some(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn chunks_cover_the_range_exactly_once() {
        let cursor = AtomicUsize::new(0);
        let size = 10_007;
        let claimed: Vec<Vec<usize>> = thread::scope(|s| {
            (0..4)
                .map(|_| {
                    s.spawn(|| {
                        let mut sched = ChunkedLoop::new(&cursor, size, 4);
                        let mut mine = Vec::new();
                        while let Some(r) = sched.next_chunk() {
                            mine.extend(r);
                        }
                        mine
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });
        let mut seen = HashSet::new();
        for mine in &claimed {
            for &k in mine {
                assert!(seen.insert(k), "index {} claimed twice", k);
            }
        }
        assert_eq!(seen.len(), size);
    }

    #[test]
    fn resumes_from_a_nonzero_cursor() {
        let cursor = AtomicUsize::new(50);
        let mut sched = ChunkedLoop::new(&cursor, 60, 1);
        let mut got = Vec::new();
        while let Some(r) = sched.next_chunk() {
            got.extend(r);
        }
        assert_eq!(got, (50..60).collect::<Vec<_>>());
    }

    #[test]
    fn chunk_shrinks_towards_the_tail() {
        let cursor = AtomicUsize::new(0);
        let mut sched = ChunkedLoop::new(&cursor, 800, 2);
        assert_eq!(sched.chunk, 100);
        // Drain; by the end the chunk must have shrunk.
        while sched.next_chunk().is_some() {}
        assert!(sched.chunk < 100);
    }
}
