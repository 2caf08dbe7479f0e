//! Export table: records queries that must be evaluated on other ranks.
//!
//! One table is shared by every walker thread, partitioned into contiguous
//! per-thread regions so no locking is needed. Exports for one particle are
//! contiguous within a region and ordered by node visitation, which is what
//! lets the wire layer rebuild per-destination query blocks and map returned
//! results back to their particles without any extra bookkeeping.

use crate::tree::{Tree, NODELIST_LEN};

/// One export: evaluate `index`'s query on `task`, entering the remote tree
/// at the node(s) in `nodelist` (second slot `-1` when unused).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportRecord {
    /// Destination rank. Never the local rank.
    pub task: u32,
    /// Originating local particle index.
    pub index: u32,
    /// Remote entry nodes, in visitation order.
    pub nodelist: [i64; NODELIST_LEN],
}

impl Default for ExportRecord {
    fn default() -> Self {
        Self {
            task: 0,
            index: 0,
            nodelist: [-1; NODELIST_LEN],
        }
    }
}

/// Transient back-pressure signal: the thread's export region is out of
/// space. The walk unwinds the current particle and resumes next iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportFull;

/// A thread's window into the shared export table.
pub struct ExportRegion<'a> {
    records: &'a mut [ExportRecord],
    nexport: usize,
    n_this_particle: usize,
    my_task: u32,
}

impl<'a> ExportRegion<'a> {
    /// Wrap a thread-owned slice of the shared table.
    pub fn new(records: &'a mut [ExportRecord], my_task: u32) -> Self {
        Self {
            records,
            nexport: 0,
            n_this_particle: 0,
            my_task,
        }
    }

    /// Records committed so far.
    pub fn nexport(&self) -> usize {
        self.nexport
    }

    /// Records emitted by the particle currently being walked.
    pub fn n_this_particle(&self) -> usize {
        self.n_this_particle
    }

    /// Per-thread capacity.
    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Start walking a new particle.
    pub fn begin_particle(&mut self) {
        self.n_this_particle = 0;
    }

    /// Record that `target`'s query must visit the sub-domain behind
    /// `top_leaf`.
    ///
    /// When the previous export of this particle went to the same rank and
    /// its second node slot is still free, the new entry node is coalesced
    /// into that record instead of consuming a new slot.
    pub fn push(&mut self, tree: &Tree, target: u32, top_leaf: u32) -> Result<(), ExportFull> {
        let leaf = tree.top_leaf(top_leaf);
        debug_assert_ne!(
            leaf.task, self.my_task,
            "pseudo node {} maps back to the local rank",
            top_leaf
        );

        // All exports of one particle are contiguous, so only the previous
        // record can be a coalescing candidate.
        if self.n_this_particle >= 1 && self.records[self.nexport - 1].task == leaf.task {
            debug_assert_eq!(
                self.records[self.nexport - 1].index,
                target,
                "previous of {} exports is not the current particle",
                self.n_this_particle
            );
            if self.records[self.nexport - 1].nodelist[1] == -1 {
                self.records[self.nexport - 1].nodelist[1] = leaf.treenode;
                return Ok(());
            }
        }

        if self.nexport >= self.records.len() {
            return Err(ExportFull);
        }
        self.records[self.nexport] = ExportRecord {
            task: leaf.task,
            index: target,
            nodelist: [leaf.treenode, -1],
        };
        self.nexport += 1;
        self.n_this_particle += 1;
        Ok(())
    }

    /// Discard the partial exports of the interrupted particle so that only
    /// fully enumerated particles remain in the table.
    ///
    /// # Panics
    /// Panics when the first discarded record does not belong to the
    /// interrupted particle: the export queue lost its ordering.
    pub fn rollback_particle(&mut self, interrupted: u32) {
        self.nexport -= self.n_this_particle;
        if self.n_this_particle > 0 && self.records[self.nexport].index > interrupted {
            panic!(
                "export queue invariant violated: nexport {} (this particle {}), record index {} > interrupted {}",
                self.nexport, self.n_this_particle, self.records[self.nexport].index, interrupted
            );
        }
        self.n_this_particle = 0;
    }

    /// Committed records, for the wire layer.
    pub fn records(&self) -> &[ExportRecord] {
        &self.records[..self.nexport]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{NodeChildren, TopLeaf, Tree, TreeNode};

    /// A tree whose only interesting feature is its top-leaf map.
    fn tree_with_leaves(leaves: Vec<TopLeaf>) -> Tree {
        Tree {
            nodes: vec![TreeNode {
                center: [0.5; 3],
                len: 1.0,
                sibling: -1,
                hmax: 0.0,
                top_level: true,
                internal_top_level: false,
                children: NodeChildren::Particles(Vec::new()),
            }],
            top_leaves: leaves,
            box_size: 1.0,
            mask: 1,
            hmax_valid: false,
            num_particles: 0,
        }
    }

    #[test]
    fn consecutive_same_rank_exports_coalesce() {
        let tree = tree_with_leaves(vec![
            TopLeaf { task: 1, treenode: 10 },
            TopLeaf { task: 1, treenode: 11 },
            TopLeaf { task: 1, treenode: 12 },
        ]);
        let mut store = vec![ExportRecord::default(); 4];
        let mut region = ExportRegion::new(&mut store, 0);

        region.begin_particle();
        region.push(&tree, 7, 0).unwrap();
        region.push(&tree, 7, 1).unwrap();
        assert_eq!(region.nexport(), 1);
        assert_eq!(region.records()[0].nodelist, [10, 11]);

        // Both slots taken: the third visit opens a fresh record.
        region.push(&tree, 7, 2).unwrap();
        assert_eq!(region.nexport(), 2);
        assert_eq!(region.records()[1].nodelist, [12, -1]);
    }

    #[test]
    fn different_rank_does_not_coalesce() {
        let tree = tree_with_leaves(vec![
            TopLeaf { task: 1, treenode: 10 },
            TopLeaf { task: 2, treenode: 20 },
        ]);
        let mut store = vec![ExportRecord::default(); 4];
        let mut region = ExportRegion::new(&mut store, 0);

        region.begin_particle();
        region.push(&tree, 3, 0).unwrap();
        region.push(&tree, 3, 1).unwrap();
        assert_eq!(region.nexport(), 2);
        assert_eq!(region.records()[0], ExportRecord { task: 1, index: 3, nodelist: [10, -1] });
        assert_eq!(region.records()[1], ExportRecord { task: 2, index: 3, nodelist: [20, -1] });
    }

    #[test]
    fn new_particle_never_coalesces_into_previous() {
        let tree = tree_with_leaves(vec![TopLeaf { task: 1, treenode: 10 }]);
        let mut store = vec![ExportRecord::default(); 4];
        let mut region = ExportRegion::new(&mut store, 0);

        region.begin_particle();
        region.push(&tree, 3, 0).unwrap();
        region.begin_particle();
        region.push(&tree, 4, 0).unwrap();
        assert_eq!(region.nexport(), 2);
        assert_eq!(region.records()[1].index, 4);
    }

    #[test]
    fn full_region_signals_and_rolls_back() {
        let tree = tree_with_leaves(vec![
            TopLeaf { task: 1, treenode: 10 },
            TopLeaf { task: 2, treenode: 20 },
            TopLeaf { task: 1, treenode: 30 },
        ]);
        let mut store = vec![ExportRecord::default(); 2];
        let mut region = ExportRegion::new(&mut store, 0);

        region.begin_particle();
        region.push(&tree, 5, 0).unwrap();
        region.begin_particle();
        region.push(&tree, 6, 1).unwrap();
        // Third record does not fit (coalescing cannot save it: new rank run).
        assert_eq!(region.push(&tree, 6, 2), Err(ExportFull));

        region.rollback_particle(6);
        assert_eq!(region.nexport(), 1);
        assert_eq!(region.records()[0].index, 5);
    }
}
