//! Free-interval tree.
//!
//! A Cartesian tree over `(index, count)` intervals: a binary search tree by
//! `index` and a max-heap by `count`, so the largest free run is always the
//! root. Adjacent intervals are never stored side by side; inserting an
//! interval that touches a neighbor merges them.
//!
//! Nodes live in an arena and link to each other by `u32` handles.
//! The tree is not synchronized; owners wrap it in a lock.

use thiserror::Error;

pub type UnitIndex = u32;
pub type UnitCount = u32;

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("zero-length interval at {0}")]
    Empty(UnitIndex),
    #[error("interval [{index}+{count}) overlaps a free interval")]
    Overlap { index: UnitIndex, count: UnitCount },
}

#[derive(Debug, Clone, Copy)]
struct Node {
    l: u32,
    r: u32,
    index: UnitIndex,
    count: UnitCount,
}

/// Location of a child handle: the root field or a child of some node.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Root,
    Left(u32),
    Right(u32),
}

#[derive(Debug)]
pub struct CartesianTree {
    nodes: Vec<Node>,
    free_nodes: Vec<u32>,
    root: u32,
    total_count: usize,
}

impl Default for CartesianTree {
    fn default() -> Self {
        Self::new()
    }
}

impl CartesianTree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free_nodes: Vec::new(),
            root: NIL,
            total_count: 0,
        }
    }

    /// A tree over `unit_count` units needs at most one node per two units.
    pub fn with_capacity(unit_count: usize) -> Self {
        let mut tree = Self::new();
        tree.nodes.reserve((unit_count >> 1) + 1);
        tree
    }

    #[inline]
    pub fn total_count(&self) -> usize {
        self.total_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root == NIL
    }

    /// The largest free interval.
    pub fn root_interval(&self) -> Option<(UnitIndex, UnitCount)> {
        (self.root != NIL).then(|| {
            let n = self.nodes[self.root as usize];
            (n.index, n.count)
        })
    }

    // ── Arena ────────────────────────────────────────────────────────

    fn alloc_node(&mut self, index: UnitIndex, count: UnitCount) -> u32 {
        let node = Node {
            l: NIL,
            r: NIL,
            index,
            count,
        };
        if let Some(handle) = self.free_nodes.pop() {
            self.nodes[handle as usize] = node;
            handle
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as u32
        }
    }

    fn free_node(&mut self, handle: u32) {
        self.nodes[handle as usize].l = NIL;
        self.nodes[handle as usize].r = NIL;
        self.free_nodes.push(handle);
    }

    #[inline(always)]
    fn node(&self, handle: u32) -> &Node {
        &self.nodes[handle as usize]
    }

    #[inline(always)]
    fn node_mut(&mut self, handle: u32) -> &mut Node {
        &mut self.nodes[handle as usize]
    }

    #[inline(always)]
    fn count_of(&self, handle: u32) -> UnitCount {
        if handle == NIL {
            0
        } else {
            self.node(handle).count
        }
    }

    #[inline(always)]
    fn get_slot(&self, slot: Slot) -> u32 {
        match slot {
            Slot::Root => self.root,
            Slot::Left(p) => self.node(p).l,
            Slot::Right(p) => self.node(p).r,
        }
    }

    #[inline(always)]
    fn set_slot(&mut self, slot: Slot, handle: u32) {
        match slot {
            Slot::Root => self.root = handle,
            Slot::Left(p) => self.node_mut(p).l = handle,
            Slot::Right(p) => self.node_mut(p).r = handle,
        }
    }

    fn rotate_left_child(&mut self, n: u32) -> u32 {
        let new_root = self.node(n).l;
        self.node_mut(n).l = self.node(new_root).r;
        self.node_mut(new_root).r = n;
        new_root
    }

    fn rotate_right_child(&mut self, n: u32) -> u32 {
        let new_root = self.node(n).r;
        self.node_mut(n).r = self.node(new_root).l;
        self.node_mut(new_root).l = n;
        new_root
    }

    // ── Insertion ────────────────────────────────────────────────────

    /// Inserts the free interval `[index, index + count)`, merging it with
    /// any touching neighbor.
    pub fn merge_insert(
        &mut self,
        index: UnitIndex,
        count: UnitCount,
    ) -> Result<(), TreeError> {
        if count == 0 {
            return Err(TreeError::Empty(index));
        }
        if self.root == NIL {
            self.root = self.alloc_node(index, count);
            self.total_count += count as usize;
            return Ok(());
        }

        let end = index + count;
        let overlap = TreeError::Overlap { index, count };
        let mut path: Vec<Slot> = Vec::new();
        let mut slot = Slot::Root;
        let mut n = self.root;
        loop {
            if n == NIL {
                let fresh = self.alloc_node(index, count);
                self.set_slot(slot, fresh);
                self.total_count += count as usize;
                break;
            }
            if self.merge_at(n, index, count)? {
                break;
            }
            let node = *self.node(n);
            path.push(slot);
            if end < node.index {
                slot = Slot::Left(n);
                n = node.l;
            } else if index > node.index + node.count {
                slot = Slot::Right(n);
                n = node.r;
            } else {
                return Err(overlap);
            }
        }

        // bubble the grown node up while it outweighs its parent
        while let Some(slot) = path.pop() {
            let n = self.get_slot(slot);
            let node = *self.node(n);
            if end < node.index {
                if node.count < self.count_of(node.l) {
                    let up = self.rotate_left_child(n);
                    self.set_slot(slot, up);
                } else {
                    break;
                }
            } else if index > node.index + node.count {
                if node.count < self.count_of(node.r) {
                    let up = self.rotate_right_child(n);
                    self.set_slot(slot, up);
                } else {
                    break;
                }
            } else {
                return Err(overlap);
            }
        }
        Ok(())
    }

    /// Returns `Ok(true)` if the interval was merged into `n`.
    fn merge_at(
        &mut self,
        n: u32,
        index: UnitIndex,
        count: UnitCount,
    ) -> Result<bool, TreeError> {
        let node = *self.node(n);
        let end = index + count;
        if index == node.index + node.count {
            self.merge_to_right(n, end, count, index)?;
            return Ok(true);
        }
        if end == node.index {
            self.merge_to_left(n, index, count)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn merge_to_right(
        &mut self,
        n: u32,
        end: UnitIndex,
        count: UnitCount,
        index: UnitIndex,
    ) -> Result<(), TreeError> {
        let overlap = TreeError::Overlap { index, count };
        let mut parent = Slot::Right(n);
        let mut nearest = self.node(n).r;
        while nearest != NIL {
            let near = *self.node(nearest);
            if near.index == end {
                if near.l != NIL {
                    return Err(overlap);
                }
                break;
            } else if near.index < end {
                return Err(overlap);
            }
            parent = Slot::Left(nearest);
            nearest = near.l;
        }

        self.node_mut(n).count += count;
        self.total_count += count as usize;
        if nearest != NIL {
            let near = *self.node(nearest);
            self.node_mut(n).count += near.count;
            self.set_slot(parent, near.r);
            self.free_node(nearest);
        }
        Ok(())
    }

    fn merge_to_left(
        &mut self,
        n: u32,
        start: UnitIndex,
        count: UnitCount,
    ) -> Result<(), TreeError> {
        let overlap = TreeError::Overlap {
            index: start,
            count,
        };
        let mut parent = Slot::Left(n);
        let mut nearest = self.node(n).l;
        while nearest != NIL {
            let near = *self.node(nearest);
            let near_end = near.index + near.count;
            if near_end == start {
                if near.r != NIL {
                    return Err(overlap);
                }
                break;
            } else if near_end > start {
                return Err(overlap);
            }
            parent = Slot::Right(nearest);
            nearest = near.r;
        }

        {
            let node = self.node_mut(n);
            node.index = start;
            node.count += count;
        }
        self.total_count += count as usize;
        if nearest != NIL {
            let near = *self.node(nearest);
            self.set_slot(parent, near.l);
            let node = self.node_mut(n);
            node.index = near.index;
            node.count += near.count;
            self.free_node(nearest);
        }
        Ok(())
    }

    // ── Removal ──────────────────────────────────────────────────────

    /// Takes `count` units from the lowest-addressed interval that can hold
    /// them and returns the start index.
    ///
    /// The walk starts at the root and goes left while the left child still
    /// fits; the heap property guarantees nothing further left fits once it
    /// stops.
    pub fn take_units(&mut self, count: UnitCount) -> Option<UnitIndex> {
        if self.root == NIL || count == 0 {
            return None;
        }
        if self.node(self.root).count < count {
            return None;
        }

        let mut slot = Slot::Root;
        let mut n = self.root;
        loop {
            let l = self.node(n).l;
            if l != NIL && self.node(l).count >= count {
                slot = Slot::Left(n);
                n = l;
            } else {
                break;
            }
        }

        let index = self.node(n).index;
        {
            let node = self.node_mut(n);
            node.index += count;
            node.count -= count;
        }
        self.total_count -= count as usize;
        if self.node(n).count == 0 {
            self.remove_zero_node(slot);
        } else {
            self.lower_node(slot);
        }
        Some(index)
    }

    /// Removes the largest interval entirely.
    pub fn take_root(&mut self) -> Option<(UnitIndex, UnitCount)> {
        let (index, count) = self.root_interval()?;
        self.node_mut(self.root).count = 0;
        self.total_count -= count as usize;
        self.remove_zero_node(Slot::Root);
        Some((index, count))
    }

    /// Sifts the node in `slot` down until both children are smaller.
    fn lower_node(&mut self, mut slot: Slot) {
        loop {
            let n = self.get_slot(slot);
            let node = *self.node(n);
            let lc = self.count_of(node.l);
            let rc = self.count_of(node.r);
            if node.l != NIL && lc > node.count {
                if node.r != NIL && rc > lc {
                    let up = self.rotate_right_child(n);
                    self.set_slot(slot, up);
                    slot = Slot::Left(up);
                } else {
                    let up = self.rotate_left_child(n);
                    self.set_slot(slot, up);
                    slot = Slot::Right(up);
                }
            } else if node.r != NIL && rc > node.count {
                let up = self.rotate_right_child(n);
                self.set_slot(slot, up);
                slot = Slot::Left(up);
            } else {
                return;
            }
        }
    }

    /// Rotates an empty node down to where it has at most one child, then
    /// splices it out.
    fn remove_zero_node(&mut self, mut slot: Slot) {
        loop {
            let n = self.get_slot(slot);
            let node = *self.node(n);
            match (node.l != NIL, node.r != NIL) {
                (true, true) => {
                    if self.count_of(node.r) >= self.count_of(node.l) {
                        let up = self.rotate_right_child(n);
                        self.set_slot(slot, up);
                        slot = Slot::Left(up);
                    } else {
                        let up = self.rotate_left_child(n);
                        self.set_slot(slot, up);
                        slot = Slot::Right(up);
                    }
                }
                (true, false) => {
                    self.set_slot(slot, node.l);
                    self.free_node(n);
                    return;
                }
                (false, true) => {
                    self.set_slot(slot, node.r);
                    self.free_node(n);
                    return;
                }
                (false, false) => {
                    self.set_slot(slot, NIL);
                    self.free_node(n);
                    return;
                }
            }
        }
    }

    // ── Inspection ───────────────────────────────────────────────────

    /// All free intervals in address order.
    pub fn intervals(&self) -> Vec<(UnitIndex, UnitCount)> {
        let mut out = Vec::new();
        let mut stack = Vec::new();
        let mut n = self.root;
        while n != NIL || !stack.is_empty() {
            while n != NIL {
                stack.push(n);
                n = self.node(n).l;
            }
            let Some(top) = stack.pop() else { break };
            let node = self.node(top);
            out.push((node.index, node.count));
            n = node.r;
        }
        out
    }

    /// Verifies ordering, heap property, non-adjacency and the total.
    pub fn verify(&self) -> Result<(), String> {
        let mut stack = vec![self.root];
        while let Some(n) = stack.pop() {
            if n == NIL {
                continue;
            }
            let node = self.node(n);
            if node.count == 0 {
                return Err(format!("empty node at {}", node.index));
            }
            for child in [node.l, node.r] {
                if child != NIL && self.node(child).count > node.count {
                    return Err(format!(
                        "heap order broken at {}+{}",
                        node.index, node.count
                    ));
                }
            }
            stack.push(node.l);
            stack.push(node.r);
        }

        let intervals = self.intervals();
        for pair in intervals.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.0 + a.1 >= b.0 {
                return Err(format!(
                    "intervals {}+{} and {}+{} touch",
                    a.0, a.1, b.0, b.1
                ));
            }
        }
        let sum: usize = intervals.iter().map(|&(_, c)| c as usize).sum();
        if sum != self.total_count {
            return Err(format!("total {} != sum {sum}", self.total_count));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_merge_adjacent_in_order() {
        let mut tree = CartesianTree::new();
        tree.merge_insert(10, 4).unwrap();
        tree.merge_insert(14, 6).unwrap();
        assert_eq!(tree.intervals(), vec![(10, 10)]);
        assert_eq!(tree.total_count(), 10);
        tree.verify().unwrap();
    }

    #[test]
    fn test_merge_adjacent_reverse_order() {
        let mut tree = CartesianTree::new();
        tree.merge_insert(14, 6).unwrap();
        tree.merge_insert(10, 4).unwrap();
        assert_eq!(tree.intervals(), vec![(10, 10)]);
        tree.verify().unwrap();
    }

    #[test]
    fn test_merge_bridges_two_intervals() {
        let mut tree = CartesianTree::new();
        tree.merge_insert(0, 2).unwrap();
        tree.merge_insert(8, 3).unwrap();
        tree.merge_insert(20, 1).unwrap();
        tree.merge_insert(2, 6).unwrap();
        assert_eq!(tree.intervals(), vec![(0, 11), (20, 1)]);
        assert_eq!(tree.root_interval(), Some((0, 11)));
        tree.verify().unwrap();
    }

    #[test]
    fn test_overlap_is_rejected() {
        let mut tree = CartesianTree::new();
        tree.merge_insert(0, 10).unwrap();
        tree.merge_insert(20, 10).unwrap();
        assert!(matches!(
            tree.merge_insert(5, 2),
            Err(TreeError::Overlap { .. })
        ));
        assert!(matches!(
            tree.merge_insert(25, 10),
            Err(TreeError::Overlap { .. })
        ));
        assert_eq!(tree.merge_insert(40, 0), Err(TreeError::Empty(40)));
        assert_eq!(tree.total_count(), 20);
    }

    #[test]
    fn test_take_prefers_lowest_address() {
        let mut tree = CartesianTree::new();
        tree.merge_insert(100, 50).unwrap();
        tree.merge_insert(0, 4).unwrap();
        tree.merge_insert(10, 8).unwrap();
        tree.merge_insert(30, 20).unwrap();

        assert_eq!(tree.take_units(3), Some(0));
        assert_eq!(tree.take_units(8), Some(10));
        assert_eq!(tree.take_units(20), Some(30));
        assert_eq!(tree.take_units(60), None);
        assert_eq!(tree.take_units(50), Some(100));
        assert_eq!(tree.intervals(), vec![(3, 1)]);
        tree.verify().unwrap();
    }

    #[test]
    fn test_take_root_removes_largest() {
        let mut tree = CartesianTree::new();
        tree.merge_insert(0, 3).unwrap();
        tree.merge_insert(10, 30).unwrap();
        tree.merge_insert(50, 5).unwrap();
        assert_eq!(tree.take_root(), Some((10, 30)));
        assert_eq!(tree.total_count(), 8);
        tree.verify().unwrap();
    }

    fn fragment(units: u32, sizes: &[u32]) -> (CartesianTree, Vec<(u32, u32)>) {
        let mut tree = CartesianTree::with_capacity(units as usize);
        tree.merge_insert(0, units).unwrap();
        let mut taken = Vec::new();
        for &size in sizes {
            if let Some(idx) = tree.take_units(size) {
                taken.push((idx, size));
            }
        }
        (tree, taken)
    }

    proptest! {
        #[test]
        fn test_balanced_ops_leave_tree_whole(
            sizes in proptest::collection::vec(1u32..40, 1..64),
            order in proptest::collection::vec(any::<u32>(), 64),
        ) {
            let units = 1024;
            let (mut tree, mut taken) = fragment(units, &sizes);
            tree.verify().unwrap();

            // return in a scrambled order
            for (i, key) in order.iter().enumerate() {
                let n = taken.len();
                if n > 1 {
                    let j = (*key as usize) % n;
                    taken.swap(i % n, j);
                }
            }
            for (idx, size) in taken {
                tree.merge_insert(idx, size).unwrap();
                tree.verify().unwrap();
            }
            prop_assert_eq!(tree.intervals(), vec![(0, units)]);

            prop_assert_eq!(tree.take_units(units), Some(0));
            prop_assert!(tree.is_empty());
            prop_assert_eq!(tree.total_count(), 0);
        }

        #[test]
        fn test_free_and_taken_never_overlap(
            sizes in proptest::collection::vec(1u32..64, 1..48),
            returns in proptest::collection::vec(any::<bool>(), 48),
        ) {
            let units = 2048;
            let (mut tree, taken) = fragment(units, &sizes);
            let mut held = Vec::new();
            for (i, interval) in taken.into_iter().enumerate() {
                if returns[i % returns.len()] {
                    tree.merge_insert(interval.0, interval.1).unwrap();
                } else {
                    held.push(interval);
                }
            }
            tree.verify().unwrap();

            let mut all: Vec<(u32, u32)> = tree.intervals();
            all.extend(held.iter().copied());
            all.sort();
            let mut cursor = 0;
            for (idx, count) in all {
                prop_assert_eq!(idx, cursor, "gap or overlap at {}", idx);
                cursor = idx + count;
            }
            prop_assert_eq!(cursor, units);
        }
    }
}
