//! Intrusive region lists, linked through unit indices.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::{
    cartesian_tree::UnitIndex,
    region_info::{INVALID_UNIT, RegionType, UNIT_SIZE, UnitInfo, UnitTable},
};

#[derive(Debug, Clone, Copy)]
struct ListState {
    head: UnitIndex,
    tail: UnitIndex,
    region_count: usize,
    unit_count: usize,
    /// Only meaningful for caches.
    active: bool,
}

impl ListState {
    const EMPTY: ListState = ListState {
        head: INVALID_UNIT,
        tail: INVALID_UNIT,
        region_count: 0,
        unit_count: 0,
        active: false,
    };
}

/// A mutex guarded doubly linked list of regions.
///
/// Every region is on at most one list at a time, and its region type names
/// that list.
pub struct RegionList {
    name: &'static str,
    units: Arc<UnitTable>,
    state: Mutex<ListState>,
}

/// The locked list. Lets callers combine several steps under one lock.
pub struct LockedRegionList<'a> {
    list: &'a RegionList,
    state: MutexGuard<'a, ListState>,
}

impl LockedRegionList<'_> {
    pub fn head(&self) -> Option<&UnitInfo> {
        (self.state.head != INVALID_UNIT).then(|| self.list.units.unit(self.state.head))
    }

    pub fn prepend(&mut self, region: &UnitInfo, ty: RegionType) {
        log::trace!(
            "{} ({}, {}) prepend region {} type {:?} -> {ty:?}",
            self.list.name,
            self.state.region_count,
            self.state.unit_count,
            region.index(),
            region.region_type()
        );
        let units = &self.list.units;
        region.set_region_type(ty);
        region.set_prev(INVALID_UNIT);
        region.set_next(self.state.head);
        if self.state.head == INVALID_UNIT {
            crate::heap_check!(
                self.state.tail == INVALID_UNIT,
                "{}: tail without head",
                self.list.name
            );
            self.state.tail = region.index();
        } else {
            units.unit(self.state.head).set_prev(region.index());
        }
        self.state.head = region.index();
        self.state.region_count += 1;
        self.state.unit_count += region.unit_count() as usize;
    }

    pub fn delete(&mut self, region: &UnitInfo) {
        crate::heap_check!(
            self.state.head != INVALID_UNIT && self.state.tail != INVALID_UNIT,
            "{}: delete of region {} from empty list",
            self.list.name,
            region.index()
        );
        let units = &self.list.units;
        let prev = region.prev();
        let next = region.next();
        region.set_prev(INVALID_UNIT);
        region.set_next(INVALID_UNIT);

        let count = region.unit_count() as usize;
        if self.state.region_count < 1 || self.state.unit_count < count {
            crate::fatal!(
                "{}: count underflow ({}, {}) - (1, {count})",
                self.list.name,
                self.state.region_count,
                self.state.unit_count
            );
        }
        self.state.region_count -= 1;
        self.state.unit_count -= count;

        if self.state.head == region.index() {
            crate::heap_check!(prev == INVALID_UNIT, "{}: head has a prev", self.list.name);
            self.state.head = next;
        } else {
            units.unit(prev).set_next(next);
        }
        if self.state.tail == region.index() {
            crate::heap_check!(next == INVALID_UNIT, "{}: tail has a next", self.list.name);
            self.state.tail = prev;
        } else {
            units.unit(next).set_prev(prev);
        }
        if self.state.head == INVALID_UNIT || self.state.tail == INVALID_UNIT {
            *self.state = ListState {
                active: self.state.active,
                ..ListState::EMPTY
            };
        }
    }
}

impl RegionList {
    pub fn new(name: &'static str, units: Arc<UnitTable>) -> Self {
        Self {
            name,
            units,
            state: Mutex::new(ListState::EMPTY),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lock(&self) -> LockedRegionList<'_> {
        LockedRegionList {
            list: self,
            state: self.state.lock(),
        }
    }

    pub fn prepend(&self, region: &UnitInfo, ty: RegionType) {
        self.lock().prepend(region, ty);
    }

    pub fn delete(&self, region: &UnitInfo) {
        self.lock().delete(region);
    }

    /// Deletes `region` if it still has type `old`, retyping it to `new`.
    pub fn try_delete(&self, region: &UnitInfo, old: RegionType, new: RegionType) -> bool {
        debug_assert_ne!(old, new);
        let mut list = self.lock();
        if region.region_type() != old {
            return false;
        }
        list.delete(region);
        region.set_region_type(new);
        true
    }

    /// Pops the head region.
    pub fn take_head(&self) -> Option<&UnitInfo> {
        self.take_head_as(None)
    }

    /// Pops the head region and retypes it under the list lock.
    pub fn take_head_as(&self, ty: Option<RegionType>) -> Option<&UnitInfo> {
        let mut list = self.lock();
        let head = list.state.head;
        if head == INVALID_UNIT {
            return None;
        }
        let region = self.units.unit(head);
        list.delete(region);
        if let Some(ty) = ty {
            region.set_region_type(ty);
        }
        Some(region)
    }

    pub fn head(&self) -> Option<&UnitInfo> {
        let head = self.state.lock().head;
        (head != INVALID_UNIT).then(|| self.units.unit(head))
    }

    /// Moves every region of `src` to the front of this list as `ty`.
    pub fn merge(&self, src: &RegionList, ty: RegionType) {
        let taken = {
            let mut src = src.state.lock();
            let taken = *src;
            *src = ListState {
                active: src.active,
                ..ListState::EMPTY
            };
            taken
        };
        if taken.head == INVALID_UNIT {
            return;
        }
        let mut state = self.state.lock();
        let mut idx = taken.head;
        while idx != INVALID_UNIT {
            let region = self.units.unit(idx);
            region.set_region_type(ty);
            idx = region.next();
        }
        if state.head == INVALID_UNIT {
            state.head = taken.head;
            state.tail = taken.tail;
        } else {
            self.units.unit(taken.tail).set_next(state.head);
            self.units.unit(state.head).set_prev(taken.tail);
            state.head = taken.head;
        }
        state.region_count += taken.region_count;
        state.unit_count += taken.unit_count;
    }

    /// Makes `dst` a snapshot of this list. The ghost links (`next0`) of the
    /// members must already be set.
    pub fn copy_to(&self, dst: &RegionList) {
        let snapshot = *self.state.lock();
        let mut dst = dst.state.lock();
        *dst = ListState {
            active: dst.active,
            ..snapshot
        };
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        *state = ListState {
            active: state.active,
            ..ListState::EMPTY
        };
    }

    pub fn visit(&self, mut f: impl FnMut(&UnitInfo)) {
        let state = self.state.lock();
        let mut idx = state.head;
        while idx != INVALID_UNIT {
            let region = self.units.unit(idx);
            idx = region.next();
            f(region);
        }
    }

    /// The members in list order, for walks that modify the list.
    pub fn regions(&self) -> Vec<&UnitInfo> {
        let mut out = Vec::with_capacity(self.region_count());
        self.visit(|r| out.push(self.units.unit(r.index())));
        out
    }

    /// Walks the list through the ghost links.
    pub fn visit_ghost(&self, mut f: impl FnMut(&UnitInfo)) {
        let head = self.state.lock().head;
        let mut idx = head;
        while idx != INVALID_UNIT {
            let region = self.units.unit(idx);
            idx = region.next0();
            f(region);
        }
    }

    pub fn set_element_type(&self, ty: RegionType) {
        self.visit(|r| r.set_region_type(ty));
    }

    pub fn clear_trace_flag(&self) {
        self.visit(|r| r.set_trace_region(false));
    }

    pub fn region_count(&self) -> usize {
        self.state.lock().region_count
    }

    pub fn unit_count(&self) -> usize {
        self.state.lock().unit_count
    }

    pub fn allocated_size(&self) -> usize {
        self.unit_count() * UNIT_SIZE
    }

    /// Sum of bytes below the allocation pointers.
    pub fn used_size(&self) -> usize {
        let mut used = 0;
        self.visit(|r| used += r.allocated_bytes());
        used
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().head == INVALID_UNIT
    }

    // ── cache behaviour ──

    /// Prepends only while the list is active.
    pub fn try_prepend(&self, region: &UnitInfo, ty: RegionType) -> bool {
        let mut list = self.lock();
        if !list.state.active {
            return false;
        }
        list.prepend(region, ty);
        true
    }

    pub fn activate(&self) {
        self.state.lock().active = true;
    }

    /// Stops accepting regions and clears the trace flag of the members.
    pub fn deactivate(&self) {
        let mut state = self.state.lock();
        let mut idx = state.head;
        while idx != INVALID_UNIT {
            let region = self.units.unit(idx);
            region.set_trace_region(false);
            idx = region.next();
        }
        state.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mem_map::MemMap, region_info::UnitRole};

    fn create_test_env(units: usize) -> (MemMap, Arc<UnitTable>) {
        let map = MemMap::map(units * UNIT_SIZE, "test-lists").expect("map");
        let table = Arc::new(UnitTable::new(map.start(), units));
        (map, table)
    }

    fn collect(list: &RegionList) -> Vec<UnitIndex> {
        let mut out = Vec::new();
        list.visit(|r| out.push(r.index()));
        out
    }

    #[test]
    fn test_prepend_and_delete_keep_counts() {
        let (_map, units) = create_test_env(16);
        let list = RegionList::new("test", units.clone());
        for (idx, n) in [(0, 2), (2, 1), (3, 4)] {
            units.init_region(idx, n, UnitRole::Small);
            list.prepend(units.unit(idx), RegionType::ThreadLocal);
        }
        assert_eq!(collect(&list), vec![3, 2, 0]);
        assert_eq!(list.unit_count(), 7);

        list.delete(units.unit(2));
        assert_eq!(collect(&list), vec![3, 0]);
        list.delete(units.unit(0));
        list.delete(units.unit(3));
        assert!(list.is_empty());
        assert_eq!(list.region_count(), 0);
        assert_eq!(list.unit_count(), 0);
    }

    #[test]
    fn test_try_delete_checks_type() {
        let (_map, units) = create_test_env(4);
        let list = RegionList::new("from", units.clone());
        units.init_region(0, 1, UnitRole::Small);
        let region = units.unit(0);
        list.prepend(region, RegionType::From);
        assert!(!list.try_delete(region, RegionType::ThreadLocal, RegionType::From));
        assert!(list.try_delete(region, RegionType::From, RegionType::UnmovableFrom));
        assert_eq!(region.region_type(), RegionType::UnmovableFrom);
        assert!(list.is_empty());
    }

    #[test]
    fn test_merge_splices_in_front() {
        let (_map, units) = create_test_env(8);
        let a = RegionList::new("a", units.clone());
        let b = RegionList::new("b", units.clone());
        for idx in 0..4 {
            units.init_region(idx, 1, UnitRole::Small);
        }
        a.prepend(units.unit(0), RegionType::From);
        b.prepend(units.unit(1), RegionType::RecentFull);
        b.prepend(units.unit(2), RegionType::RecentFull);

        a.merge(&b, RegionType::From);
        assert!(b.is_empty());
        assert_eq!(collect(&a), vec![2, 1, 0]);
        assert_eq!(a.region_count(), 3);
        a.visit(|r| assert_eq!(r.region_type(), RegionType::From));

        // deleting the old head after merge still relinks correctly
        a.delete(units.unit(0));
        assert_eq!(collect(&a), vec![2, 1]);
    }

    #[test]
    fn test_cache_accepts_only_while_active() {
        let (_map, units) = create_test_env(4);
        let cache = RegionList::new("full-trace", units.clone());
        units.init_region(0, 1, UnitRole::Small);
        let region = units.unit(0);
        region.set_trace_region(true);
        assert!(!cache.try_prepend(region, RegionType::RecentFull));
        cache.activate();
        assert!(cache.try_prepend(region, RegionType::RecentFull));
        cache.deactivate();
        assert!(!region.is_trace_region());
        assert_eq!(cache.region_count(), 1);
    }

    #[test]
    fn test_ghost_copy_survives_list_changes() {
        let (_map, units) = create_test_env(4);
        let from = RegionList::new("from", units.clone());
        let ghost = RegionList::new("ghost", units.clone());
        for idx in 0..3 {
            units.init_region(idx, 1, UnitRole::Small);
            from.prepend(units.unit(idx), RegionType::From);
        }
        from.visit(|r| r.set_next0(r.next()));
        from.copy_to(&ghost);
        from.delete(units.unit(1));

        let mut seen = Vec::new();
        ghost.visit_ghost(|r| seen.push(r.index()));
        assert_eq!(seen, vec![2, 1, 0]);
    }
}
