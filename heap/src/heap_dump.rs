//! Heap dumps and reachability walks.
//!
//! Both run with the world stopped and no cycle in progress, so region
//! lists and reference words are stable while they are read.

use std::{
    collections::{HashSet, VecDeque},
    io::{self, Write},
    sync::atomic::Ordering,
};

use crate::{
    heap::HeapInner,
    mutator_manager::ScopedStopTheWorld,
    object::{ObjectRef, RefField},
};

/// Breadth-first walk over everything reachable from the mutator and
/// static roots. Each object is visited once.
fn walk_reachable(heap: &HeapInner, mut visit: impl FnMut(ObjectRef)) {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();
    let mut reach = |obj: ObjectRef, queue: &mut VecDeque<ObjectRef>| {
        if heap.is_heap_object(obj) && seen.insert(obj.addr()) {
            queue.push_back(obj);
        }
    };

    let mut roots = Vec::new();
    heap.mutators.for_each_mutator(|m| {
        m.visit_roots(&mut |slot| roots.push(*slot));
    });
    heap.static_roots
        .visit(|field| roots.push(resolve(heap, field)));
    for root in roots {
        reach(root, &mut queue);
    }

    while let Some(obj) = queue.pop_front() {
        visit(obj);
        let mut children = Vec::new();
        // SAFETY: only reachable objects are queued
        unsafe {
            (heap.trace_fn)(obj, &mut |field| children.push(resolve(heap, field)));
        }
        for child in children {
            reach(child, &mut queue);
        }
    }
}

#[inline]
fn resolve(heap: &HeapInner, field: &RefField) -> ObjectRef {
    heap.decode_latest(field.load(Ordering::Acquire))
}

pub(crate) fn reachable_bytes(heap: &HeapInner) -> usize {
    let _cycle = heap.cycle_lock.lock();
    let _stw = ScopedStopTheWorld::new(&heap.mutators, "reachability walk");
    let mut bytes = 0;
    // SAFETY: the walk yields live objects
    walk_reachable(heap, |obj| bytes += unsafe { obj.size() });
    bytes
}

pub(crate) fn dump_heap(heap: &HeapInner, out: &mut dyn Write) -> io::Result<()> {
    let _cycle = heap.cycle_lock.lock();
    let _stw = ScopedStopTheWorld::new(&heap.mutators, "heap dump");
    let regions = &heap.regions;

    writeln!(out, "# kette heap dump")?;
    writeln!(
        out,
        "heap {} bytes, allocated {} bytes, free {} units, {} mutators, {} gc cycles",
        heap.settings.heap_size,
        regions.allocated_size(),
        regions.free_unit_count(),
        heap.mutators.mutator_count(),
        heap.gc_count()
    )?;

    writeln!(out, "## region lists")?;
    for list in regions.region_lists() {
        writeln!(
            out,
            "{}: {} regions, {} units, {} bytes",
            list.name(),
            list.region_count(),
            list.unit_count(),
            list.allocated_size()
        )?;
    }

    writeln!(out, "## regions")?;
    for list in regions.region_lists() {
        for region in list.regions() {
            writeln!(
                out,
                "{:?} {:#x} {:#x} live {}",
                region.region_type(),
                region.start(),
                region.region_end(),
                region.live_bytes()
            )?;
        }
    }

    writeln!(out, "## reachable objects")?;
    let mut result = Ok(());
    let mut count = 0usize;
    walk_reachable(heap, |obj| {
        if result.is_err() {
            return;
        }
        count += 1;
        // SAFETY: the walk yields live objects
        let (size, type_id) = unsafe { (obj.size(), obj.type_id()) };
        result = writeln!(out, "{:#x} {size} {type_id}", obj.addr());
    });
    result?;
    writeln!(out, "# {count} reachable objects")?;
    log::info!("heap dump wrote {count} objects");
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{
        barrier::tests::{NODE_SIZE, create_test_env},
        gc_request::GcReason,
        object::HEADER_SIZE,
    };

    #[test]
    fn test_dump_lists_reachable_objects_only() {
        let (heap, mut proxy, roots) = create_test_env();
        let a = proxy.new_object(11, NODE_SIZE).expect("a");
        let b = proxy.new_object(12, NODE_SIZE).expect("b");
        proxy.new_object(13, NODE_SIZE).expect("garbage");
        // SAFETY: test nodes have a slot after the header
        proxy.write_ref(a, unsafe { a.field(HEADER_SIZE) }, b);
        roots.push(a);

        proxy.enter_saferegion();
        let mut out = Vec::new();
        heap.dump_heap(&mut out).expect("dump");
        let reachable = heap.reachable_bytes();
        proxy.leave_saferegion();

        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("# kette heap dump"));
        assert!(text.contains("thread-local regions: 1 regions"));
        assert!(text.contains(&format!("{:#x} {NODE_SIZE} 11", a.addr())));
        assert!(text.contains(&format!("{:#x} {NODE_SIZE} 12", b.addr())));
        assert!(!text.contains(&format!(" {NODE_SIZE} 13")));
        assert!(text.ends_with("# 2 reachable objects\n"));
        assert_eq!(reachable, 2 * NODE_SIZE);
    }

    #[test]
    fn test_reachable_bytes_follow_moved_objects() {
        let (heap, mut proxy, roots) = create_test_env();
        let mut prev = proxy.new_object(1, NODE_SIZE).expect("node");
        roots.push(prev);
        for _ in 0..30 {
            let node = proxy.new_object(1, NODE_SIZE).expect("node");
            // SAFETY: test nodes have a slot after the header
            proxy.write_ref(prev, unsafe { prev.field(HEADER_SIZE) }, node);
            prev = node;
            proxy.new_object(2, NODE_SIZE).expect("garbage");
        }
        proxy.retire_region();
        proxy.request_gc(GcReason::User);

        proxy.enter_saferegion();
        assert_eq!(heap.reachable_bytes(), 31 * NODE_SIZE);
        proxy.leave_saferegion();
    }
}
