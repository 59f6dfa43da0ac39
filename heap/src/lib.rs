//! A concurrent region-based copying collector.
//!
//! The heap is carved into fixed units that group into regions. Mutators
//! bump-allocate from thread-local regions; a dedicated collector thread
//! marks concurrently under a snapshot-at-the-beginning barrier and then
//! evacuates sparse regions while mutators keep running. Every reference
//! access goes through the barrier of the current phase, reached through a
//! [`HeapProxy`].

mod system;

mod alloc_buffer;
mod barrier;
mod cartesian_tree;
mod collector;
mod error;
mod forward_data;
mod free_region_manager;
mod gc_phase;
mod gc_request;
mod gc_stats;
mod gc_task;
mod gc_thread_pool;
mod heap;
mod heap_dump;
mod live_info;
mod mem_map;
mod mutator;
mod mutator_manager;
mod object;
mod page_pool;
mod region_info;
mod region_list;
mod region_manager;
mod roots;
mod safepoint;
mod satb_buffer;
mod settings;

pub use system::{OS_PAGE_SIZE, map_memory, unmap_memory};

pub use error::HeapError;
pub use gc_phase::GcPhase;
pub use gc_request::GcReason;
pub use gc_stats::GcStats;
pub use heap::{Heap, HeapInner, HeapProxy};
pub use mutator::Mutator;
pub use mutator_manager::ScopedStopTheWorld;
pub use object::{
    ARRAY_HEADER_SIZE, BaseObject, GcTib, HEADER_SIZE, OBJECT_ALIGNMENT, ObjectRef, ObjectState,
    RefField, RefWord, TraceFn, align_object,
};
pub use region_info::UNIT_SIZE;
pub use roots::{RootProvider, RootStack, StaticRoots};
pub use settings::HeapSettings;
