//! Per-cycle statistics, global counters and the heap threshold.

use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use crate::gc_request::GcReason;

/// Monotonic nanoseconds since the heap was created.
#[derive(Debug, Clone, Copy)]
pub struct GcClock {
    epoch: Instant,
}

impl GcClock {
    /// Timestamp of an event that has not happened yet.
    pub const NEVER: u64 = 0;

    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Never returns [`Self::NEVER`].
    pub fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos())
            .unwrap_or(u64::MAX)
            .max(1)
    }
}

impl Default for GcClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct GcStats {
    pub reason: GcReason,
    pub is_async: bool,
    pub is_concurrent: bool,
    /// Clock timestamps of the cycle.
    pub gc_start_ns: u64,
    pub gc_end_ns: u64,

    pub live_bytes_before: usize,
    pub live_bytes_after: usize,

    pub from_space_size: usize,
    pub small_garbage_size: usize,

    pub pinned_space_size: usize,
    pub pinned_garbage_size: usize,

    pub large_space_size: usize,
    pub large_garbage_size: usize,

    pub collected_bytes: usize,
    pub garbage_ratio: f64,
    pub heap_threshold: usize,
}

impl GcStats {
    pub fn new(reason: GcReason, is_async: bool, now: u64) -> Self {
        Self {
            reason,
            is_async,
            is_concurrent: reason.is_concurrent(),
            gc_start_ns: now,
            gc_end_ns: now,
            live_bytes_before: 0,
            live_bytes_after: 0,
            from_space_size: 0,
            small_garbage_size: 0,
            pinned_space_size: 0,
            pinned_garbage_size: 0,
            large_space_size: 0,
            large_garbage_size: 0,
            collected_bytes: 0,
            garbage_ratio: 0.0,
            heap_threshold: 0,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.gc_end_ns.saturating_sub(self.gc_start_ns))
    }

    /// Sums up what the cycle reclaimed.
    pub fn finish(&mut self, now: u64) {
        self.gc_end_ns = now;
        self.collected_bytes =
            self.small_garbage_size + self.large_garbage_size + self.pinned_garbage_size;
        self.garbage_ratio = if self.from_space_size == 0 {
            0.0
        } else {
            self.small_garbage_size as f64 / self.from_space_size as f64
        };
    }

    /// The summary line of a cycle.
    pub fn dump(&self, allocated: usize, heap_size: usize) {
        let utilization = if heap_size == 0 {
            0.0
        } else {
            allocated as f64 / heap_size as f64 * 100.0
        };
        log::info!(
            "gc for {}: {} collected {} bytes, live {} -> {}, {:.2}% utilization ({}/{}), threshold {}, took {}us",
            self.reason,
            if self.is_async { "async" } else { "sync" },
            self.collected_bytes,
            self.live_bytes_before,
            self.live_bytes_after,
            utilization,
            allocated,
            heap_size,
            self.heap_threshold,
            self.duration().as_micros()
        );
    }
}

/// Next allocation threshold for `live` bytes surviving a cycle.
pub fn compute_heap_threshold(
    live: usize,
    utilization: f64,
    growth: f64,
    heap_size: usize,
) -> usize {
    let live = live as f64;
    let target = live / utilization;
    let minimum = live * (1.0 + growth);
    (target.max(minimum) as usize).min(heap_size)
}

/// Counters that outlive single cycles.
#[derive(Debug, Default)]
pub struct GcCounters {
    pub gc_count: AtomicUsize,
    pub gc_total_time_us: AtomicU64,
    pub gc_collected_total_bytes: AtomicUsize,
    pub prev_gc_start_ns: AtomicU64,
    pub prev_gc_finish_ns: AtomicU64,
}

impl GcCounters {
    pub fn record_cycle(&self, stats: &GcStats) {
        self.gc_count.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(stats.duration().as_micros()).unwrap_or(u64::MAX);
        self.gc_total_time_us.fetch_add(micros, Ordering::Relaxed);
        self.gc_collected_total_bytes
            .fetch_add(stats.collected_bytes, Ordering::Relaxed);
    }

    pub fn prev_gc_start(&self) -> u64 {
        self.prev_gc_start_ns.load(Ordering::Relaxed)
    }

    pub fn prev_gc_finish(&self) -> u64 {
        self.prev_gc_finish_ns.load(Ordering::Relaxed)
    }
}
