use std::time::Duration;

use crate::system::OS_PAGE_SIZE;

/// Configuration of the region heap and its collector.
///
/// Read once when the heap is created. [`HeapSettings::validate`] rejects
/// layouts that cannot work at all, [`HeapSettings::sanitize`] replaces
/// tunables that are out of range with their defaults.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Total reserved heap in bytes. Must be a multiple of `region_size`.
    pub heap_size: usize,
    /// Size of a thread-local region. Must be a multiple of the unit size.
    pub region_size: usize,
    /// Objects of at least this size get a region of their own.
    pub large_object_threshold: usize,
    /// Garbage ratio of the from space above which a cycle counts as
    /// productive.
    pub garbage_threshold: f64,
    /// From-regions with more live bytes than this fraction of their size
    /// are not evacuated.
    pub exemption_threshold: f64,
    /// Target ratio of live bytes to the heap threshold.
    pub heap_utilization: f64,
    /// Minimum growth of the heap threshold over the live bytes.
    pub heap_growth: f64,
    /// Allocated bytes that trigger a heuristic collection.
    pub gc_threshold: usize,
    /// Two OOM or forced collections within this window count as frequent.
    pub gc_interval: Duration,
    /// A backup collection runs if no collection happened for this long.
    pub backup_gc_interval: Duration,
    /// Number of helper threads in the gc worker pool.
    pub gc_threads: usize,
    /// Minimum distance between two asynchronous heuristic collections.
    pub min_async_gc_interval: Duration,
    /// Pages of SATB nodes carved out up front.
    pub satb_initial_pages: usize,
    /// Waiting for the mutator list longer than this is fatal.
    pub stw_timeout: Duration,
}

const DEFAULT_HEAP_SIZE: usize = 256 * 1024 * 1024;
const DEFAULT_GARBAGE_THRESHOLD: f64 = 0.5;
const DEFAULT_EXEMPTION_THRESHOLD: f64 = 0.8;
const DEFAULT_HEAP_UTILIZATION: f64 = 0.8;
const DEFAULT_HEAP_GROWTH: f64 = 0.15;
const DEFAULT_GC_INTERVAL: Duration = Duration::from_millis(150);
const DEFAULT_BACKUP_GC_INTERVAL: Duration = Duration::from_secs(240);
const DEFAULT_MIN_ASYNC_GC_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_SATB_INITIAL_PAGES: usize = 64;
const DEFAULT_STW_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_GC_THREADS: usize = 64;

fn default_gc_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .clamp(1, MAX_GC_THREADS)
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,    // 256 MB
            region_size: 128 * 1024,         // 128 KB = 32 units
            large_object_threshold: 32 * 1024, // 32 KB
            garbage_threshold: DEFAULT_GARBAGE_THRESHOLD,
            exemption_threshold: DEFAULT_EXEMPTION_THRESHOLD,
            heap_utilization: DEFAULT_HEAP_UTILIZATION,
            heap_growth: DEFAULT_HEAP_GROWTH,
            gc_threshold: DEFAULT_HEAP_SIZE / 2,
            gc_interval: DEFAULT_GC_INTERVAL,
            backup_gc_interval: DEFAULT_BACKUP_GC_INTERVAL,
            gc_threads: default_gc_threads(),
            min_async_gc_interval: DEFAULT_MIN_ASYNC_GC_INTERVAL,
            satb_initial_pages: DEFAULT_SATB_INITIAL_PAGES,
            stw_timeout: DEFAULT_STW_TIMEOUT,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.heap_size == 0
            || self.region_size == 0
            || self.large_object_threshold == 0
        {
            return Err("Sizes must be > 0");
        }
        if !self.region_size.is_multiple_of(OS_PAGE_SIZE) {
            return Err("region_size must be a multiple of the unit size");
        }
        if !self.heap_size.is_multiple_of(self.region_size) {
            return Err("heap_size must be a multiple of region_size");
        }
        if self.large_object_threshold > self.region_size {
            return Err("large_object_threshold must not exceed region_size");
        }
        if self.heap_size / OS_PAGE_SIZE >= u32::MAX as usize {
            return Err("heap_size has too many units");
        }
        Ok(())
    }

    /// Replaces every out-of-range tunable by its default, logging each
    /// replacement.
    #[must_use]
    pub fn sanitize(mut self) -> Self {
        fn ratio(name: &str, value: &mut f64, default: f64) {
            if !(*value > 0.0 && *value <= 1.0) {
                log::warn!(
                    "{name} = {value} is outside (0, 1], using {default}"
                );
                *value = default;
            }
        }
        fn interval(name: &str, value: &mut Duration, default: Duration) {
            if value.is_zero() {
                log::warn!("{name} must be > 0, using {default:?}");
                *value = default;
            }
        }

        ratio(
            "garbage_threshold",
            &mut self.garbage_threshold,
            DEFAULT_GARBAGE_THRESHOLD,
        );
        ratio(
            "exemption_threshold",
            &mut self.exemption_threshold,
            DEFAULT_EXEMPTION_THRESHOLD,
        );
        ratio(
            "heap_utilization",
            &mut self.heap_utilization,
            DEFAULT_HEAP_UTILIZATION,
        );
        ratio("heap_growth", &mut self.heap_growth, DEFAULT_HEAP_GROWTH);

        interval("gc_interval", &mut self.gc_interval, DEFAULT_GC_INTERVAL);
        interval(
            "backup_gc_interval",
            &mut self.backup_gc_interval,
            DEFAULT_BACKUP_GC_INTERVAL,
        );
        interval(
            "min_async_gc_interval",
            &mut self.min_async_gc_interval,
            DEFAULT_MIN_ASYNC_GC_INTERVAL,
        );
        interval("stw_timeout", &mut self.stw_timeout, DEFAULT_STW_TIMEOUT);

        if !(1..=MAX_GC_THREADS).contains(&self.gc_threads) {
            let default = default_gc_threads();
            log::warn!(
                "gc_threads = {} is outside [1, {MAX_GC_THREADS}], using {default}",
                self.gc_threads
            );
            self.gc_threads = default;
        }
        if self.gc_threshold == 0 || self.gc_threshold > self.heap_size {
            let default = self.heap_size / 2;
            log::warn!(
                "gc_threshold = {} is outside (0, {}], using {default}",
                self.gc_threshold,
                self.heap_size
            );
            self.gc_threshold = default;
        }
        if self.satb_initial_pages == 0 {
            log::warn!(
                "satb_initial_pages must be > 0, using {DEFAULT_SATB_INITIAL_PAGES}"
            );
            self.satb_initial_pages = DEFAULT_SATB_INITIAL_PAGES;
        }
        self
    }

    #[inline]
    pub fn units_per_region(&self) -> usize {
        self.region_size / OS_PAGE_SIZE
    }

    #[inline]
    pub fn unit_count(&self) -> usize {
        self.heap_size / OS_PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = HeapSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.units_per_region(), 32);
        assert!(settings.gc_threads >= 1);
    }

    #[test]
    fn test_validate_rejects_bad_layouts() {
        let settings = HeapSettings {
            region_size: OS_PAGE_SIZE + 8,
            ..HeapSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = HeapSettings {
            heap_size: 3 * 128 * 1024 + OS_PAGE_SIZE,
            ..HeapSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = HeapSettings {
            large_object_threshold: 256 * 1024,
            ..HeapSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_sanitize_replaces_out_of_range_values() {
        let settings = HeapSettings {
            garbage_threshold: 1.5,
            heap_growth: 0.0,
            gc_interval: Duration::ZERO,
            gc_threads: 1000,
            gc_threshold: 0,
            exemption_threshold: 0.7,
            ..HeapSettings::default()
        }
        .sanitize();

        assert_eq!(settings.garbage_threshold, DEFAULT_GARBAGE_THRESHOLD);
        assert_eq!(settings.heap_growth, DEFAULT_HEAP_GROWTH);
        assert_eq!(settings.gc_interval, DEFAULT_GC_INTERVAL);
        assert!(settings.gc_threads <= MAX_GC_THREADS);
        assert_eq!(settings.gc_threshold, settings.heap_size / 2);
        // in-range values stay untouched
        assert_eq!(settings.exemption_threshold, 0.7);
    }
}
