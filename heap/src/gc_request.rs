//! Why a collection was requested, and whether a request is worth running.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crate::{gc_stats::GcClock, settings::HeapSettings};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcReason {
    /// Requested explicitly by the embedder.
    User = 0,
    /// An allocation failed.
    Oom = 1,
    /// No collection ran for a long time.
    Backup = 2,
    /// The heap crossed its threshold.
    Heu = 3,
    /// Native allocations suggest collecting.
    Native = 4,
    HeuSync = 5,
    NativeSync = 6,
    /// The runtime insists.
    Force = 7,
}

impl GcReason {
    pub const COUNT: usize = 8;

    pub const ALL: [GcReason; Self::COUNT] = [
        GcReason::User,
        GcReason::Oom,
        GcReason::Backup,
        GcReason::Heu,
        GcReason::Native,
        GcReason::HeuSync,
        GcReason::NativeSync,
        GcReason::Force,
    ];

    pub fn from_index(index: usize) -> Option<GcReason> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            GcReason::User => "user",
            GcReason::Oom => "oom",
            GcReason::Backup => "backup",
            GcReason::Heu => "heuristic",
            GcReason::Native => "native",
            GcReason::HeuSync => "heuristic_sync",
            GcReason::NativeSync => "native_sync",
            GcReason::Force => "force",
        }
    }

    /// Whether the requester waits for the cycle to finish.
    pub fn is_sync(self) -> bool {
        matches!(
            self,
            GcReason::User
                | GcReason::Oom
                | GcReason::HeuSync
                | GcReason::NativeSync
                | GcReason::Force
        )
    }

    /// Whether mutators keep running while the cycle marks.
    pub fn is_concurrent(self) -> bool {
        !matches!(self, GcReason::Oom | GcReason::Force)
    }
}

impl std::fmt::Display for GcReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
struct GcRequest {
    min_interval_ns: u64,
    prev_request_ns: AtomicU64,
}

/// Per-reason request bookkeeping.
#[derive(Debug)]
pub struct GcRequestTable {
    requests: [GcRequest; GcReason::COUNT],
}

fn as_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl GcRequestTable {
    pub fn new(settings: &HeapSettings) -> Self {
        let requests = GcReason::ALL.map(|reason| {
            let min_interval = match reason {
                GcReason::Backup => as_ns(settings.backup_gc_interval),
                GcReason::Heu | GcReason::Native => as_ns(settings.min_async_gc_interval),
                GcReason::Oom | GcReason::Force => as_ns(settings.gc_interval),
                _ => 0,
            };
            GcRequest {
                min_interval_ns: min_interval,
                prev_request_ns: AtomicU64::new(GcClock::NEVER),
            }
        });
        Self { requests }
    }

    fn request(&self, reason: GcReason) -> &GcRequest {
        &self.requests[reason as usize]
    }

    pub fn min_interval(&self, reason: GcReason) -> Duration {
        Duration::from_nanos(self.request(reason).min_interval_ns)
    }

    /// Decides whether a request for `reason` arriving at `now` should be
    /// dropped, and records it as the latest request of its reason.
    ///
    /// Asynchronous heuristics back off from the end of the previous cycle;
    /// out-of-memory and forced requests back off from their own previous
    /// request.
    pub fn check_and_record(&self, reason: GcReason, now: u64, prev_gc_finish: u64) -> bool {
        let request = self.request(reason);
        let prev_request = request.prev_request_ns.swap(now, Ordering::Relaxed);
        let within = |since: u64| {
            since != GcClock::NEVER && now.saturating_sub(since) < request.min_interval_ns
        };
        match reason {
            GcReason::Heu | GcReason::Native => within(prev_gc_finish),
            GcReason::Oom | GcReason::Force => {
                request.min_interval_ns != 0 && within(prev_request)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_settings() -> HeapSettings {
        HeapSettings {
            gc_interval: Duration::from_millis(100),
            min_async_gc_interval: Duration::from_millis(10),
            ..HeapSettings::default()
        }
    }

    const MS: u64 = 1_000_000;

    #[test]
    fn test_reason_table() {
        assert!(GcReason::User.is_sync());
        assert!(GcReason::User.is_concurrent());
        assert!(GcReason::Oom.is_sync());
        assert!(!GcReason::Oom.is_concurrent());
        assert!(!GcReason::Backup.is_sync());
        assert!(!GcReason::Heu.is_sync());
        assert!(GcReason::NativeSync.is_sync());
        assert!(!GcReason::Force.is_concurrent());
        for (i, reason) in GcReason::ALL.iter().enumerate() {
            assert_eq!(GcReason::from_index(i), Some(*reason));
        }
        assert_eq!(GcReason::from_index(8), None);
        assert_eq!(GcReason::HeuSync.name(), "heuristic_sync");
    }

    #[test]
    fn test_min_interval_per_reason() {
        let settings = create_test_settings();
        let table = GcRequestTable::new(&settings);
        assert_eq!(table.min_interval(GcReason::Heu), Duration::from_millis(10));
        assert_eq!(table.min_interval(GcReason::Native), Duration::from_millis(10));
        assert_eq!(table.min_interval(GcReason::Oom), Duration::from_millis(100));
        assert_eq!(table.min_interval(GcReason::Force), Duration::from_millis(100));
        assert_eq!(table.min_interval(GcReason::Backup), settings.backup_gc_interval);
        assert_eq!(table.min_interval(GcReason::User), Duration::ZERO);
        assert_eq!(table.min_interval(GcReason::HeuSync), Duration::ZERO);
    }

    #[test]
    fn test_heuristic_backs_off_from_last_cycle() {
        let table = GcRequestTable::new(&create_test_settings());
        // no cycle yet
        assert!(!table.check_and_record(GcReason::Heu, 5 * MS, GcClock::NEVER));
        assert!(table.check_and_record(GcReason::Heu, 20 * MS, 15 * MS));
        assert!(!table.check_and_record(GcReason::Heu, 30 * MS, 15 * MS));
        assert!(table.check_and_record(GcReason::Native, 20 * MS, 15 * MS));
    }

    #[test]
    fn test_oom_backs_off_from_previous_request() {
        let table = GcRequestTable::new(&create_test_settings());
        assert!(!table.check_and_record(GcReason::Oom, 10 * MS, GcClock::NEVER));
        assert!(table.check_and_record(GcReason::Oom, 50 * MS, GcClock::NEVER));
        assert!(!table.check_and_record(GcReason::Oom, 200 * MS, GcClock::NEVER));
        // user requests are never dropped
        assert!(!table.check_and_record(GcReason::User, 201 * MS, 200 * MS));
        assert!(!table.check_and_record(GcReason::User, 202 * MS, 200 * MS));
    }
}
