use std::sync::atomic::{AtomicU8, Ordering};

/// Phase of a collection cycle, as seen by the collector and by each
/// mutator.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GcPhase {
    Undef = 0,
    Idle = 1,
    Finish = 2,
    ReclaimSatbNode = 3,
    Init = 8,
    Enum = 9,
    Trace = 10,
    ClearSatbBuffer = 11,
    PostTrace = 12,
    PreForward = 13,
    Forward = 14,
}

impl From<u8> for GcPhase {
    fn from(val: u8) -> Self {
        match val {
            1 => GcPhase::Idle,
            2 => GcPhase::Finish,
            3 => GcPhase::ReclaimSatbNode,
            8 => GcPhase::Init,
            9 => GcPhase::Enum,
            10 => GcPhase::Trace,
            11 => GcPhase::ClearSatbBuffer,
            12 => GcPhase::PostTrace,
            13 => GcPhase::PreForward,
            14 => GcPhase::Forward,
            _ => GcPhase::Undef,
        }
    }
}

impl GcPhase {
    pub fn name(self) -> &'static str {
        match self {
            GcPhase::Undef => "undef",
            GcPhase::Idle => "idle",
            GcPhase::Finish => "finish",
            GcPhase::ReclaimSatbNode => "reclaim-satb-node",
            GcPhase::Init => "init",
            GcPhase::Enum => "enum",
            GcPhase::Trace => "trace",
            GcPhase::ClearSatbBuffer => "clear-satb-buffer",
            GcPhase::PostTrace => "post-trace",
            GcPhase::PreForward => "preforward",
            GcPhase::Forward => "forward",
        }
    }

    /// Phases in which new objects are allocated black and SATB is on.
    #[inline(always)]
    pub fn is_marking(self) -> bool {
        matches!(
            self,
            GcPhase::Enum | GcPhase::Trace | GcPhase::ClearSatbBuffer
        )
    }

    /// Phases in which new regions carry the trace-region flag.
    #[inline(always)]
    pub fn is_tracing(self) -> bool {
        matches!(self, GcPhase::Trace | GcPhase::ClearSatbBuffer)
    }

    #[inline(always)]
    pub fn is_forwarding(self) -> bool {
        matches!(self, GcPhase::PreForward | GcPhase::Forward)
    }
}

/// A [`GcPhase`] cell.
#[derive(Debug)]
pub struct AtomicGcPhase(AtomicU8);

impl AtomicGcPhase {
    pub const fn new(phase: GcPhase) -> Self {
        Self(AtomicU8::new(phase as u8))
    }

    #[inline(always)]
    pub fn load(&self) -> GcPhase {
        GcPhase::from(self.0.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn store(&self, phase: GcPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}
