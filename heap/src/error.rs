//! Error taxonomy of the heap.
//!
//! Resource exhaustion and bad configuration are recoverable and surface as
//! [`HeapError`]. Invariant violations are not: they go through [`fatal!`],
//! which logs and aborts the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeapError {
    #[error("out of memory while allocating {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("failed to map {size} bytes (errno {errno})")]
    MapFailed { size: usize, errno: i32 },
    #[error("invalid heap settings: {0}")]
    InvalidSettings(&'static str),
    #[error("failed to spawn gc thread")]
    ThreadSpawn(#[source] std::io::Error),
}

/// Logs the message and aborts. Used for corrupted heap state, where
/// unwinding would only run more code over broken invariants.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        ::log::error!($($arg)+);
        ::std::process::abort()
    }};
}

/// Always-on assertion that aborts through [`fatal!`].
#[macro_export]
macro_rules! heap_check {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::fatal!("check failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::fatal!($($arg)+);
        }
    };
}
