//! Injectable time source.

use chrono::Utc;

/// Nanosecond wall clock. Injectable so tests run on frozen time.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> i64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        // i64 nanoseconds run out in 2262; saturate.
        Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    }
}
