//! Millisecond time sources.

use std::sync::atomic::{AtomicI64, Ordering};

/// Source of Unix-millisecond timestamps.
pub trait Clock: Send + Sync {
    /// Current time in Unix ms.
    fn now_millis(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to. Used to model skewed devices
/// and deterministic server time in tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, at: i64) {
        self.now.store(at, Ordering::SeqCst);
    }

    /// Move forward by `by` ms and return the new time.
    pub fn advance(&self, by: i64) -> i64 {
        self.now.fetch_add(by, Ordering::SeqCst) + by
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
