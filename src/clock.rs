//! An injectable time source.
//!
//! The cache store's fresh/stale decision and the `created_at`/`expires_at`
//! timestamps it writes must agree on "now". Wiring a [`Clock`] through both
//! lets tests move time forward without sleeping real seconds — the same
//! trick the admin `MakeCacheStale` hook uses in production, just taken one
//! step further for unit tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of the current unix-epoch second count.
pub trait Clock: Send + Sync + 'static {
    /// Current time, in whole seconds since the unix epoch.
    fn now(&self) -> i64;
}

/// The real wall clock, backed by [`SystemTime::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }
}

/// A clock whose value is set explicitly, for tests.
#[derive(Debug, Clone)]
pub struct TestClock {
    secs: Arc<AtomicI64>,
}

impl TestClock {
    /// Create a clock starting at the given unix-epoch second count.
    pub fn new(start_secs: i64) -> Self {
        Self { secs: Arc::new(AtomicI64::new(start_secs)) }
    }

    /// Move the clock forward by `delta` seconds.
    pub fn advance(&self, delta_secs: i64) {
        self.secs.fetch_add(delta_secs, Ordering::SeqCst);
    }

    /// Set the clock to an absolute unix-epoch second count.
    pub fn set(&self, secs: i64) {
        self.secs.store(secs, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> i64 {
        self.secs.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances() {
        let clock = TestClock::new(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.advance(5);
        assert_eq!(clock.now(), 1_005);
        clock.set(2_000);
        assert_eq!(clock.now(), 2_000);
    }

    #[test]
    fn system_clock_is_plausible() {
        let now = SystemClock.now();
        assert!(now > 1_700_000_000);
    }
}
