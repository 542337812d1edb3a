//! Coalesces drop warnings so a sustained outage logs once per interval.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Default interval between drop warnings.
pub const DEFAULT_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Counts dropped records and decides when a warning is due.
///
/// [`note_drop`](Self::note_drop) returns the number of drops to report when
/// the interval since the previous report has elapsed; the first drop is
/// always reported. Callers log the count themselves so the warning text
/// stays with the component that dropped the record.
#[derive(Debug)]
pub struct RateLimitedWarner {
    started: Instant,
    interval_ms: u64,
    /// Report time in milliseconds since `started`, plus one so that zero
    /// means "never reported".
    reported_at: AtomicU64,
    unreported: AtomicU64,
}

impl Default for RateLimitedWarner {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_INTERVAL)
    }
}

impl RateLimitedWarner {
    pub fn new(interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            reported_at: AtomicU64::new(0),
            unreported: AtomicU64::new(0),
        }
    }

    fn stamp(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis())
            .unwrap_or(u64::MAX)
            .saturating_add(1)
    }

    /// Count one dropped record and return the total to report if a warning
    /// is due.
    pub fn note_drop(&self) -> Option<u64> {
        self.unreported.fetch_add(1, Ordering::Relaxed);
        let now = self.stamp();
        let last = self.reported_at.load(Ordering::Acquire);
        if last != 0 && now.saturating_sub(last) < self.interval_ms {
            return None;
        }
        // Only one thread wins the window.
        self.reported_at
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.take_unreported()
    }

    /// Drops counted but not yet reported.
    pub fn unreported(&self) -> u64 {
        self.unreported.load(Ordering::Relaxed)
    }

    /// Return any unreported drops regardless of the interval.
    pub fn take_unreported(&self) -> Option<u64> {
        match self.unreported.swap(0, Ordering::AcqRel) {
            0 => None,
            count => Some(count),
        }
    }
}
