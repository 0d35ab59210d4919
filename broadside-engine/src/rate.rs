//! Send-rate accounting.
//!
//! Two separate mechanisms live here:
//!
//! - [`RateCounter`] is a rolling per-second bucket ring used for live
//!   "sends per window" reporting on a running campaign. It is purely
//!   observational and never throttles anything.
//! - [`SlidingWindow`] is the cooperative aggregate throttle: the batching
//!   producer records every push and, on reaching the configured ceiling
//!   inside the window, is told how long to sleep until the window resets.
//!   This is distinct from the per-worker one-second rate slice enforced
//!   in the worker loop.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Rolling event counter over a fixed window, with one-second resolution.
///
/// Concurrent increments are only approximately consistent across bucket
/// boundaries, which is fine for throughput reporting.
#[derive(Debug)]
pub struct RateCounter {
    start: Instant,
    buckets: Vec<AtomicU64>,
    stamps: Vec<AtomicU64>,
    window_secs: u64,
}

impl RateCounter {
    /// Create a counter with the given window. Windows shorter than one
    /// second are rounded up.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        let window_secs = window.as_secs().max(1);
        let len = usize::try_from(window_secs).unwrap_or(usize::MAX);

        Self {
            start: Instant::now(),
            buckets: (0..len).map(|_| AtomicU64::new(0)).collect(),
            stamps: (0..len).map(|_| AtomicU64::new(u64::MAX)).collect(),
            window_secs,
        }
    }

    /// Record one event.
    pub fn incr(&self) {
        let sec = self.start.elapsed().as_secs();
        let idx = usize::try_from(sec % self.window_secs).unwrap_or(0);

        // A stale bucket belongs to a previous revolution of the ring.
        if self.stamps[idx].swap(sec, Ordering::Relaxed) != sec {
            self.buckets[idx].store(0, Ordering::Relaxed);
        }
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Number of events recorded inside the current window.
    #[must_use]
    pub fn rate(&self) -> u64 {
        let sec = self.start.elapsed().as_secs();
        let oldest = sec.saturating_sub(self.window_secs - 1);

        self.buckets
            .iter()
            .zip(&self.stamps)
            .filter(|(_, stamp)| {
                let s = stamp.load(Ordering::Relaxed);
                s != u64::MAX && s >= oldest && s <= sec
            })
            .map(|(bucket, _)| bucket.load(Ordering::Relaxed))
            .sum()
    }
}

/// The aggregate sliding-window throttle owned by one instance's batching
/// producer.
#[derive(Debug)]
pub struct SlidingWindow {
    rate: usize,
    duration: Duration,
    started: Instant,
    count: usize,
}

impl SlidingWindow {
    #[must_use]
    pub fn new(rate: usize, duration: Duration) -> Self {
        Self {
            rate,
            duration,
            started: Instant::now(),
            count: 0,
        }
    }

    /// `true` when this window actually throttles: a positive ceiling and
    /// a window longer than one second.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.rate > 0 && self.duration > Duration::from_secs(1)
    }

    /// Record one pushed message. Returns the duration the producer must
    /// sleep when the ceiling for the current window has been reached.
    pub fn record(&mut self) -> Option<Duration> {
        if !self.is_active() {
            return None;
        }

        let diff = self.started.elapsed();
        if diff >= self.duration {
            self.started = Instant::now();
            self.count = 0;
            return None;
        }

        self.count += 1;
        if self.count >= self.rate {
            self.count = 0;
            Some(self.duration - diff)
        } else {
            None
        }
    }
}
