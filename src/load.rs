use std::time::Duration;

use bma_ts::Monotonic;
use parking_lot::Mutex;

/// Measures the fraction of wall time the worker spends doing work (at least one request in
/// flight), averaged over a configurable period. Values are within `[0, 1]`
pub struct LoadTracker {
    period: Duration,
    inner: Mutex<LoadWindow>,
}

struct LoadWindow {
    window_start: Monotonic,
    busy: Duration,
    busy_since: Option<Monotonic>,
}

impl LoadTracker {
    /// Creates a new tracker with the given averaging period
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            inner: Mutex::new(LoadWindow {
                window_start: Monotonic::now(),
                busy: Duration::ZERO,
                busy_since: None,
            }),
        }
    }
    /// Marks the start of a busy span. Idempotent while busy
    pub fn busy_start(&self) {
        let mut inner = self.inner.lock();
        if inner.busy_since.is_none() {
            inner.busy_since = Some(Monotonic::now());
        }
    }
    /// Marks the end of the current busy span
    pub fn busy_end(&self) {
        let mut inner = self.inner.lock();
        if let Some(since) = inner.busy_since.take() {
            inner.busy += since.elapsed();
        }
    }
    /// Returns the current load average and rolls the window over when the period has elapsed
    pub fn value(&self) -> f32 {
        let mut inner = self.inner.lock();
        let now = Monotonic::now();
        let elapsed = inner.window_start.elapsed();
        let mut busy = inner.busy;
        if let Some(since) = inner.busy_since {
            busy += since.elapsed();
        }
        let la = if elapsed.is_zero() {
            0.0
        } else {
            (busy.as_secs_f32() / elapsed.as_secs_f32()).clamp(0.0, 1.0)
        };
        if elapsed >= self.period {
            inner.window_start = now;
            inner.busy = Duration::ZERO;
            if inner.busy_since.is_some() {
                // a busy span is still open, re-anchor it to the new window
                inner.busy_since = Some(now);
            }
        }
        la
    }
}
