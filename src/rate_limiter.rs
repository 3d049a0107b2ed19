use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Window size / capacity pair as configured per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub window_ms: u64,
    pub capacity: u32,
}

impl WindowSpec {
    pub const fn new(window_ms: u64, capacity: u32) -> Self {
        Self {
            window_ms,
            capacity,
        }
    }
}

/// Sliding-window rate accounting for a single `(window, capacity)` budget.
///
/// Keeps the monotonic timestamp of every admission still inside the trailing
/// window, so any interval of `window_size_ms` contains at most `capacity`
/// admissions. An admission expires the instant `now - admitted_at >= window`.
/// Never blocks: a rejection is a plain `false` and leaves the state untouched.
#[derive(Debug, Clone)]
pub struct RateWindow {
    window_size_ms: u64,
    capacity: u32,
    admitted: VecDeque<u64>,
    last_seen_ms: u64,
}

impl RateWindow {
    pub fn new(spec: WindowSpec) -> Self {
        Self {
            window_size_ms: spec.window_ms,
            capacity: spec.capacity,
            admitted: VecDeque::with_capacity(spec.capacity as usize),
            last_seen_ms: 0,
        }
    }

    pub fn window_size_ms(&self) -> u64 {
        self.window_size_ms
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Admissions inside the window as of the last observation.
    pub fn count(&self) -> u32 {
        self.admitted.len() as u32
    }

    /// Oldest admission still inside the window.
    pub fn window_start_at(&self) -> Option<u64> {
        self.admitted.front().copied()
    }

    pub fn try_acquire(&mut self, now_ms: u64) -> bool {
        let now = self.observe(now_ms);
        if self.has_budget() {
            self.admitted.push_back(now);
            true
        } else {
            false
        }
    }

    /// Budget left at `now_ms` without recording anything.
    pub fn remaining(&self, now_ms: u64) -> u32 {
        let now = now_ms.max(self.last_seen_ms);
        let live = self
            .admitted
            .iter()
            .filter(|&&t| now - t < self.window_size_ms)
            .count() as u32;
        self.capacity.saturating_sub(live)
    }

    /// Milliseconds until one more admission would fit.
    pub fn retry_after_ms(&self, now_ms: u64) -> u64 {
        if self.remaining(now_ms) > 0 {
            return 0;
        }
        let now = now_ms.max(self.last_seen_ms);
        // Exhausted means `capacity` live entries; the one that frees a slot
        // is the oldest live entry.
        self.admitted
            .iter()
            .find(|&&t| now - t < self.window_size_ms)
            .map(|&t| t + self.window_size_ms - now)
            .unwrap_or(0)
    }

    /// Clamps backward clock jumps to zero elapsed time and drops expired
    /// admissions. Returns the effective `now`.
    fn observe(&mut self, now_ms: u64) -> u64 {
        let now = now_ms.max(self.last_seen_ms);
        self.last_seen_ms = now;
        while let Some(&oldest) = self.admitted.front() {
            if now - oldest >= self.window_size_ms {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
        now
    }

    fn has_budget(&self) -> bool {
        (self.admitted.len() as u32) < self.capacity
    }
}

/// All budgets governing one adapter, e.g. a per-second peak stacked with a
/// per-minute sustained limit. Admission charges every window or none.
#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    windows: Vec<RateWindow>,
}

impl SlidingWindowLimiter {
    pub fn new(specs: &[WindowSpec]) -> Self {
        Self {
            windows: specs.iter().copied().map(RateWindow::new).collect(),
        }
    }

    pub fn single(window_ms: u64, capacity: u32) -> Self {
        Self::new(&[WindowSpec::new(window_ms, capacity)])
    }

    pub fn windows(&self) -> &[RateWindow] {
        &self.windows
    }

    pub fn try_acquire(&mut self, now_ms: u64) -> bool {
        let mut now = now_ms;
        for window in &mut self.windows {
            now = window.observe(now);
        }
        if !self.windows.iter().all(RateWindow::has_budget) {
            return false;
        }
        for window in &mut self.windows {
            window.admitted.push_back(now);
        }
        true
    }

    /// Tightest remaining budget across windows.
    pub fn remaining(&self, now_ms: u64) -> u32 {
        self.windows
            .iter()
            .map(|w| w.remaining(now_ms))
            .min()
            .unwrap_or(u32::MAX)
    }

    pub fn retry_after_ms(&self, now_ms: u64) -> u64 {
        self.windows
            .iter()
            .map(|w| w.retry_after_ms(now_ms))
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_basic_admission_scenario() {
        let mut window = RateWindow::new(WindowSpec::new(1000, 2));
        assert!(window.try_acquire(0));
        assert!(window.try_acquire(0));
        assert!(!window.try_acquire(500));
        assert!(window.try_acquire(1001));
    }

    #[test]
    fn test_window_expires_exactly_at_size() {
        let mut window = RateWindow::new(WindowSpec::new(1000, 1));
        assert!(window.try_acquire(10));
        assert!(!window.try_acquire(1009));
        assert!(window.try_acquire(1010));
    }

    #[test]
    fn test_rejection_is_idempotent() {
        let mut window = RateWindow::new(WindowSpec::new(1000, 2));
        assert!(window.try_acquire(0));
        assert!(window.try_acquire(1));
        assert_eq!(window.count(), 2);

        assert!(!window.try_acquire(2));
        assert!(!window.try_acquire(2));
        assert_eq!(window.count(), 2);
        assert_eq!(window.window_start_at(), Some(0));
    }

    #[test]
    fn test_backward_clock_is_treated_as_zero_elapsed() {
        let mut window = RateWindow::new(WindowSpec::new(1000, 1));
        assert!(window.try_acquire(5000));
        // Clock jumps back: no spurious reset.
        assert!(!window.try_acquire(100));
        assert!(!window.try_acquire(5999));
        assert!(window.try_acquire(6000));
    }

    #[test]
    fn test_remaining_and_retry_after() {
        let mut window = RateWindow::new(WindowSpec::new(1000, 2));
        assert_eq!(window.remaining(0), 2);
        window.try_acquire(100);
        window.try_acquire(300);
        assert_eq!(window.remaining(400), 0);
        assert_eq!(window.retry_after_ms(400), 700);
        assert_eq!(window.remaining(1100), 1);
        assert_eq!(window.retry_after_ms(1100), 0);
    }

    #[test]
    fn test_stacked_windows_charge_all_or_nothing() {
        let mut limiter =
            SlidingWindowLimiter::new(&[WindowSpec::new(1000, 2), WindowSpec::new(60_000, 3)]);
        assert!(limiter.try_acquire(0));
        assert!(limiter.try_acquire(10));
        // Per-second window full
        assert!(!limiter.try_acquire(20));
        assert_eq!(limiter.windows()[1].count(), 2);

        assert!(limiter.try_acquire(1000));
        // Per-minute window full even though the per-second one reset
        assert!(!limiter.try_acquire(2500));
        assert_eq!(limiter.windows()[0].count(), 0);
        assert_eq!(limiter.remaining(2500), 0);
        assert_eq!(limiter.retry_after_ms(2500), 57_500);
    }

    #[test]
    fn test_rate_conformance_over_random_trace() {
        let spec = WindowSpec::new(250, 5);
        let mut window = RateWindow::new(spec);
        let mut rng = rand::thread_rng();
        let mut now = 0u64;
        let mut admitted = Vec::new();

        for _ in 0..5_000 {
            now += rng.gen_range(0..20);
            if window.try_acquire(now) {
                admitted.push(now);
            }
        }

        // Every trailing interval of `window_ms` ending at an admission holds
        // at most `capacity` admissions.
        for (i, &end) in admitted.iter().enumerate() {
            let inside = admitted[..=i]
                .iter()
                .filter(|&&t| end - t < spec.window_ms)
                .count();
            assert!(inside <= spec.capacity as usize, "window ending {end} had {inside}");
        }
        assert!(!admitted.is_empty());
    }
}
