use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakerState {
    /// Healthy, requests flow
    Closed,
    /// Unhealthy, requests are rejected without touching the backend
    Open,
    /// Cool-down elapsed, one trial request may probe the backend
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

/// How a call got past the breaker. The trial is the single call a
/// HalfOpen breaker lets through; its outcome decides the next state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Regular,
    Trial,
}

/// Per-adapter circuit breaker state.
///
/// All methods take the monotonic `now_ms` from the caller; the struct is
/// mutated only under its adapter's gate lock.
#[derive(Debug, Clone)]
pub struct AdapterHealth {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<u64>,
    cooldown_ms: u64,
    failure_threshold: u32,
    trial_in_flight: bool,
}

impl AdapterHealth {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            cooldown_ms: config.cooldown_ms,
            failure_threshold: config.failure_threshold.max(1),
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn opened_at(&self) -> Option<u64> {
        self.opened_at
    }

    pub fn trial_in_flight(&self) -> bool {
        self.trial_in_flight
    }

    /// State as of `now_ms`, applying the Open -> HalfOpen cool-down.
    pub fn observe(&mut self, now_ms: u64) -> BreakerState {
        if self.state == BreakerState::Open {
            let opened_at = self.opened_at.unwrap_or(now_ms);
            if now_ms.saturating_sub(opened_at) >= self.cooldown_ms {
                self.state = BreakerState::HalfOpen;
                self.trial_in_flight = false;
            }
        }
        self.state
    }

    /// True when no request may pass right now. A HalfOpen breaker whose
    /// trial is already in flight counts as open.
    pub fn is_open(&mut self, now_ms: u64) -> bool {
        match self.observe(now_ms) {
            BreakerState::Closed => false,
            BreakerState::Open => true,
            BreakerState::HalfOpen => self.trial_in_flight,
        }
    }

    /// Claims passage. In HalfOpen this takes the single trial slot and the
    /// returned pass is a `Trial`.
    pub fn try_admit(&mut self, now_ms: u64) -> Option<Pass> {
        if self.is_open(now_ms) {
            return None;
        }
        if self.state == BreakerState::HalfOpen {
            self.trial_in_flight = true;
            return Some(Pass::Trial);
        }
        Some(Pass::Regular)
    }

    /// Gives back a trial slot claimed by `try_admit` that was never used.
    pub fn release_trial(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    /// Returns the new state when this call changed it.
    ///
    /// Only the trial moves a HalfOpen breaker. Outcomes of calls admitted
    /// before the breaker opened are ignored until it closes again.
    pub fn record_success(&mut self, pass: Pass) -> Option<BreakerState> {
        match (self.state, pass) {
            (BreakerState::Closed, _) => {
                self.consecutive_failures = 0;
                None
            }
            (BreakerState::HalfOpen, Pass::Trial) => {
                self.consecutive_failures = 0;
                self.trial_in_flight = false;
                self.state = BreakerState::Closed;
                self.opened_at = None;
                Some(BreakerState::Closed)
            }
            _ => None,
        }
    }

    /// Returns the new state when this call changed it.
    pub fn record_failure(&mut self, now_ms: u64, pass: Pass) -> Option<BreakerState> {
        match (self.state, pass) {
            (BreakerState::Closed, _) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.failure_threshold {
                    self.trip(now_ms);
                    Some(BreakerState::Open)
                } else {
                    None
                }
            }
            (BreakerState::HalfOpen, Pass::Trial) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.trial_in_flight = false;
                self.trip(now_ms);
                Some(BreakerState::Open)
            }
            _ => None,
        }
    }

    fn trip(&mut self, now_ms: u64) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(threshold: u32, cooldown_ms: u64) -> AdapterHealth {
        AdapterHealth::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown_ms,
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut h = health(3, 1000);
        assert_eq!(h.record_failure(0, Pass::Regular), None);
        assert_eq!(h.record_failure(10, Pass::Regular), None);
        assert!(!h.is_open(10));
        assert_eq!(h.record_failure(20, Pass::Regular), Some(BreakerState::Open));
        assert!(h.is_open(20));
        assert_eq!(h.opened_at(), Some(20));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let mut h = health(3, 1000);
        h.record_failure(0, Pass::Regular);
        h.record_failure(0, Pass::Regular);
        h.record_success(Pass::Regular);
        h.record_failure(0, Pass::Regular);
        h.record_failure(0, Pass::Regular);
        assert_eq!(h.state(), BreakerState::Closed);
        assert_eq!(h.consecutive_failures(), 2);
    }

    #[test]
    fn test_half_open_allows_exactly_one_trial() {
        let mut h = health(1, 1000);
        h.record_failure(0, Pass::Regular);
        assert_eq!(h.try_admit(999), None);

        assert_eq!(h.try_admit(1000), Some(Pass::Trial));
        assert_eq!(h.state(), BreakerState::HalfOpen);
        assert!(h.trial_in_flight());
        assert_eq!(h.try_admit(1001), None);
        assert!(h.is_open(1001));
    }

    #[test]
    fn test_trial_success_closes() {
        let mut h = health(1, 500);
        h.record_failure(0, Pass::Regular);
        let pass = h.try_admit(600).unwrap();
        assert_eq!(h.record_success(pass), Some(BreakerState::Closed));
        assert!(!h.is_open(601));
        assert_eq!(h.try_admit(601), Some(Pass::Regular));
        assert_eq!(h.try_admit(601), Some(Pass::Regular));
    }

    #[test]
    fn test_trial_failure_reopens_and_resets_opened_at() {
        let mut h = health(1, 500);
        h.record_failure(0, Pass::Regular);
        let pass = h.try_admit(500).unwrap();
        assert_eq!(h.record_failure(700, pass), Some(BreakerState::Open));
        assert_eq!(h.opened_at(), Some(700));
        assert!(h.is_open(1100));
        assert_eq!(h.try_admit(1200), Some(Pass::Trial));
    }

    #[test]
    fn test_released_trial_can_be_claimed_again() {
        let mut h = health(1, 100);
        h.record_failure(0, Pass::Regular);
        assert_eq!(h.try_admit(100), Some(Pass::Trial));
        h.release_trial();
        assert!(!h.is_open(100));
        assert_eq!(h.try_admit(100), Some(Pass::Trial));
    }

    #[test]
    fn test_late_success_while_open_keeps_cooldown() {
        let mut h = health(1, 1000);
        h.record_failure(0, Pass::Regular);
        assert_eq!(h.record_success(Pass::Regular), None);
        assert!(h.is_open(500));
    }

    #[test]
    fn test_only_trial_outcome_moves_half_open() {
        let mut h = health(1, 1000);
        h.record_failure(0, Pass::Regular);
        assert_eq!(h.try_admit(1000), Some(Pass::Trial));

        // Calls admitted before the breaker opened come back late.
        assert_eq!(h.record_success(Pass::Regular), None);
        assert_eq!(h.record_failure(1010, Pass::Regular), None);
        assert_eq!(h.state(), BreakerState::HalfOpen);
        assert!(h.trial_in_flight());

        assert_eq!(h.record_success(Pass::Trial), Some(BreakerState::Closed));
        assert!(!h.trial_in_flight());
    }
}
