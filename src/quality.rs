//! Historical execution quality per adapter.
//!
//! Two exponential moving averages over dispatch outcomes, success rate and
//! latency, with a half-life expressed in samples: after `half_life` further
//! samples an observation carries half its original weight.
//!
//! `score = success_ema / (1 + latency_ema_ms / 1000)`, so a perfectly
//! reliable adapter answering instantly scores 1.0, and each extra second of
//! typical latency halves, thirds, ... the score.

use serde::Serialize;

pub const DEFAULT_HALF_LIFE_SAMPLES: f64 = 20.0;
const LATENCY_SCALE_MS: f64 = 1000.0;

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionQuality {
    #[serde(skip)]
    alpha: f64,
    success_ema: f64,
    latency_ema_ms: f64,
    samples: u64,
}

impl ExecutionQuality {
    pub fn new(half_life_samples: f64) -> Self {
        let half_life = if half_life_samples.is_finite() && half_life_samples > 0.0 {
            half_life_samples
        } else {
            DEFAULT_HALF_LIFE_SAMPLES
        };
        Self {
            alpha: 1.0 - 0.5f64.powf(1.0 / half_life),
            // Unproven adapters start optimistic so they get traffic.
            success_ema: 1.0,
            latency_ema_ms: 0.0,
            samples: 0,
        }
    }

    pub fn record(&mut self, latency_ms: u64, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        let latency = latency_ms as f64;
        if self.samples == 0 {
            self.latency_ema_ms = latency;
        } else {
            self.latency_ema_ms += self.alpha * (latency - self.latency_ema_ms);
        }
        self.success_ema += self.alpha * (outcome - self.success_ema);
        self.samples += 1;
    }

    pub fn score(&self) -> f64 {
        self.success_ema / (1.0 + self.latency_ema_ms / LATENCY_SCALE_MS)
    }

    pub fn success_rate(&self) -> f64 {
        self.success_ema
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency_ema_ms
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

impl Default for ExecutionQuality {
    fn default() -> Self {
        Self::new(DEFAULT_HALF_LIFE_SAMPLES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_adapter_scores_one() {
        let q = ExecutionQuality::default();
        assert_eq!(q.score(), 1.0);
        assert_eq!(q.samples(), 0);
    }

    #[test]
    fn test_half_life_halves_weight() {
        let mut q = ExecutionQuality::new(10.0);
        for _ in 0..10 {
            q.record(0, false);
        }
        assert!((q.success_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_latency_lowers_score() {
        let mut fast = ExecutionQuality::default();
        let mut slow = ExecutionQuality::default();
        for _ in 0..5 {
            fast.record(20, true);
            slow.record(900, true);
        }
        assert!(fast.score() > slow.score());
        assert!((slow.latency_ms() - 900.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_half_life_falls_back() {
        let mut a = ExecutionQuality::new(0.0);
        let mut b = ExecutionQuality::default();
        a.record(100, false);
        b.record(100, false);
        assert_eq!(a.score(), b.score());
    }
}
