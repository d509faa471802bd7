//! Adaptive Bitrate (ABR) controller.
//!
//! Decides one-step tier changes from measured segment throughput. The
//! controller performs no I/O; the read-ahead worker applies its decisions.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::settings::HlsSettings;

mod estimator;

pub use estimator::ThroughputEstimator;

/// Configuration for ABR decisions.
#[derive(Debug, Clone)]
pub struct AbrConfig {
    /// Safety factor applied to throughput when selecting a variant.
    /// For example, if set to 0.8, and throughput is 5 Mbps, ABR will
    /// try to select a variant with bandwidth <= 4 Mbps.
    pub throughput_safety_factor: f64,
    /// Hysteresis ratio applied for up-switch decisions (e.g., 0.15 = +15% headroom).
    pub up_hysteresis_ratio: f64,
    /// Hysteresis ratio applied for down-switch decisions (e.g., 0.05 = -5% margin).
    pub down_hysteresis_ratio: f64,
    /// Minimum buffered media above which the controller allows up-switching.
    pub min_buffer_for_up_switch: Duration,
    /// Minimal interval between consecutive switches to avoid oscillations.
    pub min_switch_interval: Duration,
    /// Samples required before the first decision.
    pub min_samples: u32,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            throughput_safety_factor: 0.8,
            up_hysteresis_ratio: 0.15,
            down_hysteresis_ratio: 0.05,
            min_buffer_for_up_switch: Duration::ZERO,
            min_switch_interval: Duration::from_secs(4),
            min_samples: 2,
        }
    }
}

impl AbrConfig {
    pub fn from_settings(settings: &HlsSettings) -> Self {
        Self {
            throughput_safety_factor: settings.abr_throughput_safety_factor,
            up_hysteresis_ratio: settings.abr_up_hysteresis_ratio,
            down_hysteresis_ratio: settings.abr_down_hysteresis_ratio,
            min_buffer_for_up_switch: settings.abr_min_buffer_for_up_switch,
            min_switch_interval: settings.abr_min_switch_interval,
            ..Self::default()
        }
    }
}

/// Outcome of one ABR evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbrDecision {
    Stay,
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub struct AbrController {
    config: AbrConfig,
    estimator: ThroughputEstimator,
    /// Backoff timer to avoid too frequent switches.
    last_switch: Option<Instant>,
}

impl AbrController {
    pub fn new(config: AbrConfig) -> Self {
        Self {
            config,
            estimator: ThroughputEstimator::new(),
            last_switch: None,
        }
    }

    /// Reports a downloaded media segment for throughput estimation.
    pub fn on_segment_downloaded(&mut self, byte_len: u64, elapsed: Duration) {
        self.estimator.push_sample(byte_len, elapsed);
    }

    pub fn estimate_bps(&self) -> Option<u64> {
        self.estimator.estimate_bps()
    }

    /// Records that a switch happened, whoever initiated it.
    pub fn on_switch(&mut self, now: Instant) {
        self.last_switch = Some(now);
    }

    /// Forgets throughput history and the switch gate, e.g. after a seek.
    pub fn reset(&mut self) {
        self.estimator.reset();
        self.last_switch = None;
    }

    /// Evaluates a one-step move from `current` within `bandwidths` (ascending).
    pub fn decide(
        &self,
        bandwidths: &[u64],
        current: usize,
        buffered: Duration,
        now: Instant,
    ) -> AbrDecision {
        if bandwidths.len() <= 1 || current >= bandwidths.len() {
            return AbrDecision::Stay;
        }
        if self.estimator.sample_count() < self.config.min_samples {
            return AbrDecision::Stay;
        }
        if let Some(last) = self.last_switch {
            if now.saturating_duration_since(last) < self.config.min_switch_interval {
                return AbrDecision::Stay;
            }
        }
        let Some(estimate) = self.estimator.estimate_bps() else {
            return AbrDecision::Stay;
        };

        let usable = estimate as f64 * self.config.throughput_safety_factor;
        let current_bw = bandwidths[current] as f64;

        if let Some(&next_bw) = bandwidths.get(current + 1) {
            let needed = next_bw as f64 * (1.0 + self.config.up_hysteresis_ratio);
            if usable >= needed && buffered >= self.config.min_buffer_for_up_switch {
                debug!(estimate, current_bw, next_bw, "abr: up-switch");
                return AbrDecision::Up;
            }
        }

        if current > 0 && usable < current_bw * (1.0 - self.config.down_hysteresis_ratio) {
            debug!(estimate, current_bw, "abr: down-switch");
            return AbrDecision::Down;
        }

        AbrDecision::Stay
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const TIERS: [u64; 3] = [500_000, 2_000_000, 6_000_000];

    fn controller_with(bytes: u64, ms: u64) -> AbrController {
        let mut abr = AbrController::new(AbrConfig::default());
        for _ in 0..3 {
            abr.on_segment_downloaded(bytes, Duration::from_millis(ms));
        }
        abr
    }

    #[rstest]
    // ~8 Mbps measured, 6.4 usable: 0.5 Mbps tier can step up to 2 Mbps
    #[case(1_000_000, 1000, 0, AbrDecision::Up)]
    // 6.4 usable is short of 6 Mbps plus headroom
    #[case(1_000_000, 1000, 1, AbrDecision::Stay)]
    // ~1.6 Mbps measured, 1.28 usable: below the 2 Mbps tier
    #[case(200_000, 1000, 1, AbrDecision::Down)]
    // ~3 Mbps measured, 2.4 usable: keeps 2 Mbps
    #[case(375_000, 1000, 1, AbrDecision::Stay)]
    // already at the bottom
    #[case(10_000, 1000, 0, AbrDecision::Stay)]
    fn decisions(
        #[case] bytes: u64,
        #[case] ms: u64,
        #[case] current: usize,
        #[case] expected: AbrDecision,
    ) {
        let abr = controller_with(bytes, ms);
        let decision = abr.decide(&TIERS, current, Duration::from_secs(10), Instant::now());
        assert_eq!(decision, expected);
    }

    #[test]
    fn no_decision_before_enough_samples() {
        let mut abr = AbrController::new(AbrConfig::default());
        abr.on_segment_downloaded(1_000_000, Duration::from_millis(100));
        assert_eq!(
            abr.decide(&TIERS, 0, Duration::from_secs(10), Instant::now()),
            AbrDecision::Stay
        );
    }

    #[test]
    fn switch_interval_is_respected() {
        let mut abr = controller_with(1_000_000, 1000);
        let now = Instant::now();
        abr.on_switch(now);
        assert_eq!(
            abr.decide(&TIERS, 0, Duration::from_secs(10), now + Duration::from_secs(1)),
            AbrDecision::Stay
        );
        assert_eq!(
            abr.decide(&TIERS, 0, Duration::from_secs(10), now + Duration::from_secs(5)),
            AbrDecision::Up
        );
    }

    #[test]
    fn up_switch_waits_for_buffer() {
        let config = AbrConfig {
            min_buffer_for_up_switch: Duration::from_secs(8),
            ..AbrConfig::default()
        };
        let mut abr = AbrController::new(config);
        for _ in 0..3 {
            abr.on_segment_downloaded(1_000_000, Duration::from_millis(1000));
        }
        assert_eq!(
            abr.decide(&TIERS, 0, Duration::from_secs(2), Instant::now()),
            AbrDecision::Stay
        );
    }
}
