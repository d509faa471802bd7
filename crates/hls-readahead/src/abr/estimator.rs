use std::time::Duration;

/// Dual-EWMA throughput estimator.
///
/// The fast average reacts to drops quickly, the slow one damps spikes; the
/// estimate is the lower of the two.
#[derive(Clone, Debug)]
pub struct ThroughputEstimator {
    fast_ewma: Ewma,
    slow_ewma: Ewma,
    samples: u32,
}

impl Default for ThroughputEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputEstimator {
    const FAST_HALF_LIFE_SECS: f64 = 2.0;
    const SLOW_HALF_LIFE_SECS: f64 = 10.0;
    const MIN_CHUNK_BYTES: u64 = 2_000;
    const MIN_DURATION_MS: f64 = 0.5;

    pub fn new() -> Self {
        Self {
            fast_ewma: Ewma::new(Self::FAST_HALF_LIFE_SECS),
            slow_ewma: Ewma::new(Self::SLOW_HALF_LIFE_SECS),
            samples: 0,
        }
    }

    /// Estimated throughput in bits per second, `None` before any usable sample.
    pub fn estimate_bps(&self) -> Option<u64> {
        let est = self
            .fast_ewma
            .get_estimate()
            .min(self.slow_ewma.get_estimate());
        (est > 0.0).then(|| est.round() as u64)
    }

    pub fn sample_count(&self) -> u32 {
        self.samples
    }

    /// Feeds one completed download. Tiny payloads are ignored; their timing is
    /// dominated by latency rather than bandwidth.
    pub fn push_sample(&mut self, bytes: u64, elapsed: Duration) {
        if bytes < Self::MIN_CHUNK_BYTES {
            return;
        }

        let dur_ms = (elapsed.as_secs_f64() * 1000.0).max(Self::MIN_DURATION_MS);
        let bps = (bytes as f64) * 8000.0 / dur_ms;
        let weight_secs = dur_ms / 1000.0;

        self.fast_ewma.add_sample(weight_secs, bps);
        self.slow_ewma.add_sample(weight_secs, bps);
        self.samples = self.samples.saturating_add(1);
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[derive(Clone, Debug)]
struct Ewma {
    alpha: f64,
    last_estimate: f64,
    total_weight: f64,
}

impl Ewma {
    fn new(half_life_secs: f64) -> Self {
        Self {
            alpha: f64::exp(0.5_f64.ln() / half_life_secs.max(0.001)),
            last_estimate: 0.0,
            total_weight: 0.0,
        }
    }

    fn add_sample(&mut self, weight: f64, val: f64) {
        let adj_alpha = self.alpha.powf(weight.max(0.0));
        self.last_estimate = val * (1.0 - adj_alpha) + adj_alpha * self.last_estimate;
        self.total_weight += weight.max(0.0);
    }

    fn get_estimate(&self) -> f64 {
        if self.total_weight <= 0.0 {
            0.0
        } else {
            let zero_factor = 1.0 - self.alpha.powf(self.total_weight);
            self.last_estimate / zero_factor.max(1e-6)
        }
    }
}
