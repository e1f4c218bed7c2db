//! Latency providers.
//!
//! A latency provider produces a latency/jitter estimate on demand. The
//! streaming engine never consumes these directly, it only measures the
//! effects of the network it runs over. Providers drive network emulation
//! in tests and tooling, where the same call site must work with a fitted
//! distribution, a time-series model, or recorded data.

use std::collections::VecDeque;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// One latency sample with the jitter that accompanies it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyEstimate {
    // ---
    /// One-way delay to apply
    pub latency: Duration,

    /// Expected variation around `latency`
    pub jitter: Duration,
}

impl LatencyEstimate {
    // ---
    fn from_ms(latency_ms: f64, jitter_ms: f64) -> Self {
        // ---
        Self {
            latency: duration_from_ms(latency_ms),
            jitter: duration_from_ms(jitter_ms.abs()),
        }
    }
}

/// Source of latency estimates.
pub trait LatencyProvider: Send {
    /// Next estimate, or `None` once the provider is exhausted.
    fn next_latency(&mut self) -> Option<LatencyEstimate>;
}

impl<P: LatencyProvider + ?Sized> LatencyProvider for Box<P> {
    fn next_latency(&mut self) -> Option<LatencyEstimate> {
        (**self).next_latency()
    }
}

fn duration_from_ms(ms: f64) -> Duration {
    // ---
    if ms.is_finite() && ms > 0.0 {
        Duration::from_nanos((ms * 1_000_000.0).round() as u64)
    } else {
        Duration::ZERO
    }
}

fn make_rng(seed: Option<u64>) -> StdRng {
    // ---
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Standard normal sample (Box-Muller).
fn standard_normal(rng: &mut StdRng) -> f64 {
    // ---
    let u1: f64 = 1.0 - rng.gen::<f64>(); // (0, 1]
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn mean_std(data: &[f64]) -> (f64, f64) {
    // ---
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let n = data.len() as f64;
    let mean = data.iter().sum::<f64>() / n;
    let var = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Latency drawn from a normal distribution, clamped at zero.
pub struct DistributionLatency {
    // ---
    mean_ms: f64,
    std_ms: f64,
    rng: StdRng,
}

impl DistributionLatency {
    // ---
    pub fn new(mean_ms: f64, std_ms: f64, seed: Option<u64>) -> Self {
        // ---
        Self {
            mean_ms,
            std_ms: std_ms.abs(),
            rng: make_rng(seed),
        }
    }

    /// Fits mean and standard deviation to recorded milliseconds.
    pub fn from_data(data_ms: &[f64], seed: Option<u64>) -> Self {
        // ---
        let (mean, std) = mean_std(data_ms);
        Self::new(mean, std, seed)
    }

    pub fn mean_ms(&self) -> f64 {
        // ---
        self.mean_ms
    }

    pub fn std_ms(&self) -> f64 {
        // ---
        self.std_ms
    }
}

impl LatencyProvider for DistributionLatency {
    fn next_latency(&mut self) -> Option<LatencyEstimate> {
        // ---
        let sample = self.mean_ms + self.std_ms * standard_normal(&mut self.rng);
        Some(LatencyEstimate::from_ms(sample, self.std_ms))
    }
}

/// Autoregressive AR(p) latency model with occasional spikes.
///
/// `x[t] = c + sum(phi[i] * x[t-1-i]) + e[t]`, `e ~ N(0, noise_std^2)`.
/// While a spike is active, a sample from the spike distribution is added
/// on top of the model output.
pub struct AutoregressiveLatency {
    // ---
    constant_ms: f64,
    coefficients: Vec<f64>,
    noise_std_ms: f64,
    history: VecDeque<f64>,

    spike_prob: f64,
    spike_mean_ms: f64,
    spike_std_ms: f64,
    spike_len: u32,
    spike_remaining: u32,

    rng: StdRng,
}

impl AutoregressiveLatency {
    // ---
    /// Creates a model seeded with recent observations (newest last).
    ///
    /// Missing history is filled with the process mean.
    pub fn new(
        constant_ms: f64,
        coefficients: Vec<f64>,
        noise_std_ms: f64,
        recent_ms: &[f64],
        seed: Option<u64>,
    ) -> Self {
        // ---
        let order = coefficients.len();
        let phi_sum: f64 = coefficients.iter().sum();
        let mean = if (1.0 - phi_sum).abs() > f64::EPSILON {
            constant_ms / (1.0 - phi_sum)
        } else {
            constant_ms
        };

        let mut history: VecDeque<f64> = recent_ms.iter().rev().take(order).copied().collect();
        while history.len() < order {
            history.push_back(mean);
        }

        Self {
            constant_ms,
            coefficients,
            noise_std_ms: noise_std_ms.abs(),
            history,
            spike_prob: 0.0,
            spike_mean_ms: 0.0,
            spike_std_ms: 0.0,
            spike_len: 0,
            spike_remaining: 0,
            rng: make_rng(seed),
        }
    }

    /// Enables latency spikes of `len` samples, started with probability
    /// `prob` per sample.
    pub fn with_spikes(mut self, prob: f64, mean_ms: f64, std_ms: f64, len: u32) -> Self {
        // ---
        self.spike_prob = prob.clamp(0.0, 1.0);
        self.spike_mean_ms = mean_ms;
        self.spike_std_ms = std_ms.abs();
        self.spike_len = len;
        self
    }

    fn next_value(&mut self) -> f64 {
        // ---
        // history is newest-first, aligned with coefficients
        let ar: f64 = self
            .coefficients
            .iter()
            .zip(self.history.iter())
            .map(|(phi, x)| phi * x)
            .sum();
        let noise = self.noise_std_ms * standard_normal(&mut self.rng);
        let value = self.constant_ms + ar + noise;

        if !self.coefficients.is_empty() {
            self.history.push_front(value);
            self.history.truncate(self.coefficients.len());
        }
        value
    }
}

impl LatencyProvider for AutoregressiveLatency {
    fn next_latency(&mut self) -> Option<LatencyEstimate> {
        // ---
        let previous = self.history.front().copied().unwrap_or(self.constant_ms);
        let mut value = self.next_value();

        if self.spike_remaining == 0 && self.spike_len > 0 && self.rng.gen_bool(self.spike_prob) {
            self.spike_remaining = self.spike_len;
        }
        if self.spike_remaining > 0 {
            self.spike_remaining -= 1;
            value += self.spike_mean_ms + self.spike_std_ms * standard_normal(&mut self.rng);
        }

        Some(LatencyEstimate::from_ms(value, value - previous))
    }
}

/// Replays recorded latencies in order.
pub struct ReplayLatency {
    // ---
    data_ms: Vec<f64>,
    position: usize,
    looping: bool,
    previous_ms: Option<f64>,
}

impl ReplayLatency {
    // ---
    pub fn new(data_ms: Vec<f64>, looping: bool) -> Self {
        // ---
        Self {
            data_ms,
            position: 0,
            looping,
            previous_ms: None,
        }
    }

    /// Samples not yet replayed in the current pass.
    pub fn remaining(&self) -> usize {
        // ---
        self.data_ms.len().saturating_sub(self.position)
    }
}

impl LatencyProvider for ReplayLatency {
    fn next_latency(&mut self) -> Option<LatencyEstimate> {
        // ---
        if self.position >= self.data_ms.len() {
            if !self.looping || self.data_ms.is_empty() {
                return None;
            }
            self.position = 0;
        }

        let value = *self.data_ms.get(self.position)?;
        self.position += 1;
        let jitter = self.previous_ms.map_or(0.0, |p| value - p);
        self.previous_ms = Some(value);

        Some(LatencyEstimate::from_ms(value, jitter))
    }
}
