//! Bitrate adaptation.
//!
//! [`RateController`] is pure decision logic over a rolling window of RTT
//! and throughput samples. It never touches the encoder; the caller
//! compares the returned rung with the live encoder bitrate and decides
//! whether a restart is due.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use abr_stream_common::{StreamError, StreamResult};

/// Bitrate in bits per second.
pub type BitrateLevel = u32;

/// Ordered, finite set of allowed encoding bitrates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitrateLadder {
    rungs: Vec<BitrateLevel>,
}

impl BitrateLadder {
    // ---
    /// Builds a ladder from explicit rungs (sorted and deduplicated).
    ///
    /// # Errors
    ///
    /// Returns error if no rung is positive.
    pub fn new(mut rungs: Vec<BitrateLevel>) -> StreamResult<Self> {
        // ---
        rungs.retain(|&r| r > 0);
        rungs.sort_unstable();
        rungs.dedup();
        if rungs.is_empty() {
            return Err(StreamError::Config(
                "bitrate ladder needs at least one positive rung".into(),
            ));
        }
        Ok(Self { rungs })
    }

    /// Builds `min, min+step, ...` up to and including `max`.
    ///
    /// `max` is always a rung even when `max - min` is not a multiple of
    /// `step`.
    pub fn from_range(min: BitrateLevel, max: BitrateLevel, step: BitrateLevel) -> StreamResult<Self> {
        // ---
        if step == 0 || min == 0 || min > max {
            return Err(StreamError::Config(format!(
                "invalid bitrate range: min={min} max={max} step={step}"
            )));
        }
        let mut rungs: Vec<BitrateLevel> = (min..=max).step_by(step as usize).collect();
        if rungs.last() != Some(&max) {
            rungs.push(max);
        }
        Self::new(rungs)
    }

    pub fn min(&self) -> BitrateLevel {
        // ---
        self.rungs.first().copied().unwrap_or_default()
    }

    pub fn max(&self) -> BitrateLevel {
        // ---
        self.rungs.last().copied().unwrap_or_default()
    }

    pub fn rungs(&self) -> &[BitrateLevel] {
        // ---
        &self.rungs
    }

    pub fn contains(&self, bps: BitrateLevel) -> bool {
        // ---
        self.rungs.binary_search(&bps).is_ok()
    }

    /// Index of the rung nearest to `bps`; ties resolve to the lower rung.
    pub fn snap_index(&self, bps: BitrateLevel) -> usize {
        // ---
        match self.rungs.binary_search(&bps) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) if i >= self.rungs.len() => self.rungs.len() - 1,
            Err(i) => {
                let below = self.rungs[i - 1];
                let above = self.rungs[i];
                if bps - below <= above - bps {
                    i - 1
                } else {
                    i
                }
            }
        }
    }

    /// Nearest rung to `bps`.
    pub fn snap(&self, bps: BitrateLevel) -> BitrateLevel {
        // ---
        self.rungs[self.snap_index(bps)]
    }

    fn rung(&self, index: usize) -> BitrateLevel {
        // ---
        self.rungs[index.min(self.rungs.len() - 1)]
    }
}

/// One measurement produced by a probe exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    // ---
    pub rtt: Duration,

    /// Effective payload rate; `None` when nothing was sent during the
    /// measured interval.
    pub throughput_bps: Option<f64>,

    pub timestamp: Instant,
}

impl Sample {
    // ---
    pub fn new(rtt: Duration, throughput_bps: Option<f64>) -> Self {
        // ---
        Self {
            rtt,
            throughput_bps,
            timestamp: Instant::now(),
        }
    }
}

/// Rate controller tuning.
#[derive(Debug, Clone)]
pub struct RateConfig {
    // ---
    pub ladder: BitrateLadder,

    /// Samples kept per rolling window
    pub window: usize,

    /// Weight multiplier per step of sample age; 1.0 is a plain mean
    pub decay: f64,

    /// Step down when average throughput falls below `current * down_ratio`
    pub down_ratio: f64,

    /// Step up when average throughput exceeds `current * up_ratio`
    pub up_ratio: f64,

    /// Average RTT above this forces a step down
    pub rtt_high_watermark: Duration,
}

impl Default for RateConfig {
    fn default() -> Self {
        // ---
        Self {
            ladder: BitrateLadder {
                rungs: vec![64_000, 128_000, 192_000, 256_000, 320_000],
            },
            window: 8,
            decay: 1.0,
            down_ratio: 0.8,
            up_ratio: 1.2,
            rtt_high_watermark: Duration::from_millis(200),
        }
    }
}

impl RateConfig {
    // ---
    pub fn validate(&self) -> StreamResult<()> {
        // ---
        if self.window == 0 {
            return Err(StreamError::Config("rate window must be at least 1".into()));
        }
        if !(self.decay > 0.0 && self.decay <= 1.0) {
            return Err(StreamError::Config(format!(
                "decay must be in (0, 1], got {}",
                self.decay
            )));
        }
        if !(self.down_ratio > 0.0 && self.down_ratio <= self.up_ratio) {
            return Err(StreamError::Config(format!(
                "ratios must satisfy 0 < down ({}) <= up ({})",
                self.down_ratio, self.up_ratio
            )));
        }
        Ok(())
    }
}

/// Chooses the next bitrate rung from recent samples.
///
/// Moves at most one rung per [`next_bitrate`](Self::next_bitrate) call.
/// Callers rate-limit how often they ask (every K chunks) so a burst of
/// samples cannot cause a restart storm.
#[derive(Debug, Clone)]
pub struct RateController {
    // ---
    config: RateConfig,
    current: usize,
    rtts: VecDeque<Duration>,
    throughputs: VecDeque<f64>,
}

impl RateController {
    // ---
    /// Creates a controller starting at the rung nearest `initial`.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn new(config: RateConfig, initial: BitrateLevel) -> StreamResult<Self> {
        // ---
        config.validate()?;
        let current = config.ladder.snap_index(initial);
        Ok(Self {
            rtts: VecDeque::with_capacity(config.window),
            throughputs: VecDeque::with_capacity(config.window),
            config,
            current,
        })
    }

    /// Adds a sample to the rolling windows, evicting the oldest.
    pub fn observe(&mut self, sample: Sample) {
        // ---
        push_bounded(&mut self.rtts, sample.rtt, self.config.window);
        if let Some(bps) = sample.throughput_bps.filter(|b| b.is_finite() && *b >= 0.0) {
            push_bounded(&mut self.throughputs, bps, self.config.window);
        }
    }

    /// Bitrate the controller currently settles on.
    pub fn current(&self) -> BitrateLevel {
        // ---
        self.config.ladder.rung(self.current)
    }

    pub fn ladder(&self) -> &BitrateLadder {
        // ---
        &self.config.ladder
    }

    /// Weighted average RTT over the window.
    pub fn average_rtt(&self) -> Option<Duration> {
        // ---
        weighted_mean(self.rtts.iter().map(Duration::as_secs_f64), self.config.decay)
            .map(Duration::from_secs_f64)
    }

    /// Weighted average throughput over the window.
    pub fn average_throughput(&self) -> Option<f64> {
        // ---
        weighted_mean(self.throughputs.iter().copied(), self.config.decay)
    }

    /// Evaluates the windows and returns the bitrate to run at.
    ///
    /// - Throughput below `current * down_ratio` steps down one rung,
    ///   above `current * up_ratio` steps up one rung.
    /// - Average RTT above the watermark overrides the throughput verdict
    ///   with a one-rung decrease, so both rules voting down still moves a
    ///   single rung.
    ///
    /// Returns the previous bitrate unchanged unless a rung changes.
    pub fn next_bitrate(&mut self) -> BitrateLevel {
        // ---
        let current_bps = self.current() as f64;
        let top = self.config.ladder.rungs.len() - 1;
        let mut next = self.current;

        if let Some(throughput) = self.average_throughput() {
            if throughput < current_bps * self.config.down_ratio {
                next = self.current.saturating_sub(1);
            } else if throughput > current_bps * self.config.up_ratio {
                next = (self.current + 1).min(top);
            }
        }

        if let Some(rtt) = self.average_rtt() {
            if rtt > self.config.rtt_high_watermark {
                next = self.current.saturating_sub(1);
            }
        }

        self.current = next;
        self.current()
    }
}

fn push_bounded<T>(window: &mut VecDeque<T>, value: T, cap: usize) {
    // ---
    while window.len() >= cap {
        window.pop_front();
    }
    window.push_back(value);
}

/// Mean where the newest value weighs 1 and each older one `decay` times
/// the next newer one.
fn weighted_mean(values: impl DoubleEndedIterator<Item = f64>, decay: f64) -> Option<f64> {
    // ---
    let mut weight = 1.0;
    let mut total_weight = 0.0;
    let mut sum = 0.0;
    for v in values.rev() {
        sum += v * weight;
        total_weight += weight;
        weight *= decay;
    }
    (total_weight > 0.0).then(|| sum / total_weight)
}

/// Converts probe outcomes into [`Sample`]s.
///
/// The receiver answers a ping only after reading every frame sent before
/// it, so the bytes sent between two pings divided by the spacing of their
/// pongs is the rate at which the receiver actually drained the channel.
#[derive(Debug)]
pub struct ThroughputMeter {
    // ---
    last: Option<(u64, Instant)>,
    ceiling: Duration,
}

impl ThroughputMeter {
    // ---
    /// `ceiling` is the RTT recorded for a probe that never came back.
    pub fn new(ceiling: Duration) -> Self {
        // ---
        Self { last: None, ceiling }
    }

    /// Builds a sample from one probe.
    ///
    /// # Arguments
    ///
    /// * `sent_at` - When the ping was written
    /// * `bytes_before` - Chunk bytes sent before the ping
    /// * `pong_at` - When the matching pong arrived, `None` on timeout
    pub fn record(&mut self, sent_at: Instant, bytes_before: u64, pong_at: Option<Instant>) -> Sample {
        // ---
        let Some(pong_at) = pong_at else {
            return Sample::new(self.ceiling, None);
        };

        let rtt = pong_at.saturating_duration_since(sent_at);
        let throughput = match self.last {
            Some((prev_bytes, prev_pong)) if pong_at > prev_pong && bytes_before > prev_bytes => {
                let secs = pong_at.duration_since(prev_pong).as_secs_f64();
                Some((bytes_before - prev_bytes) as f64 * 8.0 / secs)
            }
            _ => None,
        };

        if self.last.map_or(true, |(_, prev_pong)| pong_at > prev_pong) {
            self.last = Some((bytes_before, pong_at));
        }

        Sample {
            rtt,
            throughput_bps: throughput,
            timestamp: pong_at,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn ladder_64_320() -> BitrateLadder {
        // ---
        BitrateLadder::from_range(64_000, 320_000, 32_000).expect("valid range")
    }

    fn controller(initial: BitrateLevel) -> RateController {
        // ---
        let config = RateConfig {
            ladder: ladder_64_320(),
            window: 5,
            ..RateConfig::default()
        };
        RateController::new(config, initial).expect("valid config")
    }

    fn throughput_sample(bps: f64) -> Sample {
        // ---
        Sample::new(Duration::from_millis(20), Some(bps))
    }

    #[test]
    fn ladder_from_range_includes_both_ends() {
        // ---
        let ladder = ladder_64_320();
        assert_eq!(ladder.rungs().len(), 9);
        assert_eq!(ladder.min(), 64_000);
        assert_eq!(ladder.max(), 320_000);

        let odd = BitrateLadder::from_range(64_000, 100_000, 32_000).unwrap();
        assert_eq!(odd.rungs(), &[64_000, 96_000, 100_000]);
    }

    #[test]
    fn ladder_rejects_nonsense() {
        // ---
        assert!(BitrateLadder::from_range(0, 100, 10).is_err());
        assert!(BitrateLadder::from_range(200, 100, 10).is_err());
        assert!(BitrateLadder::from_range(100, 200, 0).is_err());
        assert!(BitrateLadder::new(vec![0]).is_err());
    }

    #[test]
    fn snap_picks_nearest_rung() {
        // ---
        let ladder = BitrateLadder::new(vec![128_000, 64_000, 256_000]).unwrap();
        assert_eq!(ladder.snap(10), 64_000);
        assert_eq!(ladder.snap(96_000), 64_000); // tie goes down
        assert_eq!(ladder.snap(100_000), 128_000);
        assert_eq!(ladder.snap(1_000_000), 256_000);
    }

    #[test]
    fn starved_throughput_steps_down_to_floor() {
        // ---
        let mut rc = controller(192_000);
        let mut seen = vec![rc.current()];

        for _ in 0..5 {
            rc.observe(throughput_sample(rc.current() as f64 * 0.5));
            seen.push(rc.next_bitrate());
        }
        assert_eq!(seen, vec![192_000, 160_000, 128_000, 96_000, 64_000, 64_000]);

        // Stays clamped
        rc.observe(throughput_sample(1_000.0));
        assert_eq!(rc.next_bitrate(), 64_000);
    }

    #[test]
    fn abundant_throughput_steps_up_to_ceiling() {
        // ---
        let mut rc = controller(256_000);
        for _ in 0..5 {
            rc.observe(throughput_sample(10_000_000.0));
            rc.next_bitrate();
        }
        assert_eq!(rc.current(), 320_000);
    }

    #[test]
    fn high_rtt_overrides_healthy_throughput() {
        // ---
        let mut rc = controller(192_000);
        rc.observe(Sample::new(Duration::from_millis(250), Some(192_000.0 * 1.5)));
        assert_eq!(rc.next_bitrate(), 160_000);
    }

    #[test]
    fn starved_throughput_and_high_rtt_step_down_once() {
        // ---
        let mut rc = controller(192_000);
        rc.observe(Sample::new(Duration::from_millis(250), Some(192_000.0 * 0.5)));
        assert_eq!(rc.next_bitrate(), 160_000);
        assert_eq!(rc.next_bitrate(), 128_000);
    }

    #[test]
    fn in_band_throughput_holds_bitrate() {
        // ---
        let mut rc = controller(128_000);
        rc.observe(throughput_sample(130_000.0));
        assert_eq!(rc.next_bitrate(), 128_000);
    }

    #[test]
    fn no_samples_means_no_change() {
        // ---
        let mut rc = controller(128_000);
        assert_eq!(rc.next_bitrate(), 128_000);
    }

    #[test]
    fn window_evicts_oldest() {
        // ---
        let mut rc = controller(128_000);
        for _ in 0..5 {
            rc.observe(Sample::new(Duration::from_millis(900), None));
        }
        for _ in 0..5 {
            rc.observe(Sample::new(Duration::from_millis(10), None));
        }
        let avg = rc.average_rtt().expect("window populated");
        assert!(avg > Duration::from_millis(9) && avg < Duration::from_millis(11));
    }

    #[test]
    fn decay_favours_recent_samples() {
        // ---
        let config = RateConfig {
            decay: 0.5,
            ..RateConfig::default()
        };
        let mut rc = RateController::new(config, 128_000).unwrap();
        rc.observe(throughput_sample(0.0));
        rc.observe(throughput_sample(300.0));
        // (300 * 1 + 0 * 0.5) / 1.5
        let avg = rc.average_throughput().unwrap();
        assert!((avg - 200.0).abs() < 1e-9);
    }

    #[test]
    fn result_always_on_ladder_and_single_step() {
        // ---
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut rc = controller(128_000);
        let ladder = ladder_64_320();

        let mut prev = ladder.snap_index(rc.current());
        for _ in 0..500 {
            let rtt = Duration::from_millis(rng.gen_range(0..400));
            let tp = if rng.gen_bool(0.2) {
                None
            } else {
                Some(rng.gen_range(0.0..600_000.0))
            };
            rc.observe(Sample::new(rtt, tp));

            let next = rc.next_bitrate();
            assert!(ladder.contains(next));
            assert!((ladder.min()..=ladder.max()).contains(&next));
            let idx = ladder.snap_index(next);
            assert!(idx.abs_diff(prev) <= 1);
            prev = idx;
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        // ---
        let config = RateConfig {
            window: 0,
            ..RateConfig::default()
        };
        assert!(RateController::new(config, 128_000).is_err());
    }

    #[test]
    fn meter_reports_ceiling_on_timeout() {
        // ---
        let mut meter = ThroughputMeter::new(Duration::from_secs(2));
        let s = meter.record(Instant::now(), 0, None);
        assert_eq!(s.rtt, Duration::from_secs(2));
        assert_eq!(s.throughput_bps, None);
    }

    #[test]
    fn meter_derives_throughput_from_pong_spacing() {
        // ---
        let mut meter = ThroughputMeter::new(Duration::from_secs(2));
        let t0 = Instant::now();

        let first = meter.record(t0, 0, Some(t0 + Duration::from_millis(10)));
        assert_eq!(first.rtt, Duration::from_millis(10));
        assert_eq!(first.throughput_bps, None);

        // 12_500 bytes drained between pongs one second apart = 100 kbit/s
        let second = meter.record(
            t0 + Duration::from_millis(990),
            12_500,
            Some(t0 + Duration::from_millis(1010)),
        );
        assert_eq!(second.rtt, Duration::from_millis(20));
        let bps = second.throughput_bps.expect("throughput measured");
        assert!((bps - 100_000.0).abs() < 1e-6);
    }
}
