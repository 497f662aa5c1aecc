//! Post-mix lookahead limiter
//!
//! Sits at the end of the engine's chain:
//!   voice mix → gain → **limiter** → NaN guard / hard clamp → output
//!
//! A short lookahead lets the gain come down *before* a peak leaves the
//! delay line, so polyphonic pile-ups are caught without clipping and
//! without the distortion a plain clamp would add. Only the gain changes;
//! below the threshold the output is the delayed input, bit for bit.
//!
//! # Algorithm
//!
//! 1. Each input frame is written to a delay line.
//! 2. Its stereo peak gives a per-frame "target gain" (threshold / peak,
//!    or 1.0), stored in a parallel ring.
//! 3. A sliding-window minimum over the lookahead finds the lowest gain
//!    needed by any frame still in the delay line.
//! 4. An exponential follower smooths the gain: attack converges 99 %
//!    within the lookahead, release uses the configured time-constant.
//! 5. The delayed frame is scaled by the smoothed gain.
//!
//! All storage is sized in `prepare`; `process` never allocates.

use crate::config::LimiterConfig;
use crate::types::{StereoSample, DEFAULT_SAMPLE_RATE};

// ═══════════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════════

/// Longest accepted lookahead in milliseconds
const MAX_LOOKAHEAD_MS: f32 = 10.0;

/// ln(0.01): the attack reaches 99 % of its target within the lookahead
const LN_ONE_PERCENT: f32 = -4.605_17;

// ═══════════════════════════════════════════════════════════════════════════════
// Limiter
// ═══════════════════════════════════════════════════════════════════════════════

/// Feed-forward lookahead limiter that only ever reduces gain
pub struct Limiter {
    config: LimiterConfig,
    /// Threshold in linear amplitude
    threshold: f32,
    /// Lookahead in frames
    lookahead: usize,

    // Ring buffers, sized in `prepare`

    /// Audio delay line
    delay: Vec<StereoSample>,
    /// Per-frame target gain
    target_gains: Vec<f32>,
    /// Shared write cursor
    write_pos: usize,

    // Envelope follower

    /// Current smoothed gain (1.0 = unity)
    gain: f32,
    attack_coeff: f32,
    release_coeff: f32,
}

impl Limiter {
    pub fn new(config: LimiterConfig) -> Self {
        let mut limiter = Self {
            config,
            threshold: 1.0,
            lookahead: 1,
            delay: Vec::new(),
            target_gains: Vec::new(),
            write_pos: 0,
            gain: 1.0,
            attack_coeff: 0.0,
            release_coeff: 0.0,
        };
        limiter.prepare(DEFAULT_SAMPLE_RATE);
        limiter
    }

    /// Recompute coefficients and (re)allocate the delay line. Not real-time safe.
    pub fn prepare(&mut self, sample_rate: f64) {
        let sample_rate = sample_rate as f32;
        let threshold_db = if self.config.threshold_db.is_finite() {
            self.config.threshold_db.min(0.0)
        } else {
            LimiterConfig::default().threshold_db
        };
        self.threshold = 10.0_f32.powf(threshold_db / 20.0);

        let lookahead_ms = self.config.lookahead_ms.clamp(0.0, MAX_LOOKAHEAD_MS);
        self.lookahead = ((lookahead_ms * 0.001 * sample_rate).round() as usize).max(1);

        // coeff^N = 0.01  →  coeff = exp(ln 0.01 / N)
        self.attack_coeff = (LN_ONE_PERCENT / self.lookahead as f32).exp();

        // First-order release: coeff = exp(-1 / (τ × fs))
        let release_secs = (self.config.release_ms.max(1.0)) * 0.001;
        self.release_coeff = (-1.0 / (release_secs * sample_rate)).exp();

        let len = self.lookahead + 1;
        self.delay = vec![StereoSample::silence(); len];
        self.target_gains = vec![1.0; len];
        self.reset();
    }

    /// Clear the delay line and return to unity gain
    pub fn reset(&mut self) {
        self.delay.fill(StereoSample::silence());
        self.target_gains.fill(1.0);
        self.write_pos = 0;
        self.gain = 1.0;
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Latency in frames (zero when disabled)
    pub fn latency_samples(&self) -> usize {
        if self.config.enabled {
            self.lookahead
        } else {
            0
        }
    }

    /// Current gain reduction as a linear factor (1.0 = none)
    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Limit a block in place
    pub fn process(&mut self, buffer: &mut [StereoSample]) {
        if !self.config.enabled {
            return;
        }
        let len = self.delay.len();

        for sample in buffer.iter_mut() {
            let peak = sample.peak();
            let target = if peak > self.threshold {
                self.threshold / peak
            } else {
                1.0
            };
            self.target_gains[self.write_pos] = target;

            let min_gain = self.window_min_gain();
            let coeff = if min_gain < self.gain {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.gain = self.gain * coeff + min_gain * (1.0 - coeff);

            let read_pos = (self.write_pos + len - self.lookahead) % len;
            let delayed = self.delay[read_pos];
            self.delay[self.write_pos] = *sample;
            *sample = delayed * self.gain;

            self.write_pos = (self.write_pos + 1) % len;
        }
    }

    /// Minimum target gain across the lookahead window
    #[inline]
    fn window_min_gain(&self) -> f32 {
        let len = self.target_gains.len();
        (0..self.lookahead)
            .map(|i| self.target_gains[(self.write_pos + len - i) % len])
            .fold(1.0_f32, f32::min)
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new(LimiterConfig::default())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
