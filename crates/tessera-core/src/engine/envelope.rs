//! ADSR envelope state machine
//!
//! `Idle → Attack → Decay → Sustain → Release → Idle`
//!
//! Two curve families are available. `OnePole` (the default) uses a raised
//! cosine attack and exponential decay/release, so the slope is continuous
//! at every segment boundary. `Linear` uses straight segments. Both share
//! the rules that matter for click-free playback:
//!
//! - A new attack always starts from the current value, never from a jump.
//! - Release is recomputed from the value at note-off, so it always takes
//!   the configured release time whatever level it starts from.
//! - Release ends below `SILENCE_THRESHOLD` or at the configured time,
//!   whichever comes first, and then snaps to 0.

use serde::{Deserialize, Serialize};

use crate::diagnostics::ParamError;
use crate::types::ms_to_frames;

/// Level treated as silence at the end of the release
pub const SILENCE_THRESHOLD: f32 = 1e-4;

/// Shortest segment time accepted (milliseconds)
pub const MIN_SEGMENT_MS: f32 = 1.0;

/// Longest segment time accepted (milliseconds)
pub const MAX_SEGMENT_MS: f32 = 60_000.0;

/// Distance from the sustain level left at the end of an exponential decay
const DECAY_RESIDUAL: f32 = 1e-3;

/// Time-constant used to glide to a new sustain level
const SUSTAIN_GLIDE_MS: f64 = 5.0;

/// Shape of the envelope segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeCurve {
    /// Raised-cosine attack, exponential decay and release
    #[default]
    OnePole,
    /// Straight-line segments
    Linear,
}

/// Envelope stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EnvelopeStage {
    #[default]
    Idle = 0,
    Attack = 1,
    Decay = 2,
    Sustain = 3,
    Release = 4,
}

impl EnvelopeStage {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Attack,
            2 => Self::Decay,
            3 => Self::Sustain,
            4 => Self::Release,
            _ => Self::Idle,
        }
    }
}

/// Attack/decay/release times in milliseconds and the sustain level (0..=1)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdsrParams {
    pub attack_ms: f32,
    pub decay_ms: f32,
    pub sustain: f32,
    pub release_ms: f32,
}

impl Default for AdsrParams {
    fn default() -> Self {
        Self {
            attack_ms: 5.0,
            decay_ms: 100.0,
            sustain: 1.0,
            release_ms: 200.0,
        }
    }
}

impl AdsrParams {
    pub fn new(attack_ms: f32, decay_ms: f32, sustain: f32, release_ms: f32) -> Self {
        Self {
            attack_ms,
            decay_ms,
            sustain,
            release_ms,
        }
    }

    /// Clamp every field into its valid range
    ///
    /// Non-finite values fall back to the default for that field. Returns
    /// the usable parameters and the first problem found, if any.
    pub fn validated(self) -> (Self, Option<ParamError>) {
        let defaults = Self::default();
        let mut first_error = None;

        let mut check = |name: &'static str, requested: f32, default: f32, min: f32, max: f32| {
            let applied = if requested.is_finite() {
                requested.clamp(min, max)
            } else {
                default
            };
            if applied != requested && first_error.is_none() {
                first_error = Some(ParamError::Envelope {
                    name,
                    requested: requested as f64,
                    applied: applied as f64,
                });
            }
            applied
        };

        let params = Self {
            attack_ms: check("attack_ms", self.attack_ms, defaults.attack_ms, MIN_SEGMENT_MS, MAX_SEGMENT_MS),
            decay_ms: check("decay_ms", self.decay_ms, defaults.decay_ms, MIN_SEGMENT_MS, MAX_SEGMENT_MS),
            sustain: check("sustain", self.sustain, defaults.sustain, 0.0, 1.0),
            release_ms: check("release_ms", self.release_ms, defaults.release_ms, MIN_SEGMENT_MS, MAX_SEGMENT_MS),
        };
        (params, first_error)
    }
}

/// Per-voice ADSR generator
#[derive(Debug, Clone)]
pub struct Envelope {
    curve: EnvelopeCurve,
    params: AdsrParams,
    sample_rate: f64,
    stage: EnvelopeStage,
    value: f32,
    /// Samples spent in the current segment
    counter: usize,
    /// Length of the current segment in samples
    length: usize,
    /// Value at the start of the current segment
    start_value: f32,
    /// Per-sample multiplier for exponential segments
    coeff: f32,
    sustain_glide: f32,
}

impl Envelope {
    pub fn new(curve: EnvelopeCurve) -> Self {
        let mut envelope = Self {
            curve,
            params: AdsrParams::default(),
            sample_rate: crate::types::DEFAULT_SAMPLE_RATE,
            stage: EnvelopeStage::Idle,
            value: 0.0,
            counter: 0,
            length: 1,
            start_value: 0.0,
            coeff: 1.0,
            sustain_glide: 0.0,
        };
        envelope.prepare(envelope.sample_rate);
        envelope
    }

    pub fn prepare(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        self.sustain_glide = (1.0 - (-1.0 / (SUSTAIN_GLIDE_MS * 0.001 * sample_rate)).exp()) as f32;
    }

    /// Set new parameters (expected to be validated); the running segment
    /// keeps its length, later segments use the new values
    pub fn set_params(&mut self, params: AdsrParams) {
        self.params = params;
    }

    pub fn params(&self) -> AdsrParams {
        self.params
    }

    pub fn set_curve(&mut self, curve: EnvelopeCurve) {
        self.curve = curve;
    }

    pub fn curve(&self) -> EnvelopeCurve {
        self.curve
    }

    #[inline]
    pub fn stage(&self) -> EnvelopeStage {
        self.stage
    }

    #[inline]
    pub fn value(&self) -> f32 {
        self.value
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.stage != EnvelopeStage::Idle
    }

    #[inline]
    pub fn is_releasing(&self) -> bool {
        self.stage == EnvelopeStage::Release
    }

    /// Force silence
    pub fn reset(&mut self) {
        self.stage = EnvelopeStage::Idle;
        self.value = 0.0;
        self.counter = 0;
    }

    #[inline]
    fn frames(&self, ms: f32) -> usize {
        ms_to_frames(ms as f64, self.sample_rate).max(1)
    }

    /// Start a fresh attack from the current value
    ///
    /// A voice that is idle or already practically silent starts from 0.
    pub fn note_on(&mut self) {
        if self.stage == EnvelopeStage::Idle || self.value < SILENCE_THRESHOLD {
            self.value = 0.0;
        }
        self.enter_attack();
    }

    fn enter_attack(&mut self) {
        self.stage = EnvelopeStage::Attack;
        self.counter = 0;
        self.length = self.frames(self.params.attack_ms);
        self.start_value = self.value;
    }

    fn enter_decay(&mut self) {
        self.stage = EnvelopeStage::Decay;
        self.counter = 0;
        self.length = self.frames(self.params.decay_ms);
        self.start_value = self.value;
        self.coeff = DECAY_RESIDUAL.powf(1.0 / self.length as f32);
    }

    /// Enter release from wherever the envelope is
    pub fn note_off(&mut self) {
        if matches!(self.stage, EnvelopeStage::Idle | EnvelopeStage::Release) {
            return;
        }
        if self.value <= SILENCE_THRESHOLD {
            self.reset();
            return;
        }
        self.stage = EnvelopeStage::Release;
        self.counter = 0;
        self.length = self.frames(self.params.release_ms);
        self.start_value = self.value;
        // Reaches the threshold after exactly `length` samples from any start
        self.coeff = (SILENCE_THRESHOLD / self.value).powf(1.0 / self.length as f32);
    }

    /// Advance one sample and return the new value
    #[inline]
    pub fn next(&mut self) -> f32 {
        match self.stage {
            EnvelopeStage::Idle => {
                self.value = 0.0;
            }
            EnvelopeStage::Attack => {
                self.counter += 1;
                if self.counter >= self.length {
                    self.value = 1.0;
                    self.enter_decay();
                } else {
                    let t = self.counter as f32 / self.length as f32;
                    let shape = match self.curve {
                        EnvelopeCurve::OnePole => 0.5 - 0.5 * (std::f32::consts::PI * t).cos(),
                        EnvelopeCurve::Linear => t,
                    };
                    self.value = self.start_value + (1.0 - self.start_value) * shape;
                }
            }
            EnvelopeStage::Decay => {
                self.counter += 1;
                let sustain = self.params.sustain;
                if self.counter >= self.length {
                    self.value = sustain;
                    self.stage = EnvelopeStage::Sustain;
                } else {
                    self.value = match self.curve {
                        EnvelopeCurve::OnePole => sustain + (self.value - sustain) * self.coeff,
                        EnvelopeCurve::Linear => {
                            let t = self.counter as f32 / self.length as f32;
                            self.start_value + (sustain - self.start_value) * t
                        }
                    };
                }
            }
            EnvelopeStage::Sustain => {
                self.value += (self.params.sustain - self.value) * self.sustain_glide;
            }
            EnvelopeStage::Release => {
                self.counter += 1;
                self.value = match self.curve {
                    EnvelopeCurve::OnePole => self.value * self.coeff,
                    EnvelopeCurve::Linear => {
                        let t = self.counter as f32 / self.length as f32;
                        self.start_value * (1.0 - t)
                    }
                };
                if self.counter >= self.length || self.value < SILENCE_THRESHOLD {
                    self.reset();
                }
            }
        }
        self.value
    }
}
