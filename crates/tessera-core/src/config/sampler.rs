//! Sampler engine configuration

use serde::{Deserialize, Serialize};

use crate::engine::EnvelopeCurve;
use crate::midi::DEFAULT_MIDI_QUEUE_CAPACITY;
use crate::timestretch::StretchBackend;

/// Inclusive bounds for a ratio parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatioBounds {
    pub min: f64,
    pub max: f64,
}

impl RatioBounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Bounds with `min <= 1 <= max`, both positive and finite
    ///
    /// Broken bounds from a hand-edited config collapse to the defaults.
    pub fn sanitized(self) -> Self {
        let valid = self.min.is_finite()
            && self.max.is_finite()
            && self.min > 0.0
            && self.min <= 1.0
            && self.max >= 1.0;
        if valid {
            self
        } else {
            log::warn!("Invalid ratio bounds {:?}, using defaults", self);
            Self::default()
        }
    }
}

impl Default for RatioBounds {
    fn default() -> Self {
        Self::new(0.25, 4.0)
    }
}

/// Post-mix safety limiter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// When disabled only the per-sample NaN guard and hard clamp remain
    pub enabled: bool,
    /// Ceiling in dBFS; the headroom below 0 dBFS the limiter keeps
    pub threshold_db: f32,
    /// Lookahead in milliseconds (also the limiter's latency)
    pub lookahead_ms: f32,
    /// Gain recovery time-constant in milliseconds
    pub release_ms: f32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_db: -0.3,
            lookahead_ms: 1.5,
            release_ms: 100.0,
        }
    }
}

/// Engine configuration, applied at construction and on `prepare`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Size of the voice pool (fixed for the engine's lifetime)
    pub voices: usize,
    /// Time/pitch backend each voice owns an instance of
    pub backend: StretchBackend,
    /// Route voices through their time/pitch processor
    pub time_warp: bool,
    /// Envelope segment shape
    pub envelope_curve: EnvelopeCurve,
    /// Anti-click fade-in after every (re)start, in frames
    pub fade_in_samples: usize,
    /// Fade applied after the release envelope finishes, in frames
    pub release_fade_samples: usize,
    /// Fade-out before restarting an audible voice on retrigger, in frames
    pub retrigger_fade_samples: usize,
    /// Fade-out of a stolen voice, in milliseconds
    pub steal_fade_ms: f64,
    /// Extra start delay per additional note-on in the same block, in frames
    pub start_stagger_samples: usize,
    /// Per-voice DC blocking high-pass
    pub dc_block: bool,
    /// Accepted range for the pitch ratio
    pub pitch_ratio_bounds: RatioBounds,
    /// Accepted range for the time ratio
    pub time_ratio_bounds: RatioBounds,
    /// MIDI queue capacity (rounded up to a power of two)
    pub midi_queue_capacity: usize,
    /// Output limiter
    pub limiter: LimiterConfig,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            voices: 16,
            backend: StretchBackend::default(),
            time_warp: false,
            envelope_curve: EnvelopeCurve::default(),
            fade_in_samples: 100,
            release_fade_samples: 256,
            retrigger_fade_samples: 64,
            steal_fade_ms: 5.0,
            start_stagger_samples: 0,
            dc_block: true,
            pitch_ratio_bounds: RatioBounds::default(),
            time_ratio_bounds: RatioBounds::default(),
            midi_queue_capacity: DEFAULT_MIDI_QUEUE_CAPACITY,
            limiter: LimiterConfig::default(),
        }
    }
}

impl SamplerConfig {
    /// Copy with every field forced into a usable range
    pub fn sanitized(&self) -> Self {
        let mut config = self.clone();
        config.voices = config.voices.clamp(1, 256);
        config.fade_in_samples = config.fade_in_samples.clamp(1, 4096);
        config.release_fade_samples = config.release_fade_samples.clamp(1, 8192);
        config.retrigger_fade_samples = config.retrigger_fade_samples.clamp(1, 4096);
        if !config.steal_fade_ms.is_finite() {
            config.steal_fade_ms = Self::default().steal_fade_ms;
        }
        config.steal_fade_ms = config.steal_fade_ms.clamp(0.1, 100.0);
        config.start_stagger_samples = config.start_stagger_samples.min(256);
        config.pitch_ratio_bounds = config.pitch_ratio_bounds.sanitized();
        config.time_ratio_bounds = config.time_ratio_bounds.sanitized();
        config.midi_queue_capacity = config.midi_queue_capacity.clamp(2, 1 << 16);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SamplerConfig::default();
        assert_eq!(config.voices, 16);
        assert_eq!(config.fade_in_samples, 100);
        assert_eq!(config.pitch_ratio_bounds, RatioBounds::new(0.25, 4.0));
        assert!(config.limiter.enabled);
    }

    #[test]
    fn test_sanitized_fixes_broken_values() {
        let config = SamplerConfig {
            voices: 0,
            steal_fade_ms: f64::NAN,
            pitch_ratio_bounds: RatioBounds::new(2.0, 0.5),
            ..Default::default()
        }
        .sanitized();

        assert_eq!(config.voices, 1);
        assert_eq!(config.steal_fade_ms, 5.0);
        assert_eq!(config.pitch_ratio_bounds, RatioBounds::default());
    }

    #[test]
    fn test_yaml_uses_snake_case_enums() {
        let yaml = serde_yaml::to_string(&SamplerConfig::default()).unwrap();
        assert!(yaml.contains("backend: wsola"));
        assert!(yaml.contains("envelope_curve: one_pole"));
    }
}
