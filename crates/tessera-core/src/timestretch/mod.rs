//! Time-stretching and pitch-shifting processors
//!
//! Every voice owns exactly one [`TimePitchProcessor`] so phase and
//! correlation history never leak between voices. Four backends implement
//! the trait:
//!
//! - [`WsolaProcessor`]: time-domain waveform-similarity overlap-add
//! - [`GranularProcessor`]: windowed grains read at the pitch ratio
//! - [`PhaseVocoderProcessor`]: STFT phase vocoder with transient reset
//! - [`StretcherProcessor`]: adapter around signalsmith-stretch
//!
//! All of them accept blocks of any size. While they accumulate enough
//! context for their analysis window ("priming") they return fewer frames
//! than requested and zero-fill the rest of the output; they never make up
//! audio. `time_ratio` scales duration (2.0 = twice as long), the pitch
//! ratio scales frequency independently of it.

mod granular;
mod ola;
mod phase_vocoder;
mod stretcher;
mod wsola;

pub use granular::GranularProcessor;
pub use phase_vocoder::PhaseVocoderProcessor;
pub use stretcher::StretcherProcessor;
pub use wsola::WsolaProcessor;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::RatioBounds;
use crate::diagnostics::{clamp_ratio, Diagnostics, ParamError};
use crate::types::{semitones_to_ratio, StereoSample};

/// Upper bound on analysis frames computed in a single `process` call
///
/// Keeps the worst-case cost of one callback bounded under polyphony; any
/// shortfall shows up as fewer produced frames.
pub(crate) const MAX_FRAMES_PER_CALL: usize = 64;

/// Common contract of the time/pitch backends
///
/// `prepare` is the only method that allocates. Everything else is called
/// from the audio thread.
pub trait TimePitchProcessor: Send {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Allocate internal buffers for the given stream format
    fn prepare(&mut self, sample_rate: f64, channels: usize, max_block: usize);

    /// Clear all history, keeping the current ratios
    fn reset(&mut self);

    /// Set the pitch shift in semitones
    ///
    /// Values whose ratio falls outside the configured bounds are clamped;
    /// the clamped value is applied and the error is also recorded in the
    /// shared diagnostics.
    fn set_pitch_semitones(&mut self, semitones: f32) -> Result<(), ParamError>;

    /// Set the duration ratio (clamped like the pitch)
    fn set_time_ratio(&mut self, ratio: f64) -> Result<(), ParamError>;

    /// Pitch ratio currently applied
    fn pitch_ratio(&self) -> f64;

    /// Time ratio currently applied
    fn time_ratio(&self) -> f64;

    /// Consume all of `input` and write up to `output.len()` frames
    ///
    /// Returns the number of frames produced; `output[produced..]` is
    /// zero-filled. Produced samples are finite and within [-1, 1].
    fn process(&mut self, input: &[StereoSample], output: &mut [StereoSample]) -> usize;

    /// Drain buffered audio at end of input, as `process` with silence fed in
    fn flush(&mut self, output: &mut [StereoSample]) -> usize;

    /// Input frames needed before the first output frame appears
    fn input_latency(&self) -> usize;

    /// Delay added on the output side
    fn output_latency(&self) -> usize;

    /// Input frames currently buffered
    fn input_fill(&self) -> usize;

    /// Output frames ready to be popped
    fn output_fill(&self) -> usize;

    /// Combined latency in frames
    fn total_latency(&self) -> usize {
        self.input_latency() + self.output_latency()
    }
}

/// Available time/pitch backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StretchBackend {
    #[default]
    Wsola,
    Granular,
    PhaseVocoder,
    Stretcher,
}

impl StretchBackend {
    pub const ALL: [StretchBackend; 4] = [
        StretchBackend::Wsola,
        StretchBackend::Granular,
        StretchBackend::PhaseVocoder,
        StretchBackend::Stretcher,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Wsola => "wsola",
            Self::Granular => "granular",
            Self::PhaseVocoder => "phase_vocoder",
            Self::Stretcher => "stretcher",
        }
    }

    /// Parse a backend name as written in config files
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|backend| backend.name() == name)
    }
}

impl std::fmt::Display for StretchBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Create an unprepared processor for `backend`
pub fn create_processor(
    backend: StretchBackend,
    diagnostics: Arc<Diagnostics>,
    pitch_bounds: RatioBounds,
    time_bounds: RatioBounds,
) -> Box<dyn TimePitchProcessor> {
    let ratios = RatioControl::new(diagnostics, pitch_bounds, time_bounds);
    match backend {
        StretchBackend::Wsola => Box::new(WsolaProcessor::new(ratios)),
        StretchBackend::Granular => Box::new(GranularProcessor::new(ratios)),
        StretchBackend::PhaseVocoder => Box::new(PhaseVocoderProcessor::new(ratios)),
        StretchBackend::Stretcher => Box::new(StretcherProcessor::new(ratios)),
    }
}

/// Pitch/time ratios with their bounds and clamp reporting
///
/// Shared by all backends so the clamping and error policy is identical.
pub struct RatioControl {
    pitch_ratio: f64,
    time_ratio: f64,
    pitch_bounds: RatioBounds,
    time_bounds: RatioBounds,
    diagnostics: Arc<Diagnostics>,
}

impl RatioControl {
    pub fn new(diagnostics: Arc<Diagnostics>, pitch_bounds: RatioBounds, time_bounds: RatioBounds) -> Self {
        Self {
            pitch_ratio: 1.0,
            time_ratio: 1.0,
            pitch_bounds: pitch_bounds.sanitized(),
            time_bounds: time_bounds.sanitized(),
            diagnostics,
        }
    }

    #[inline]
    pub fn pitch(&self) -> f64 {
        self.pitch_ratio
    }

    #[inline]
    pub fn time(&self) -> f64 {
        self.time_ratio
    }

    pub fn pitch_bounds(&self) -> RatioBounds {
        self.pitch_bounds
    }

    pub fn time_bounds(&self) -> RatioBounds {
        self.time_bounds
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn set_pitch_semitones(&mut self, semitones: f32) -> Result<(), ParamError> {
        let requested = if semitones.is_finite() {
            semitones_to_ratio(semitones as f64)
        } else {
            f64::NAN
        };
        self.set_pitch_ratio(requested)
    }

    pub fn set_pitch_ratio(&mut self, requested: f64) -> Result<(), ParamError> {
        let bounds = self.pitch_bounds;
        let (applied, clamped) = clamp_ratio(requested, bounds.min, bounds.max, 1.0);
        self.pitch_ratio = applied;
        if clamped {
            Err(self
                .diagnostics
                .record_param(ParamError::PitchRatio { requested, applied }))
        } else {
            Ok(())
        }
    }

    pub fn set_time_ratio(&mut self, requested: f64) -> Result<(), ParamError> {
        let bounds = self.time_bounds;
        let (applied, clamped) = clamp_ratio(requested, bounds.min, bounds.max, 1.0);
        self.time_ratio = applied;
        if clamped {
            Err(self
                .diagnostics
                .record_param(ParamError::TimeRatio { requested, applied }))
        } else {
            Ok(())
        }
    }
}

/// Apply the sample safety net to the produced frames and silence the rest
pub(crate) fn finish_output(output: &mut [StereoSample], produced: usize, diagnostics: &Diagnostics) -> usize {
    let produced = produced.min(output.len());
    let mut bad = 0u64;
    for frame in &mut output[..produced] {
        let (clean, was_bad) = frame.sanitized();
        *frame = clean;
        bad += was_bad as u64;
    }
    diagnostics.record_nan(bad);
    output[produced..].fill(StereoSample::silence());
    produced
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use std::f32::consts::PI;

    pub fn processor(backend: StretchBackend) -> (Box<dyn TimePitchProcessor>, Arc<Diagnostics>) {
        let diagnostics = Arc::new(Diagnostics::new());
        let mut p = create_processor(
            backend,
            diagnostics.clone(),
            RatioBounds::default(),
            RatioBounds::default(),
        );
        p.prepare(44100.0, 2, 512);
        (p, diagnostics)
    }

    pub fn sine(freq: f32, amplitude: f32, frames: usize) -> Vec<StereoSample> {
        (0..frames)
            .map(|i| StereoSample::mono(amplitude * (2.0 * PI * freq * i as f32 / 44100.0).sin()))
            .collect()
    }

    /// Run `input` through `p` in blocks of `block`, then flush; returns
    /// only the produced frames
    pub fn run(
        p: &mut dyn TimePitchProcessor,
        input: &[StereoSample],
        block: usize,
        out_per_block: usize,
    ) -> Vec<StereoSample> {
        let mut collected = Vec::new();
        let mut out = vec![StereoSample::silence(); out_per_block];
        for chunk in input.chunks(block) {
            let mut n = p.process(chunk, &mut out);
            // Drain whatever the chunk made available
            while n > 0 {
                assert!(n <= out.len());
                collected.extend_from_slice(&out[..n]);
                n = p.process(&[], &mut out);
            }
        }
        for _ in 0..64 {
            let n = p.flush(&mut out);
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&out[..n]);
        }
        collected
    }

    /// Positive-going zero crossings per second, an estimate of the frequency
    pub fn zero_crossing_freq(signal: &[StereoSample]) -> f32 {
        let crossings = signal
            .windows(2)
            .filter(|w| w[0].left < 0.0 && w[1].left >= 0.0)
            .count();
        crossings as f32 * 44100.0 / signal.len() as f32
    }
}
