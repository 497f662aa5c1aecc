//! STFT phase vocoder
//!
//! Each frame of `FFT_SIZE` samples is windowed and transformed with a real
//! FFT. Per bin the phase difference to the previous frame is unwrapped into
//! an instantaneous frequency, and the synthesis phase is accumulated from
//! it at the fixed synthesis hop. The analysis hop is `HOP / (time * pitch)`,
//! so every bin's phase advance is scaled by `time * pitch`; the result is
//! then resampled at a step of `pitch`, which restores the requested
//! duration and moves the frequencies by the pitch ratio.
//!
//! A spectral-flux detector resets the synthesis phases to the analysis
//! phases on onsets, which keeps attacks from smearing ("phasiness").

use std::f64::consts::TAU;
use std::sync::Arc;

use realfft::num_complex::Complex32;
use realfft::{ComplexToReal, FftError, RealFftPlanner, RealToComplex};

use crate::diagnostics::ErrorCode;
use crate::ring_buffer::{PlanarRingBuffer, RingBuffer};
use crate::types::StereoSample;

use super::ola::{clean_input, hann_window, FractionalResampler, OverlapAccumulator};
use super::{finish_output, RatioControl, TimePitchProcessor, MAX_FRAMES_PER_CALL};

const FFT_SIZE: usize = 2048;
/// Synthesis hop (75% overlap)
const HOP: usize = FFT_SIZE / 4;
const BINS: usize = FFT_SIZE / 2 + 1;

/// Rising spectral energy, relative to the previous frame, that counts as an onset
const TRANSIENT_FLUX: f32 = 1.0;
/// Frames quieter than this (summed magnitude) never count as onsets
const TRANSIENT_FLOOR: f32 = 1e-2;

/// Wrap a phase into (-pi, pi]
#[inline]
fn wrap_phase(phase: f64) -> f64 {
    phase - TAU * (phase / TAU).round()
}

/// Per-channel analysis/synthesis history
#[derive(Default)]
struct ChannelState {
    prev_phase: Vec<f64>,
    prev_magnitude: Vec<f32>,
    prev_total: f32,
    synth_phase: Vec<f64>,
}

impl ChannelState {
    fn prepare(&mut self) {
        self.prev_phase = vec![0.0; BINS];
        self.prev_magnitude = vec![0.0; BINS];
        self.synth_phase = vec![0.0; BINS];
        self.prev_total = 0.0;
    }

    fn clear(&mut self) {
        self.prev_phase.fill(0.0);
        self.prev_magnitude.fill(0.0);
        self.synth_phase.fill(0.0);
        self.prev_total = 0.0;
    }
}

pub struct PhaseVocoderProcessor {
    ratios: RatioControl,
    channels: usize,
    window: Vec<f32>,
    forward: Option<Arc<dyn RealToComplex<f32>>>,
    inverse: Option<Arc<dyn ComplexToReal<f32>>>,

    input: PlanarRingBuffer,
    /// Analysis position relative to the read position of `input`
    position: f64,
    /// Frames discarded from `input` so far
    consumed: u64,
    /// Absolute start of the previous analysis frame
    last_start: Option<u64>,
    state: [ChannelState; 2],

    time_frame: Vec<f32>,
    spectrum: Vec<Complex32>,
    forward_scratch: Vec<Complex32>,
    inverse_scratch: Vec<Complex32>,
    magnitude: Vec<f32>,
    phase: Vec<f64>,
    staged: Vec<StereoSample>,

    accumulator: OverlapAccumulator,
    pitch_stage: FractionalResampler,
    output: RingBuffer<StereoSample>,
    flushing: bool,
}

impl PhaseVocoderProcessor {
    pub fn new(ratios: RatioControl) -> Self {
        Self {
            ratios,
            channels: 2,
            window: Vec::new(),
            forward: None,
            inverse: None,
            input: PlanarRingBuffer::new(),
            position: 0.0,
            consumed: 0,
            last_start: None,
            state: [ChannelState::default(), ChannelState::default()],
            time_frame: Vec::new(),
            spectrum: Vec::new(),
            forward_scratch: Vec::new(),
            inverse_scratch: Vec::new(),
            magnitude: Vec::new(),
            phase: Vec::new(),
            staged: Vec::new(),
            accumulator: OverlapAccumulator::default(),
            pitch_stage: FractionalResampler::default(),
            output: RingBuffer::new(),
            flushing: false,
        }
    }

    /// Analyse one channel frame starting at `start` and write the
    /// resynthesised, synthesis-windowed frame into `staged`
    fn process_channel(&mut self, channel: usize, start: usize, advance: Option<u64>) -> Result<(), FftError> {
        let (Some(forward), Some(inverse)) = (self.forward.as_ref(), self.inverse.as_ref()) else {
            return Ok(());
        };
        let Some(plane) = self.input.plane(channel) else {
            return Ok(());
        };

        for (i, sample) in self.time_frame.iter_mut().enumerate() {
            *sample = plane.peek_or_default(start + i) * self.window[i];
        }
        forward.process_with_scratch(&mut self.time_frame, &mut self.spectrum, &mut self.forward_scratch)?;

        let state = &mut self.state[channel];

        // Analysis: magnitude, phase and spectral flux
        let mut flux = 0.0f32;
        let mut total = 0.0f32;
        for k in 0..BINS {
            let bin = self.spectrum[k];
            let magnitude = bin.norm();
            flux += (magnitude - state.prev_magnitude[k]).max(0.0);
            total += magnitude;
            self.magnitude[k] = magnitude;
            self.phase[k] = bin.arg() as f64;
        }
        let onset = total > TRANSIENT_FLOOR && flux > TRANSIENT_FLUX * (state.prev_total + TRANSIENT_FLOOR);
        let reset = advance.is_none() || onset;

        // Unwrapped phase difference gives each bin's instantaneous frequency
        // (radians per sample); the synthesis phase advances by it over one
        // synthesis hop
        for k in 0..BINS {
            let omega = TAU * k as f64 / FFT_SIZE as f64;
            let frequency = match advance {
                Some(h) if h > 0 => {
                    let h = h as f64;
                    let delta = wrap_phase(self.phase[k] - state.prev_phase[k] - omega * h);
                    omega + delta / h
                }
                _ => omega,
            };
            state.synth_phase[k] = if reset {
                self.phase[k]
            } else {
                wrap_phase(state.synth_phase[k] + frequency * HOP as f64)
            };
            state.prev_phase[k] = self.phase[k];
            state.prev_magnitude[k] = self.magnitude[k];
            self.spectrum[k] = Complex32::from_polar(self.magnitude[k], state.synth_phase[k] as f32);
        }
        state.prev_total = total;

        // DC and Nyquist must be real for the inverse real FFT
        self.spectrum[0].im = 0.0;
        self.spectrum[BINS - 1].im = 0.0;

        inverse.process_with_scratch(&mut self.spectrum, &mut self.time_frame, &mut self.inverse_scratch)?;

        let scale = 1.0 / FFT_SIZE as f32;
        for (i, staged) in self.staged.iter_mut().enumerate() {
            let value = self.time_frame[i] * scale * self.window[i];
            if channel == 0 {
                staged.left = value;
            } else {
                staged.right = value;
            }
        }
        Ok(())
    }

    fn step(&mut self) -> bool {
        if self.forward.is_none() {
            return false;
        }
        let start = self.position.round().max(0.0) as usize;
        if self.input.len() < start + FFT_SIZE {
            return false;
        }

        let absolute = self.consumed + start as u64;
        let advance = self.last_start.map(|previous| absolute.saturating_sub(previous));

        let analysed = self.channels.clamp(1, 2);
        for channel in 0..analysed {
            if self.process_channel(channel, start, advance).is_err() {
                self.ratios.diagnostics().record(ErrorCode::FftFailure);
                self.staged.fill(StereoSample::silence());
                break;
            }
        }
        if analysed == 1 {
            for frame in &mut self.staged {
                frame.right = frame.left;
            }
        }

        for (i, &frame) in self.staged.iter().enumerate() {
            let w = self.window[i];
            self.accumulator.add(i, frame, w * w);
        }
        let pitch_stage = &mut self.pitch_stage;
        self.accumulator.emit(HOP, |s| pitch_stage.push(s));
        let pitch = self.ratios.pitch();
        while let Some(frame) = self.pitch_stage.next(pitch) {
            self.output.push(frame);
        }

        self.last_start = Some(absolute);
        self.position += HOP as f64 / (self.ratios.time() * pitch);
        let whole = self.position.floor() as usize;
        let dropped = self.input.discard(whole);
        self.consumed += dropped as u64;
        self.position -= dropped as f64;
        true
    }

    fn render(&mut self, output: &mut [StereoSample]) -> usize {
        let mut frames = 0;
        while self.output.len() < output.len() && frames < MAX_FRAMES_PER_CALL && self.step() {
            frames += 1;
        }
        let produced = self.output.pop_into(output);
        finish_output(output, produced, self.ratios.diagnostics())
    }
}

impl TimePitchProcessor for PhaseVocoderProcessor {
    fn name(&self) -> &'static str {
        "phase_vocoder"
    }

    fn prepare(&mut self, _sample_rate: f64, channels: usize, max_block: usize) {
        let max_block = max_block.max(1);
        self.channels = channels.clamp(1, 2);

        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(FFT_SIZE);
        let inverse = planner.plan_fft_inverse(FFT_SIZE);
        self.time_frame = forward.make_input_vec();
        self.spectrum = forward.make_output_vec();
        self.forward_scratch = forward.make_scratch_vec();
        self.inverse_scratch = inverse.make_scratch_vec();
        self.forward = Some(forward);
        self.inverse = Some(inverse);

        self.window = hann_window(FFT_SIZE);
        self.magnitude = vec![0.0; BINS];
        self.phase = vec![0.0; BINS];
        self.staged = vec![StereoSample::silence(); FFT_SIZE];
        for state in &mut self.state {
            state.prepare();
        }

        let time_min = self.ratios.time_bounds().min;
        let pitch_min = self.ratios.pitch_bounds().min;
        let max_input_per_block = (max_block as f64 / time_min).ceil() as usize;
        self.input.prepare(2, 4 * FFT_SIZE + 4 * max_input_per_block);
        self.accumulator.prepare(FFT_SIZE);
        self.pitch_stage.prepare(2 * HOP + 4);
        let max_burst = (HOP as f64 / pitch_min).ceil() as usize;
        self.output.prepare(4 * max_block + 2 * max_burst);

        self.reset();
        log::debug!(
            "Phase vocoder prepared: fft {}, hop {}, {} channel(s)",
            FFT_SIZE,
            HOP,
            self.channels
        );
    }

    fn reset(&mut self) {
        self.input.clear();
        self.position = 0.0;
        self.consumed = 0;
        self.last_start = None;
        for state in &mut self.state {
            state.clear();
        }
        self.accumulator.clear();
        self.pitch_stage.clear();
        self.output.clear();
        self.flushing = false;
    }

    fn set_pitch_semitones(&mut self, semitones: f32) -> Result<(), crate::diagnostics::ParamError> {
        self.ratios.set_pitch_semitones(semitones)
    }

    fn set_time_ratio(&mut self, ratio: f64) -> Result<(), crate::diagnostics::ParamError> {
        self.ratios.set_time_ratio(ratio)
    }

    fn pitch_ratio(&self) -> f64 {
        self.ratios.pitch()
    }

    fn time_ratio(&self) -> f64 {
        self.ratios.time()
    }

    fn process(&mut self, input: &[StereoSample], output: &mut [StereoSample]) -> usize {
        if !input.is_empty() {
            self.flushing = false;
        }
        for &frame in input {
            let frame = clean_input(frame);
            if self.input.push_frame(&[frame.left, frame.right]) {
                self.consumed += 1;
            }
        }
        self.render(output)
    }

    fn flush(&mut self, output: &mut [StereoSample]) -> usize {
        if !self.flushing {
            self.flushing = true;
            for _ in 0..FFT_SIZE {
                if self.input.push_frame(&[0.0, 0.0]) {
                    self.consumed += 1;
                }
            }
        }
        self.render(output)
    }

    fn input_latency(&self) -> usize {
        FFT_SIZE
    }

    fn output_latency(&self) -> usize {
        0
    }

    fn input_fill(&self) -> usize {
        self.input.len()
    }

    fn output_fill(&self) -> usize {
        self.output.len() + self.pitch_stage.buffered()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::super::StretchBackend;
    use super::*;

    #[test]
    fn test_wrap_phase() {
        assert!((wrap_phase(3.0 * std::f64::consts::PI) - std::f64::consts::PI).abs() < 1e-9);
        assert!((wrap_phase(-0.5) + 0.5).abs() < 1e-12);
        assert!(wrap_phase(100.0).abs() <= std::f64::consts::PI);
    }

    #[test]
    fn test_unity_ratios_pass_audio_through() {
        let (mut p, _) = processor(StretchBackend::PhaseVocoder);
        let input = sine(523.25, 0.5, 32768);
        let out = run(p.as_mut(), &input, 512, 512);

        assert!(out.len() >= input.len() - FFT_SIZE);
        for i in FFT_SIZE..input.len() - FFT_SIZE {
            assert!(
                (out[i].left - input[i].left).abs() < 1e-3,
                "sample {} differs: {} vs {}",
                i,
                out[i].left,
                input[i].left
            );
        }
    }

    #[test]
    fn test_pitch_octave_up() {
        let (mut p, _) = processor(StretchBackend::PhaseVocoder);
        p.set_pitch_semitones(12.0).unwrap();

        let input = sine(440.0, 0.5, 44100);
        let out = run(p.as_mut(), &input, 512, 512);

        let ratio = out.len() as f64 / input.len() as f64;
        assert!((ratio - 1.0).abs() < 0.06, "duration ratio {}", ratio);
        let freq = zero_crossing_freq(&out[8192..out.len() - 8192]);
        assert!((freq - 880.0).abs() < 30.0, "frequency {}", freq);
    }

    #[test]
    fn test_time_stretch_keeps_frequency() {
        let (mut p, _) = processor(StretchBackend::PhaseVocoder);
        p.set_time_ratio(1.5).unwrap();

        let input = sine(660.0, 0.5, 44100);
        let out = run(p.as_mut(), &input, 512, 512);

        let ratio = out.len() as f64 / input.len() as f64;
        assert!((ratio - 1.5).abs() < 0.08, "duration ratio {}", ratio);
        let freq = zero_crossing_freq(&out[8192..out.len() - 8192]);
        assert!((freq - 660.0).abs() < 25.0, "frequency {}", freq);
    }

    #[test]
    fn test_mono_prepare_mirrors_left() {
        let diagnostics = Arc::new(crate::diagnostics::Diagnostics::new());
        let mut p = super::super::create_processor(
            StretchBackend::PhaseVocoder,
            diagnostics,
            Default::default(),
            Default::default(),
        );
        p.prepare(44100.0, 1, 256);
        let input: Vec<StereoSample> = sine(440.0, 0.5, 8192)
            .into_iter()
            .map(|s| StereoSample::new(s.left, 0.0))
            .collect();
        let out = run(p.as_mut(), &input, 256, 256);
        assert!(out.iter().all(|s| s.left == s.right));
    }
}
