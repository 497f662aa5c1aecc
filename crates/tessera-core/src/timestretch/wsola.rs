//! WSOLA (waveform-similarity overlap-add) time stretcher
//!
//! Frames of `FRAME` samples are windowed and overlap-added at a fixed
//! synthesis hop. The analysis position advances by `SYNTH_HOP / stretch`;
//! around each nominal position a bounded window of candidate offsets is
//! scored by normalised cross-correlation against the tail that is already
//! in the overlap accumulator, and the best-matching frame is spliced in.
//!
//! Pitch is handled by stretching by `time * pitch` and then resampling the
//! result at a step of `pitch`, which restores the requested duration and
//! moves every frequency by the pitch ratio.

use crate::ring_buffer::RingBuffer;
use crate::types::StereoSample;

use super::ola::{clean_input, hann_window, FractionalResampler, OverlapAccumulator};
use super::{finish_output, RatioControl, TimePitchProcessor, MAX_FRAMES_PER_CALL};

/// Analysis/synthesis frame length
const FRAME: usize = 512;
/// Fixed synthesis hop (50% overlap)
const SYNTH_HOP: usize = FRAME / 2;
/// Length of the region that is compared when splicing
const OVERLAP: usize = FRAME - SYNTH_HOP;
/// Candidate offsets searched on either side of the nominal position
const SEARCH: usize = FRAME / 8;

pub struct WsolaProcessor {
    ratios: RatioControl,
    window: Vec<f32>,
    input: RingBuffer<StereoSample>,
    /// Nominal analysis position, relative to the read position of `input`
    position: f64,
    accumulator: OverlapAccumulator,
    pitch_stage: FractionalResampler,
    output: RingBuffer<StereoSample>,
    /// Mono copy of the splice target (normalised accumulator tail)
    target: Vec<f32>,
    /// Mono copy of the candidate region
    candidates: Vec<f32>,
    first_frame: bool,
    flushing: bool,
}

impl WsolaProcessor {
    pub fn new(ratios: RatioControl) -> Self {
        Self {
            ratios,
            window: Vec::new(),
            input: RingBuffer::new(),
            position: 0.0,
            accumulator: OverlapAccumulator::default(),
            pitch_stage: FractionalResampler::default(),
            output: RingBuffer::new(),
            target: Vec::new(),
            candidates: Vec::new(),
            first_frame: true,
            flushing: false,
        }
    }

    #[inline]
    fn stretch(&self) -> f64 {
        self.ratios.time() * self.ratios.pitch()
    }

    /// Pick the candidate start in `lo..=hi` whose first `OVERLAP` samples
    /// best continue the accumulator tail
    fn best_offset(&mut self, lo: usize, hi: usize) -> usize {
        for (i, t) in self.target.iter_mut().enumerate() {
            *t = self.accumulator.normalized(i).mono_sum();
        }
        let span = hi - lo + OVERLAP;
        for (i, c) in self.candidates.iter_mut().take(span).enumerate() {
            *c = self.input.peek_or_default(lo + i).mono_sum();
        }

        let target_energy: f32 = self.target.iter().map(|t| t * t).sum();
        if target_energy < 1e-9 {
            // Nothing to match against (silence), take the nominal frame
            return (lo + hi) / 2;
        }

        let mut energy: f32 = self.candidates[..OVERLAP].iter().map(|c| c * c).sum();
        let mut best = (lo + hi) / 2;
        let mut best_score = f32::NEG_INFINITY;

        for offset in 0..=(hi - lo) {
            if offset > 0 {
                let gone = self.candidates[offset - 1];
                let added = self.candidates[offset + OVERLAP - 1];
                energy = (energy - gone * gone + added * added).max(0.0);
            }
            let dot: f32 = self.target
                .iter()
                .zip(&self.candidates[offset..offset + OVERLAP])
                .map(|(t, c)| t * c)
                .sum();
            let score = dot / (energy * target_energy + 1e-12).sqrt();
            if score > best_score {
                best_score = score;
                best = lo + offset;
            }
        }
        best
    }

    /// Splice one frame into the accumulator and move one hop on.
    /// Returns false when there is not enough input.
    fn step(&mut self) -> bool {
        let stretch = self.stretch();
        let unity = (stretch - 1.0).abs() < 1e-9;
        let nominal = self.position.round().max(0.0) as usize;
        let available = self.input.len();

        let mut search = if unity || self.first_frame { 0 } else { SEARCH };
        if available < nominal + search + FRAME {
            // Draining: splice un-searched rather than dropping the tail
            if self.flushing && available >= nominal + FRAME {
                search = 0;
            } else {
                return false;
            }
        }

        let lo = nominal.saturating_sub(search);
        let hi = nominal + search;
        let start = if search > 0 { self.best_offset(lo, hi) } else { nominal };

        for i in 0..FRAME {
            let w = self.window[i];
            let frame = self.input.peek_or_default(start + i);
            self.accumulator.add(i, frame * w, w);
        }

        let pitch_stage = &mut self.pitch_stage;
        self.accumulator.emit(SYNTH_HOP, |s| pitch_stage.push(s));
        let pitch = self.ratios.pitch();
        while let Some(frame) = self.pitch_stage.next(pitch) {
            self.output.push(frame);
        }

        self.first_frame = false;
        self.position += SYNTH_HOP as f64 / stretch;

        // Keep SEARCH frames of history behind the next nominal position
        let keep_from = (self.position.floor() as usize).saturating_sub(SEARCH);
        let dropped = self.input.discard(keep_from);
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

    /// Append one input frame, keeping `position` on the same source frame
    /// when the ring overwrites its oldest entry
    #[inline]
    fn push_input(&mut self, frame: StereoSample) {
        if self.input.push(frame) {
            self.position = (self.position - 1.0).max(0.0);
        }
    }

    fn prime(&mut self) {
        self.input.clear();
        // SEARCH frames of silent history so the first search window fits
        for _ in 0..SEARCH {
            self.input.push(StereoSample::silence());
        }
        self.position = SEARCH as f64;
        self.first_frame = true;
        self.flushing = false;
    }
}

impl TimePitchProcessor for WsolaProcessor {
    fn name(&self) -> &'static str {
        "wsola"
    }

    fn prepare(&mut self, _sample_rate: f64, _channels: usize, max_block: usize) {
        let max_block = max_block.max(1);
        let min_pitch = self.ratios.pitch_bounds().min;
        let min_time = self.ratios.time_bounds().min;

        self.window = hann_window(FRAME);
        self.accumulator.prepare(FRAME);
        self.pitch_stage.prepare(SYNTH_HOP * 2 + 4);
        self.target = vec![0.0; OVERLAP];
        self.candidates = vec![0.0; OVERLAP + 2 * SEARCH + 1];

        let max_input_per_block = (max_block as f64 / min_time).ceil() as usize;
        self.input.prepare(8 * FRAME + 4 * max_input_per_block);
        let max_burst = (SYNTH_HOP as f64 / min_pitch).ceil() as usize;
        self.output.prepare(4 * max_block + 2 * max_burst);

        self.reset();
        log::debug!(
            "WSOLA prepared: frame {}, hop {}, search ±{}, max block {}",
            FRAME,
            SYNTH_HOP,
            SEARCH,
            max_block
        );
    }

    fn reset(&mut self) {
        self.accumulator.clear();
        self.pitch_stage.clear();
        self.output.clear();
        self.prime();
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
            self.push_input(clean_input(frame));
        }
        self.render(output)
    }

    fn flush(&mut self, output: &mut [StereoSample]) -> usize {
        if !self.flushing {
            self.flushing = true;
            for _ in 0..FRAME {
                self.push_input(StereoSample::silence());
            }
        }
        self.render(output)
    }

    fn input_latency(&self) -> usize {
        FRAME + SEARCH
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
    fn test_unity_ratios_pass_audio_through() {
        let (mut p, _) = processor(StretchBackend::Wsola);
        let input = sine(440.0, 0.5, 16384);
        let out = run(p.as_mut(), &input, 333, 512);

        assert!(out.len() >= input.len() - FRAME);
        for i in FRAME..input.len() - FRAME {
            assert!(
                (out[i].left - input[i].left).abs() < 1e-4,
                "sample {} differs: {} vs {}",
                i,
                out[i].left,
                input[i].left
            );
        }
    }

    #[test]
    fn test_input_overflow_keeps_analysis_position() {
        use crate::config::RatioBounds;
        use crate::diagnostics::Diagnostics;
        use std::sync::Arc;

        let ratios = RatioControl::new(Arc::new(Diagnostics::new()), RatioBounds::default(), RatioBounds::default());
        let mut p = WsolaProcessor::new(ratios);
        p.prepare(44100.0, 2, 512);

        // Fill the ring exactly without pulling output, so no frame is analysed
        let free = p.input.space();
        let ramp: Vec<_> = (0..free + 10)
            .map(|i| StereoSample::mono(0.01 + i as f32 * 1e-5))
            .collect();
        assert_eq!(p.process(&ramp[..free], &mut []), 0);
        assert_eq!(p.input.peek(p.position as usize), Some(ramp[0]));

        // Ten more frames overwrite the oldest history
        p.process(&ramp[free..], &mut []);
        assert_eq!(p.position, (SEARCH - 10) as f64);
        assert_eq!(p.input.peek(p.position as usize), Some(ramp[0]));
    }

    #[test]
    fn test_double_duration_keeps_frequency() {
        let (mut p, _) = processor(StretchBackend::Wsola);
        p.set_time_ratio(2.0).unwrap();

        let input = sine(1000.0, 0.5, 88200);
        let out = run(p.as_mut(), &input, 512, 512);

        let ratio = out.len() as f64 / input.len() as f64;
        assert!((ratio - 2.0).abs() < 0.05, "duration ratio {}", ratio);

        // Skip priming and the flushed tail
        let steady = &out[4096..out.len() - 4096];
        let freq = zero_crossing_freq(steady);
        assert!((freq - 1000.0).abs() < 30.0, "frequency moved to {}", freq);
    }

    #[test]
    fn test_pitch_up_an_octave_keeps_duration() {
        let (mut p, _) = processor(StretchBackend::Wsola);
        p.set_pitch_semitones(12.0).unwrap();

        let input = sine(300.0, 0.5, 44100);
        let out = run(p.as_mut(), &input, 256, 256);

        let ratio = out.len() as f64 / input.len() as f64;
        assert!((ratio - 1.0).abs() < 0.05, "duration ratio {}", ratio);
        let freq = zero_crossing_freq(&out[4096..out.len() - 4096]);
        assert!((freq - 600.0).abs() < 25.0, "frequency {}", freq);
    }

    #[test]
    fn test_priming_returns_fewer_frames() {
        let (mut p, _) = processor(StretchBackend::Wsola);
        let input = sine(440.0, 0.5, 128);
        let mut out = vec![StereoSample::silence(); 128];
        assert_eq!(p.process(&input, &mut out), 0);
        assert_eq!(p.input_fill(), SEARCH + 128);
    }
}
