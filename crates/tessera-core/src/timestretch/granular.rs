//! Granular time-warp
//!
//! Grains of `GRAIN` samples are laid down at a constant synthesis hop. The
//! content of each grain is read around its analysis centre with linear
//! interpolation at a step of `pitch`, so the pitch moves while grain
//! placement, and with it the duration, follows the input. The analysis
//! centre advances by `HOP / time_ratio` per grain, which gives independent
//! time scaling on top.

use crate::ring_buffer::RingBuffer;
use crate::types::StereoSample;

use super::ola::{clean_input, hann_window, OverlapAccumulator};
use super::{finish_output, RatioControl, TimePitchProcessor, MAX_FRAMES_PER_CALL};

const GRAIN: usize = 1024;
/// 75% overlap
const HOP: usize = GRAIN / 4;
const HALF: f64 = (GRAIN / 2) as f64;

pub struct GranularProcessor {
    ratios: RatioControl,
    window: Vec<f32>,
    input: RingBuffer<StereoSample>,
    /// Absolute input index of the oldest buffered frame
    input_start: u64,
    /// Absolute input position of the next grain centre
    centre: f64,
    accumulator: OverlapAccumulator,
    output: RingBuffer<StereoSample>,
    flushing: bool,
}

impl GranularProcessor {
    pub fn new(ratios: RatioControl) -> Self {
        Self {
            ratios,
            window: Vec::new(),
            input: RingBuffer::new(),
            input_start: 0,
            centre: HALF,
            accumulator: OverlapAccumulator::default(),
            output: RingBuffer::new(),
            flushing: false,
        }
    }

    /// Linear read at an absolute fractional position; anything before the
    /// buffered history (including before the stream start) is silence
    #[inline]
    fn read(&self, position: f64) -> StereoSample {
        let relative = position - self.input_start as f64;
        if relative < 0.0 {
            return StereoSample::silence();
        }
        let index = relative.floor();
        let t = (relative - index) as f32;
        let index = index as usize;
        let a = self.input.peek_or_default(index);
        if t == 0.0 {
            return a;
        }
        let b = self.input.peek_or_default(index + 1);
        a + (b - a) * t
    }

    fn step(&mut self) -> bool {
        let pitch = self.ratios.pitch();
        let reach = HALF * pitch;
        let buffered_end = self.input_start + self.input.len() as u64;
        if ((self.centre + reach).ceil() as u64 + 1) > buffered_end {
            return false;
        }

        for j in 0..GRAIN {
            let w = self.window[j];
            let position = self.centre + (j as f64 - HALF) * pitch;
            let frame = self.read(position);
            self.accumulator.add(j, frame * w, w);
        }
        let output = &mut self.output;
        self.accumulator.emit(HOP, |s| {
            output.push(s);
        });

        self.centre += HOP as f64 / self.ratios.time();

        // Drop history no future grain can reach, even at the highest pitch
        let max_reach = HALF * self.ratios.pitch_bounds().max;
        let lowest = (self.centre - max_reach - 1.0).floor();
        if lowest > self.input_start as f64 {
            let dropped = self.input.discard((lowest as u64 - self.input_start) as usize);
            self.input_start += dropped as u64;
        }
        true
    }

    fn render(&mut self, output: &mut [StereoSample]) -> usize {
        let mut grains = 0;
        while self.output.len() < output.len() && grains < MAX_FRAMES_PER_CALL && self.step() {
            grains += 1;
        }
        let produced = self.output.pop_into(output);
        finish_output(output, produced, self.ratios.diagnostics())
    }
}

impl TimePitchProcessor for GranularProcessor {
    fn name(&self) -> &'static str {
        "granular"
    }

    fn prepare(&mut self, _sample_rate: f64, _channels: usize, max_block: usize) {
        let max_block = max_block.max(1);
        let pitch_max = self.ratios.pitch_bounds().max;
        let time_min = self.ratios.time_bounds().min;

        self.window = hann_window(GRAIN);
        self.accumulator.prepare(GRAIN);

        let history = (GRAIN as f64 * pitch_max).ceil() as usize;
        let max_input_per_block = (max_block as f64 / time_min).ceil() as usize;
        self.input.prepare(history + 4 * GRAIN + 4 * max_input_per_block);
        self.output.prepare(4 * max_block + 2 * HOP);

        self.reset();
        log::debug!("Granular prepared: grain {}, hop {}, max block {}", GRAIN, HOP, max_block);
    }

    fn reset(&mut self) {
        self.input.clear();
        self.input_start = 0;
        self.centre = HALF;
        self.accumulator.clear();
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
            if self.input.push(clean_input(frame)) {
                // Overwrote the oldest frame
                self.input_start += 1;
            }
        }
        self.render(output)
    }

    fn flush(&mut self, output: &mut [StereoSample]) -> usize {
        if !self.flushing {
            self.flushing = true;
            let reach = (HALF * self.ratios.pitch()).ceil() as usize;
            for _ in 0..GRAIN.max(reach + 2) {
                if self.input.push(StereoSample::silence()) {
                    self.input_start += 1;
                }
            }
        }
        self.render(output)
    }

    fn input_latency(&self) -> usize {
        (HALF + HALF * self.ratios.pitch()).ceil() as usize + 1
    }

    fn output_latency(&self) -> usize {
        0
    }

    fn input_fill(&self) -> usize {
        self.input.len()
    }

    fn output_fill(&self) -> usize {
        self.output.len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::super::StretchBackend;
    use super::*;

    #[test]
    fn test_unity_ratios_pass_audio_through() {
        let (mut p, _) = processor(StretchBackend::Granular);
        let input = sine(330.0, 0.7, 16384);
        let out = run(p.as_mut(), &input, 200, 512);

        assert!(out.len() >= input.len() - GRAIN);
        for i in GRAIN..input.len() - GRAIN {
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
    fn test_pitch_shift_keeps_duration() {
        let (mut p, _) = processor(StretchBackend::Granular);
        p.set_pitch_semitones(-12.0).unwrap();

        let input = sine(800.0, 0.5, 44100);
        let out = run(p.as_mut(), &input, 512, 512);

        let ratio = out.len() as f64 / input.len() as f64;
        assert!((ratio - 1.0).abs() < 0.05, "duration ratio {}", ratio);
        let freq = zero_crossing_freq(&out[4096..out.len() - 4096]);
        assert!((freq - 400.0).abs() < 20.0, "frequency {}", freq);
    }

    #[test]
    fn test_time_ratio_scales_duration() {
        let (mut p, _) = processor(StretchBackend::Granular);
        p.set_time_ratio(0.5).unwrap();

        let input = sine(500.0, 0.5, 44100);
        let out = run(p.as_mut(), &input, 512, 512);

        let ratio = out.len() as f64 / input.len() as f64;
        assert!((ratio - 0.5).abs() < 0.05, "duration ratio {}", ratio);
    }

    #[test]
    fn test_reads_before_start_are_silent() {
        let (mut p, _) = processor(StretchBackend::Granular);
        p.set_pitch_semitones(12.0).unwrap();
        let input = vec![StereoSample::mono(0.5); 4096];
        let mut out = vec![StereoSample::silence(); 1024];
        let n = p.process(&input, &mut out);
        assert_eq!(n, 1024);
        // At an octave up the first grain starts reading 512 frames before the stream
        assert_eq!(out[0], StereoSample::silence());
        assert!((out[700].left - 0.5).abs() < 1e-4, "steady level {}", out[700].left);
    }
}
