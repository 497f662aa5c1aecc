//! Time/pitch processing via signalsmith-stretch
//!
//! The stretcher works on chunks whose size follows from the sample rate
//! (`CHUNK_SECONDS`), while the host calls us with whatever block size it
//! likes. Two ring buffers decouple the two: input is accumulated until a
//! whole chunk is available, each chunk is stretched into
//! `chunk * time_ratio` output frames (the fractional part is carried to the
//! next chunk), and the output ring is popped for exactly the requested
//! frame count, or fewer while priming.
//!
//! Buffers are `StereoSample` slices; thanks to `#[repr(C)]` they are handed
//! to the library as interleaved `f32` without per-frame copying.
//!
//! At unity pitch and time the library output is replaced by the input
//! delayed by the library latency, so unprocessed material comes back
//! sample for sample. The library keeps running on every chunk and the two
//! paths are crossfaded over one chunk whenever the ratios cross unity.

use signalsmith_stretch::Stretch;

use crate::ring_buffer::RingBuffer;
use crate::types::{ratio_to_semitones, StereoSample};

use super::ola::clean_input;
use super::{finish_output, RatioControl, TimePitchProcessor};

/// Number of channels handed to the library (always stereo)
const CHANNELS: u32 = 2;

/// Processing chunk length in seconds
const CHUNK_SECONDS: f64 = 0.03;

/// Chunks processed per call at most
const MAX_CHUNKS_PER_CALL: usize = 8;

pub struct StretcherProcessor {
    ratios: RatioControl,
    /// Created in `prepare`, which is where the library allocates
    stretcher: Option<Stretch>,
    chunk: usize,
    input: RingBuffer<StereoSample>,
    output: RingBuffer<StereoSample>,
    chunk_in: Vec<StereoSample>,
    chunk_out: Vec<StereoSample>,
    /// Input delayed by the library latency
    dry_delay: RingBuffer<StereoSample>,
    chunk_dry: Vec<StereoSample>,
    library_latency: usize,
    /// The previous chunk was emitted from the dry path
    bypassed: bool,
    /// Fractional output frames owed from previous chunks
    carry: f64,
    flushing: bool,
}

impl StretcherProcessor {
    pub fn new(ratios: RatioControl) -> Self {
        Self {
            ratios,
            stretcher: None,
            chunk: 0,
            input: RingBuffer::new(),
            output: RingBuffer::new(),
            chunk_in: Vec::new(),
            chunk_out: Vec::new(),
            dry_delay: RingBuffer::new(),
            chunk_dry: Vec::new(),
            library_latency: 0,
            bypassed: false,
            carry: 0.0,
            flushing: false,
        }
    }

    fn apply_transpose(&mut self) {
        let semitones = ratio_to_semitones(self.ratios.pitch()) as f32;
        if let Some(stretcher) = self.stretcher.as_mut() {
            // No tonality limit
            stretcher.set_transpose_factor_semitones(semitones, None);
        }
    }

    fn is_unity(&self) -> bool {
        (self.ratios.pitch() - 1.0).abs() < 1e-9 && (self.ratios.time() - 1.0).abs() < 1e-9
    }

    /// Stretch one chunk from `chunk_in[..chunk]` into the output ring
    fn process_chunk(&mut self) {
        let Some(stretcher) = self.stretcher.as_mut() else {
            return;
        };

        let exact = self.chunk as f64 * self.ratios.time() + self.carry;
        let out_len = (exact.floor() as usize).min(self.chunk_out.len());
        self.carry = exact - out_len as f64;

        let chunk_out = &mut self.chunk_out[..out_len];
        chunk_out.fill(StereoSample::silence());

        let input = bytemuck::cast_slice::<StereoSample, f32>(&self.chunk_in[..self.chunk]);
        let output = bytemuck::cast_slice_mut::<StereoSample, f32>(chunk_out);
        stretcher.process(input, output);

        let chunk = self.chunk;
        self.dry_delay.push_slice(&self.chunk_in[..chunk]);
        self.dry_delay.pop_into(&mut self.chunk_dry[..chunk]);

        let unity = self.is_unity();
        let crossfade = unity != self.bypassed;
        self.bypassed = unity;
        for i in 0..out_len {
            let wet = self.chunk_out[i];
            let dry = self.chunk_dry[i.min(chunk - 1)];
            let frame = match (unity, crossfade) {
                (true, false) => dry,
                (false, false) => wet,
                (to_dry, true) => {
                    let t = (i + 1) as f32 / out_len as f32;
                    let mix = if to_dry { t } else { 1.0 - t };
                    wet * (1.0 - mix) + dry * mix
                }
            };
            self.output.push(frame);
        }
    }

    fn render(&mut self, output: &mut [StereoSample]) -> usize {
        let mut chunks = 0;
        while self.output.len() < output.len()
            && self.input.len() >= self.chunk
            && self.chunk > 0
            && chunks < MAX_CHUNKS_PER_CALL
        {
            let chunk = self.chunk;
            self.input.pop_into(&mut self.chunk_in[..chunk]);
            self.process_chunk();
            chunks += 1;
        }
        let produced = self.output.pop_into(output);
        finish_output(output, produced, self.ratios.diagnostics())
    }
}

impl TimePitchProcessor for StretcherProcessor {
    fn name(&self) -> &'static str {
        "stretcher"
    }

    fn prepare(&mut self, sample_rate: f64, _channels: usize, max_block: usize) {
        let max_block = max_block.max(1);
        let rate = sample_rate.round().max(1.0) as u32;
        let stretcher = Stretch::preset_default(CHANNELS, rate);
        let latency = stretcher.input_latency() + stretcher.output_latency();
        self.stretcher = Some(stretcher);
        self.library_latency = latency;

        self.chunk = ((sample_rate * CHUNK_SECONDS).round() as usize).max(16);
        let time_max = self.ratios.time_bounds().max;
        let time_min = self.ratios.time_bounds().min;
        let max_chunk_out = (self.chunk as f64 * time_max).ceil() as usize + 1;

        self.chunk_in = vec![StereoSample::silence(); self.chunk];
        self.chunk_out = vec![StereoSample::silence(); max_chunk_out.max(latency)];
        self.chunk_dry = vec![StereoSample::silence(); self.chunk];
        self.dry_delay.prepare(latency + self.chunk);

        let max_input_per_block = (max_block as f64 / time_min).ceil() as usize;
        self.input.prepare(4 * self.chunk + 4 * max_input_per_block);
        self.output.prepare(4 * max_block + 2 * max_chunk_out + latency);

        self.reset();
        self.apply_transpose();
        log::debug!(
            "Stretcher prepared: {} Hz, chunk {} frames, library latency {}",
            rate,
            self.chunk,
            latency
        );
    }

    fn reset(&mut self) {
        if let Some(stretcher) = self.stretcher.as_mut() {
            stretcher.reset();
        }
        self.input.clear();
        self.output.clear();
        self.dry_delay.clear();
        for _ in 0..self.library_latency {
            self.dry_delay.push(StereoSample::silence());
        }
        self.bypassed = self.is_unity();
        self.carry = 0.0;
        self.flushing = false;
    }

    fn set_pitch_semitones(&mut self, semitones: f32) -> Result<(), crate::diagnostics::ParamError> {
        let result = self.ratios.set_pitch_semitones(semitones);
        self.apply_transpose();
        result
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
            self.input.push(clean_input(frame));
        }
        self.render(output)
    }

    fn flush(&mut self, output: &mut [StereoSample]) -> usize {
        if !self.flushing && self.stretcher.is_some() {
            self.flushing = true;

            // Pad the partial chunk, then let the library drain its latency
            if !self.input.is_empty() {
                while self.input.len() % self.chunk != 0 {
                    self.input.push(StereoSample::silence());
                }
                let max_chunk_out = (self.chunk as f64 * self.ratios.time()).ceil() as usize + 1;
                while self.input.len() >= self.chunk && self.output.space() >= max_chunk_out {
                    let chunk = self.chunk;
                    self.input.pop_into(&mut self.chunk_in[..chunk]);
                    self.process_chunk();
                }
            }

            if let Some(stretcher) = self.stretcher.as_mut() {
                let tail = stretcher.output_latency().min(self.chunk_out.len());
                let chunk_out = &mut self.chunk_out[..tail];
                chunk_out.fill(StereoSample::silence());
                stretcher.flush(bytemuck::cast_slice_mut::<StereoSample, f32>(chunk_out));
                if self.bypassed {
                    // Everything still held in the delay line, then re-prime it
                    while let Some(frame) = self.dry_delay.pop() {
                        self.output.push(frame);
                    }
                    for _ in 0..self.library_latency {
                        self.dry_delay.push(StereoSample::silence());
                    }
                } else {
                    for &frame in &self.chunk_out[..tail] {
                        self.output.push(frame);
                    }
                }
            }
        }
        let produced = self.output.pop_into(output);
        finish_output(output, produced, self.ratios.diagnostics())
    }

    fn input_latency(&self) -> usize {
        self.stretcher.as_ref().map_or(0, Stretch::input_latency) + self.chunk
    }

    fn output_latency(&self) -> usize {
        self.stretcher.as_ref().map_or(0, Stretch::output_latency)
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
    use crate::config::RatioBounds;
    use crate::diagnostics::Diagnostics;
    use std::sync::Arc;

    fn rms(signal: &[StereoSample]) -> f32 {
        (signal.iter().map(|s| s.left * s.left).sum::<f32>() / signal.len().max(1) as f32).sqrt()
    }

    fn stretcher() -> StretcherProcessor {
        let ratios = RatioControl::new(Arc::new(Diagnostics::new()), RatioBounds::default(), RatioBounds::default());
        let mut p = StretcherProcessor::new(ratios);
        p.prepare(44100.0, 2, 512);
        p
    }

    #[test]
    fn test_latency_reported_after_prepare() {
        let (p, _) = processor(StretchBackend::Stretcher);
        assert!(p.input_latency() > 0);
        assert!(p.output_latency() > 0);
    }

    #[test]
    fn test_unity_reproduces_input_after_latency() {
        let mut p = stretcher();
        let delay = p.library_latency;
        let input = sine(440.0, 0.5, 44100);
        let out = run(&mut p, &input, 512, 512);

        assert!(out.len() >= input.len() + delay);
        assert!(out[..delay].iter().all(|s| *s == StereoSample::silence()));
        for (i, expected) in input.iter().enumerate() {
            assert_eq!(out[i + delay], *expected, "frame {}", i);
        }
    }

    #[test]
    fn test_leaving_unity_crossfades_into_library_output() {
        let mut p = stretcher();
        let input = sine(440.0, 0.5, 44100);
        let mut out = Vec::new();
        let mut block = vec![StereoSample::silence(); 512];
        for (n, chunk) in input.chunks(512).enumerate() {
            if n == 40 {
                p.set_pitch_semitones(3.0).unwrap();
            }
            let produced = p.process(chunk, &mut block);
            out.extend_from_slice(&block[..produced]);
        }
        assert!(!p.bypassed);

        let steady = &out[8192..out.len() - 4096];
        let level = rms(steady);
        assert!(level > 0.2 && level < 0.5, "rms {}", level);
        let step = steady
            .windows(2)
            .map(|w| (w[1].left - w[0].left).abs())
            .fold(0.0f32, f32::max);
        assert!(step < 0.25, "largest step {}", step);
    }

    #[test]
    fn test_time_ratio_scales_output_length() {
        let (mut p, _) = processor(StretchBackend::Stretcher);
        p.set_time_ratio(2.0).unwrap();
        let input = sine(440.0, 0.5, 44100);
        let out = run(p.as_mut(), &input, 512, 512);

        let ratio = out.len() as f64 / input.len() as f64;
        assert!((ratio - 2.0).abs() < 0.15, "duration ratio {}", ratio);
    }

    #[test]
    fn test_chunks_decouple_from_tiny_blocks() {
        let (mut p, _) = processor(StretchBackend::Stretcher);
        let input = sine(440.0, 0.5, 22050);
        let out = run(p.as_mut(), &input, 17, 17);
        assert!(out.len() > 20000);
    }
}
