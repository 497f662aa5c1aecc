//! Sampler engine - ties together the voice pool, parameters and limiter
//!
//! [`SamplerEngine::new`] returns two halves:
//!
//! - [`SamplerEngine`] lives on the audio thread. `process` drains the MIDI
//!   queue, renders the voices, applies gain and the limiter and writes the
//!   host's planar buffers. It never allocates, locks or logs.
//! - [`EngineControl`] lives on the control thread. It publishes sample data,
//!   queues note events and writes the global parameters, all lock-free.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::{RatioBounds, SamplerConfig};
use crate::diagnostics::{clamp_ratio, Diagnostics, ParamError};
use crate::midi::{midi_channel, MidiEvent, MidiReceiver, MidiSender};
use crate::sample::{SampleData, SampleDataPtr, SampleSlot};
use crate::timestretch::StretchBackend;
use crate::types::{semitones_to_ratio, StereoSample, DEFAULT_MAX_BLOCK, DEFAULT_SAMPLE_RATE, MAX_BLOCK_FRAMES};

use super::envelope::AdsrParams;
use super::limiter::Limiter;
use super::params::{EngineParams, ParamSnapshot, VoiceAtomics, VoiceSnapshot, REGION_END_OF_SAMPLE};
use super::voice_manager::VoiceManager;

/// Largest accepted master gain (+12 dB)
pub const MAX_GAIN: f32 = 4.0;

/// Audio-thread half of the sampler
pub struct SamplerEngine {
    config: SamplerConfig,
    sample_rate: f64,
    max_block: usize,
    voices: VoiceManager,
    limiter: Limiter,
    params: Arc<EngineParams>,
    sample: Arc<SampleSlot>,
    diagnostics: Arc<Diagnostics>,
    midi: MidiReceiver,
    /// Pre-allocated mix bus, `max_block` frames
    mix: Vec<StereoSample>,
}

impl SamplerEngine {
    /// Build an engine and its control handle
    ///
    /// The engine is prepared for the default format; call
    /// [`prepare`](Self::prepare) once the host format is known.
    pub fn new(config: SamplerConfig) -> (Self, EngineControl) {
        let config = config.sanitized();
        let diagnostics = Arc::new(Diagnostics::new());
        let params = Arc::new(EngineParams::default());
        params.time_warp.store(config.time_warp, Ordering::Relaxed);
        let sample = Arc::new(SampleSlot::new());
        let (midi_tx, midi_rx) = midi_channel(config.midi_queue_capacity);
        let voices = VoiceManager::new(&config, diagnostics.clone());

        let control = EngineControl {
            params: params.clone(),
            sample: sample.clone(),
            diagnostics: diagnostics.clone(),
            midi: midi_tx,
            voices: voices.atomics(),
            pitch_bounds: config.pitch_ratio_bounds,
            time_bounds: config.time_ratio_bounds,
        };

        let mut engine = Self {
            limiter: Limiter::new(config.limiter.clone()),
            config,
            sample_rate: DEFAULT_SAMPLE_RATE,
            max_block: DEFAULT_MAX_BLOCK,
            voices,
            params,
            sample,
            diagnostics,
            midi: midi_rx,
            mix: Vec::new(),
        };
        engine.prepare(DEFAULT_SAMPLE_RATE, DEFAULT_MAX_BLOCK);
        (engine, control)
    }

    /// Allocate everything for a new stream format (not real-time safe)
    ///
    /// Any sounding voice is silenced.
    pub fn prepare(&mut self, sample_rate: f64, max_block: usize) {
        let sample_rate = if sample_rate.is_finite() && sample_rate > 0.0 {
            sample_rate
        } else {
            log::warn!("Invalid sample rate {}, using {}", sample_rate, DEFAULT_SAMPLE_RATE);
            DEFAULT_SAMPLE_RATE
        };
        let max_block = max_block.clamp(1, MAX_BLOCK_FRAMES);

        self.sample_rate = sample_rate;
        self.max_block = max_block;
        self.mix = vec![StereoSample::silence(); max_block];
        self.voices.prepare(sample_rate, max_block);
        self.limiter.prepare(sample_rate);

        log::info!(
            "Sampler prepared: {} Hz, max block {}, {} voices, backend {}",
            sample_rate,
            max_block,
            self.voices.voice_count(),
            self.voices.backend()
        );
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn max_block(&self) -> usize {
        self.max_block
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn backend(&self) -> StretchBackend {
        self.voices.backend()
    }

    /// Switch every voice to another time/pitch backend (not real-time safe)
    pub fn set_backend(&mut self, backend: StretchBackend) {
        self.config.backend = backend;
        self.voices.set_backend(backend);
        log::info!("Time/pitch backend set to {}", backend);
    }

    /// Output latency in frames: limiter lookahead, plus the processor
    /// latency when time warp is on
    pub fn latency_samples(&self) -> usize {
        let warp = if self.params.time_warp.load(Ordering::Relaxed) {
            self.voices.processor_latency()
        } else {
            0
        };
        self.limiter.latency_samples() + warp
    }

    pub fn active_voice_count(&self) -> usize {
        self.voices.active_count()
    }

    /// Start a note directly (audio-thread owner only)
    pub fn note_on(&mut self, note: u8, velocity: f32) {
        let params = self.params.snapshot();
        self.dispatch(MidiEvent::note_on(note as i32, velocity, 0), &params);
    }

    /// Release a note directly (audio-thread owner only)
    pub fn note_off(&mut self, note: u8) {
        let params = self.params.snapshot();
        self.dispatch(MidiEvent::note_off(note as i32, 0), &params);
    }

    /// Silence all voices and clear the limiter
    pub fn reset(&mut self) {
        self.voices.reset();
        self.limiter.reset();
    }

    fn dispatch(&mut self, event: MidiEvent, params: &ParamSnapshot) {
        let offset = event.sample_offset as usize;
        if event.is_release() {
            self.voices.note_off(event.note, offset);
        } else {
            let sample = self.sample.load();
            self.voices.note_on(event.note, event.velocity, offset, sample, params);
        }
    }

    /// Render `num_samples` frames into planar `outputs`
    ///
    /// One channel receives the mono sum, two channels left and right, any
    /// further channels silence. Blocks longer than `max_block` are rendered
    /// in sub-blocks.
    pub fn process(&mut self, outputs: &mut [&mut [f32]], num_samples: usize) {
        let params = self.params.snapshot();
        self.voices.begin_block();
        while let Some(event) = self.midi.pop() {
            self.dispatch(event, &params);
        }

        let mut offset = 0;
        while offset < num_samples {
            let frames = (num_samples - offset).min(self.max_block);
            self.render_block(frames, &params);
            write_channels(outputs, offset, &self.mix[..frames]);
            offset += frames;
        }
    }

    fn render_block(&mut self, frames: usize, params: &ParamSnapshot) {
        let mix = &mut self.mix[..frames];
        mix.fill(StereoSample::silence());
        self.voices.process(mix, params);

        for frame in mix.iter_mut() {
            *frame *= params.gain;
        }
        self.limiter.process(mix);

        let mut bad = 0u64;
        for frame in mix.iter_mut() {
            let (clean, was_bad) = frame.sanitized();
            *frame = clean;
            bad += was_bad as u64;
        }
        self.diagnostics.record_nan(bad);
    }
}

fn write_channels(outputs: &mut [&mut [f32]], offset: usize, mix: &[StereoSample]) {
    let mono = outputs.len() == 1;
    for (channel, out) in outputs.iter_mut().enumerate() {
        let end = (offset + mix.len()).min(out.len());
        if offset >= end {
            continue;
        }
        for (dst, frame) in out[offset..end].iter_mut().zip(mix) {
            *dst = match (mono, channel) {
                (true, _) => frame.mono_sum(),
                (false, 0) => frame.left,
                (false, 1) => frame.right,
                _ => 0.0,
            };
        }
    }
}

/// Control-thread half of the sampler
///
/// Every setter validates its input, applies the (possibly clamped) value
/// and returns `Err` when the request was not used verbatim. The error is
/// also recorded in [`Diagnostics`].
pub struct EngineControl {
    params: Arc<EngineParams>,
    sample: Arc<SampleSlot>,
    diagnostics: Arc<Diagnostics>,
    midi: MidiSender,
    voices: Vec<Arc<VoiceAtomics>>,
    pitch_bounds: RatioBounds,
    time_bounds: RatioBounds,
}

impl EngineControl {
    /// Publish new sample data; sounding voices keep the previous one
    pub fn set_sample_data(&self, data: SampleData) {
        log::debug!(
            "Publishing sample: {} frames, {} channel(s), {} Hz",
            data.len(),
            data.channels(),
            data.source_sample_rate()
        );
        self.sample.store(data);
    }

    /// Publish an already shared sample
    pub fn set_shared_sample(&self, data: SampleDataPtr) {
        self.sample.store_shared(data);
    }

    pub fn clear_sample_data(&self) {
        self.sample.clear();
    }

    /// Current sample as new notes will see it
    pub fn sample_data(&self) -> SampleDataPtr {
        self.sample.load()
    }

    /// Queue an event; a full queue hands the event back
    pub fn send(&mut self, event: MidiEvent) -> Result<(), MidiEvent> {
        self.midi.send(event).map_err(|event| {
            self.diagnostics.record_dropped_event();
            event
        })
    }

    pub fn note_on(&mut self, note: i32, velocity: f32) -> Result<(), MidiEvent> {
        self.send(MidiEvent::note_on(note, velocity, 0))
    }

    pub fn note_off(&mut self, note: i32) -> Result<(), MidiEvent> {
        self.send(MidiEvent::note_off(note, 0))
    }

    pub fn set_adsr(&self, attack_ms: f32, decay_ms: f32, sustain: f32, release_ms: f32) -> Result<(), ParamError> {
        let (adsr, err) = AdsrParams::new(attack_ms, decay_ms, sustain, release_ms).validated();
        self.params.set_adsr(adsr);
        match err {
            Some(err) => Err(self.diagnostics.record_param(err)),
            None => Ok(()),
        }
    }

    /// Set the loop points in source frames
    ///
    /// An enabled loop with `end <= start` is stored disabled. Points past
    /// the end of the sample are clamped when a voice reads them.
    pub fn set_loop(&self, enabled: bool, start: u64, end: u64) -> Result<(), ParamError> {
        if enabled && end <= start {
            self.params.set_loop(false, start, end);
            return Err(self.diagnostics.record_param(ParamError::Loop { start, end }));
        }
        self.params.set_loop(enabled, start, end);
        Ok(())
    }

    /// Set the playback region for new notes (`end` may be
    /// [`REGION_END_OF_SAMPLE`]); an empty region selects the whole sample
    pub fn set_region(&self, start: u64, end: u64) -> Result<(), ParamError> {
        if end <= start {
            self.params.set_region(0, REGION_END_OF_SAMPLE);
            return Err(self.diagnostics.record_param(ParamError::Region { start, end }));
        }
        self.params.set_region(start, end);
        Ok(())
    }

    /// Note at which the sample plays at its original pitch
    pub fn set_root_note(&self, note: u8) {
        self.params.root_note.store(note.min(127), Ordering::Relaxed);
    }

    pub fn set_pitch_ratio(&self, ratio: f64) -> Result<(), ParamError> {
        let (applied, clamped) = clamp_ratio(ratio, self.pitch_bounds.min, self.pitch_bounds.max, 1.0);
        self.params.pitch_ratio.store(applied);
        if clamped {
            Err(self.diagnostics.record_param(ParamError::PitchRatio {
                requested: ratio,
                applied,
            }))
        } else {
            Ok(())
        }
    }

    pub fn set_pitch_semitones(&self, semitones: f32) -> Result<(), ParamError> {
        let ratio = if semitones.is_finite() {
            semitones_to_ratio(semitones as f64)
        } else {
            f64::NAN
        };
        self.set_pitch_ratio(ratio)
    }

    pub fn set_time_ratio(&self, ratio: f64) -> Result<(), ParamError> {
        let (applied, clamped) = clamp_ratio(ratio, self.time_bounds.min, self.time_bounds.max, 1.0);
        self.params.time_ratio.store(applied);
        if clamped {
            Err(self.diagnostics.record_param(ParamError::TimeRatio {
                requested: ratio,
                applied,
            }))
        } else {
            Ok(())
        }
    }

    /// Route new notes through the time/pitch processors
    pub fn set_time_warp(&self, enabled: bool) {
        self.params.time_warp.store(enabled, Ordering::Relaxed);
    }

    /// Master gain, linear (0..=[`MAX_GAIN`])
    pub fn set_gain(&self, gain: f32) -> Result<(), ParamError> {
        let applied = if gain.is_finite() { gain.clamp(0.0, MAX_GAIN) } else { 1.0 };
        self.params.gain.store(applied);
        if applied != gain {
            Err(self.diagnostics.record_param(ParamError::Gain {
                requested: gain as f64,
                applied: applied as f64,
            }))
        } else {
            Ok(())
        }
    }

    /// Current global parameters
    pub fn params(&self) -> ParamSnapshot {
        self.params.snapshot()
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Eventually consistent read-back of one voice
    pub fn voice_snapshot(&self, index: usize) -> Option<VoiceSnapshot> {
        self.voices.get(index).map(|v| v.snapshot())
    }

    /// Voices that were sounding at the end of the last block
    pub fn active_voice_count(&self) -> usize {
        self.voices.iter().filter(|v| v.is_active()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::envelope::{EnvelopeCurve, EnvelopeStage};
    use std::f32::consts::PI;

    const SR: f64 = 44100.0;
    const BLOCK: usize = 512;

    fn engine_with(config: SamplerConfig) -> (SamplerEngine, EngineControl) {
        let (mut engine, control) = SamplerEngine::new(config);
        engine.prepare(SR, BLOCK);
        (engine, control)
    }

    fn no_dc() -> SamplerConfig {
        SamplerConfig {
            dc_block: false,
            ..SamplerConfig::default()
        }
    }

    /// Render `frames` stereo frames, returning the left channel
    fn render(engine: &mut SamplerEngine, frames: usize) -> Vec<f32> {
        let mut left = vec![0.0f32; frames];
        let mut right = vec![0.0f32; frames];
        let mut offset = 0;
        while offset < frames {
            let n = (frames - offset).min(BLOCK);
            let mut outputs: [&mut [f32]; 2] = [&mut left[offset..offset + n], &mut right[offset..offset + n]];
            engine.process(&mut outputs, n);
            offset += n;
        }
        left
    }

    fn max_delta(signal: &[f32]) -> f32 {
        signal.windows(2).map(|w| (w[1] - w[0]).abs()).fold(0.0, f32::max)
    }

    fn sine_sample(freq: f32, amplitude: f32, seconds: f32) -> SampleData {
        let frames = (seconds * SR as f32) as usize;
        let samples = (0..frames)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / SR as f32).sin())
            .collect();
        SampleData::mono(samples, SR).unwrap()
    }

    #[test]
    fn test_adsr_end_to_end() {
        let (mut engine, mut control) = engine_with(no_dc());
        control.set_sample_data(SampleData::mono(vec![0.5; 2 * 44100], SR).unwrap());
        control.set_adsr(100.0, 100.0, 0.5, 200.0).unwrap();
        control.note_on(60, 1.0).unwrap();

        // Note-off lands exactly on frame 44100
        let before = 44100 / BLOCK * BLOCK;
        let mut out = render(&mut engine, before);
        control.send(MidiEvent::note_off(60, (44100 - before) as u32)).unwrap();
        out.extend(render(&mut engine, 2 * 44100 - before));

        let latency = engine.latency_samples();
        assert_eq!(latency, 66);

        assert_eq!(out[0], 0.0);
        assert!((out[latency + 4410] - 0.5).abs() < 0.01, "attack peak {}", out[latency + 4410]);
        assert!((out[latency + 22050] - 0.25).abs() < 0.005, "sustain {}", out[latency + 22050]);
        assert!((out[latency + 44099] - 0.25).abs() < 0.005);

        let mid_release = out[latency + 44100 + 4410];
        assert!(mid_release > 0.0 && mid_release < 0.01, "mid release {}", mid_release);
        assert!(out[latency + 44100 + 8820 + 2..].iter().all(|s| s.abs() < 1e-6));

        let delta = max_delta(&out);
        assert!(delta < 0.1, "max inter-sample delta {}", delta);
        assert_eq!(control.active_voice_count(), 0);
    }

    #[test]
    fn test_retrigger_idempotence_for_both_curves() {
        for curve in [EnvelopeCurve::OnePole, EnvelopeCurve::Linear] {
            let (mut engine, mut control) = engine_with(SamplerConfig {
                envelope_curve: curve,
                ..no_dc()
            });
            control.set_sample_data(sine_sample(110.0, 0.5, 3.0));
            control.set_adsr(5.0, 100.0, 0.7, 200.0).unwrap();

            control.note_on(60, 1.0).unwrap();
            control.note_on(60, 1.0).unwrap();
            let mut out = render(&mut engine, 11025);

            // Mid-sustain
            control.note_on(60, 1.0).unwrap();
            control.note_on(60, 1.0).unwrap();
            out.extend(render(&mut engine, 11025));

            // During the release
            control.note_off(60).unwrap();
            out.extend(render(&mut engine, 2205));
            control.note_on(60, 1.0).unwrap();
            control.note_on(60, 1.0).unwrap();
            out.extend(render(&mut engine, 11025));

            let delta = max_delta(&out);
            assert!(delta < 0.1, "{:?}: max inter-sample delta {}", curve, delta);
            assert!(out.iter().any(|s| s.abs() > 0.2), "{:?}: nothing played", curve);
        }
    }

    #[test]
    fn test_voice_pool_overflow_through_queue() {
        let (mut engine, mut control) = engine_with(SamplerConfig { voices: 2, ..no_dc() });
        control.set_sample_data(SampleData::mono(vec![0.25; 44100], SR).unwrap());
        control.set_adsr(1.0, 1.0, 1.0, 50.0).unwrap();

        control.note_on(60, 1.0).unwrap();
        control.note_on(62, 1.0).unwrap();
        render(&mut engine, 2048);
        control.note_on(64, 1.0).unwrap();
        let out = render(&mut engine, 2048);

        assert_eq!(control.diagnostics().voice_steals(), 1);
        assert_eq!(control.voice_snapshot(0).map(|v| v.note), Some(64));
        assert_eq!(control.voice_snapshot(0).map(|v| v.stage), Some(EnvelopeStage::Sustain));
        assert!((out[2047] - 0.5).abs() < 1e-3, "{}", out[2047]);
    }

    #[test]
    fn test_channel_mapping() {
        let (mut engine, control) = engine_with(no_dc());
        control.set_sample_data(SampleData::stereo(vec![0.5; 44100], vec![-0.25; 44100], SR).unwrap());
        control.set_adsr(1.0, 1.0, 1.0, 50.0).unwrap();
        engine.note_on(60, 1.0);

        let mut mono = vec![0.0f32; 4096];
        {
            let mut outputs: [&mut [f32]; 1] = [&mut mono];
            engine.process(&mut outputs, 4096);
        }
        assert!((mono[4095] - 0.125).abs() < 1e-4, "mono {}", mono[4095]);

        let mut a = vec![0.0f32; 1024];
        let mut b = vec![0.0f32; 1024];
        let mut c = vec![1.0f32; 1024];
        {
            let mut outputs: [&mut [f32]; 3] = [&mut a, &mut b, &mut c];
            engine.process(&mut outputs, 1024);
        }
        assert!((a[1023] - 0.5).abs() < 1e-4);
        assert!((b[1023] + 0.25).abs() < 1e-4);
        assert!(c.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_large_host_block_is_split() {
        let (mut engine, control) = engine_with(no_dc());
        control.set_sample_data(SampleData::mono(vec![0.5; 44100], SR).unwrap());
        control.set_adsr(1.0, 1.0, 1.0, 50.0).unwrap();
        engine.note_on(60, 1.0);

        let mut left = vec![0.0f32; 3000];
        let mut right = vec![0.0f32; 3000];
        let mut outputs: [&mut [f32]; 2] = [&mut left, &mut right];
        engine.process(&mut outputs, 3000);
        assert!((left[2999] - 0.5).abs() < 1e-4);
        assert!(max_delta(&left) < 0.1);
    }

    #[test]
    fn test_full_queue_rejects_and_counts() {
        let (_engine, mut control) = engine_with(SamplerConfig {
            midi_queue_capacity: 4,
            ..SamplerConfig::default()
        });
        for note in 0..4 {
            control.note_on(60 + note, 1.0).unwrap();
        }
        let rejected = control.note_on(70, 1.0).unwrap_err();
        assert_eq!(rejected.note, 70);
        assert_eq!(control.diagnostics().dropped_events(), 1);
    }

    #[test]
    fn test_setters_clamp_and_report() {
        let (_engine, control) = engine_with(SamplerConfig::default());

        assert!(control.set_time_ratio(2.0).is_ok());
        assert!(control.set_time_ratio(100.0).is_err());
        assert_eq!(control.params().time_ratio, 4.0);

        assert!(control.set_pitch_semitones(-36.0).is_err());
        assert_eq!(control.params().pitch_ratio, 0.25);
        assert!(control.set_pitch_ratio(f64::NAN).is_err());
        assert_eq!(control.params().pitch_ratio, 1.0);

        assert!(control.set_gain(f32::NAN).is_err());
        assert_eq!(control.params().gain, 1.0);
        assert!(control.set_gain(10.0).is_err());
        assert_eq!(control.params().gain, MAX_GAIN);

        assert!(control.set_loop(true, 500, 100).is_err());
        assert!(!control.params().loop_enabled);
        assert!(control.set_loop(true, 100, 500).is_ok());
        assert!(control.params().loop_enabled);

        assert!(control.set_region(10, 10).is_err());
        assert_eq!(control.params().region_end, REGION_END_OF_SAMPLE);

        assert!(control.set_adsr(-1.0, 10.0, 0.5, 10.0).is_err());
        assert!(control.params().adsr.attack_ms >= 1.0);

        assert!(control.diagnostics().error_count() >= 8);
    }

    #[test]
    fn test_sample_swap_leaves_sounding_voice_alone() {
        let (mut engine, mut control) = engine_with(no_dc());
        control.set_sample_data(SampleData::mono(vec![0.5; 44100], SR).unwrap());
        control.set_adsr(1.0, 1.0, 1.0, 50.0).unwrap();
        control.note_on(60, 1.0).unwrap();
        render(&mut engine, 2048);

        control.set_sample_data(SampleData::mono(vec![0.25; 44100], SR).unwrap());
        let out = render(&mut engine, 512);
        assert!((out[511] - 0.5).abs() < 1e-4, "{}", out[511]);

        control.note_on(64, 1.0).unwrap();
        let out = render(&mut engine, 2048);
        assert!((out[2047] - 0.75).abs() < 1e-3, "{}", out[2047]);
    }

    #[test]
    fn test_time_warp_through_every_backend() {
        for backend in StretchBackend::ALL {
            let (mut engine, control) = engine_with(SamplerConfig { backend, ..no_dc() });
            control.set_sample_data(sine_sample(220.0, 0.5, 1.0));
            control.set_time_warp(true);
            control.set_time_ratio(1.5).unwrap();
            control.set_pitch_semitones(3.0).unwrap();
            assert!(engine.latency_samples() > 66, "{} reports no latency", backend);

            engine.note_on(60, 1.0);
            let out = render(&mut engine, 44100);
            assert!(out.iter().all(|s| s.is_finite() && s.abs() <= 1.0), "{}", backend);
            let peak = out.iter().fold(0.0f32, |m, s| m.max(s.abs()));
            assert!(peak > 0.1, "{} produced no audio (peak {})", backend, peak);
        }
    }

    #[test]
    fn test_reset_silences_output() {
        let (mut engine, control) = engine_with(no_dc());
        control.set_sample_data(SampleData::mono(vec![0.5; 44100], SR).unwrap());
        engine.note_on(60, 1.0);
        render(&mut engine, 2048);
        engine.reset();
        assert_eq!(engine.active_voice_count(), 0);
        assert!(render(&mut engine, 512).iter().all(|&s| s == 0.0));
    }
}
