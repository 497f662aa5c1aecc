//! Fixed voice pool with round-robin allocation and stealing

use std::sync::Arc;

use crate::config::SamplerConfig;
use crate::diagnostics::Diagnostics;
use crate::sample::SampleDataPtr;
use crate::timestretch::{create_processor, StretchBackend, TimePitchProcessor};
use crate::types::StereoSample;

use super::params::{ParamSnapshot, VoiceAtomics};
use super::voice::{Voice, VoiceSettings};

/// Owns every voice; allocation is O(pool size) in the worst case
pub struct VoiceManager {
    voices: Vec<Voice>,
    /// Where the next allocation scan starts; under full load this is the
    /// oldest allocated voice
    cursor: usize,
    config: SamplerConfig,
    diagnostics: Arc<Diagnostics>,
    sample_rate: f64,
    max_block: usize,
    /// Note-ons dispatched in the current block, for start staggering
    block_starts: usize,
}

impl VoiceManager {
    pub fn new(config: &SamplerConfig, diagnostics: Arc<Diagnostics>) -> Self {
        let settings = VoiceSettings::from_config(config, crate::types::DEFAULT_SAMPLE_RATE);
        let voices = (0..config.voices)
            .map(|_| Voice::new(Self::processor(config, config.backend, &diagnostics), settings, diagnostics.clone()))
            .collect();

        Self {
            voices,
            cursor: 0,
            config: config.clone(),
            diagnostics,
            sample_rate: crate::types::DEFAULT_SAMPLE_RATE,
            max_block: crate::types::DEFAULT_MAX_BLOCK,
            block_starts: 0,
        }
    }

    fn processor(
        config: &SamplerConfig,
        backend: StretchBackend,
        diagnostics: &Arc<Diagnostics>,
    ) -> Box<dyn TimePitchProcessor> {
        create_processor(
            backend,
            diagnostics.clone(),
            config.pitch_ratio_bounds,
            config.time_ratio_bounds,
        )
    }

    /// Size every voice for the stream format (not real-time safe)
    pub fn prepare(&mut self, sample_rate: f64, max_block: usize) {
        self.sample_rate = sample_rate;
        self.max_block = max_block;
        let settings = VoiceSettings::from_config(&self.config, sample_rate);
        let time_min = self.config.time_ratio_bounds.sanitized().min;
        let max_input = (max_block as f64 / time_min).ceil() as usize + 1;

        for voice in &mut self.voices {
            voice.prepare(sample_rate, max_block, max_input, settings);
        }
        self.cursor = 0;
    }

    /// Replace every voice's processor (not real-time safe)
    pub fn set_backend(&mut self, backend: StretchBackend) {
        self.config.backend = backend;
        for voice in &mut self.voices {
            let processor = Self::processor(&self.config, backend, &self.diagnostics);
            voice.set_processor(processor, self.max_block);
        }
    }

    pub fn backend(&self) -> StretchBackend {
        self.config.backend
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn voice(&self, index: usize) -> Option<&Voice> {
        self.voices.get(index)
    }

    pub fn active_count(&self) -> usize {
        self.voices.iter().filter(|v| !v.is_idle()).count()
    }

    /// Read-back handles for every voice, in pool order
    pub fn atomics(&self) -> Vec<Arc<VoiceAtomics>> {
        self.voices.iter().map(Voice::atomics).collect()
    }

    /// Largest processor latency across the pool
    pub fn processor_latency(&self) -> usize {
        self.voices.iter().map(Voice::processor_latency).max().unwrap_or(0)
    }

    /// Call at the top of every audio block before dispatching events
    pub fn begin_block(&mut self) {
        self.block_starts = 0;
    }

    /// Index of the voice a new note should use, and whether it is a steal
    fn allocate(&mut self) -> Option<(usize, bool)> {
        let n = self.voices.len();
        if n == 0 {
            return None;
        }
        let found = (0..n)
            .map(|k| (self.cursor + k) % n)
            .find(|&i| self.voices[i].is_idle());

        let (index, steal) = match found {
            Some(i) => (i, false),
            None => (self.cursor, true),
        };
        self.cursor = (index + 1) % n;
        Some((index, steal))
    }

    /// Start a note
    ///
    /// A held note of the same pitch is retriggered in place; otherwise the
    /// first idle voice from the cursor is used, or the voice at the cursor
    /// is stolen.
    pub fn note_on(
        &mut self,
        note: u8,
        velocity: f32,
        sample_offset: usize,
        sample: SampleDataPtr,
        params: &ParamSnapshot,
    ) {
        if sample.is_empty() {
            return;
        }
        let delay = sample_offset + self.block_starts * self.config.start_stagger_samples;
        self.block_starts += 1;

        if let Some(voice) = self.voices.iter_mut().find(|v| v.held_note() == Some(note)) {
            voice.note_on(note, velocity, delay, sample, params, false);
            return;
        }

        let Some((index, steal)) = self.allocate() else {
            return;
        };
        if steal {
            self.diagnostics.record_steal();
        }
        self.voices[index].note_on(note, velocity, delay, sample, params, steal);
    }

    /// Release the first voice holding `note`
    pub fn note_off(&mut self, note: u8, sample_offset: usize) {
        if let Some(voice) = self.voices.iter_mut().find(|v| v.held_note() == Some(note)) {
            voice.note_off(sample_offset);
        }
    }

    /// Mix every voice into `out`
    pub fn process(&mut self, out: &mut [StereoSample], params: &ParamSnapshot) {
        for voice in &mut self.voices {
            voice.render(out, params);
        }
    }

    /// Silence every voice immediately
    pub fn reset(&mut self) {
        for voice in &mut self.voices {
            voice.kill();
        }
        self.cursor = 0;
        self.block_starts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::envelope::AdsrParams;
    use crate::sample::{share_sample, SampleData};

    const SR: f64 = 44100.0;

    fn manager(voices: usize) -> (VoiceManager, Arc<Diagnostics>) {
        let diagnostics = Arc::new(Diagnostics::new());
        let config = SamplerConfig {
            voices,
            dc_block: false,
            ..SamplerConfig::default()
        };
        let mut manager = VoiceManager::new(&config, diagnostics.clone());
        manager.prepare(SR, 256);
        (manager, diagnostics)
    }

    fn params() -> ParamSnapshot {
        ParamSnapshot {
            adsr: AdsrParams::new(1.0, 1.0, 1.0, 10.0),
            ..ParamSnapshot::default()
        }
    }

    fn sample() -> SampleDataPtr {
        share_sample(SampleData::mono(vec![0.25; 44100], SR).unwrap())
    }

    fn run(manager: &mut VoiceManager, params: &ParamSnapshot, frames: usize) -> Vec<StereoSample> {
        let mut out = vec![StereoSample::silence(); frames];
        for chunk in out.chunks_mut(256) {
            manager.begin_block();
            manager.process(chunk, params);
        }
        out
    }

    #[test]
    fn test_allocates_idle_voices_round_robin() {
        let (mut m, diagnostics) = manager(4);
        let p = params();
        for note in 60..63 {
            m.note_on(note, 1.0, 0, sample(), &p);
        }
        assert_eq!(m.active_count(), 3);
        let notes: Vec<_> = (0..3).map(|i| m.voice(i).and_then(Voice::note)).collect();
        assert_eq!(notes, vec![Some(60), Some(61), Some(62)]);
        assert_eq!(diagnostics.voice_steals(), 0);
    }

    #[test]
    fn test_pool_overflow_steals_exactly_one_voice() {
        let (mut m, diagnostics) = manager(4);
        let p = params();
        for note in 60..64 {
            m.note_on(note, 1.0, 0, sample(), &p);
        }
        run(&mut m, &p, 2048);

        m.note_on(70, 1.0, 0, sample(), &p);
        assert_eq!(diagnostics.voice_steals(), 1);

        let out = run(&mut m, &p, 1024);
        assert_eq!(m.active_count(), 4);
        // Oldest allocation (voice 0) was taken over
        assert_eq!(m.voice(0).and_then(Voice::note), Some(70));
        for i in 1..4 {
            assert_eq!(m.voice(i).and_then(Voice::note), Some(60 + i as u8));
        }
        // The new note sounds: the mix recovers to four voices' worth
        assert!((out[1023].left - 1.0).abs() < 1e-3, "{}", out[1023].left);
    }

    #[test]
    fn test_note_off_releases_first_held_match() {
        let (mut m, _) = manager(4);
        let p = params();
        m.note_on(60, 1.0, 0, sample(), &p);
        m.note_on(62, 1.0, 0, sample(), &p);
        run(&mut m, &p, 512);

        m.note_off(60, 0);
        run(&mut m, &p, 2048);
        assert_eq!(m.active_count(), 1);
        assert_eq!(m.voice(1).and_then(Voice::note), Some(62));

        // Unknown notes are ignored
        m.note_off(99, 0);
        assert_eq!(m.active_count(), 1);
    }

    #[test]
    fn test_same_note_retriggers_in_place() {
        let (mut m, _) = manager(4);
        let p = params();
        m.note_on(60, 1.0, 0, sample(), &p);
        run(&mut m, &p, 1024);
        m.note_on(60, 1.0, 0, sample(), &p);
        run(&mut m, &p, 1024);
        assert_eq!(m.active_count(), 1);
    }

    #[test]
    fn test_start_stagger_offsets_simultaneous_notes() {
        let diagnostics = Arc::new(Diagnostics::new());
        let config = SamplerConfig {
            voices: 4,
            dc_block: false,
            start_stagger_samples: 32,
            ..SamplerConfig::default()
        };
        let mut m = VoiceManager::new(&config, diagnostics);
        m.prepare(SR, 256);
        let p = params();

        m.begin_block();
        m.note_on(60, 1.0, 0, sample(), &p);
        m.note_on(64, 1.0, 0, sample(), &p);
        let mut out = vec![StereoSample::silence(); 256];
        m.process(&mut out, &p);

        // Only the first voice contributes before the stagger offset
        assert!(out[20].left > 0.0 && out[20].left <= 0.25);
        assert!(out[200].left > 0.25);
    }

    #[test]
    fn test_empty_sample_is_ignored() {
        let (mut m, _) = manager(2);
        let empty = share_sample(SampleData::empty());
        m.note_on(60, 1.0, 0, empty, &params());
        assert_eq!(m.active_count(), 0);
    }

    #[test]
    fn test_reset_silences_all() {
        let (mut m, _) = manager(2);
        let p = params();
        m.note_on(60, 1.0, 0, sample(), &p);
        m.note_on(61, 1.0, 0, sample(), &p);
        run(&mut m, &p, 512);
        m.reset();
        assert_eq!(m.active_count(), 0);
    }
}
