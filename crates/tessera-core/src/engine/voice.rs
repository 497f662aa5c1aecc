//! One polyphonic playback slot
//!
//! A voice owns everything a sounding note needs: the ADSR envelope, a
//! fractional playhead into its own snapshot of the sample, the anti-click
//! ramps and, for time-warped playback, its own [`TimePitchProcessor`].
//! Once allocated it is touched by the audio thread only; the control side
//! sees it through [`VoiceAtomics`].
//!
//! ## Signal path
//!
//! ```text
//! sample ─► cubic read ─► tail fade ─► anti-alias ─┬───────────────► DC block ─► × gain ─► sanitize ─► mix
//!   (playhead += step, loop wrap)                  └► processor ──┘
//!                                                     (time warp)
//! gain = velocity × envelope × fade-in × fade-out
//! ```
//!
//! ## Restarting a sounding voice
//!
//! Restarting playback jumps the playhead back to the start point, which is
//! a step in the waveform. A voice that is audible therefore never restarts
//! directly: it keeps the new note as *pending*, fades its current output to
//! zero (retrigger or steal fade) and only then starts the pending note with
//! a fresh fade-in. A voice that is silent restarts immediately.

use std::sync::Arc;

use crate::config::SamplerConfig;
use crate::diagnostics::Diagnostics;
use crate::sample::SampleDataPtr;
use crate::timestretch::TimePitchProcessor;
use crate::types::{ms_to_frames, ratio_to_semitones, semitones_to_ratio, StereoSample};

use super::envelope::{Envelope, EnvelopeCurve, EnvelopeStage, SILENCE_THRESHOLD};
use super::params::{ParamSnapshot, VoiceAtomics, VoiceSnapshot};

/// Feed/process rounds per segment when pulling from the processor
const MAX_FEED_ROUNDS: usize = 8;

/// DC blocker corner frequency
const DC_BLOCK_HZ: f64 = 20.0;

/// Anti-click and filtering settings, in frames at the output rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceSettings {
    pub fade_in: usize,
    /// Fade applied over the last frames before the end of the region
    pub tail_fade: usize,
    pub retrigger_fade: usize,
    pub steal_fade: usize,
    pub dc_block: bool,
    pub curve: EnvelopeCurve,
}

impl VoiceSettings {
    pub fn from_config(config: &SamplerConfig, sample_rate: f64) -> Self {
        Self {
            fade_in: config.fade_in_samples,
            tail_fade: config.release_fade_samples.max(1),
            retrigger_fade: config.retrigger_fade_samples.max(1),
            steal_fade: ms_to_frames(config.steal_fade_ms, sample_rate).max(1),
            dc_block: config.dc_block,
            curve: config.envelope_curve,
        }
    }
}

/// A note waiting for the current one to fade out
struct PendingNote {
    note: u8,
    velocity: f32,
    delay: usize,
    /// Note-off arrived before the note could start
    released: bool,
    sample: SampleDataPtr,
}

/// Linear fade to silence
#[derive(Debug, Clone, Copy)]
struct FadeOut {
    remaining: usize,
    length: usize,
}

/// The pre-jump read position, faded out after the playhead leaves a loop
#[derive(Debug, Clone, Copy)]
struct JumpFade {
    position: f64,
    remaining: usize,
    length: usize,
}

/// First-order high-pass removing DC offsets from the voice signal
#[derive(Debug, Clone, Copy, Default)]
struct DcBlocker {
    coeff: f32,
    x1: StereoSample,
    y1: StereoSample,
}

impl DcBlocker {
    fn prepare(&mut self, sample_rate: f64) {
        self.coeff = (1.0 - std::f64::consts::TAU * DC_BLOCK_HZ / sample_rate).clamp(0.0, 1.0) as f32;
        self.reset();
    }

    fn reset(&mut self) {
        self.x1 = StereoSample::silence();
        self.y1 = StereoSample::silence();
    }

    #[inline]
    fn process(&mut self, x: StereoSample) -> StereoSample {
        let y = x - self.x1 + self.y1 * self.coeff;
        self.x1 = x;
        self.y1 = y;
        y
    }
}

/// Time-warp bookkeeping for the current note
#[derive(Debug, Clone, Copy, Default)]
struct WarpState {
    enabled: bool,
    /// The processor has produced its first frame for this note
    primed: bool,
    /// The source region is exhausted; the processor is being flushed
    source_done: bool,
    /// Flushing produced nothing more
    drained: bool,
    pitch_sent: f64,
    time_sent: f64,
}

/// Values derived once per block (and again when a note starts)
#[derive(Debug, Clone, Copy)]
struct BlockState {
    /// Source frames advanced per output (or processor input) frame
    step: f64,
    loop_active: bool,
    loop_start: f64,
    loop_end: f64,
}

impl Default for BlockState {
    fn default() -> Self {
        Self {
            step: 1.0,
            loop_active: false,
            loop_start: 0.0,
            loop_end: 0.0,
        }
    }
}

pub struct Voice {
    atomics: Arc<VoiceAtomics>,
    diagnostics: Arc<Diagnostics>,
    settings: VoiceSettings,
    sample_rate: f64,
    envelope: Envelope,
    processor: Box<dyn TimePitchProcessor>,
    sample: Option<SampleDataPtr>,

    active: bool,
    note: u8,
    velocity: f32,
    playhead: f64,
    start_point: f64,
    end_point: f64,
    /// Note-off has been applied; looping is off for the rest of the note
    released: bool,
    /// Silent frames before the note starts
    start_delay: usize,
    /// Sounding frames before the scheduled note-off
    release_delay: Option<usize>,

    fade_in_remaining: usize,
    fade_out: Option<FadeOut>,
    jump: Option<JumpFade>,
    pending: Option<PendingNote>,
    /// Gain applied to the last rendered frame
    last_gain: f32,

    dc: DcBlocker,
    anti_alias: StereoSample,
    warp: WarpState,
    warp_in: Vec<StereoSample>,
    warp_out: Vec<StereoSample>,
    block: BlockState,
}

impl Voice {
    pub fn new(processor: Box<dyn TimePitchProcessor>, settings: VoiceSettings, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            atomics: Arc::new(VoiceAtomics::new()),
            diagnostics,
            settings,
            sample_rate: crate::types::DEFAULT_SAMPLE_RATE,
            envelope: Envelope::new(settings.curve),
            processor,
            sample: None,
            active: false,
            note: 0,
            velocity: 0.0,
            playhead: 0.0,
            start_point: 0.0,
            end_point: 0.0,
            released: false,
            start_delay: 0,
            release_delay: None,
            fade_in_remaining: 0,
            fade_out: None,
            jump: None,
            pending: None,
            last_gain: 0.0,
            dc: DcBlocker::default(),
            anti_alias: StereoSample::silence(),
            warp: WarpState::default(),
            warp_in: Vec::new(),
            warp_out: Vec::new(),
            block: BlockState::default(),
        }
    }

    /// Allocate buffers for the stream format (not real-time safe)
    ///
    /// `max_input` bounds the source frames fed to the processor in one round.
    pub fn prepare(&mut self, sample_rate: f64, max_block: usize, max_input: usize, settings: VoiceSettings) {
        self.sample_rate = sample_rate;
        self.settings = settings;
        self.envelope.set_curve(settings.curve);
        self.envelope.prepare(sample_rate);
        self.dc.prepare(sample_rate);
        self.processor.prepare(sample_rate, 2, max_block);
        self.warp_out = vec![StereoSample::silence(); max_block.max(1)];
        self.warp_in = vec![StereoSample::silence(); max_input.max(1)];
        self.kill();
    }

    /// Swap the time/pitch processor (not real-time safe)
    pub fn set_processor(&mut self, mut processor: Box<dyn TimePitchProcessor>, max_block: usize) {
        processor.prepare(self.sample_rate, 2, max_block);
        self.processor = processor;
        self.kill();
    }

    pub fn atomics(&self) -> Arc<VoiceAtomics> {
        self.atomics.clone()
    }

    /// Free for allocation
    #[inline]
    pub fn is_idle(&self) -> bool {
        !self.active
    }

    /// Note currently sounding (or fading out)
    pub fn note(&self) -> Option<u8> {
        self.active.then_some(self.note)
    }

    /// Note a note-off would release: the pending note if one is waiting,
    /// otherwise the sounding note unless it is already released
    pub fn held_note(&self) -> Option<u8> {
        if let Some(pending) = &self.pending {
            return (!pending.released).then_some(pending.note);
        }
        let held = self.active && !self.released && self.release_delay.is_none() && self.envelope.is_active();
        held.then_some(self.note)
    }

    pub fn stage(&self) -> EnvelopeStage {
        self.envelope.stage()
    }

    pub fn playhead(&self) -> f64 {
        self.playhead
    }

    /// Latency of the owned processor in frames
    pub fn processor_latency(&self) -> usize {
        self.processor.total_latency()
    }

    #[inline]
    fn is_audible(&self) -> bool {
        self.active && self.start_delay == 0 && self.last_gain > SILENCE_THRESHOLD
    }

    /// Start `note`, or queue it behind a fade-out if the voice is audible
    ///
    /// `steal` selects the steal fade instead of the retrigger fade. Only one
    /// note waits per voice: a newer note replaces a waiting one, which is
    /// counted in the diagnostics as superseded.
    pub fn note_on(
        &mut self,
        note: u8,
        velocity: f32,
        delay: usize,
        sample: SampleDataPtr,
        params: &ParamSnapshot,
        steal: bool,
    ) {
        let pending = PendingNote {
            note,
            velocity,
            delay,
            released: false,
            sample,
        };
        if !self.is_audible() {
            self.start(pending, params);
            return;
        }

        if let Some(replaced) = self.pending.replace(pending) {
            if !replaced.released {
                self.diagnostics.record_superseded();
            }
        }
        if self.fade_out.is_none() {
            let length = if steal {
                self.settings.steal_fade
            } else {
                self.settings.retrigger_fade
            };
            self.fade_out = Some(FadeOut { remaining: length, length });
        }
    }

    /// Release the held note `delay` frames into the current block
    pub fn note_off(&mut self, delay: usize) {
        if let Some(pending) = self.pending.as_mut() {
            pending.released = true;
            return;
        }
        if !self.active || self.released || self.release_delay.is_some() {
            return;
        }
        let sounding_delay = delay.saturating_sub(self.start_delay);
        if sounding_delay == 0 && self.start_delay == 0 {
            self.release_now();
        } else {
            self.release_delay = Some(sounding_delay);
        }
    }

    /// Silence immediately and forget everything about the note
    pub fn kill(&mut self) {
        self.deactivate();
        self.processor.reset();
        self.publish();
    }

    /// Enter release; a playhead inside an active loop moves past its end
    fn release_now(&mut self) {
        self.release_delay = None;
        self.released = true;

        let block = self.block;
        if block.loop_active && self.playhead >= block.loop_start && self.playhead < block.loop_end {
            let length = self.settings.retrigger_fade;
            self.jump = Some(JumpFade {
                position: self.playhead,
                remaining: length,
                length,
            });
            self.playhead = block.loop_end;
        }
        self.block.loop_active = false;
        self.envelope.note_off();
    }

    fn start(&mut self, pending: PendingNote, params: &ParamSnapshot) {
        self.pending = None;
        self.fade_out = None;
        if pending.released || pending.sample.is_empty() {
            self.deactivate();
            return;
        }

        let len = pending.sample.len() as u64;
        let start = params.region_start.min(len);
        let end = params.region_end.min(len);
        if end <= start {
            self.deactivate();
            return;
        }

        self.sample = Some(pending.sample);
        self.active = true;
        self.note = pending.note;
        self.velocity = pending.velocity;
        self.start_point = start as f64;
        self.end_point = end as f64;
        self.playhead = self.start_point;
        self.released = false;
        self.start_delay = pending.delay;
        self.release_delay = None;
        self.fade_in_remaining = self.settings.fade_in;
        self.jump = None;
        self.last_gain = 0.0;

        self.envelope.set_params(params.adsr);
        self.envelope.note_on();
        self.dc.reset();
        self.anti_alias = StereoSample::silence();

        self.warp = WarpState {
            enabled: params.time_warp,
            pitch_sent: f64::NAN,
            time_sent: f64::NAN,
            ..WarpState::default()
        };
        if self.warp.enabled {
            self.processor.reset();
        }
        self.begin_block(params);
    }

    fn deactivate(&mut self) {
        self.active = false;
        self.sample = None;
        self.pending = None;
        self.fade_out = None;
        self.jump = None;
        self.release_delay = None;
        self.start_delay = 0;
        self.last_gain = 0.0;
        self.envelope.reset();
    }

    /// The current note is over: start the pending one or go idle
    fn end_current(&mut self, params: &ParamSnapshot) {
        match self.pending.take() {
            Some(pending) => self.start(pending, params),
            None => self.deactivate(),
        }
    }

    /// Refresh the per-block values from the parameter snapshot
    fn begin_block(&mut self, params: &ParamSnapshot) {
        let Some(sample) = self.sample.as_ref() else {
            return;
        };
        self.envelope.set_params(params.adsr);

        let note_ratio = semitones_to_ratio(self.note as f64 - params.root_note as f64);
        let rate_ratio = sample.source_sample_rate() / self.sample_rate;

        if self.warp.enabled {
            self.block.step = rate_ratio;
            let pitch = params.pitch_ratio * note_ratio;
            if pitch != self.warp.pitch_sent {
                // Clamps are recorded in the diagnostics
                let _ = self.processor.set_pitch_semitones(ratio_to_semitones(pitch) as f32);
                self.warp.pitch_sent = pitch;
            }
            if params.time_ratio != self.warp.time_sent {
                let _ = self.processor.set_time_ratio(params.time_ratio);
                self.warp.time_sent = params.time_ratio;
            }
        } else {
            self.block.step = params.pitch_ratio * note_ratio * rate_ratio;
        }

        let loop_start = (params.loop_start as f64).max(self.start_point);
        let loop_end = (params.loop_end as f64).min(self.end_point);
        self.block.loop_start = loop_start;
        self.block.loop_end = loop_end;
        self.block.loop_active = params.loop_enabled && !self.released && loop_end - loop_start >= 2.0;
    }

    /// Read the next source frame and advance the playhead
    ///
    /// Returns `None` once the playhead passes the end of the region.
    #[inline]
    fn next_source_frame(&mut self) -> Option<StereoSample> {
        let sample = self.sample.as_ref()?;
        let block = self.block;

        if block.loop_active && self.playhead >= block.loop_end {
            let span = block.loop_end - block.loop_start;
            self.playhead = block.loop_start + (self.playhead - block.loop_end) % span;
        }

        let current = (self.playhead < self.end_point).then(|| {
            let mut frame = sample.read_cubic(self.playhead);
            if !block.loop_active {
                let remaining = (self.end_point - self.playhead) / block.step;
                let tail = self.settings.tail_fade as f64;
                if remaining < tail {
                    frame *= (remaining / tail) as f32;
                }
            }
            frame
        });

        // Crossfade from the old position after a jump
        let mut frame = match (current, self.jump.as_mut()) {
            (current, Some(jump)) => {
                let old = if jump.position < self.end_point {
                    sample.read_cubic(jump.position)
                } else {
                    StereoSample::silence()
                };
                let t = jump.remaining as f32 / jump.length as f32;
                jump.position += block.step;
                jump.remaining -= 1;
                current.unwrap_or_default() * (1.0 - t) + old * t
            }
            (Some(frame), None) => frame,
            (None, None) => return None,
        };
        if self.jump.is_some_and(|jump| jump.remaining == 0) {
            self.jump = None;
        }

        // One-pole low-pass when reading faster than real time
        if block.step > 1.0 {
            let coeff = (1.0 / block.step) as f32;
            self.anti_alias += (frame - self.anti_alias) * coeff;
            frame = self.anti_alias;
        } else {
            self.anti_alias = frame;
        }

        self.playhead += block.step;
        Some(frame)
    }

    /// Pull `frames` frames from the processor into `warp_out`
    ///
    /// Returns `(lead, valid)`: frames before `lead` are silence because the
    /// processor is still priming, frames from `valid` on were not produced.
    fn render_warp(&mut self, frames: usize) -> (usize, usize) {
        let mut out = std::mem::take(&mut self.warp_out);
        let mut input = std::mem::take(&mut self.warp_in);
        let frames = frames.min(out.len());
        let target = &mut out[..frames];
        let time = self.processor.time_ratio();

        let mut produced = 0;
        for _ in 0..MAX_FEED_ROUNDS {
            if produced >= frames || self.warp.drained || input.is_empty() {
                break;
            }
            if self.warp.source_done {
                let n = self.processor.flush(&mut target[produced..]);
                if n == 0 {
                    self.warp.drained = true;
                }
                produced += n;
                continue;
            }

            let want = ((frames - produced) as f64 / time).ceil() as usize;
            let count = want.clamp(1, input.len());
            let mut read = 0;
            while read < count {
                match self.next_source_frame() {
                    Some(frame) => {
                        input[read] = frame;
                        read += 1;
                    }
                    None => {
                        self.warp.source_done = true;
                        break;
                    }
                }
            }
            produced += self.processor.process(&input[..read], &mut target[produced..]);
        }

        let span = if !self.warp.primed {
            if produced == 0 {
                (frames, frames)
            } else {
                // Right-align the first audio so the stream continues
                // seamlessly into the next block
                let lead = frames - produced;
                target.copy_within(0..produced, lead);
                target[..lead].fill(StereoSample::silence());
                self.warp.primed = true;
                (lead, frames)
            }
        } else {
            if produced < frames && !self.warp.source_done {
                self.diagnostics.record_underflow();
            }
            (0, produced)
        };

        self.warp_out = out;
        self.warp_in = input;
        span
    }

    /// Render until the block ends or the source changes; returns frames covered
    fn render_segment(&mut self, out: &mut [StereoSample], params: &ParamSnapshot) -> usize {
        if self.start_delay > 0 {
            let skip = self.start_delay.min(out.len());
            self.start_delay -= skip;
            return skip;
        }

        let mut frames = out.len();
        if let Some(fade) = &self.fade_out {
            frames = frames.min(fade.remaining.max(1));
        }
        let (lead, valid) = if self.warp.enabled {
            self.render_warp(frames)
        } else {
            (0, frames)
        };

        let mut bad = 0u64;
        let mut done = false;
        let mut covered = frames;

        for i in lead..frames {
            if let Some(delay) = self.release_delay {
                if delay == 0 {
                    self.release_now();
                } else {
                    self.release_delay = Some(delay - 1);
                }
            }

            let source = if self.warp.enabled {
                if i >= valid {
                    if self.warp.drained {
                        done = true;
                        covered = i;
                        break;
                    }
                    StereoSample::silence()
                } else {
                    self.warp_out[i]
                }
            } else {
                match self.next_source_frame() {
                    Some(frame) => frame,
                    None => {
                        done = true;
                        covered = i;
                        break;
                    }
                }
            };
            let source = if self.settings.dc_block {
                self.dc.process(source)
            } else {
                source
            };

            let envelope = self.envelope.next();
            let fade_in = if self.fade_in_remaining > 0 {
                let gain = 1.0 - self.fade_in_remaining as f32 / self.settings.fade_in as f32;
                self.fade_in_remaining -= 1;
                gain
            } else {
                1.0
            };
            let fade_out = match self.fade_out.as_mut() {
                Some(fade) => {
                    let gain = fade.remaining as f32 / fade.length as f32;
                    fade.remaining = fade.remaining.saturating_sub(1);
                    gain
                }
                None => 1.0,
            };

            let gain = self.velocity * envelope * fade_in * fade_out;
            self.last_gain = gain;
            let (frame, was_bad) = (source * gain).sanitized();
            bad += was_bad as u64;
            out[i] += frame;

            if !self.envelope.is_active() {
                done = true;
                covered = i + 1;
                break;
            }
        }
        self.diagnostics.record_nan(bad);

        if self.fade_out.is_some_and(|fade| fade.remaining == 0) {
            done = true;
        }
        if done {
            self.end_current(params);
            return covered;
        }
        covered.max(1)
    }

    /// Mix this voice's next `out.len()` frames into `out`
    pub fn render(&mut self, out: &mut [StereoSample], params: &ParamSnapshot) {
        if self.active {
            self.begin_block(params);
            let mut pos = 0;
            while pos < out.len() && self.active {
                pos += self.render_segment(&mut out[pos..], params);
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.atomics.publish(VoiceSnapshot {
            playhead: self.playhead,
            envelope: self.envelope.value(),
            stage: self.envelope.stage(),
            note: self.note,
            input_fill: self.processor.input_fill() as u32,
            output_fill: self.processor.output_fill() as u32,
        });
    }
}
