//! Lock-free global parameters and per-voice read-back
//!
//! The control thread writes scalars here at any time; the audio thread
//! takes one [`ParamSnapshot`] at the top of each block. Every field is its
//! own atomic with relaxed ordering: a block may see a mix of old and new
//! values while the control thread is mid-update, which is harmless because
//! the next block reads them again.
//!
//! [`VoiceAtomics`] goes the other way: the audio thread publishes each
//! voice's playhead and envelope once per block for visualisation.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use super::envelope::{AdsrParams, EnvelopeStage};

/// Region end marker meaning "to the end of the sample"
pub const REGION_END_OF_SAMPLE: u64 = u64::MAX;

/// `f32` stored in an `AtomicU32`
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// `f64` stored in an `AtomicU64`
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Values the audio thread reads once per block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSnapshot {
    pub gain: f32,
    pub adsr: AdsrParams,
    pub loop_enabled: bool,
    pub loop_start: u64,
    pub loop_end: u64,
    pub region_start: u64,
    pub region_end: u64,
    pub root_note: u8,
    pub pitch_ratio: f64,
    pub time_ratio: f64,
    pub time_warp: bool,
}

impl Default for ParamSnapshot {
    fn default() -> Self {
        Self {
            gain: 1.0,
            adsr: AdsrParams::default(),
            loop_enabled: false,
            loop_start: 0,
            loop_end: 0,
            region_start: 0,
            region_end: REGION_END_OF_SAMPLE,
            root_note: 60,
            pitch_ratio: 1.0,
            time_ratio: 1.0,
            time_warp: false,
        }
    }
}

/// Scalars shared between the control and audio threads
///
/// Values stored here are already validated by `EngineControl`.
#[derive(Debug)]
pub struct EngineParams {
    pub gain: AtomicF32,
    pub attack_ms: AtomicF32,
    pub decay_ms: AtomicF32,
    pub sustain: AtomicF32,
    pub release_ms: AtomicF32,
    pub loop_enabled: AtomicBool,
    pub loop_start: AtomicU64,
    pub loop_end: AtomicU64,
    pub region_start: AtomicU64,
    pub region_end: AtomicU64,
    pub root_note: AtomicU8,
    pub pitch_ratio: AtomicF64,
    pub time_ratio: AtomicF64,
    pub time_warp: AtomicBool,
}

impl EngineParams {
    pub fn new(initial: ParamSnapshot) -> Self {
        Self {
            gain: AtomicF32::new(initial.gain),
            attack_ms: AtomicF32::new(initial.adsr.attack_ms),
            decay_ms: AtomicF32::new(initial.adsr.decay_ms),
            sustain: AtomicF32::new(initial.adsr.sustain),
            release_ms: AtomicF32::new(initial.adsr.release_ms),
            loop_enabled: AtomicBool::new(initial.loop_enabled),
            loop_start: AtomicU64::new(initial.loop_start),
            loop_end: AtomicU64::new(initial.loop_end),
            region_start: AtomicU64::new(initial.region_start),
            region_end: AtomicU64::new(initial.region_end),
            root_note: AtomicU8::new(initial.root_note),
            pitch_ratio: AtomicF64::new(initial.pitch_ratio),
            time_ratio: AtomicF64::new(initial.time_ratio),
            time_warp: AtomicBool::new(initial.time_warp),
        }
    }

    pub fn set_adsr(&self, adsr: AdsrParams) {
        self.attack_ms.store(adsr.attack_ms);
        self.decay_ms.store(adsr.decay_ms);
        self.sustain.store(adsr.sustain);
        self.release_ms.store(adsr.release_ms);
    }

    pub fn set_loop(&self, enabled: bool, start: u64, end: u64) {
        self.loop_start.store(start, Ordering::Relaxed);
        self.loop_end.store(end, Ordering::Relaxed);
        self.loop_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_region(&self, start: u64, end: u64) {
        self.region_start.store(start, Ordering::Relaxed);
        self.region_end.store(end, Ordering::Relaxed);
    }

    /// Read every value (audio thread, once per block)
    pub fn snapshot(&self) -> ParamSnapshot {
        ParamSnapshot {
            gain: self.gain.load(),
            adsr: AdsrParams {
                attack_ms: self.attack_ms.load(),
                decay_ms: self.decay_ms.load(),
                sustain: self.sustain.load(),
                release_ms: self.release_ms.load(),
            },
            loop_enabled: self.loop_enabled.load(Ordering::Relaxed),
            loop_start: self.loop_start.load(Ordering::Relaxed),
            loop_end: self.loop_end.load(Ordering::Relaxed),
            region_start: self.region_start.load(Ordering::Relaxed),
            region_end: self.region_end.load(Ordering::Relaxed),
            root_note: self.root_note.load(Ordering::Relaxed),
            pitch_ratio: self.pitch_ratio.load(),
            time_ratio: self.time_ratio.load(),
            time_warp: self.time_warp.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineParams {
    fn default() -> Self {
        Self::new(ParamSnapshot::default())
    }
}

/// Per-voice state published by the audio thread for visualisation
///
/// Eventually consistent: fields are updated one by one at the end of every
/// block, so a reader may see values from two neighbouring blocks.
#[derive(Debug, Default)]
pub struct VoiceAtomics {
    playhead: AtomicF64,
    envelope: AtomicF32,
    stage: AtomicU8,
    note: AtomicU8,
    input_fill: AtomicU32,
    output_fill: AtomicU32,
}

/// Plain copy of a voice's published state
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VoiceSnapshot {
    /// Fractional frame position in the source sample
    pub playhead: f64,
    pub envelope: f32,
    pub stage: EnvelopeStage,
    pub note: u8,
    /// Frames buffered at the input of the time/pitch processor
    pub input_fill: u32,
    /// Frames ready at its output
    pub output_fill: u32,
}

impl VoiceAtomics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn publish(&self, snapshot: VoiceSnapshot) {
        self.playhead.store(snapshot.playhead);
        self.envelope.store(snapshot.envelope);
        self.stage.store(snapshot.stage as u8, Ordering::Relaxed);
        self.note.store(snapshot.note, Ordering::Relaxed);
        self.input_fill.store(snapshot.input_fill, Ordering::Relaxed);
        self.output_fill.store(snapshot.output_fill, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> VoiceSnapshot {
        VoiceSnapshot {
            playhead: self.playhead.load(),
            envelope: self.envelope.load(),
            stage: EnvelopeStage::from_u8(self.stage.load(Ordering::Relaxed)),
            note: self.note.load(Ordering::Relaxed),
            input_fill: self.input_fill.load(Ordering::Relaxed),
            output_fill: self.output_fill.load(Ordering::Relaxed),
        }
    }

    /// Playhead position (lock-free)
    #[inline]
    pub fn playhead(&self) -> f64 {
        self.playhead.load()
    }

    /// Envelope value (lock-free)
    #[inline]
    pub fn envelope(&self) -> f32 {
        self.envelope.load()
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.stage.load(Ordering::Relaxed) != EnvelopeStage::Idle as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_atomic_floats_roundtrip() {
        let a = AtomicF32::new(0.25);
        a.store(-3.5);
        assert_eq!(a.load(), -3.5);

        let b = AtomicF64::new(1.0);
        b.store(12345.678);
        assert_eq!(b.load(), 12345.678);
    }

    #[test]
    fn test_snapshot_reflects_updates() {
        let params = EngineParams::default();
        params.gain.store(0.5);
        params.set_adsr(AdsrParams::new(1.0, 2.0, 0.3, 4.0));
        params.set_loop(true, 100, 200);
        params.time_warp.store(true, Ordering::Relaxed);

        let snap = params.snapshot();
        assert_eq!(snap.gain, 0.5);
        assert_eq!(snap.adsr, AdsrParams::new(1.0, 2.0, 0.3, 4.0));
        assert!(snap.loop_enabled);
        assert_eq!((snap.loop_start, snap.loop_end), (100, 200));
        assert_eq!(snap.region_end, REGION_END_OF_SAMPLE);
        assert!(snap.time_warp);
    }

    #[test]
    fn test_voice_atomics_across_threads() {
        let atomics = Arc::new(VoiceAtomics::new());
        let writer = atomics.clone();
        std::thread::spawn(move || {
            writer.publish(VoiceSnapshot {
                playhead: 441.5,
                envelope: 0.75,
                stage: EnvelopeStage::Sustain,
                note: 64,
                input_fill: 10,
                output_fill: 20,
            });
        })
        .join()
        .unwrap();

        let snap = atomics.snapshot();
        assert_eq!(snap.playhead, 441.5);
        assert_eq!(snap.stage, EnvelopeStage::Sustain);
        assert!(atomics.is_active());
    }
}
