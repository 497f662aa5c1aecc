//! Immutable sample data and its lock-free hand-off to the audio thread
//!
//! A [`SampleData`] is built completely on the control thread and never
//! mutated afterwards. It is published through a [`SampleSlot`], which wraps a
//! `basedrop::SharedCell`: the control thread swaps in a new pointer, the
//! audio thread grabs a reference-counted snapshot at note-on. Voices keep
//! their snapshot for their whole life, so a reload never changes a note that
//! is already sounding.

use basedrop::{Shared, SharedCell};
use thiserror::Error;

use crate::engine::gc::gc_handle;
use crate::types::{finite_or_zero, Sample, StereoSample};

/// Errors raised while building sample data
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    #[error("Channel length mismatch: left has {left} frames, right has {right}")]
    ChannelLengthMismatch { left: usize, right: usize },

    #[error("Invalid source sample rate: {0}")]
    InvalidSampleRate(f64),
}

/// Mono or stereo audio at its source sample rate
///
/// `right` is empty for mono material; reads of the right channel then fall
/// back to the left one.
#[derive(Debug, Clone)]
pub struct SampleData {
    left: Vec<Sample>,
    right: Vec<Sample>,
    source_sample_rate: f64,
}

impl SampleData {
    /// Build mono sample data. Non-finite input samples are replaced with 0.
    pub fn mono(samples: Vec<Sample>, source_sample_rate: f64) -> Result<Self, SampleError> {
        Self::stereo(samples, Vec::new(), source_sample_rate)
    }

    /// Build stereo sample data (pass an empty `right` for mono)
    pub fn stereo(
        mut left: Vec<Sample>,
        mut right: Vec<Sample>,
        source_sample_rate: f64,
    ) -> Result<Self, SampleError> {
        if !source_sample_rate.is_finite() || source_sample_rate <= 0.0 {
            return Err(SampleError::InvalidSampleRate(source_sample_rate));
        }
        if !right.is_empty() && right.len() != left.len() {
            return Err(SampleError::ChannelLengthMismatch {
                left: left.len(),
                right: right.len(),
            });
        }

        for s in left.iter_mut().chain(right.iter_mut()) {
            *s = finite_or_zero(*s);
        }

        Ok(Self {
            left,
            right,
            source_sample_rate,
        })
    }

    /// Zero-length placeholder (what the slot holds before anything is loaded)
    pub fn empty() -> Self {
        Self {
            left: Vec::new(),
            right: Vec::new(),
            source_sample_rate: crate::types::DEFAULT_SAMPLE_RATE,
        }
    }

    /// Number of frames
    #[inline]
    pub fn len(&self) -> usize {
        self.left.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    #[inline]
    pub fn is_stereo(&self) -> bool {
        !self.right.is_empty()
    }

    #[inline]
    pub fn channels(&self) -> usize {
        if self.is_stereo() {
            2
        } else {
            1
        }
    }

    #[inline]
    pub fn source_sample_rate(&self) -> f64 {
        self.source_sample_rate
    }

    /// Left (or mono) channel
    pub fn left(&self) -> &[Sample] {
        &self.left
    }

    /// Right channel, or the left one for mono material
    pub fn right(&self) -> &[Sample] {
        if self.is_stereo() {
            &self.right
        } else {
            &self.left
        }
    }

    /// Frame at an integer index; anything outside the data is silence
    #[inline]
    pub fn frame(&self, index: i64) -> StereoSample {
        if index < 0 || index >= self.left.len() as i64 {
            return StereoSample::silence();
        }
        let i = index as usize;
        let left = self.left[i];
        let right = if self.is_stereo() { self.right[i] } else { left };
        StereoSample::new(left, right)
    }

    /// Cubic Catmull-Rom read at a fractional frame position
    ///
    /// Passes through every control point and keeps the first derivative
    /// continuous, which matters for pitched-down playback.
    #[inline]
    pub fn read_cubic(&self, position: f64) -> StereoSample {
        let index = position.floor() as i64;
        let t = (position - position.floor()) as f32;

        let s0 = self.frame(index - 1);
        let s1 = self.frame(index);
        let s2 = self.frame(index + 1);
        let s3 = self.frame(index + 2);

        let t2 = t * t;
        let t3 = t2 * t;
        let c0 = -0.5 * t3 + t2 - 0.5 * t;
        let c1 = 1.5 * t3 - 2.5 * t2 + 1.0;
        let c2 = -1.5 * t3 + 2.0 * t2 + 0.5 * t;
        let c3 = 0.5 * t3 - 0.5 * t2;

        StereoSample {
            left: s0.left * c0 + s1.left * c1 + s2.left * c2 + s3.left * c3,
            right: s0.right * c0 + s1.right * c1 + s2.right * c2 + s3.right * c3,
        }
    }
}

/// Reference-counted, RT-droppable handle to sample data
pub type SampleDataPtr = Shared<SampleData>;

/// Wrap sample data for publishing (allocates; control thread only)
pub fn share_sample(data: SampleData) -> SampleDataPtr {
    Shared::new(&gc_handle(), data)
}

/// Atomic publication point for the current sample
///
/// `store` is called from the control thread after the data is fully built;
/// `load` is called from the audio thread and only bumps a reference count.
pub struct SampleSlot {
    cell: SharedCell<SampleData>,
}

impl SampleSlot {
    /// Slot holding an empty placeholder
    pub fn new() -> Self {
        Self {
            cell: SharedCell::new(share_sample(SampleData::empty())),
        }
    }

    /// Publish new sample data (control thread)
    pub fn store(&self, data: SampleData) {
        self.store_shared(share_sample(data));
    }

    /// Publish an already shared pointer (control thread)
    ///
    /// The previous pointer is dropped here, on the calling thread; if a
    /// voice still holds it the memory is reclaimed by the collector later.
    pub fn store_shared(&self, data: SampleDataPtr) {
        self.cell.set(data);
    }

    /// Replace the current sample with the empty placeholder
    pub fn clear(&self) {
        self.store(SampleData::empty());
    }

    /// Snapshot the current sample (audio thread, wait-free for readers)
    #[inline]
    pub fn load(&self) -> SampleDataPtr {
        self.cell.get()
    }
}

impl Default for SampleSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_reads_mirror_left() {
        let data = SampleData::mono(vec![0.1, 0.2, 0.3], 48000.0).unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data.channels(), 1);
        assert_eq!(data.frame(1), StereoSample::new(0.2, 0.2));
        assert_eq!(data.frame(-1), StereoSample::silence());
        assert_eq!(data.frame(3), StereoSample::silence());
        assert_eq!(data.right(), data.left());
    }

    #[test]
    fn test_stereo_length_mismatch_rejected() {
        let err = SampleData::stereo(vec![0.0; 4], vec![0.0; 3], 44100.0).unwrap_err();
        assert_eq!(err, SampleError::ChannelLengthMismatch { left: 4, right: 3 });
    }

    #[test]
    fn test_invalid_rate_rejected() {
        assert!(SampleData::mono(vec![0.0], 0.0).is_err());
        assert!(SampleData::mono(vec![0.0], f64::NAN).is_err());
    }

    #[test]
    fn test_non_finite_input_is_zeroed() {
        let data = SampleData::stereo(vec![f32::NAN, 0.5], vec![0.25, f32::INFINITY], 44100.0).unwrap();
        assert_eq!(data.frame(0), StereoSample::new(0.0, 0.25));
        assert_eq!(data.frame(1), StereoSample::new(0.5, 0.0));
    }

    #[test]
    fn test_cubic_hits_control_points() {
        let data = SampleData::mono(vec![0.0, 1.0, 0.0, -1.0, 0.0], 44100.0).unwrap();
        for i in 0..5 {
            let expected = data.frame(i).left;
            assert!((data.read_cubic(i as f64).left - expected).abs() < 1e-6);
        }
        let mid = data.read_cubic(1.5).left;
        assert!(mid > -1.0 && mid < 1.0);
    }

    #[test]
    fn test_slot_swap_does_not_affect_held_snapshot() {
        let slot = SampleSlot::new();
        assert!(slot.load().is_empty());

        slot.store(SampleData::mono(vec![0.5; 10], 44100.0).unwrap());
        let held = slot.load();
        assert_eq!(held.len(), 10);

        slot.store(SampleData::mono(vec![0.25; 20], 44100.0).unwrap());
        assert_eq!(held.len(), 10);
        assert_eq!(held.frame(0).left, 0.5);
        assert_eq!(slot.load().len(), 20);

        slot.clear();
        assert!(slot.load().is_empty());
    }
}
