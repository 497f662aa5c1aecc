//! Common types for Tessera
//!
//! This module contains the fundamental audio types used throughout the
//! sampler engine: stereo frames, unit conversions and the per-sample
//! safety helpers every output path runs through.

/// Default sample rate used until the host calls `prepare`
pub const DEFAULT_SAMPLE_RATE: f64 = 44100.0;

/// Default maximum block size handed to `prepare`
pub const DEFAULT_MAX_BLOCK: usize = 512;

/// Hard upper bound for any single block (larger host blocks are split)
pub const MAX_BLOCK_FRAMES: usize = 8192;

/// Magnitudes below this are flushed to zero to keep the FPU out of denormals
pub const DENORMAL_FLOOR: f32 = 1e-12;

/// Audio sample type (32-bit float throughout the engine)
pub type Sample = f32;

/// A single stereo frame (left and right channels)
///
/// Uses `#[repr(C)]` to ensure predictable memory layout: [left, right].
/// This enables zero-copy conversion between `&[StereoSample]` and `&[f32]`
/// (interleaved format) using bytemuck, which is what the wrapped stretcher
/// consumes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    /// Create a new stereo sample
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    /// Create a silent stereo sample
    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Create a mono sample (same value in both channels)
    #[inline]
    pub fn mono(value: Sample) -> Self {
        Self { left: value, right: value }
    }

    /// Get the peak amplitude (max of abs(left), abs(right))
    #[inline]
    pub fn peak(&self) -> Sample {
        self.left.abs().max(self.right.abs())
    }

    /// Average of both channels
    #[inline]
    pub fn mono_sum(&self) -> Sample {
        (self.left + self.right) * 0.5
    }

    /// Apply the output safety net to both channels
    ///
    /// See [`sanitize`]. Returns true when a non-finite value was replaced.
    #[inline]
    pub fn sanitized(self) -> (Self, bool) {
        let (left, bad_l) = sanitize(self.left);
        let (right, bad_r) = sanitize(self.right);
        (Self { left, right }, bad_l || bad_r)
    }
}

impl std::ops::Add for StereoSample {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            left: self.left + other.left,
            right: self.right + other.right,
        }
    }
}

impl std::ops::AddAssign for StereoSample {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.left += other.left;
        self.right += other.right;
    }
}

impl std::ops::Sub for StereoSample {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Self {
            left: self.left - other.left,
            right: self.right - other.right,
        }
    }
}

impl std::ops::Mul<Sample> for StereoSample {
    type Output = Self;

    #[inline]
    fn mul(self, factor: Sample) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }
}

impl std::ops::MulAssign<Sample> for StereoSample {
    #[inline]
    fn mul_assign(&mut self, factor: Sample) {
        self.left *= factor;
        self.right *= factor;
    }
}

/// Per-sample safety net
///
/// Non-finite values become 0, magnitudes below [`DENORMAL_FLOOR`] become 0
/// and everything else is hard-clamped to [-1, 1]. The flag reports whether
/// a NaN/Inf was substituted so callers can count it.
#[inline]
pub fn sanitize(x: Sample) -> (Sample, bool) {
    if !x.is_finite() {
        (0.0, true)
    } else if x.abs() < DENORMAL_FLOOR {
        (0.0, false)
    } else {
        (x.clamp(-1.0, 1.0), false)
    }
}

/// Replace a non-finite value with silence (no clamping)
#[inline]
pub fn finite_or_zero(x: Sample) -> Sample {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

/// Convert a semitone offset to a frequency ratio
#[inline]
pub fn semitones_to_ratio(semitones: f64) -> f64 {
    2.0_f64.powf(semitones / 12.0)
}

/// Convert a frequency ratio to a semitone offset
#[inline]
pub fn ratio_to_semitones(ratio: f64) -> f64 {
    12.0 * ratio.log2()
}

/// Convert milliseconds to a whole number of frames at `sample_rate`
#[inline]
pub fn ms_to_frames(ms: f64, sample_rate: f64) -> usize {
    (ms.max(0.0) * 0.001 * sample_rate).round() as usize
}
