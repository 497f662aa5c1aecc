//! Per-engine diagnostics and parameter errors
//!
//! Nothing in the sampler core is fatal. Bad parameters are clamped, starved
//! processors return fewer frames, NaNs are replaced with silence and an
//! exhausted voice pool steals. Each of those events is recorded here so the
//! control thread can read it back without ever blocking the audio thread.
//!
//! One `Diagnostics` instance belongs to one engine and is shared by `Arc`
//! with every voice's time/pitch processor and with the control handle.
//! `last_error` only keeps the most recent code; the counters accumulate.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use thiserror::Error;

/// Diagnostic error codes (stored as `u8` in an atomic)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0,
    InvalidPitchRatio = 1,
    InvalidTimeRatio = 2,
    InvalidEnvelope = 3,
    InvalidLoop = 4,
    InvalidGain = 5,
    NonFiniteSample = 6,
    BufferUnderflow = 7,
    QueueFull = 8,
    FftFailure = 9,
}

impl ErrorCode {
    /// Decode a stored code; unknown values map to `None`
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::InvalidPitchRatio,
            2 => Self::InvalidTimeRatio,
            3 => Self::InvalidEnvelope,
            4 => Self::InvalidLoop,
            5 => Self::InvalidGain,
            6 => Self::NonFiniteSample,
            7 => Self::BufferUnderflow,
            8 => Self::QueueFull,
            9 => Self::FftFailure,
            _ => Self::None,
        }
    }

    /// Short human-readable label
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::InvalidPitchRatio => "invalid pitch ratio",
            Self::InvalidTimeRatio => "invalid time ratio",
            Self::InvalidEnvelope => "invalid envelope",
            Self::InvalidLoop => "invalid loop",
            Self::InvalidGain => "invalid gain",
            Self::NonFiniteSample => "non-finite sample",
            Self::BufferUnderflow => "buffer underflow",
            Self::QueueFull => "queue full",
            Self::FftFailure => "fft failure",
        }
    }
}

/// A parameter was rejected and replaced by a safe value
///
/// Setters always apply the replacement; the error only reports that the
/// requested value was not used verbatim.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum ParamError {
    #[error("pitch ratio {requested} is invalid, using {applied}")]
    PitchRatio { requested: f64, applied: f64 },

    #[error("time ratio {requested} is invalid, using {applied}")]
    TimeRatio { requested: f64, applied: f64 },

    #[error("envelope parameter {name} = {requested} is invalid, using {applied}")]
    Envelope {
        name: &'static str,
        requested: f64,
        applied: f64,
    },

    #[error("loop region {start}..{end} is invalid")]
    Loop { start: u64, end: u64 },

    #[error("playback region {start}..{end} is invalid, playing the whole sample")]
    Region { start: u64, end: u64 },

    #[error("gain {requested} is invalid, using {applied}")]
    Gain { requested: f64, applied: f64 },
}

impl ParamError {
    /// Diagnostic code this error is recorded under
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::PitchRatio { .. } => ErrorCode::InvalidPitchRatio,
            Self::TimeRatio { .. } => ErrorCode::InvalidTimeRatio,
            Self::Envelope { .. } => ErrorCode::InvalidEnvelope,
            Self::Loop { .. } | Self::Region { .. } => ErrorCode::InvalidLoop,
            Self::Gain { .. } => ErrorCode::InvalidGain,
        }
    }
}

/// Clamp a ratio into `[min, max]`
///
/// Non-finite or non-positive inputs fall back to `default` (which must lie
/// inside the bounds). Returns the value to apply and whether it differs from
/// the request.
pub fn clamp_ratio(requested: f64, min: f64, max: f64, default: f64) -> (f64, bool) {
    if !requested.is_finite() || requested <= 0.0 {
        (default, true)
    } else if requested < min {
        (min, true)
    } else if requested > max {
        (max, true)
    } else {
        (requested, false)
    }
}

/// Lock-free diagnostics shared between the audio and control threads
#[derive(Debug, Default)]
pub struct Diagnostics {
    last_error: AtomicU8,
    error_count: AtomicU64,
    nan_substitutions: AtomicU64,
    underflows: AtomicU64,
    dropped_events: AtomicU64,
    voice_steals: AtomicU64,
    superseded_notes: AtomicU64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error code (overwrites the previous one)
    #[inline]
    pub fn record(&self, code: ErrorCode) {
        self.last_error.store(code as u8, Ordering::Relaxed);
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a parameter error and hand it back for `?`-style propagation
    #[inline]
    pub fn record_param(&self, err: ParamError) -> ParamError {
        self.record(err.code());
        err
    }

    /// Count NaN/Inf substitutions found in one pass
    #[inline]
    pub fn record_nan(&self, count: u64) {
        if count > 0 {
            self.nan_substitutions.fetch_add(count, Ordering::Relaxed);
            self.record(ErrorCode::NonFiniteSample);
        }
    }

    /// A processor returned fewer frames than requested outside of priming
    #[inline]
    pub fn record_underflow(&self) {
        self.underflows.fetch_add(1, Ordering::Relaxed);
        self.last_error
            .store(ErrorCode::BufferUnderflow as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
        self.record(ErrorCode::QueueFull);
    }

    #[inline]
    pub fn record_steal(&self) {
        self.voice_steals.fetch_add(1, Ordering::Relaxed);
    }

    /// A deferred note was replaced by a newer one before it could start
    #[inline]
    pub fn record_superseded(&self) {
        self.superseded_notes.fetch_add(1, Ordering::Relaxed);
    }

    /// Most recent error code
    pub fn last_error(&self) -> ErrorCode {
        ErrorCode::from_u8(self.last_error.load(Ordering::Relaxed))
    }

    /// Reset `last_error` to `None`, returning the previous code
    pub fn take_last_error(&self) -> ErrorCode {
        ErrorCode::from_u8(self.last_error.swap(ErrorCode::None as u8, Ordering::Relaxed))
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn nan_substitutions(&self) -> u64 {
        self.nan_substitutions.load(Ordering::Relaxed)
    }

    pub fn underflows(&self) -> u64 {
        self.underflows.load(Ordering::Relaxed)
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn voice_steals(&self) -> u64 {
        self.voice_steals.load(Ordering::Relaxed)
    }

    pub fn superseded_notes(&self) -> u64 {
        self.superseded_notes.load(Ordering::Relaxed)
    }
}
