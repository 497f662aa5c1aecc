//! Sampler engine - voices, voice pool, limiter and control surface
//!
//! This module contains the real-time side of the sampler:
//! - Voice: one playback slot with envelope, loop/playhead and anti-click ramps
//! - VoiceManager: fixed voice pool with round-robin allocation and stealing
//! - Limiter: post-mix lookahead safety limiter
//! - SamplerEngine / EngineControl: the audio-thread engine and its
//!   lock-free control handle

mod engine;
mod envelope;
pub mod gc;
mod limiter;
mod params;
mod voice;
mod voice_manager;

pub use engine::*;
pub use envelope::*;
pub use limiter::*;
pub use params::*;
pub use voice::*;
pub use voice_manager::*;
