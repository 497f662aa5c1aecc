//! Tessera Core - real-time polyphonic sampler engine
//!
//! MIDI note events become audio through a fixed pool of voices, each with
//! its own envelope and time/pitch processor, mixed on a non-blocking audio
//! callback. See [`engine::SamplerEngine`] for the entry point.

pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod midi;
pub mod ring_buffer;
pub mod sample;
pub mod timestretch;
pub mod types;

pub use types::*;
