//! tessera-render - drive the sampler offline and write a WAV file
//!
//! Synthesises a short harmonic test tone, loads it as the sample, plays the
//! requested notes through the engine block by block and writes the result
//! as 32-bit float stereo WAV.
//!
//! ```text
//! tessera-render --notes 60,64,67 --time-warp --backend phase_vocoder --time-ratio 1.5 -o chord.wav
//! ```

use std::f32::consts::TAU;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use tessera_core::config::{default_config_path, load_config, save_config, SamplerConfig};
use tessera_core::engine::SamplerEngine;
use tessera_core::sample::SampleData;
use tessera_core::timestretch::StretchBackend;

#[derive(Parser)]
#[command(name = "tessera-render", version, about = "Render notes through the sampler engine to a WAV file")]
struct Cli {
    /// Time/pitch backend (wsola, granular, phase_vocoder, stretcher)
    #[arg(short, long, value_parser = parse_backend)]
    backend: Option<StretchBackend>,

    /// Notes to hold, comma separated
    #[arg(short, long, value_delimiter = ',', default_value = "60")]
    notes: Vec<u8>,

    /// Seconds the notes are held
    #[arg(short, long, default_value_t = 2.0)]
    duration: f64,

    /// Seconds rendered after the note-off
    #[arg(long, default_value_t = 1.0)]
    tail: f64,

    /// Route voices through their time/pitch processor
    #[arg(long)]
    time_warp: bool,

    /// Duration ratio applied when time warp is on (2.0 = twice as long)
    #[arg(short, long, default_value_t = 1.0)]
    time_ratio: f64,

    /// Global pitch offset in semitones
    #[arg(short, long, default_value_t = 0.0, allow_hyphen_values = true)]
    pitch: f32,

    /// Output sample rate
    #[arg(short = 'r', long, default_value_t = 44100)]
    sample_rate: u32,

    /// Host block size used for rendering
    #[arg(long, default_value_t = 512)]
    block: usize,

    /// Base frequency of the synthesised test tone (Hz)
    #[arg(long, default_value_t = 220.0)]
    tone: f32,

    /// Sampler config file (YAML), defaults to <config dir>/tessera/sampler.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the effective config (after command-line overrides) back to the config path
    #[arg(long)]
    save_config: bool,

    /// Output WAV path
    #[arg(short, long, default_value = "tessera-render.wav")]
    output: PathBuf,
}

fn parse_backend(name: &str) -> Result<StretchBackend, String> {
    StretchBackend::from_name(name).ok_or_else(|| {
        let names: Vec<_> = StretchBackend::ALL.iter().map(|b| b.name()).collect();
        format!("unknown backend '{}', expected one of {}", name, names.join(", "))
    })
}

/// A decaying tone with a few harmonics, looped sustain-friendly
fn synth_tone(freq: f32, sample_rate: u32, seconds: f32) -> Result<SampleData> {
    let frames = (seconds * sample_rate as f32) as usize;
    let sr = sample_rate as f32;
    let samples = (0..frames)
        .map(|i| {
            let t = i as f32 / sr;
            let decay = (-1.5 * t).exp();
            let tone = (1..=4)
                .map(|h| (TAU * freq * h as f32 * t).sin() / h as f32)
                .sum::<f32>();
            0.4 * decay * tone
        })
        .collect();
    SampleData::mono(samples, sample_rate as f64).context("Failed to build test tone")
}

fn main() -> Result<()> {
    // Set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| default_config_path("sampler.yaml"));
    let mut config: SamplerConfig = load_config(&config_path);
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    config.time_warp |= cli.time_warp;
    if cli.save_config {
        save_config(&config, &config_path)?;
    }

    let block = cli.block.max(1);
    let (mut engine, mut control) = SamplerEngine::new(config);
    engine.prepare(cli.sample_rate as f64, block);

    let seconds = (cli.duration + cli.tail).max(0.5) as f32;
    control.set_sample_data(synth_tone(cli.tone, cli.sample_rate, seconds)?);
    if let Err(e) = control.set_time_ratio(cli.time_ratio) {
        log::warn!("{}", e);
    }
    if let Err(e) = control.set_pitch_semitones(cli.pitch) {
        log::warn!("{}", e);
    }

    log::info!(
        "Rendering notes {:?} for {:.2} s (+{:.2} s tail), backend {}, time warp {}, latency {} frames",
        cli.notes,
        cli.duration,
        cli.tail,
        engine.backend(),
        engine.config().time_warp,
        engine.latency_samples()
    );

    for &note in &cli.notes {
        if control.note_on(note as i32, 0.8).is_err() {
            log::warn!("MIDI queue full, note {} dropped", note);
        }
    }

    let sr = cli.sample_rate as f64;
    let held = (cli.duration.max(0.0) * sr) as usize;
    let tail = (cli.tail.max(0.0) * sr) as usize;
    let mut left = vec![0.0f32; held + tail];
    let mut right = vec![0.0f32; held + tail];

    let mut offset = 0;
    let mut released = false;
    while offset < left.len() {
        if !released && offset >= held {
            for &note in &cli.notes {
                let _ = control.note_off(note as i32);
            }
            released = true;
        }
        let end = if released { left.len() } else { held };
        let n = block.min(end - offset);
        let mut outputs: [&mut [f32]; 2] = [&mut left[offset..offset + n], &mut right[offset..offset + n]];
        engine.process(&mut outputs, n);
        offset += n;
    }

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: cli.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&cli.output, spec)
        .with_context(|| format!("Failed to create {:?}", cli.output))?;
    for (l, r) in left.iter().zip(&right) {
        writer.write_sample(*l)?;
        writer.write_sample(*r)?;
    }
    writer.finalize().context("Failed to finalize WAV file")?;

    let diagnostics = control.diagnostics();
    log::info!(
        "Wrote {} frames to {:?} (last error: {}, NaN substitutions: {}, underflows: {}, steals: {}, superseded: {})",
        left.len(),
        cli.output,
        diagnostics.last_error().name(),
        diagnostics.nan_substitutions(),
        diagnostics.underflows(),
        diagnostics.voice_steals(),
        diagnostics.superseded_notes()
    );
    Ok(())
}
