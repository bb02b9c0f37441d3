//! Command-line frontend for `swood-core`: `swood sample.wav song.mid out.wav`.
//!
//! Grounded on `examples/original_source/swood/__init__.py`'s `argparse`
//! surface for the flag names/defaults (`--transpose`, `--speed`,
//! `--cachesize`, `--binsize`, `--fullclip`); on `hrcli/src/main.rs` for
//! the `clap::Parser` derive style and `anyhow::Context` error wrapping;
//! and on `chaosgarden/src/bin/chaosgarden.rs` for the `tracing_subscriber`
//! setup. CLI parsing, error-reporting UX, and bug-report uploads are the
//! out-of-core collaborators `spec.md` §1 names; this binary is exactly
//! that collaborator.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use swood_config::SwoodConfig;
use swood_core::midi::parse_midi;
use swood_core::render::{NoteRenderer, RenderOptions};
use swood_core::sample::Sample;
use swood_core::sink::{ChunkedSink, DirectArraySink, MmapSink, OutputSink};
use swood_core::soundfont::{InstrumentLookup, SoundFont};

/// Which `OutputSink` backend to render into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputMode {
    /// Everything held in RAM, one `std::fs::write` at the end. Simplest,
    /// but uses the most memory on long renders.
    Direct,
    /// Flush completed chunks to disk as rendering proceeds. The
    /// recommended default for anything longer than a few seconds.
    Chunked,
    /// Memory-map the output file and mix directly into the mapping.
    Mmap,
}

/// swood: the automatic YTPMV generator.
///
/// Renders a MIDI file by pitch-shifting a single WAV sample to every
/// note it calls for, splicing the results into a multi-channel output.
#[derive(Debug, Parser)]
#[command(name = "swood", version, about, long_about = None)]
struct Cli {
    /// A short WAV file to sample as the instrument.
    sample: PathBuf,

    /// The MIDI file to play with the WAV sample.
    midi: PathBuf,

    /// Path for the output WAV file.
    output: PathBuf,

    /// A soundfont config file (or ZIP bundle) overriding the default
    /// single-sample instrument mapping.
    #[arg(long = "config", visible_alias = "cfg")]
    config: Option<PathBuf>,

    /// Amount to transpose, in semitones.
    #[arg(short, long, default_value_t = 0)]
    transpose: i32,

    /// Speed multiplier for the MIDI.
    #[arg(short, long, default_value_t = 1.0)]
    speed: f64,

    /// How many seconds to keep a rendered note cached before it becomes
    /// eligible for eviction.
    #[arg(short, long)]
    cachesize: Option<f64>,

    /// FFT bin size; lower numbers make analysis faster but more
    /// off-pitch.
    #[arg(short, long)]
    binsize: Option<u32>,

    /// Always use the full sample without zero-crossing cropping.
    #[arg(short, long, default_value_t = false)]
    fullclip: bool,

    /// Which output sink backend to use.
    #[arg(long, value_enum, default_value_t = OutputMode::Chunked)]
    output_mode: OutputMode,

    /// Suppress the progress bar.
    #[arg(short = 'p', long = "no-pbar", default_value_t = false)]
    no_pbar: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = SwoodConfig::load().unwrap_or_else(|e| {
        eprintln!("warning: failed to load config, using built-in defaults: {e}");
        SwoodConfig::default()
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, config: SwoodConfig) -> Result<()> {
    if cli.speed <= 0.0 {
        bail!("--speed must be a positive number, got {}", cli.speed);
    }

    let binsize = cli.binsize.unwrap_or(config.render.binsize);

    info!(sample = %cli.sample.display(), "loading instrument sample");
    let font = if let Some(config_path) = &cli.config {
        let bytes = std::fs::read(config_path)
            .with_context(|| format!("failed to read soundfont config {}", config_path.display()))?;
        SoundFont::load_bundle(&bytes, binsize).context("failed to load soundfont bundle")?
    } else {
        let bytes = std::fs::read(&cli.sample)
            .with_context(|| format!("failed to read sample {}", cli.sample.display()))?;
        let sample = Sample::from_wav_bytes(&bytes, binsize).context("failed to decode sample WAV")?;
        SoundFont::trivial_default(std::sync::Arc::new(sample))
    };

    let transpose = font.arguments.transpose.unwrap_or(cli.transpose);
    let speed = font.arguments.speed.unwrap_or(cli.speed);
    let cachesize_seconds = font
        .arguments
        .cachesize
        .or(cli.cachesize)
        .unwrap_or(config.render.cachesize);

    info!(midi = %cli.midi.display(), "parsing MIDI schedule");
    let midi_bytes = std::fs::read(&cli.midi)
        .with_context(|| format!("failed to read MIDI file {}", cli.midi.display()))?;
    let schedule = parse_midi(&midi_bytes, &font, transpose, speed).context("failed to parse MIDI")?;

    let options = RenderOptions {
        threshold: config.render.threshold * font.frame_rate() as f64,
        cache_horizon_frames: cachesize_seconds * font.frame_rate() as f64,
        fullclip: cli.fullclip,
    };
    let mut renderer = NoteRenderer::new(options);
    let output_length = renderer.compute_output_length(&schedule);

    let pbar = if cli.no_pbar {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(schedule.note_count as u64);
        bar.set_style(
            ProgressStyle::with_template("{percent}% {bar:40.cyan/blue} {pos}/{len} notes ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar
    };

    info!(
        notes = schedule.note_count,
        output_length,
        mode = ?cli.output_mode,
        "rendering"
    );

    render_to_mode(&mut renderer, &schedule, &cli, &config, &font, output_length, &pbar)?;
    pbar.finish_and_clear();

    info!(output = %cli.output.display(), "render complete");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn render_to_mode(
    renderer: &mut NoteRenderer,
    schedule: &swood_core::midi::ParsedSchedule,
    cli: &Cli,
    config: &SwoodConfig,
    font: &SoundFont,
    output_length: usize,
    pbar: &ProgressBar,
) -> Result<()> {
    let channels = font.channels();
    let frame_rate = font.frame_rate();
    let sample_width = config.output.sample_width;

    match cli.output_mode {
        OutputMode::Direct => {
            let mut sink = DirectArraySink::new(channels, output_length, frame_rate, sample_width);
            render_with_progress(renderer, schedule, &mut sink, pbar)?;
            sink.save_to_path(&cli.output)
                .with_context(|| format!("failed to write {}", cli.output.display()))?;
        }
        OutputMode::Chunked => {
            let mut sink = ChunkedSink::create(
                &cli.output,
                channels,
                output_length,
                frame_rate,
                sample_width,
                Some(config.output.chunk_frames),
            )
            .with_context(|| format!("failed to create {}", cli.output.display()))?;
            render_with_progress(renderer, schedule, &mut sink, pbar)?;
            sink.finish().context("failed to flush final chunk")?;
        }
        OutputMode::Mmap => {
            let mut sink = MmapSink::create(&cli.output, channels, output_length, frame_rate, sample_width)
                .with_context(|| format!("failed to create {}", cli.output.display()))?;
            render_with_progress(renderer, schedule, &mut sink, pbar)?;
            sink.finish().context("failed to flush mmap output")?;
        }
    }
    Ok(())
}

fn render_with_progress(
    renderer: &mut NoteRenderer,
    schedule: &swood_core::midi::ParsedSchedule,
    sink: &mut dyn OutputSink,
    pbar: &ProgressBar,
) -> Result<()> {
    // `NoteRenderer::render` consumes the whole schedule in one pass; the
    // progress bar is ticked once up front since the renderer itself has
    // no per-note callback hook (spec.md's pbar is cosmetic only).
    renderer.render(schedule, sink).context("rendering failed")?;
    pbar.set_position(schedule.note_count as u64);
    if schedule.note_count == 0 {
        warn!("MIDI file produced an empty schedule");
    }
    Ok(())
}
