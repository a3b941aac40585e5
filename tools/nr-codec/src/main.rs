/// nr-codec: B-type noise-reduction encoder/decoder for WAV files.
///
/// Usage:
///   nr-codec encode in.wav out.wav [--filter N] [--upsample N] [--upsample-all]
///                                  [--threshold DB] [--accuracy DB]
///                                  [--cache FILE | --no-cache] [--progress]
///   nr-codec decode in.wav out.wav [same options]
///
/// Input must be 8, 16 or 24-bit integer PCM, mono or stereo. The output keeps
/// the input's format. Calibration results are cached in ~/.libdolbyb unless
/// told otherwise.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use hound::{SampleFormat, WavReader, WavWriter};
use log::info;
use opennr_dsp::{CalibrationCache, Config, FileCache, NoCache, Session};

/// Frames handed to the engine per call.
const BLOCK_FRAMES: usize = 1024;

#[derive(Parser)]
#[command(name = "nr-codec", version, about = "B-type noise reduction for WAV files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply noise-reduction encoding
    Encode(Job),
    /// Remove noise-reduction encoding
    Decode(Job),
}

#[derive(Args)]
struct Job {
    /// Input WAV file
    input: PathBuf,
    /// Output WAV file
    output: PathBuf,
    /// Side-path filter variant (1-4)
    #[arg(short, long, default_value_t = 4)]
    filter: u8,
    /// Sliding-filter upsampling factor, 0 picks one automatically
    #[arg(short, long, default_value_t = 0)]
    upsample: u16,
    /// Run every stage at the upsampled rate
    #[arg(long)]
    upsample_all: bool,
    /// Threshold gain in dB, for material recorded hotter or quieter than reference
    #[arg(short, long, default_value_t = 0.0, allow_negative_numbers = true)]
    threshold: f64,
    /// Decoder accuracy in dB relative to one LSB
    #[arg(short, long, default_value_t = -5.0, allow_negative_numbers = true)]
    accuracy: f64,
    /// Calibration cache file
    #[arg(long, conflicts_with = "no_cache")]
    cache: Option<PathBuf>,
    /// Always calibrate, never read or write a cache
    #[arg(long)]
    no_cache: bool,
    /// Show progress on stderr
    #[arg(long)]
    progress: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Encode,
    Decode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Encode(job) => run(&job, Mode::Encode),
        Commands::Decode(job) => run(&job, Mode::Decode),
    }
}

fn open_cache(job: &Job) -> Box<dyn CalibrationCache> {
    if job.no_cache {
        return Box::new(NoCache);
    }
    match &job.cache {
        Some(path) => Box::new(FileCache::new(path)),
        None => match FileCache::user_default() {
            Some(cache) => Box::new(cache),
            None => Box::new(NoCache),
        },
    }
}

fn run(job: &Job, mode: Mode) -> Result<()> {
    let mut reader = WavReader::open(&job.input)
        .with_context(|| format!("opening {}", job.input.display()))?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int {
        bail!("{}: only integer PCM is supported", job.input.display());
    }

    let config = Config {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        bit_depth: spec.bits_per_sample,
        filter_variant: job.filter,
        upsampling: job.upsample,
        upsample_all: job.upsample_all,
        decode_accuracy_db: job.accuracy,
        threshold_gain_db: job.threshold,
    };
    let cache = open_cache(job);
    let mut session = Session::start(&config, cache.as_ref()).context("starting session")?;

    let samples = reader
        .samples::<i32>()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading {}", job.input.display()))?;

    let mut writer = WavWriter::create(&job.output, spec)
        .with_context(|| format!("creating {}", job.output.display()))?;

    let block = BLOCK_FRAMES * spec.channels as usize;
    let mut out = vec![0; block];
    let blocks = samples.len().div_ceil(block).max(1);
    for (n, chunk) in samples.chunks(block).enumerate() {
        let out = &mut out[..chunk.len()];
        match mode {
            Mode::Encode => session.encode_into(chunk, out),
            Mode::Decode => session.decode_into(chunk, out),
        }
        .with_context(|| format!("processing block {n}"))?;

        for &s in out.iter() {
            writer.write_sample(s).context("writing sample")?;
        }
        if job.progress {
            eprint!("\r{:5.1}%", (n + 1) as f64 * 100.0 / blocks as f64);
            std::io::stderr().flush().ok();
        }
    }
    if job.progress {
        eprintln!();
    }
    writer.finalize().context("finalizing output")?;

    let frames = samples.len() / spec.channels.max(1) as usize;
    info!(
        "{} {frames} frames ({} ch, {}-bit, {} Hz) -> {}",
        if mode == Mode::Encode { "encoded" } else { "decoded" },
        spec.channels,
        spec.bits_per_sample,
        spec.sample_rate,
        job.output.display()
    );
    Ok(())
}
