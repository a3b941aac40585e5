/// NR Bench: measurement CLI for the noise-reduction engine.
///
/// Usage:
///   nr-bench calibrate [--rate R] [--filter N] [--upsample N] [--nominal] [--quick]
///                      [--cache FILE | --no-cache]
///   nr-bench response  [--rate R] [--filter N] [--freq F] [--from DB] [--to DB] [--step DB]
///                      [--threshold DB] [--calibrate]
///   nr-bench roundtrip [--rate R] [--filter N] [--bits B] [--freq F] [--level DB]
///                      [--duration S] [--accuracy DB] [--calibrate]

use std::f64::consts::PI;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use opennr_dsp::cache::format_line;
use opennr_dsp::calibrate::Calibrator;
use opennr_dsp::fixed::{VOLT, db_to_gain};
use opennr_dsp::side_path::SidePath;
use opennr_dsp::{
    CacheKey, Calibration, CalibrationCache, CalibrationPlan, Config, FileCache, MemoryCache,
    NoCache, Session, Settings,
};

/// Calibration reference level, 17.5 mV RMS.
const REFERENCE_VOLTS: f64 = 0.0175;

#[derive(Parser)]
#[command(name = "nr-bench", version, about = "Noise-reduction engine measurements")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Calibrate the side path and print the cache line
    Calibrate(CalibrateArgs),
    /// Encoder gain against input level at one frequency
    Response(ResponseArgs),
    /// Encode then decode a tone and report the error
    Roundtrip(RoundtripArgs),
}

#[derive(Args)]
struct Target {
    /// Sample rate in Hz
    #[arg(short, long, default_value_t = 44100)]
    rate: u32,
    /// Side-path filter variant (1-4)
    #[arg(short, long, default_value_t = 4)]
    filter: u8,
    /// Sliding-filter upsampling factor, 0 picks one automatically
    #[arg(short, long, default_value_t = 0)]
    upsample: u16,
}

impl Target {
    fn config(&self) -> Config {
        Config {
            sample_rate: self.rate,
            filter_variant: self.filter,
            upsampling: self.upsample,
            ..Config::default()
        }
    }

    fn settings(&self) -> Result<Settings> {
        Ok(self.config().validate()?)
    }
}

#[derive(Args)]
struct CalibrateArgs {
    #[command(flatten)]
    target: Target,
    /// Print the built-in constants instead of measuring
    #[arg(long)]
    nominal: bool,
    /// Short measurement windows (less accurate)
    #[arg(long)]
    quick: bool,
    /// Store the result in this cache file
    #[arg(long, conflicts_with = "no_cache")]
    cache: Option<PathBuf>,
    /// Do not touch the user cache
    #[arg(long)]
    no_cache: bool,
}

#[derive(Args)]
struct ResponseArgs {
    #[command(flatten)]
    target: Target,
    /// Tone frequency in Hz
    #[arg(long, default_value_t = 1000.0)]
    freq: f64,
    /// Lowest level, dB relative to the reference level
    #[arg(long, default_value_t = -60.0, allow_negative_numbers = true)]
    from: f64,
    /// Highest level, dB relative to the reference level
    #[arg(long, default_value_t = 10.0, allow_negative_numbers = true)]
    to: f64,
    #[arg(long, default_value_t = 10.0)]
    step: f64,
    /// Threshold gain in dB, applied after calibration
    #[arg(short, long, default_value_t = 0.0, allow_negative_numbers = true)]
    threshold: f64,
    /// Calibrate first instead of using the built-in constants
    #[arg(long)]
    calibrate: bool,
}

#[derive(Args)]
struct RoundtripArgs {
    #[command(flatten)]
    target: Target,
    /// Bit depth (8, 16 or 24)
    #[arg(short, long, default_value_t = 16)]
    bits: u16,
    #[arg(long, default_value_t = 3000.0)]
    freq: f64,
    /// Tone level in dBFS
    #[arg(long, default_value_t = -20.0, allow_negative_numbers = true)]
    level: f64,
    /// Seconds of audio
    #[arg(long, default_value_t = 2.0)]
    duration: f64,
    /// Decoder accuracy in dB relative to one LSB
    #[arg(short, long, default_value_t = -5.0, allow_negative_numbers = true)]
    accuracy: f64,
    /// Calibrate first instead of using the built-in constants
    #[arg(long)]
    calibrate: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Commands::Calibrate(args) => cmd_calibrate(&args),
        Commands::Response(args) => cmd_response(&args),
        Commands::Roundtrip(args) => cmd_roundtrip(&args),
    }
}

fn quick_plan() -> CalibrationPlan {
    CalibrationPlan {
        side_gain_warmup: 0,
        side_gain_window: 1,
        source_warmup: 1,
        source_window: 1,
    }
}

fn calibration_for(settings: &Settings, calibrate: bool) -> Result<Calibration> {
    if calibrate {
        Ok(Calibrator::new(settings, CalibrationPlan::default())?.run())
    } else {
        Ok(Calibration::nominal(settings.variant))
    }
}

fn cmd_calibrate(args: &CalibrateArgs) -> Result<()> {
    let settings = args.target.settings()?;
    let key = CacheKey::for_settings(&settings);

    let calibration = if args.nominal {
        Calibration::nominal(settings.variant)
    } else {
        let plan = if args.quick {
            quick_plan()
        } else {
            CalibrationPlan::default()
        };
        let calibration = Calibrator::new(&settings, plan)?.run();

        let cache: Box<dyn CalibrationCache> = match (&args.cache, args.no_cache) {
            (_, true) => Box::new(NoCache),
            (Some(path), false) => Box::new(FileCache::new(path)),
            (None, false) => match FileCache::user_default() {
                Some(cache) => Box::new(cache),
                None => Box::new(NoCache),
            },
        };
        cache
            .store(&key, &calibration)
            .context("storing calibration")?;
        calibration
    };

    let nominal = Calibration::nominal(settings.variant);
    print!("{}", format_line(&key, &calibration));
    println!(
        "  side gain  {:+.6} vs nominal",
        calibration.side_gain - nominal.side_gain
    );
    println!(
        "  source     {:+.3} mV vs nominal",
        (calibration.source_volts - nominal.source_volts) as f64 / 1e6
    );
    Ok(())
}

/// Sums of |x| and |y| over the second half of `n` samples of a tone through `side`.
fn tone_levels(side: &SidePath, passes: u32, rate: f64, freq: f64, amp: f64, n: usize) -> (f64, f64) {
    let mut state = side.new_channel();
    let (mut sum_in, mut sum_out) = (0.0, 0.0);
    for i in 0..n {
        let x = (amp * (2.0 * PI * freq * i as f64 / rate).sin()).round() as i64;
        let y = side.encode(&mut state, x, passes);
        if i >= n / 2 {
            sum_in += x.unsigned_abs() as f64;
            sum_out += y.unsigned_abs() as f64;
        }
    }
    (sum_in, sum_out)
}

fn cmd_response(args: &ResponseArgs) -> Result<()> {
    let settings = args.target.settings()?;
    let calibration = calibration_for(&settings, args.calibrate)?;
    let mut side = SidePath::new(&settings, &calibration)?;
    side.set_threshold_gain(db_to_gain(args.threshold));
    let rate = settings.sample_rate as f64;
    let n = settings.sample_rate as usize;

    println!(
        "Encoder response at {:.0} Hz, {} Hz, variant {}, threshold {:+.1} dB",
        args.freq,
        settings.sample_rate,
        side.variant().number(),
        args.threshold
    );
    println!("{:>10} {:>10}", "level dB", "gain dB");

    let peak = REFERENCE_VOLTS * std::f64::consts::SQRT_2 * VOLT as f64;
    let mut level = args.from;
    while level <= args.to + 1e-9 {
        let amp = peak * 10f64.powf(level / 20.0);
        let (sum_in, sum_out) = tone_levels(&side, settings.input_passes(), rate, args.freq, amp, n);
        let gain = if sum_in > 0.0 {
            20.0 * (sum_out / sum_in).log10()
        } else {
            0.0
        };
        println!("{level:>10.1} {gain:>10.2}");
        level += args.step.max(0.1);
    }
    Ok(())
}

fn cmd_roundtrip(args: &RoundtripArgs) -> Result<()> {
    let config = Config {
        bit_depth: args.bits,
        decode_accuracy_db: args.accuracy,
        ..args.target.config()
    };
    let settings = config.validate()?;
    let calibration = calibration_for(&settings, args.calibrate)?;
    let cache = MemoryCache::with_entries([(CacheKey::for_settings(&settings), calibration)]);

    let mut encoder = Session::start(&config, &cache)?;
    let mut decoder = Session::start(&config, &cache)?;

    let full = settings.bit_depth.max() as f64;
    let amp = full * 10f64.powf(args.level / 20.0);
    let rate = settings.sample_rate as f64;
    let n = (rate * args.duration) as usize;
    let input: Vec<i32> = (0..n)
        .map(|i| (amp * (2.0 * PI * args.freq * i as f64 / rate).sin()).round() as i32)
        .collect();

    let encoded = encoder.encode(&input)?;
    let decoded = decoder.decode(&encoded)?;

    let mut max_err = 0i64;
    let mut sum_err = 0i64;
    for (a, b) in input.iter().zip(&decoded) {
        let e = (*a as i64 - *b as i64).abs();
        max_err = max_err.max(e);
        sum_err += e;
    }
    let changed = input.iter().zip(&encoded).filter(|(a, b)| a != b).count();

    info!("{n} samples, {changed} changed by encoding");
    println!(
        "{}-bit {} Hz variant {}: max error {max_err} LSB, mean {:.3} LSB",
        args.bits,
        settings.sample_rate,
        settings.variant.number(),
        sum_err as f64 / n.max(1) as f64
    );
    Ok(())
}
