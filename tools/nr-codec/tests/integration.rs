/// Integration tests for the WAV codec.
///
/// These run the CLI on short clips and check:
/// 1. Format is preserved
/// 2. Encode then decode reproduces the input
/// 3. Encoding is audible (the high band is lifted)
/// 4. Bad settings fail cleanly
/// 5. A fresh calibration lands in the cache file
use std::path::{Path, PathBuf};
use std::process::Command;

use opennr_dsp::cache::format_line;
use opennr_dsp::{CacheKey, Calibration, FilterVariant};

fn cargo_bin() -> Command {
    let mut cmd = Command::new(env!("CARGO"));
    cmd.args(["run", "-q", "-p", "nr-codec", "--"]);
    cmd.env("RUST_LOG", "warn");
    cmd
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("nr-codec-{}-{name}", std::process::id()))
}

/// Cache file holding the nominal constants for every variant at `rate`.
fn nominal_cache(name: &str, rate: u32) -> PathBuf {
    let path = temp_path(name);
    let mut text = String::new();
    for (n, variant) in [
        FilterVariant::Type1,
        FilterVariant::Type2,
        FilterVariant::Type3,
        FilterVariant::Type4,
    ]
    .into_iter()
    .enumerate()
    {
        let key = CacheKey {
            sample_rate: rate,
            variant: n as u8 + 1,
            upsampling: 0,
        };
        text.push_str(&format_line(&key, &Calibration::nominal(variant)));
    }
    std::fs::write(&path, text).expect("failed to write cache");
    path
}

fn write_tone(path: &Path, rate: u32, channels: u16, bits: u16, freq: f64, dbfs: f64, secs: f64) {
    let spec = hound::WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: bits,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("failed to create WAV");
    let amp = ((1i64 << (bits - 1)) - 1) as f64 * 10f64.powf(dbfs / 20.0);
    let frames = (rate as f64 * secs) as usize;
    for i in 0..frames {
        let v = amp * (2.0 * std::f64::consts::PI * freq * i as f64 / rate as f64).sin();
        for _ in 0..channels {
            writer.write_sample(v.round() as i32).expect("failed to write");
        }
    }
    writer.finalize().expect("failed to finalize");
}

fn read_samples(path: &Path) -> (hound::WavSpec, Vec<i32>) {
    let mut reader = hound::WavReader::open(path).expect("invalid WAV file");
    let spec = reader.spec();
    let samples = reader.samples::<i32>().map(|s| s.expect("bad sample")).collect();
    (spec, samples)
}

fn run(mode: &str, input: &Path, output: &Path, cache: &Path, extra: &[&str]) -> bool {
    cargo_bin()
        .arg(mode)
        .arg(input)
        .arg(output)
        .arg("--cache")
        .arg(cache)
        .args(extra)
        .status()
        .expect("failed to run nr-codec")
        .success()
}

fn peak(samples: &[i32]) -> i32 {
    samples.iter().map(|s| s.abs()).max().unwrap_or(0)
}

#[test]
fn test_cli_round_trip_16bit_stereo() {
    let cache = nominal_cache("rt16.cache", 44100);
    let src = temp_path("rt16-src.wav");
    let enc = temp_path("rt16-enc.wav");
    let dec = temp_path("rt16-dec.wav");
    write_tone(&src, 44100, 2, 16, 2000.0, -20.0, 0.5);

    assert!(run("encode", &src, &enc, &cache, &[]), "encode failed");
    assert!(run("decode", &enc, &dec, &cache, &[]), "decode failed");

    let (spec_in, input) = read_samples(&src);
    let (spec_enc, encoded) = read_samples(&enc);
    let (spec_out, decoded) = read_samples(&dec);
    assert_eq!(spec_enc, spec_in);
    assert_eq!(spec_out, spec_in);
    assert_eq!(decoded.len(), input.len());
    assert!(encoded != input, "encoding should change the signal");

    let max_err = input
        .iter()
        .zip(&decoded)
        .map(|(a, b)| (a - b).abs())
        .max()
        .unwrap_or(0);
    assert!(max_err <= 2, "round trip error {max_err} LSB");

    for p in [&cache, &src, &enc, &dec] {
        std::fs::remove_file(p).ok();
    }
}

#[test]
fn test_cli_round_trip_8_and_24_bit() {
    let cache = nominal_cache("rt-depths.cache", 32000);
    for bits in [8u16, 24] {
        let src = temp_path(&format!("rt{bits}-src.wav"));
        let enc = temp_path(&format!("rt{bits}-enc.wav"));
        let dec = temp_path(&format!("rt{bits}-dec.wav"));
        write_tone(&src, 32000, 1, bits, 1000.0, -20.0, 0.25);

        assert!(run("encode", &src, &enc, &cache, &["--filter", "2"]));
        assert!(run("decode", &enc, &dec, &cache, &["--filter", "2"]));

        let (spec, input) = read_samples(&src);
        let (spec_out, decoded) = read_samples(&dec);
        assert_eq!(spec_out.bits_per_sample, bits);
        assert_eq!(spec_out, spec);
        let max_err = input
            .iter()
            .zip(&decoded)
            .map(|(a, b)| (a - b).abs())
            .max()
            .unwrap_or(0);
        assert!(max_err <= 3, "{bits}-bit round trip error {max_err} LSB");

        for p in [&src, &enc, &dec] {
            std::fs::remove_file(p).ok();
        }
    }
    std::fs::remove_file(&cache).ok();
}

#[test]
fn test_cli_encode_lifts_quiet_highs() {
    let cache = nominal_cache("lift.cache", 44100);
    let src = temp_path("lift-src.wav");
    let enc = temp_path("lift-enc.wav");
    write_tone(&src, 44100, 1, 16, 5000.0, -50.0, 0.5);

    assert!(run("encode", &src, &enc, &cache, &[]));
    let (_, input) = read_samples(&src);
    let (_, encoded) = read_samples(&enc);
    let half = input.len() / 2;
    let lift_db = 20.0 * (peak(&encoded[half..]) as f64 / peak(&input[half..]) as f64).log10();
    assert!(lift_db > 3.0, "quiet 5 kHz should be lifted, got {lift_db:.2} dB");

    for p in [&cache, &src, &enc] {
        std::fs::remove_file(p).ok();
    }
}

#[test]
fn test_cli_rejects_bad_filter() {
    let cache = nominal_cache("bad.cache", 44100);
    let src = temp_path("bad-src.wav");
    let out = temp_path("bad-out.wav");
    write_tone(&src, 44100, 1, 16, 1000.0, -20.0, 0.05);

    assert!(!run("encode", &src, &out, &cache, &["--filter", "7"]));
    assert!(!out.exists(), "no output should be written on a config error");

    for p in [&cache, &src] {
        std::fs::remove_file(p).ok();
    }
}

#[test]
fn test_cli_calibrates_into_cache() {
    let cache = temp_path("fresh.cache");
    let _ = std::fs::remove_file(&cache);
    let src = temp_path("fresh-src.wav");
    let enc = temp_path("fresh-enc.wav");
    write_tone(&src, 8000, 1, 16, 1000.0, -20.0, 0.1);

    assert!(run("encode", &src, &enc, &cache, &[]));
    let text = std::fs::read_to_string(&cache).expect("cache file should exist");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1, "one calibration line expected: {text:?}");
    assert!(lines[0].starts_with("SmpSec=8000 FltTyp=4 UpSamp=0 SidAmp="));

    // Second run hits the cache and appends nothing.
    assert!(run("encode", &src, &enc, &cache, &[]));
    assert_eq!(std::fs::read_to_string(&cache).unwrap(), text);

    for p in [&cache, &src, &enc] {
        std::fs::remove_file(p).ok();
    }
}
