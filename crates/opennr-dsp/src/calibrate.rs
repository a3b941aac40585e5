/// Calibration: derive the side-path gain and FET source voltage for a
/// sample rate, filter variant and upsampling factor.
///
/// Both constants are found by running a 5 kHz test tone through the encoder
/// and matching its mean output level against targets set relative to the
/// tone's own level:
///   side gain     FET clamped off, output 10 dB above the tone
///   source volts  FET free, output 8 dB above the tone
///
/// Each search is a false-position iteration over a fixed bracket that stops
/// once two consecutive trials measure the same level.

use log::{debug, info, warn};

use crate::cache::{CacheKey, CalibrationCache};
use crate::config::{FilterVariant, Settings};
use crate::error::NrResult;
use crate::fixed::{VOLT, alloc_table, db_to_gain, mul_div};
use crate::side_path::SidePath;

/// Calibrated circuit constants.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Calibration {
    /// Gain into the side path.
    pub side_gain: f64,
    /// FET source voltage in nanovolts.
    pub source_volts: i64,
}

impl Calibration {
    /// Constants calibrated at 44.1 kHz with automatic upsampling.
    pub fn nominal(variant: FilterVariant) -> Self {
        let (side_gain, source_volts) = match variant {
            FilterVariant::Type1 => (3.339_475_631_7, 11_526_914_565),
            FilterVariant::Type2 => (3.326_810_359_9, 11_455_997_405),
            FilterVariant::Type3 => (3.339_475_631_7, 11_526_914_535),
            FilterVariant::Type4 => (2.476_506_233_2, 11_490_770_993),
        };
        Self {
            side_gain,
            source_volts,
        }
    }

    /// Whether both constants sit near the range the searches cover. Anything
    /// else came from a damaged cache and would break the fixed-point stages.
    pub fn is_plausible(&self) -> bool {
        let (gain_low, gain_high) = SIDE_GAIN_BRACKET;
        let (source_low, source_high) = SOURCE_BRACKET;
        self.side_gain.is_finite()
            && self.side_gain >= gain_low / 2.0
            && self.side_gain <= gain_high * 2.0
            && self.source_volts >= source_low - VOLT
            && self.source_volts <= source_high + VOLT
    }
}

// ── Search constants ──

const TONE_HZ: u32 = 5000;
/// Test tone RMS in millivolts.
const TONE_MV_RMS: f64 = 17.5;

const SIDE_GAIN_TARGET_DB: f64 = 10.0;
const SOURCE_TARGET_DB: f64 = 8.0;

const SIDE_GAIN_BRACKET: (f64, f64) = (2.3, 4.5);
const SOURCE_BRACKET: (i64, i64) = (11_250_000_000, 11_510_000_000);

/// Trials per search before giving up on convergence.
const MAX_TRIALS: u32 = 64;

/// Test lengths in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CalibrationPlan {
    pub side_gain_warmup: u32,
    pub side_gain_window: u32,
    pub source_warmup: u32,
    pub source_window: u32,
}

impl Default for CalibrationPlan {
    fn default() -> Self {
        Self {
            side_gain_warmup: 0,
            side_gain_window: 5,
            source_warmup: 2,
            source_window: 5,
        }
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// One exact period of the 5 kHz tone at the session rate.
struct TestTone {
    table: Vec<i64>,
}

impl TestTone {
    fn new(sample_rate: u32) -> NrResult<Self> {
        let len = (sample_rate / gcd(sample_rate, TONE_HZ)) as usize;
        let amp = TONE_MV_RMS * std::f64::consts::SQRT_2 * VOLT as f64 / 1000.0;
        let mut table = alloc_table(len, "test tone")?;
        for (k, entry) in table.iter_mut().enumerate() {
            let phase = 2.0 * std::f64::consts::PI * TONE_HZ as f64 * k as f64 / sample_rate as f64;
            *entry = (phase.sin() * amp).round() as i64;
        }
        Ok(Self { table })
    }

    fn samples(&self) -> impl Iterator<Item = i64> + '_ {
        self.table.iter().copied().cycle()
    }
}

pub struct Calibrator {
    settings: Settings,
    plan: CalibrationPlan,
    side: SidePath,
    tone: TestTone,
}

impl Calibrator {
    /// Calibration always runs at unity threshold gain.
    pub fn new(settings: &Settings, plan: CalibrationPlan) -> NrResult<Self> {
        let settings = Settings {
            threshold_gain: 1.0,
            ..settings.clone()
        };
        let side = SidePath::new(&settings, &Calibration::nominal(settings.variant))?;
        let tone = TestTone::new(settings.sample_rate)?;
        Ok(Self {
            settings,
            plan,
            side,
            tone,
        })
    }

    pub fn run(mut self) -> Calibration {
        let reference = self.reference_level();
        let gain_target = (reference as f64 * db_to_gain(SIDE_GAIN_TARGET_DB)).round() as i64;
        let source_target = (reference as f64 * db_to_gain(SOURCE_TARGET_DB)).round() as i64;
        debug!("calibration reference {reference} nV, targets {gain_target} / {source_target}");

        let side_gain = self.find_side_gain(gain_target);
        self.side.set_side_gain(side_gain);
        let source_volts = self.find_source_volts(source_target);

        Calibration {
            side_gain,
            source_volts,
        }
    }

    /// Mean |tone| with the side path out of circuit.
    fn reference_level(&self) -> i64 {
        let n = self.seconds(self.plan.side_gain_window).max(1);
        let total: i128 = self
            .tone
            .samples()
            .take(n as usize)
            .map(|x| crate::mixers::encode(x, 0).unsigned_abs() as i128)
            .sum();
        (total / n as i128) as i64
    }

    fn seconds(&self, secs: u32) -> u64 {
        secs as u64 * self.settings.sample_rate as u64
    }

    /// Mean |encoded tone| over the window, after the warm-up, from a fresh
    /// channel.
    fn measure(&self, warmup: u32, window: u32) -> i64 {
        let warmup = self.seconds(warmup);
        let window = self.seconds(window).max(1);
        let passes = self.settings.input_passes();
        let mut state = self.side.new_channel();
        let mut total: i128 = 0;
        for (i, x) in self.tone.samples().take((warmup + window) as usize).enumerate() {
            let y = self.side.encode(&mut state, x, passes);
            if i as u64 >= warmup {
                total += y.unsigned_abs() as i128;
            }
        }
        (total / window as i128) as i64
    }

    fn try_side_gain(&mut self, gain: f64) -> i64 {
        self.side.set_side_gain(gain);
        let level = self.measure(self.plan.side_gain_warmup, self.plan.side_gain_window);
        debug!("side gain {gain:.10} -> {level} nV");
        level
    }

    fn find_side_gain(&mut self, target: i64) -> f64 {
        self.side.clamp_fet(true);

        let (mut low, mut high) = SIDE_GAIN_BRACKET;
        let mut low_res = self.try_side_gain(low);
        let mut high_res = self.try_side_gain(high);
        let (mut prev, mut prev_res) = (low, low_res);
        let (mut tried, mut tried_res) = (high, high_res);

        let mut trials = 0;
        while tried_res != prev_res {
            if trials == MAX_TRIALS || high_res == low_res {
                warn!("side gain search stopped after {trials} trials at {tried:.10}");
                break;
            }
            trials += 1;
            (prev, prev_res) = (tried, tried_res);
            tried = low + (high - low) * (target - low_res) as f64 / (high_res - low_res) as f64;
            tried_res = self.try_side_gain(tried);
            if tried_res > target {
                (high, high_res) = (tried, tried_res);
            } else if tried_res < target {
                (low, low_res) = (tried, tried_res);
            }
        }

        self.side.clamp_fet(false);
        let gain = (tried + prev) / 2.0;
        info!("side gain calibrated to {gain:.10}");
        gain
    }

    fn try_source_volts(&mut self, volts: i64) -> i64 {
        self.side.set_source_volts(volts);
        let level = self.measure(self.plan.source_warmup, self.plan.source_window);
        debug!("source {volts} nV -> {level} nV");
        level
    }

    fn find_source_volts(&mut self, target: i64) -> i64 {
        let (mut low, mut high) = SOURCE_BRACKET;
        let mut low_res = self.try_source_volts(low);
        let mut high_res = self.try_source_volts(high);
        let (mut prev, mut prev_res) = (low, low_res);
        let (mut tried, mut tried_res) = (high, high_res);

        let mut trials = 0;
        while tried_res != prev_res {
            if trials == MAX_TRIALS || high_res == low_res {
                warn!("source voltage search stopped after {trials} trials at {tried}");
                break;
            }
            trials += 1;
            (prev, prev_res) = (tried, tried_res);
            tried = low + mul_div(high - low, target - low_res, high_res - low_res);
            if tried != prev {
                tried_res = self.try_source_volts(tried);
                if tried_res > target {
                    (high, high_res) = (tried, tried_res);
                } else if tried_res < target {
                    (low, low_res) = (tried, tried_res);
                }
            }
        }

        let volts = (tried + prev + 1) / 2;
        info!("FET source voltage calibrated to {volts} nV");
        volts
    }
}

/// Cached constants for `settings`, or a fresh calibration stored back into
/// the cache.
///
/// Upsample-all sessions always calibrate: the cache key cannot tell them
/// apart from ordinary ones.
pub fn load_or_calibrate(
    settings: &Settings,
    plan: CalibrationPlan,
    cache: &dyn CalibrationCache,
) -> NrResult<Calibration> {
    let key = CacheKey::for_settings(settings);
    let cacheable = !settings.upsample_all;

    if cacheable {
        match cache.lookup(&key) {
            Ok(Some(found)) if found.is_plausible() => {
                debug!("calibration cache hit for {key}");
                return Ok(found);
            }
            Ok(Some(found)) => warn!(
                "ignoring out-of-range cached calibration for {key}: gain {}, source {} nV",
                found.side_gain, found.source_volts
            ),
            Ok(None) => debug!("calibration cache miss for {key}"),
            Err(e) => warn!("calibration cache unreadable, recalibrating: {e}"),
        }
    }

    info!("calibrating for {key}");
    let calibration = Calibrator::new(settings, plan)?.run();

    if cacheable && calibration.is_plausible() {
        if let Err(e) = cache.store(&key, &calibration) {
            warn!("could not save calibration: {e}");
        }
    }
    Ok(calibration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::Config;

    fn short_plan() -> CalibrationPlan {
        CalibrationPlan {
            side_gain_warmup: 0,
            side_gain_window: 1,
            source_warmup: 1,
            source_window: 1,
        }
    }

    fn settings(rate: u32, variant: u8) -> Settings {
        Config {
            sample_rate: rate,
            filter_variant: variant,
            ..Config::default()
        }
        .validate()
        .unwrap()
    }

    #[test]
    fn test_tone_is_one_exact_period() {
        assert_eq!(TestTone::new(44100).unwrap().table.len(), 441);
        assert_eq!(TestTone::new(48000).unwrap().table.len(), 48);
        assert_eq!(TestTone::new(8001).unwrap().table.len(), 8001);
        let tone = TestTone::new(48000).unwrap();
        let peak = tone.table.iter().map(|x| x.abs()).max().unwrap();
        approx::assert_relative_eq!(peak as f64, 24_748_737.0, max_relative = 1e-3);
        let sum: i64 = tone.table.iter().sum();
        assert!(sum.abs() < 1000, "tone should average to zero, sum {sum}");
    }

    #[test]
    fn test_reference_level_is_mean_abs_tone() {
        let cal = Calibrator::new(&settings(48000, 4), short_plan()).unwrap();
        // Mean |sin| = 2/pi of the peak.
        let expected = 24_748_737.0 * 2.0 / std::f64::consts::PI;
        approx::assert_relative_eq!(cal.reference_level() as f64, expected, max_relative = 0.02);
    }

    #[test]
    fn test_calibration_is_idempotent() {
        let s = settings(8000, 4);
        let cache = MemoryCache::default();
        let first = load_or_calibrate(&s, short_plan(), &cache).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(first.side_gain.is_finite(), "side gain {}", first.side_gain);

        let second = load_or_calibrate(&s, short_plan(), &cache).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1, "a cache hit must not append");

        // A cold run lands on exactly the same constants.
        let cold = Calibrator::new(&s, short_plan()).unwrap().run();
        assert_eq!(cold, first);
    }

    #[test]
    fn test_nominal_constants_are_plausible() {
        for variant in [
            FilterVariant::Type1,
            FilterVariant::Type2,
            FilterVariant::Type3,
            FilterVariant::Type4,
        ] {
            assert!(Calibration::nominal(variant).is_plausible(), "{variant:?}");
        }
        let nominal = Calibration::nominal(FilterVariant::Type4);
        for bad in [
            Calibration { side_gain: 1e300, ..nominal },
            Calibration { side_gain: 0.0, ..nominal },
            Calibration { side_gain: -3.0, ..nominal },
            Calibration { side_gain: f64::NAN, ..nominal },
            Calibration { source_volts: i64::MIN, ..nominal },
            Calibration { source_volts: 0, ..nominal },
            Calibration { source_volts: i64::MAX, ..nominal },
        ] {
            assert!(!bad.is_plausible(), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_out_of_range_cache_hit_recalibrates() {
        let s = settings(8000, 4);
        let key = CacheKey::for_settings(&s);
        let corrupt = Calibration {
            side_gain: 1e300,
            source_volts: 11_490_770_993,
        };
        let cache = MemoryCache::with_entries([(key, corrupt)]);
        let found = load_or_calibrate(&s, short_plan(), &cache).unwrap();
        assert_ne!(found, corrupt);
        assert_eq!(found, Calibrator::new(&s, short_plan()).unwrap().run());
    }

    #[test]
    fn test_threshold_gain_does_not_change_calibration() {
        let plain = settings(8000, 2);
        let hot = Settings {
            threshold_gain: 2.0,
            ..plain.clone()
        };
        let a = Calibrator::new(&plain, short_plan()).unwrap().run();
        let b = Calibrator::new(&hot, short_plan()).unwrap().run();
        assert_eq!(a, b);
    }
}
