/// Session configuration and its validated, resolved form.
///
/// `Config` is what a host fills in (plain integers, so out-of-range values
/// can be reported instead of being unrepresentable); `Config::validate`
/// turns it into `Settings`, which every other module consumes.

use crate::error::{NrError, NrResult};
use crate::fixed::db_to_gain;

/// Effective rate the sliding filter should reach when upsampling is automatic.
pub const AUTO_UPSAMPLE_RATE: u64 = 200_000;

/// Largest explicit upsampling factor accepted.
pub const MAX_UPSAMPLING: u16 = 100;

/// Host-facing configuration. Defaults match a mono 16-bit stream through
/// filter variant 4.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Samples per second. Required.
    pub sample_rate: u32,
    /// 1 or 2.
    pub channels: u16,
    /// 8, 16 or 24.
    pub bit_depth: u16,
    /// 1..=4, see `FilterVariant`.
    pub filter_variant: u8,
    /// Sliding-filter upsampling factor; 0 picks the smallest factor that
    /// reaches 200 kHz.
    pub upsampling: u16,
    /// Run every stage (and the mixers) at the upsampled rate, not just the
    /// sliding filter.
    pub upsample_all: bool,
    /// Decoder search tolerance relative to one LSB, in dB.
    pub decode_accuracy_db: f64,
    /// Level adjustment for material digitized hotter or quieter than the
    /// reference, in dB.
    pub threshold_gain_db: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: 0,
            channels: 1,
            bit_depth: 16,
            filter_variant: 4,
            upsampling: 0,
            upsample_all: false,
            decode_accuracy_db: -5.0,
            threshold_gain_db: 0.0,
        }
    }
}

/// Which of the four side-path topologies to simulate.
///
/// | variant | fixed HPF on      | pot derived from      |
/// |---------|-------------------|-----------------------|
/// | 1       | side-path input   | input (subtracted)    |
/// | 2       | pot tap           | input (subtracted)    |
/// | 3       | side-path input   | input - filter output |
/// | 4       | pot tap           | input - filter output |
///
/// Variants 2 and 4 also cap the sliding filter's lowest frequency at the
/// fixed HPF's cutoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterVariant {
    Type1,
    Type2,
    Type3,
    Type4,
}

impl FilterVariant {
    pub fn number(self) -> u8 {
        match self {
            Self::Type1 => 1,
            Self::Type2 => 2,
            Self::Type3 => 3,
            Self::Type4 => 4,
        }
    }

    /// Fixed high-pass sits in front of the sliding filter.
    pub fn hpf_on_input(self) -> bool {
        matches!(self, Self::Type1 | Self::Type3)
    }

    /// Fixed high-pass filters the pot tap instead.
    pub fn hpf_on_pot(self) -> bool {
        !self.hpf_on_input()
    }

    /// Pot attenuates the input before the coefficient filter (1/2), as
    /// opposed to tapping the difference after it (3/4).
    pub fn pot_first(self) -> bool {
        matches!(self, Self::Type1 | Self::Type2)
    }

    /// Sliding filter RC is capped at the fixed HPF's RC.
    pub fn caps_rc(self) -> bool {
        self.hpf_on_pot()
    }
}

impl TryFrom<u8> for FilterVariant {
    type Error = NrError;

    fn try_from(n: u8) -> NrResult<Self> {
        match n {
            1 => Ok(Self::Type1),
            2 => Ok(Self::Type2),
            3 => Ok(Self::Type3),
            4 => Ok(Self::Type4),
            _ => Err(NrError::Config(format!("filter variant must be 1 to 4, got {n}"))),
        }
    }
}

/// PCM sample width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BitDepth {
    Eight,
    Sixteen,
    TwentyFour,
}

impl BitDepth {
    pub fn bits(self) -> u16 {
        match self {
            Self::Eight => 8,
            Self::Sixteen => 16,
            Self::TwentyFour => 24,
        }
    }

    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }

    /// Nanovolts per LSB.
    pub fn scale(self) -> i64 {
        match self {
            Self::Eight => 15_624_980,
            Self::Sixteen => 61_035,
            Self::TwentyFour => 238,
        }
    }

    pub fn min(self) -> i32 {
        -(1 << (self.bits() - 1))
    }

    pub fn max(self) -> i32 {
        (1 << (self.bits() - 1)) - 1
    }

    pub fn saturate(self, v: i64) -> i32 {
        v.clamp(self.min() as i64, self.max() as i64) as i32
    }
}

impl TryFrom<u16> for BitDepth {
    type Error = NrError;

    fn try_from(bits: u16) -> NrResult<Self> {
        match bits {
            8 => Ok(Self::Eight),
            16 => Ok(Self::Sixteen),
            24 => Ok(Self::TwentyFour),
            _ => Err(NrError::Config(format!("bit depth must be 8, 16 or 24, got {bits}"))),
        }
    }
}

/// Validated configuration with every derived rate resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub sample_rate: u32,
    pub channels: usize,
    pub bit_depth: BitDepth,
    pub variant: FilterVariant,
    /// Factor as configured (0 = automatic). Part of the calibration cache key.
    pub upsampling_setting: u16,
    /// Factor actually used.
    pub upsampling: u32,
    pub upsample_all: bool,
    /// Linear decode accuracy.
    pub accuracy: f64,
    /// Linear threshold gain.
    pub threshold_gain: f64,
}

impl Config {
    pub fn validate(&self) -> NrResult<Settings> {
        if self.sample_rate == 0 {
            return Err(NrError::Config("sample rate must be set".into()));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(NrError::Config(format!(
                "only mono and stereo are supported, got {} channels",
                self.channels
            )));
        }
        let variant = FilterVariant::try_from(self.filter_variant)?;
        let bit_depth = BitDepth::try_from(self.bit_depth)?;
        if self.upsampling > MAX_UPSAMPLING {
            return Err(NrError::Config(format!(
                "upsampling must be 0 to {MAX_UPSAMPLING}, got {}",
                self.upsampling
            )));
        }
        if !self.decode_accuracy_db.is_finite() || !(-100.0..=0.0).contains(&self.decode_accuracy_db)
        {
            return Err(NrError::Config(format!(
                "decode accuracy must be -100 to 0 dB, got {}",
                self.decode_accuracy_db
            )));
        }
        if !self.threshold_gain_db.is_finite()
            || !(-100.0..=100.0).contains(&self.threshold_gain_db)
        {
            return Err(NrError::Config(format!(
                "threshold gain must be -100 to 100 dB, got {}",
                self.threshold_gain_db
            )));
        }

        let upsampling = if self.upsampling > 0 {
            self.upsampling as u32
        } else {
            auto_upsampling(self.sample_rate)
        };

        Ok(Settings {
            sample_rate: self.sample_rate,
            channels: self.channels as usize,
            bit_depth,
            variant,
            upsampling_setting: self.upsampling,
            upsampling,
            upsample_all: self.upsample_all,
            accuracy: db_to_gain(self.decode_accuracy_db),
            threshold_gain: db_to_gain(self.threshold_gain_db),
        })
    }
}

/// Smallest factor `n` with `n * rate >= 200 kHz`.
pub fn auto_upsampling(sample_rate: u32) -> u32 {
    let rate = sample_rate.max(1) as u64;
    AUTO_UPSAMPLE_RATE.div_ceil(rate).max(1) as u32
}

impl Settings {
    /// Rate of the sliding filter's coefficient tables.
    pub fn filter_rate(&self) -> f64 {
        self.sample_rate as f64 * self.upsampling as f64
    }

    /// Rate of the DC trackers, fixed HPF and envelope detector.
    pub fn base_rate(&self) -> f64 {
        if self.upsample_all {
            self.filter_rate()
        } else {
            self.sample_rate as f64
        }
    }

    /// Coefficient-filter repetitions inside one sliding-filter call.
    pub fn sliding_passes(&self) -> u32 {
        if self.upsample_all { 1 } else { self.upsampling }
    }

    /// Side-path evaluations per input sample.
    pub fn input_passes(&self) -> u32 {
        if self.upsample_all { self.upsampling } else { 1 }
    }
}
