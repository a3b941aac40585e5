/// Side path: the level-dependent high-pass branch that gets mixed with the
/// main signal.
///
/// Signal flow per sample (one channel):
///   gain -> [fixed HPF, variants 1/3] -> sliding filter -> sum(filter, pot)
///        -> diode clip
///   pot tap -> [fixed HPF, variants 2/4]
///   unclipped sum * 10 -> envelope detector -> FET tables -> next coefficients
///
/// `check` evaluates a sample against a channel's state without changing it and
/// hands back a `Trial`; `update` applies that trial. The decoder tries many
/// trial values per sample and only commits the last one.

use crate::calibrate::Calibration;
use crate::config::{FilterVariant, Settings};
use crate::error::NrResult;
use crate::fet::Coefficients;
use crate::filters::{Clipped, DiodeClip, FixedHpf, HpfPending, HpfState};
use crate::fixed::{Coeff, GAIN_TARGET, narrow};
use crate::gate::{EnvelopeDetector, GateState};
use crate::mixers;
use crate::sliding::{SlidingFilter, SlidingPending, SlidingState};

/// Fixed bias on the FET gate, 7.5 V.
pub const GATE_BIAS: i64 = 7_500_000_000;

/// Gain between the side-path output and the envelope detector.
const GATE_DRIVE: f64 = 10.0;

pub struct SidePath {
    variant: FilterVariant,
    gain: Coeff,
    gate_gain: Coeff,
    hpf: FixedHpf,
    sliding: SlidingFilter,
    gate: EnvelopeDetector,
    clip: DiodeClip,
    source_volts: i64,
    gate_bias: i64,
    fet_clamped: bool,
}

/// Everything one channel remembers between samples.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelState {
    hpf: HpfState,
    sliding: SlidingState,
    gate: GateState,
    gate_voltage: i64,
    coeffs: Coefficients,
    generation: u64,
}

impl ChannelState {
    pub fn gate_voltage(&self) -> i64 {
        self.gate_voltage
    }

    pub fn coefficients(&self) -> Coefficients {
        self.coeffs
    }
}

/// A side-path evaluation that has not been applied yet.
///
/// Only `SidePath::update` can consume it, and only for the state it was
/// checked against.
#[derive(Debug)]
pub struct Trial {
    output: Clipped,
    sum: i64,
    hpf: Option<HpfPending>,
    sliding: SlidingPending,
    generation: u64,
}

impl Trial {
    pub fn output(&self) -> i64 {
        self.output.value
    }

    pub fn clipped(&self) -> bool {
        self.output.clipped
    }
}

impl SidePath {
    pub fn new(settings: &Settings, calibration: &Calibration) -> NrResult<Self> {
        let base_rate = settings.base_rate();
        Ok(Self {
            variant: settings.variant,
            gain: Coeff::fit(calibration.side_gain, GAIN_TARGET),
            gate_gain: Coeff::fit(GATE_DRIVE * settings.threshold_gain, GAIN_TARGET),
            hpf: FixedHpf::new(base_rate),
            sliding: SlidingFilter::new(
                settings.variant,
                settings.filter_rate(),
                base_rate,
                settings.sliding_passes(),
            )?,
            gate: EnvelopeDetector::new(base_rate)?,
            clip: DiodeClip::new(settings.threshold_gain),
            source_volts: calibration.source_volts,
            gate_bias: GATE_BIAS,
            fet_clamped: false,
        })
    }

    pub fn variant(&self) -> FilterVariant {
        self.variant
    }

    pub fn set_side_gain(&mut self, gain: f64) {
        self.gain = Coeff::fit(gain, GAIN_TARGET);
    }

    pub fn set_source_volts(&mut self, volts: i64) {
        self.source_volts = volts;
    }

    /// Hold the FET gate at 0 V with no bias, as the side-gain calibration needs.
    pub fn clamp_fet(&mut self, clamped: bool) {
        self.fet_clamped = clamped;
        self.gate_bias = if clamped { 0 } else { GATE_BIAS };
    }

    pub fn set_threshold_gain(&mut self, threshold_gain: f64) {
        self.gate_gain = Coeff::fit(GATE_DRIVE * threshold_gain, GAIN_TARGET);
        self.clip = DiodeClip::new(threshold_gain);
    }

    /// Fresh channel state with coefficients for a 0 V gate.
    pub fn new_channel(&self) -> ChannelState {
        ChannelState {
            coeffs: self.coefficients_for(0),
            ..ChannelState::default()
        }
    }

    fn coefficients_for(&self, gate_voltage: i64) -> Coefficients {
        self.sliding
            .coefficients(
                self.source_volts
                    .saturating_sub(self.gate_bias)
                    .saturating_sub(gate_voltage),
            )
    }

    /// Evaluate one sample without touching `state`.
    pub fn check(&self, state: &ChannelState, x: i64) -> Trial {
        let mut hpf = None;
        let mut smp = self.gain.apply(x);

        if self.variant.hpf_on_input() {
            let (y, pending) = self.hpf.check(&state.hpf, smp);
            hpf = Some(pending);
            smp = y;
        }

        let out = self.sliding.check(&state.sliding, &state.coeffs, smp);
        let mut pot = out.pot;
        if self.variant.hpf_on_pot() {
            let (y, pending) = self.hpf.check(&state.hpf, pot);
            hpf = Some(pending);
            pot = y;
        }

        let sum = out.filtered + pot;
        Trial {
            output: self.clip.apply(sum),
            sum,
            hpf,
            sliding: out.pending,
            generation: state.generation,
        }
    }

    /// Apply a trial to the state it was checked against and return its
    /// clipped output.
    pub fn update(&self, state: &mut ChannelState, trial: Trial) -> Clipped {
        debug_assert_eq!(
            trial.generation, state.generation,
            "trial applied to a state it was not checked against"
        );
        if let Some(pending) = trial.hpf {
            self.hpf.update(&mut state.hpf, pending);
        }
        self.sliding.update(&mut state.sliding, trial.sliding);

        state.gate_voltage = if self.fet_clamped {
            0
        } else {
            self.gate
                .process(&mut state.gate, self.gate_gain.apply(trial.sum))
        };
        state.coeffs = self.coefficients_for(state.gate_voltage);
        state.generation = state.generation.wrapping_add(1);
        trial.output
    }

    /// `check` followed by `update`.
    pub fn commit(&self, state: &mut ChannelState, x: i64) -> Clipped {
        let trial = self.check(state, x);
        self.update(state, trial)
    }

    /// Encode one sample: commit it `passes` times (upsample-all mode holds the
    /// input across the sub-samples) and average the mixed results.
    pub fn encode(&self, state: &mut ChannelState, x: i64, passes: u32) -> i64 {
        let passes = passes.max(1);
        let mut total: i128 = 0;
        for _ in 0..passes {
            let side = self.commit(state, x);
            total += mixers::encode(x, side.value) as i128;
        }
        narrow(total / passes as i128)
    }

    pub fn clip_limit(&self) -> i64 {
        self.clip.limit()
    }
}
