/// Gain-control envelope detector: two diode/resistor low-pass stages.
///
/// Stage 1: the side-path signal drives a 2.7k resistor in series with a
/// diode, loaded by 270k, into 100 nF. How hard the diode conducts depends on
/// how far the input is above the capacitor, so both the input attenuation
/// and the time constant are looked up per sample from that difference
/// (10 mV steps, 0.25..10 V).
///
/// Stage 2: a diode in parallel with 270k into 330 nF, again with a
/// coefficient chosen from the voltage across it (1 mV steps, 1..700 mV).
/// The capacitor can't sit more than one diode drop below stage 1.
///
/// The stage-2 voltage is the control voltage handed to the FET tables.

use crate::error::NrResult;
use crate::filters::lpf_alpha;
use crate::fixed::{ALPHA_TARGET, CAP_SCALE, VOLT, alloc_table, lerp, mul_div, mux_for};

// ── Circuit constants ──

const GC_R1: i64 = 2700;
const GC_R1_LOAD: f64 = 270_000.0;
const GC_C1: f64 = 1000.0 / CAP_SCALE;
const GC_R2: f64 = 270_000.0;
const GC_C2: f64 = 3300.0 / CAP_SCALE;

/// Shockley diode: saturation current and thermal voltage.
const DIODE_IS: f64 = 1e-12;
const DIODE_VT: f64 = 0.02585;

/// Above this the diode is treated as a short.
const DIODE_ON_VOLTS: f64 = 0.7;

/// Stage 2 never falls more than this below stage 1.
const DIODE_DROP: i64 = VOLT * 6 / 10;

/// Stage 2's cutoff ceiling.
const STAGE2_MAX_HZ: f64 = 5000.0;

// ── Table layout ──

const STAGE1_FIRST: i64 = 25;
const STAGE1_LAST: i64 = 1000;
const STAGE1_STEP: i64 = VOLT / 100;

const STAGE2_FIRST: i64 = 1;
const STAGE2_LAST: i64 = 700;
const STAGE2_STEP: i64 = VOLT / 1000;

/// Input clamp: the product of a sample and any multiplier stays below this.
const PRODUCT_LIMIT: f64 = 9e18;

fn diode_current(vd: f64) -> f64 {
    DIODE_IS * (vd / DIODE_VT - 1.0).exp()
}

fn parallel(a: f64, b: f64) -> f64 {
    1.0 / (1.0 / a + 1.0 / b)
}

/// Whether a total series resistance `r` draws less current than the diode
/// would pass at the resulting voltage across it.
fn resistance_too_high(vin: f64, r: i64) -> bool {
    let total = vin / r as f64;
    let vd = vin - total * GC_R1 as f64;
    if vd <= 0.0 {
        return false;
    }
    let diode = if vd > DIODE_ON_VOLTS { 1000.0 } else { diode_current(vd) };
    diode > total
}

/// Solves the 2.7k + diode string for its effective resistance.
///
/// Each solve starts from the previous answer; the table is built with
/// rising voltages, so the resistance only ever walks down.
struct SeriesResistance {
    prev: i64,
}

impl SeriesResistance {
    fn new() -> Self {
        Self {
            prev: GC_R1 + 1_000_000,
        }
    }

    fn solve(&mut self, vin: f64) -> i64 {
        let mut high = self.prev;
        let mut low = high - 1000;
        while resistance_too_high(vin, low) {
            high = low;
            low = high - 1000;
        }
        while low + 1 < high {
            let mid = low + (high - low) / 2;
            if resistance_too_high(vin, mid) {
                high = mid;
            } else {
                low = mid;
            }
        }
        let mut next = low + 1;
        while !(resistance_too_high(vin, next) || next > high) {
            low = next;
            next = low + 1;
        }
        self.prev = low;
        low
    }
}

fn stage1_attenuation(r: i64) -> f64 {
    GC_R1_LOAD / (r as f64 + GC_R1_LOAD)
}

fn stage1_alpha(r: i64, rate: f64) -> f64 {
    lpf_alpha(parallel(r as f64, GC_R1_LOAD) * GC_C1, rate)
}

fn stage2_alpha(vin: f64, rate: f64) -> f64 {
    let diode_ohms = vin / diode_current(vin);
    let mut rc = parallel(diode_ohms, GC_R2) * GC_C2;
    if 1.0 / (2.0 * std::f64::consts::PI * rc) > STAGE2_MAX_HZ {
        rc = 1.0 / (2.0 * std::f64::consts::PI * STAGE2_MAX_HZ);
    }
    lpf_alpha(rc, rate)
}

/// Capacitor voltages of one detector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GateState {
    stage1: i64,
    stage2: i64,
}

impl GateState {
    pub fn stage1(&self) -> i64 {
        self.stage1
    }

    pub fn stage2(&self) -> i64 {
        self.stage2
    }
}

pub struct EnvelopeDetector {
    att: Vec<i64>,
    alpha1: Vec<i64>,
    alpha2: Vec<i64>,
    att_mux: i64,
    alpha1_mux: i64,
    alpha2_mux: i64,
    max_input: i64,
}

impl EnvelopeDetector {
    pub fn new(sample_rate: f64) -> NrResult<Self> {
        let att_mux = mux_for(stage1_attenuation(1_000_000), 1_000_000.0);

        let mut alpha1_mux = mux_for(stage1_alpha(1_000_000, sample_rate), ALPHA_TARGET as f64);
        let r_top = SeriesResistance::new().solve(STAGE1_LAST as f64 / 100.0);
        let cap = (ALPHA_TARGET as f64 / stage1_alpha(r_top, sample_rate)).round() as i64;
        alpha1_mux = alpha1_mux.min(cap);

        let first2 = STAGE2_FIRST as f64 / 1000.0;
        let last2 = STAGE2_LAST as f64 / 1000.0;
        let mut alpha2_mux = mux_for(stage2_alpha(first2, sample_rate), ALPHA_TARGET as f64);
        let cap = (ALPHA_TARGET as f64 / stage2_alpha(last2, sample_rate)).round() as i64;
        alpha2_mux = alpha2_mux.min(cap);

        let len1 = (STAGE1_LAST - STAGE1_FIRST + 1) as usize;
        let mut att = alloc_table(len1, "gate attenuation table")?;
        let mut alpha1 = alloc_table(len1, "gate stage 1 table")?;
        let mut search = SeriesResistance::new();
        for (i, pos) in (STAGE1_FIRST..=STAGE1_LAST).enumerate() {
            let r = search.solve(pos as f64 / 100.0);
            att[i] = (att_mux as f64 * stage1_attenuation(r)).round() as i64;
            alpha1[i] = (alpha1_mux as f64 * stage1_alpha(r, sample_rate)).round() as i64;
        }

        let len2 = (STAGE2_LAST - STAGE2_FIRST + 1) as usize;
        let mut alpha2 = alloc_table(len2, "gate stage 2 table")?;
        for (i, pos) in (STAGE2_FIRST..=STAGE2_LAST).enumerate() {
            alpha2[i] = (alpha2_mux as f64 * stage2_alpha(pos as f64 / 1000.0, sample_rate)).round() as i64;
        }

        let max_input = [att_mux, alpha1_mux, alpha2_mux]
            .iter()
            .map(|&m| (PRODUCT_LIMIT / m as f64) as i64)
            .min()
            .unwrap_or(0)
            / 4;

        Ok(Self {
            att,
            alpha1,
            alpha2,
            att_mux,
            alpha1_mux,
            alpha2_mux,
            max_input,
        })
    }

    /// Run one sample through both stages and return the new control voltage.
    pub fn process(&self, state: &mut GateState, x: i64) -> i64 {
        let x = x.clamp(-self.max_input, self.max_input);

        // Stage 1, interpolated across the 10 mV step.
        let dif = x - state.stage1;
        let raw = dif / STAGE1_STEP;
        let (pos, frac) = if raw < STAGE1_FIRST {
            (STAGE1_FIRST, 0)
        } else if raw >= STAGE1_LAST {
            (STAGE1_LAST, 0)
        } else {
            (raw, dif - raw * STAGE1_STEP)
        };
        let i = (pos - STAGE1_FIRST) as usize;
        let j = (i + 1).min(self.att.len() - 1);
        let att = lerp(self.att[i], self.att[j], frac, STAGE1_STEP);
        let alpha1 = lerp(self.alpha1[i], self.alpha1[j], frac, STAGE1_STEP);

        let attenuated = mul_div(x, att, self.att_mux);
        let s1 = state.stage1 + mul_div(attenuated - state.stage1, alpha1, self.alpha1_mux);
        state.stage1 = s1;

        // Stage 2.
        let pos = ((s1 - state.stage2) / STAGE2_STEP).clamp(STAGE2_FIRST, STAGE2_LAST);
        let alpha2 = self.alpha2[(pos - STAGE2_FIRST) as usize];
        let floor = s1 - DIODE_DROP;
        let s2 = (state.stage2 + mul_div(s1 - state.stage2, alpha2, self.alpha2_mux)).max(floor);
        state.stage2 = s2;
        s2
    }

    pub fn max_input(&self) -> i64 {
        self.max_input
    }
}
