/// Fixed-coefficient stages of the side path: DC tracker, fixed high-pass,
/// diode clip, plus the cutoff warps every RC-derived alpha goes through.
///
/// Coefficients live in the filter structs and are shared read-only across
/// channels; history lives in the `*State` structs owned by each channel.
///
///   DC tracker:  acc = (x - prev) * alpha + rem;  prev += acc / mux;  rem = acc % mux
///   Fixed HPF:   y = (y[n-1] + x - x[n-1]) * alpha / mux
///                y[n-1] is stored with its DC component removed

use std::f64::consts::PI;

use crate::fixed::{ALPHA_TARGET, CAP_SCALE, Coeff, VOLT, unit_alpha_mux};

// ── Circuit constants ──

/// Fixed high-pass: R1 = 3.3k, C1 = 32.6 nF.
pub const R1: f64 = 3300.0;
pub const C1: f64 = 326.0 / CAP_SCALE;

/// DC tracker: 10k into 100 uF.
const DC_R: f64 = 10_000.0;
const DC_C: f64 = 1_000_000.0 / CAP_SCALE;

/// Forward voltage at which the output diodes start clipping.
pub const DIODE_CLIP_VOLTS: f64 = 0.6;

// ─── Cutoff warps ───

/// Largest `fc / sample_rate` the warps accept; anything above is pinned here.
const MAX_RATIO: f64 = 0.499_999;

/// `(w, 1 - cos w, sqrt((1 - cos w)(3 - cos w)))`, computed without
/// cancellation for very low ratios.
fn warp_terms(ratio: f64) -> (f64, f64, f64) {
    let w = 2.0 * PI * ratio.clamp(0.0, MAX_RATIO);
    let half = (w / 2.0).sin();
    let omc = 2.0 * half * half;
    let s = (omc * (2.0 + omc)).sqrt();
    (w, omc, s)
}

/// RC scale factor that puts a one-pole high-pass's -3 dB point on `fc`.
///
/// For `y = a (y[n-1] + x - x[n-1])` the exact coefficient is
/// `a = 1 / (cos w + sqrt((1 - cos w)(3 - cos w)))`; the returned factor turns
/// the analog RC into the one that yields that `a` via `RC / (RC + dt)`.
pub fn hpf_rc_factor(ratio: f64) -> f64 {
    let (w, omc, s) = warp_terms(ratio);
    if w == 0.0 {
        return 1.0;
    }
    w / (s - omc)
}

/// RC scale factor that puts a one-pole low-pass's -3 dB point on `fc`.
///
/// Pole: `p = (2 - cos w) - sqrt((2 - cos w)^2 - 1)`, alpha = `1 - p`.
pub fn lpf_rc_factor(ratio: f64) -> f64 {
    let (w, omc, s) = warp_terms(ratio);
    if w == 0.0 {
        return 1.0;
    }
    w * (1.0 + omc - s) / (s - omc)
}

/// High-pass alpha `RC / (RC + dt)` for an analog RC, cutoff-warped.
pub fn hpf_alpha(rc: f64, sample_rate: f64) -> f64 {
    let fc = 1.0 / (2.0 * PI * rc);
    let rc = rc * hpf_rc_factor(fc / sample_rate);
    let dt = 1.0 / sample_rate;
    rc / (rc + dt)
}

/// Low-pass alpha `dt / (RC + dt)` for an analog RC, cutoff-warped.
pub fn lpf_alpha(rc: f64, sample_rate: f64) -> f64 {
    let fc = 1.0 / (2.0 * PI * rc);
    let rc = rc * lpf_rc_factor(fc / sample_rate);
    let dt = 1.0 / sample_rate;
    dt / (rc + dt)
}

// ─── DC tracker ───

/// Very slow low-pass that tracks the DC level of a stage's history.
///
/// The integer division remainder is fed back into the next sample, so the
/// tracker settles exactly on a constant input instead of stalling short of it.
#[derive(Clone, Copy, Debug)]
pub struct DcFilter {
    alpha: Coeff,
}

/// Per-instance history of a `DcFilter`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DcState {
    prev: i64,
    rem: i64,
}

impl DcState {
    pub fn level(&self) -> i64 {
        self.prev
    }
}

impl DcFilter {
    pub fn new(sample_rate: f64) -> Self {
        let alpha = lpf_alpha(DC_R * DC_C, sample_rate);
        let mux = unit_alpha_mux(alpha);
        Self {
            alpha: Coeff {
                value: (alpha * mux as f64).round() as i64,
                mux,
            },
        }
    }

    pub fn process(&self, state: &mut DcState, x: i64) -> i64 {
        let delta = x as i128 - state.prev as i128;
        let acc = delta * self.alpha.value as i128 + state.rem as i128;
        let step = acc / self.alpha.mux as i128;
        state.rem = (acc % self.alpha.mux as i128) as i64;
        state.prev = crate::fixed::narrow(state.prev as i128 + step);
        state.prev
    }

    /// Samples per time constant.
    pub fn time_constant(&self) -> i64 {
        self.alpha.mux / self.alpha.value.max(1)
    }
}

// ─── Fixed high-pass ───

/// One-pole high-pass with a constant coefficient (R1/C1).
#[derive(Clone, Copy, Debug)]
pub struct FixedHpf {
    alpha: Coeff,
    dc: DcFilter,
}

/// History of one fixed high-pass instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HpfState {
    prev_in: i64,
    prev_out: i64,
    dc: DcState,
}

/// Result of a trial evaluation, waiting to be applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HpfPending {
    input: i64,
    output: i64,
}

impl FixedHpf {
    pub fn new(sample_rate: f64) -> Self {
        let alpha = hpf_alpha(R1 * C1, sample_rate);
        Self {
            alpha: Coeff::fit(alpha, ALPHA_TARGET),
            dc: DcFilter::new(sample_rate),
        }
    }

    /// Evaluate one sample without touching `state`.
    pub fn check(&self, state: &HpfState, x: i64) -> (i64, HpfPending) {
        let y = self.alpha.apply(state.prev_out + x - state.prev_in);
        (y, HpfPending { input: x, output: y })
    }

    /// Apply a pending result. The DC tracker runs on the output and its level
    /// is removed from the stored history only.
    pub fn update(&self, state: &mut HpfState, pending: HpfPending) {
        state.prev_in = pending.input;
        let lp = self.dc.process(&mut state.dc, pending.output);
        state.prev_out = pending.output - lp;
    }

    pub fn process(&self, state: &mut HpfState, x: i64) -> i64 {
        let (y, pending) = self.check(state, x);
        self.update(state, pending);
        y
    }

    pub fn alpha(&self) -> Coeff {
        self.alpha
    }
}

// ─── Diode clip ───

/// Output of the diode clip: the limited value and whether the limit was hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Clipped {
    pub value: i64,
    pub clipped: bool,
}

/// Back-to-back diodes across the side-path output.
#[derive(Clone, Copy, Debug)]
pub struct DiodeClip {
    limit: i64,
}

impl DiodeClip {
    /// `threshold_gain` scales the signal level the circuit sees, so the clip
    /// point moves the other way.
    pub fn new(threshold_gain: f64) -> Self {
        let volts = if threshold_gain != 1.0 {
            DIODE_CLIP_VOLTS / threshold_gain
        } else {
            DIODE_CLIP_VOLTS
        };
        Self {
            limit: (volts * VOLT as f64).round() as i64,
        }
    }

    /// A value sitting on the limit counts as clipped.
    pub fn apply(&self, x: i64) -> Clipped {
        if x >= self.limit {
            Clipped { value: self.limit, clipped: true }
        } else if x <= -self.limit {
            Clipped { value: -self.limit, clipped: true }
        } else {
            Clipped { value: x, clipped: false }
        }
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }
}
