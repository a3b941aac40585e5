/// FET voltage-controlled resistor and the sliding filter's coefficient tables.
///
/// The FET's drain-source resistance as a function of gate-source voltage:
///   R(Vgs) = (2000 / IDSS) / (1 - Vgs / Vgs_off),  100 <= R <= 1M
///
/// Three tables are built over 1001 positions covering |Vgs| = 0..4 V:
///   pot:     R / (R + R2), the sliding filter's pot attenuation
///   alpha:   high-pass alpha of R * C2 at the sliding filter's rate
///   out_att: extra output attenuation standing in for frequencies the
///            filter is not allowed to reach (RC clamped at 0.2 * rate)
///
/// `lookup` interpolates all three between the two positions bracketing the
/// current voltage.

use std::f64::consts::PI;

use crate::config::FilterVariant;
use crate::error::NrResult;
use crate::filters::{C1, R1, hpf_alpha};
use crate::fixed::{ALPHA_TARGET, CAP_SCALE, VOLT, alloc_table, lerp, mux_for};

// ── FET and component constants ──

pub const IDSS: f64 = 6.0;
pub const VGS_OFF: f64 = -4.0;
const MIN_OHMS: f64 = 100.0;
const MAX_OHMS: f64 = 1_000_000.0;

/// Sliding filter: R2 = 47k, C2 = 4.7 nF.
pub const R2: f64 = 47_000.0;
pub const C2: f64 = 47.0 / CAP_SCALE;

/// Highest sliding-filter cutoff as a fraction of its sample rate.
const MAX_FREQ_RATIO: f64 = 0.2;

/// Positions 0..=TABLE_SIZE.
pub const TABLE_SIZE: usize = 1000;

const POT_TARGET: f64 = 1_000_000.0;

/// Multiplier of the output attenuation table.
pub const OUT_ATT_MUX: i64 = 1_000_000;

/// Drain-source resistance for a gate-source voltage.
pub fn fet_resistance(vgs: f64) -> f64 {
    let vgs = vgs.max(VGS_OFF + 0.0001);
    let r = (2000.0 / IDSS) / (1.0 - vgs / VGS_OFF);
    r.clamp(MIN_OHMS, MAX_OHMS)
}

/// Interpolated coefficients for the current control voltage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Coefficients {
    pub pot: i64,
    pub alpha: i64,
    pub out_att: i64,
}

pub struct FetTables {
    max_volts: i64,
    step: i64,
    pot: Vec<i64>,
    alpha: Vec<i64>,
    out_att: Vec<i64>,
    pot_mux: i64,
    alpha_mux: i64,
}

/// RC limits of the sliding filter.
struct RcLimits {
    /// Smallest RC the filter may use (highest frequency).
    min: f64,
    /// `min - RC at Vgs = 0`; zero when the FET never reaches the limit.
    span: f64,
    /// Largest RC for variants that cap it.
    cap: Option<f64>,
}

impl FetTables {
    /// Build the tables for a sliding filter running at `filter_rate`.
    pub fn build(variant: FilterVariant, filter_rate: f64) -> NrResult<Self> {
        let max_volts = (VOLT as f64 * -VGS_OFF).round() as i64;
        let mut step = max_volts / TABLE_SIZE as i64;
        while max_volts / step < TABLE_SIZE as i64 {
            step += 1;
        }
        while max_volts / step > TABLE_SIZE as i64 {
            step -= 1;
        }
        let resistance = |pos: usize| fet_resistance(-((pos as i64 * step) as f64) / VOLT as f64);

        let mut min_rc = 1.0 / (2.0 * PI * filter_rate * MAX_FREQ_RATIO);
        let low_rc = resistance(0) * C2;
        if min_rc <= low_rc {
            min_rc = low_rc;
        }
        let limits = RcLimits {
            min: min_rc,
            span: min_rc - low_rc,
            cap: variant.caps_rc().then_some(R1 * C1),
        };

        let len = TABLE_SIZE + 1;
        let mut pot = alloc_table(len, "pot table")?;
        let mut alpha = alloc_table(len, "sliding alpha table")?;
        let mut out_att = alloc_table(len, "output attenuation table")?;

        let pot_of = |r: f64| r / (r + R2);
        let pot_mux = mux_for(pot_of(resistance(0)), POT_TARGET);
        for (pos, entry) in pot.iter_mut().enumerate() {
            *entry = (pot_mux as f64 * pot_of(resistance(pos))).round() as i64;
        }

        let (top_alpha, _) = limits.alpha(resistance(TABLE_SIZE) * C2, filter_rate);
        let alpha_mux = mux_for(top_alpha, ALPHA_TARGET as f64);
        let mut prev = 0;
        for pos in 0..len {
            let (a, att) = limits.alpha(resistance(pos) * C2, filter_rate);
            out_att[pos] = (OUT_ATT_MUX as f64 * att).round() as i64;
            // Rounding can dent the curve; keep it non-decreasing.
            let value = ((alpha_mux as f64 * a).round() as i64).max(prev);
            alpha[pos] = value;
            prev = value;
        }

        Ok(Self {
            max_volts,
            step,
            pot,
            alpha,
            out_att,
            pot_mux,
            alpha_mux,
        })
    }

    /// Coefficients for a source-minus-gate voltage in nanovolts.
    pub fn lookup(&self, vds: i64) -> Coefficients {
        let v = vds.clamp(0, self.max_volts);
        let pos = ((v / self.step) as usize).min(TABLE_SIZE);
        let next = (pos + 1).min(TABLE_SIZE);
        let frac = v - pos as i64 * self.step;
        Coefficients {
            pot: lerp(self.pot[pos], self.pot[next], frac, self.step),
            alpha: lerp(self.alpha[pos], self.alpha[next], frac, self.step),
            out_att: lerp(self.out_att[pos], self.out_att[next], frac, self.step),
        }
    }

    pub fn pot_mux(&self) -> i64 {
        self.pot_mux
    }

    pub fn alpha_mux(&self) -> i64 {
        self.alpha_mux
    }

    pub fn max_volts(&self) -> i64 {
        self.max_volts
    }
}

impl RcLimits {
    /// Alpha and output attenuation for an RC, after applying the limits.
    fn alpha(&self, rc: f64, rate: f64) -> (f64, f64) {
        let mut rc = match self.cap {
            Some(cap) => rc.min(cap),
            None => rc,
        };
        let mut att = 1.0;
        if self.span > 0.0 && rc < self.min {
            att = 1.0 - (self.min - rc) / self.span;
            rc = self.min;
        }
        (hpf_alpha(rc, rate), att)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fet_resistance_limits() {
        approx::assert_relative_eq!(fet_resistance(0.0), 2000.0 / 6.0, max_relative = 1e-12);
        assert_eq!(fet_resistance(-4.0), MAX_OHMS);
        assert_eq!(fet_resistance(-10.0), MAX_OHMS);
        assert_eq!(fet_resistance(5.0), MIN_OHMS);
        assert!(fet_resistance(-2.0) > fet_resistance(-1.0));
    }

    #[test]
    fn test_table_grid() {
        let t = FetTables::build(FilterVariant::Type4, 220_500.0).unwrap();
        assert_eq!(t.max_volts(), 4 * VOLT);
        assert_eq!(t.max_volts() / t.step, TABLE_SIZE as i64);
        assert_eq!(t.pot.len(), TABLE_SIZE + 1);
    }

    #[test]
    fn test_alpha_table_monotone() {
        for variant in [FilterVariant::Type1, FilterVariant::Type4] {
            let t = FetTables::build(variant, 220_500.0).unwrap();
            for w in t.alpha.windows(2) {
                assert!(w[1] >= w[0], "alpha table dips: {} -> {}", w[0], w[1]);
            }
            let top = *t.alpha.last().unwrap();
            assert!((top - ALPHA_TARGET).abs() <= 1, "top alpha {top}");
        }
    }

    #[test]
    fn test_pot_table_spans_fet_range() {
        let t = FetTables::build(FilterVariant::Type3, 220_500.0).unwrap();
        // Vgs = 0: FET fully on, pot at its lowest (the multiplier target).
        assert!((t.pot[0] - 1_000_000).abs() <= 1);
        // Vgs = -4 V: 1M against 47k.
        let hi = t.pot[TABLE_SIZE] as f64 / t.pot_mux() as f64;
        approx::assert_relative_eq!(hi, 1e6 / 1.047e6, max_relative = 1e-4);
    }

    #[test]
    fn test_output_attenuation_only_near_fet_on() {
        let t = FetTables::build(FilterVariant::Type1, 220_500.0).unwrap();
        assert!(t.out_att[0] < OUT_ATT_MUX, "Vgs = 0 should need attenuation");
        assert_eq!(t.out_att[TABLE_SIZE], OUT_ATT_MUX);
        for w in t.out_att.windows(2) {
            assert!(w[1] >= w[0]);
        }
    }

    #[test]
    fn test_lookup_interpolates_and_clamps() {
        let t = FetTables::build(FilterVariant::Type4, 220_500.0).unwrap();
        let at = |pos: usize| t.lookup(pos as i64 * t.step);
        assert_eq!(at(10).alpha, t.alpha[10]);
        let mid = t.lookup(10 * t.step + t.step / 2);
        let (a, b) = (t.alpha[10], t.alpha[11]);
        assert!(mid.alpha >= a.min(b) && mid.alpha <= a.max(b));
        assert_eq!(t.lookup(-5), at(0));
        assert_eq!(t.lookup(i64::MAX), at(TABLE_SIZE));
    }
}
