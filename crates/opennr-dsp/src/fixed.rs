/// Fixed-point coefficient convention shared by every stage.
///
/// A real coefficient `c` is carried as an integer pair `(value, mux)` with
/// `value ≈ c * mux`, so per-sample code multiplies and divides integers only.
/// The multiplier is picked from a target: `mux = round(target / c)`, which
/// makes `value` land near `target` for the coefficient the table or filter
/// was fitted against.
///
/// Signal values are nanovolts. Products go through an `i128` intermediate and
/// saturate when narrowed, so a wild trial value in the decoder search can't
/// wrap around.

use crate::error::{NrError, NrResult};

/// Nanovolts per volt.
pub const VOLT: i64 = 1_000_000_000;

/// Target for filter alpha multipliers.
pub const ALPHA_TARGET: i64 = 1_000_000;

/// Target for gain multipliers (2^20).
pub const GAIN_TARGET: i64 = 1_048_576;

/// Capacitor values in the component list are given in units of 1e-10 F.
pub const CAP_SCALE: f64 = 1e10;

/// Multiplier that brings `coefficient * mux` as close as possible to `target`.
pub fn mux_for(coefficient: f64, target: f64) -> i64 {
    (target / coefficient).round() as i64
}

/// Decibels to linear amplitude ratio.
pub fn db_to_gain(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

/// Saturating conversion from a wide intermediate.
#[inline]
pub fn narrow(v: i128) -> i64 {
    v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// `x * num / den`, truncating toward zero.
#[inline]
pub fn mul_div(x: i64, num: i64, den: i64) -> i64 {
    narrow(x as i128 * num as i128 / den as i128)
}

/// Integer coefficient with its multiplier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Coeff {
    pub value: i64,
    pub mux: i64,
}

impl Coeff {
    /// Fit `coefficient` against `target` (see module docs).
    ///
    /// A coefficient larger than `target` would round its multiplier to zero;
    /// the multiplier is held at 1 instead.
    pub fn fit(coefficient: f64, target: i64) -> Self {
        let mux = match mux_for(coefficient, target as f64) {
            0 => 1,
            mux => mux,
        };
        Self {
            value: (coefficient * mux as f64).round() as i64,
            mux,
        }
    }

    #[inline]
    pub fn apply(self, x: i64) -> i64 {
        mul_div(x, self.value, self.mux)
    }

    pub fn as_f64(self) -> f64 {
        self.value as f64 / self.mux as f64
    }
}

/// Smallest multiplier for which `alpha * mux >= 1`.
///
/// Used for very slow filters where the alpha target would overflow; the
/// resulting integer alpha is 1.
pub fn unit_alpha_mux(alpha: f64) -> i64 {
    let mut mux = (1.0 / alpha).round() as i64;
    while mux > 1 && alpha * mux as f64 > 1.0 {
        mux -= 1;
    }
    while alpha * (mux as f64) < 1.0 {
        mux += 1;
    }
    mux
}

/// Allocate a zeroed coefficient table, reporting allocator failure as an error.
pub fn alloc_table(len: usize, what: &str) -> NrResult<Vec<i64>> {
    let mut table = Vec::new();
    table
        .try_reserve_exact(len)
        .map_err(|e| NrError::Resource(format!("{what} ({len} entries): {e}")))?;
    table.resize(len, 0);
    Ok(table)
}

/// Interpolate between two adjacent table entries.
///
/// `frac / step` is the fractional position between `lo` and `hi`.
#[inline]
pub fn lerp(lo: i64, hi: i64, frac: i64, step: i64) -> i64 {
    lo + mul_div(frac, hi - lo, step)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_lands_near_target() {
        let c = Coeff::fit(0.93, ALPHA_TARGET);
        assert!((c.value - ALPHA_TARGET).abs() <= 1, "value {}", c.value);
        approx::assert_relative_eq!(c.as_f64(), 0.93, max_relative = 1e-6);
    }

    #[test]
    fn test_gain_fit() {
        let g = Coeff::fit(2.4765062332, GAIN_TARGET);
        assert_eq!(g.mux, (1_048_576.0f64 / 2.4765062332).round() as i64);
        assert_eq!(g.apply(1_000_000), 1_000_000 * g.value / g.mux);
    }

    #[test]
    fn test_fit_never_divides_by_zero() {
        let huge = Coeff::fit(1e300, GAIN_TARGET);
        assert_eq!(huge.mux, 1);
        assert_eq!(huge.apply(0), 0);
        let over = Coeff::fit(4.0 * GAIN_TARGET as f64, GAIN_TARGET);
        assert_eq!(over.mux, 1);
        assert_eq!(over.apply(3), 3 * over.value);
    }

    #[test]
    fn test_unit_alpha_mux() {
        let a = 2.2675e-5;
        let mux = unit_alpha_mux(a);
        assert!(a * mux as f64 >= 1.0);
        assert!(a * ((mux - 1) as f64) < 1.0);
        assert_eq!((a * mux as f64).round() as i64, 1);
    }

    #[test]
    fn test_mul_div_saturates_instead_of_wrapping() {
        let big = mul_div(i64::MAX / 2, 1_000_000, 3);
        assert_eq!(big, i64::MAX);
        let neg = mul_div(i64::MIN / 2, 1_000_000, 3);
        assert_eq!(neg, i64::MIN);
    }

    #[test]
    fn test_mul_div_truncates_toward_zero() {
        assert_eq!(mul_div(-7, 1, 2), -3);
        assert_eq!(mul_div(7, 1, 2), 3);
    }

    #[test]
    fn test_db_to_gain() {
        approx::assert_relative_eq!(db_to_gain(20.0), 10.0, max_relative = 1e-12);
        approx::assert_relative_eq!(db_to_gain(-6.0206), 0.5, max_relative = 1e-4);
    }
}
