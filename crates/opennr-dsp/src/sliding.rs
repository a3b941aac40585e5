/// Sliding high-pass filter: a one-pole HPF whose coefficient, pot tap and
/// output attenuation all come from the FET tables each sample.
///
/// Variants 1/2 take the pot tap off the input and filter the remainder;
/// variants 3/4 filter first and tap the pot across what the filter removed.
/// The coefficient filter runs `passes` times per call (zero-order hold
/// upsampling) and the passes are averaged back down.

use crate::config::FilterVariant;
use crate::error::NrResult;
use crate::fet::{Coefficients, FetTables, OUT_ATT_MUX};
use crate::filters::{DcFilter, DcState};
use crate::fixed::{mul_div, narrow};

pub struct SlidingFilter {
    variant: FilterVariant,
    passes: u32,
    tables: FetTables,
    dc: DcFilter,
}

/// History of one sliding filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlidingState {
    prev_in: i64,
    prev_out: i64,
    dc: DcState,
}

/// Filter history produced by a trial, waiting to be applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlidingPending {
    prev_in: i64,
    prev_out: i64,
    filtered: i64,
}

/// One evaluated sample: filter branch, pot branch, and the pending history.
#[derive(Clone, Copy, Debug)]
pub struct SlidingOutput {
    pub filtered: i64,
    pub pot: i64,
    pub pending: SlidingPending,
}

impl SlidingFilter {
    /// `filter_rate` is the rate the coefficient filter effectively runs at;
    /// `base_rate` is the call rate (DC tracker).
    pub fn new(
        variant: FilterVariant,
        filter_rate: f64,
        base_rate: f64,
        passes: u32,
    ) -> NrResult<Self> {
        Ok(Self {
            variant,
            passes: passes.max(1),
            tables: FetTables::build(variant, filter_rate)?,
            dc: DcFilter::new(base_rate),
        })
    }

    /// Table coefficients for a source-minus-gate voltage.
    pub fn coefficients(&self, vds: i64) -> Coefficients {
        self.tables.lookup(vds)
    }

    pub fn check(&self, state: &SlidingState, c: &Coefficients, x: i64) -> SlidingOutput {
        let pot_mux = self.tables.pot_mux();
        let pot_in = if self.variant.pot_first() {
            mul_div(x, c.pot, pot_mux)
        } else {
            0
        };
        let smp = x - pot_in;

        let alpha_mux = self.tables.alpha_mux();
        let (mut prev_in, mut prev_out) = (state.prev_in, state.prev_out);
        let mut total: i128 = 0;
        for _ in 0..self.passes {
            let y = mul_div(prev_out + smp - prev_in, c.alpha, alpha_mux);
            prev_in = smp;
            prev_out = y;
            total += y as i128;
        }
        let averaged = narrow(total / self.passes as i128);
        let filtered = mul_div(averaged, c.out_att, OUT_ATT_MUX);

        let pot = if self.variant.pot_first() {
            pot_in
        } else {
            mul_div(x - filtered, c.pot, pot_mux)
        };

        SlidingOutput {
            filtered,
            pot,
            pending: SlidingPending {
                prev_in,
                prev_out,
                filtered,
            },
        }
    }

    /// Apply a trial's history, removing the output's DC level from it.
    pub fn update(&self, state: &mut SlidingState, pending: SlidingPending) {
        state.prev_in = pending.prev_in;
        let lp = self.dc.process(&mut state.dc, pending.filtered);
        state.prev_out = pending.prev_out - lp;
    }

    pub fn tables(&self) -> &FetTables {
        &self.tables
    }
}
