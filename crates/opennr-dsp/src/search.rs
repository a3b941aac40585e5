/// Decoder inversion: find the output sample `y` that the encoder would have
/// turned into the received sample.
///
/// The side path is stateful, so the encoder cannot be inverted in closed form.
/// Instead we solve the fixed point
///
///   h(y) = decode_mix(received, side_path.check(y)),   h(y) = y
///
/// with a bracketing search. Each trial evaluation `o = h(g)` moves one end
/// of the bracket:
///   o == g  -> converged, bracket (g - 1, g + 1)
///   o >  g  -> answer lies above g (and no higher than o)
///   o <  g  -> answer lies below g (and no lower than o)
/// which assumes h is non-increasing around the answer, as it is for the
/// side path's positive gain. Up to two secant steps from clip-free trials
/// speed things up; everything else bisects.

use crate::mixers;
use crate::side_path::{ChannelState, SidePath, Trial};

/// Initial half-width of the bracket, 500 V.
pub const SEARCH_LIMIT: i64 = 500_000_000_000;

/// Smallest tolerance in nanovolts.
const MIN_TOLERANCE: i64 = 10;

const MAX_SECANT_STEPS: u32 = 2;

/// Secant slopes this close to 1 are numerically useless.
const FLAT_SLOPE: (f64, f64) = (0.95, 1.05);

/// Converged pair from the previous sample of one channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchHistory {
    prev_in: i64,
    prev_out: i64,
}

impl SearchHistory {
    fn extrapolate(&self, received: i64) -> i64 {
        self.prev_out + received - self.prev_in
    }
}

/// Open interval known to contain the answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bracket {
    pub low: i64,
    pub high: i64,
}

impl Bracket {
    fn open() -> Self {
        Self {
            low: -SEARCH_LIMIT,
            high: SEARCH_LIMIT,
        }
    }

    pub fn width(&self) -> i64 {
        self.high - self.low
    }

    fn narrow(&mut self, guess: i64, out: i64) {
        if out == guess {
            self.low = guess - 1;
            self.high = guess + 1;
        } else if out > guess {
            self.low = guess;
            if out < self.high {
                self.high = out + 1;
            }
        } else {
            self.high = guess;
            if out > self.low {
                self.low = out - 1;
            }
        }
    }

    /// Pull a candidate strictly inside the bracket.
    fn confine(&self, x: i64) -> i64 {
        if x <= self.low {
            self.low + 1
        } else if x >= self.high {
            self.high - 1
        } else {
            x
        }
    }
}

/// Result of one search.
#[derive(Debug)]
pub struct Solution {
    /// Last trial evaluated; committing it advances the channel.
    pub trial: Trial,
    /// Value tried in the last trial.
    pub guess: i64,
    /// `h(guess)`: the decoded sample.
    pub output: i64,
    /// Side-path evaluations spent.
    pub evaluations: u32,
}

/// Clip-free (guess, output) pairs for the secant step. Slot 0 keeps the
/// first one, slot 1 the latest.
#[derive(Default)]
struct Pairs {
    len: usize,
    guess: [i64; 2],
    out: [i64; 2],
}

impl Pairs {
    fn record(&mut self, guess: i64, out: i64) {
        if self.len < 2 {
            self.len += 1;
        }
        self.guess[self.len - 1] = guess;
        self.out[self.len - 1] = out;
    }

    /// Secant slope of h between the two pairs, when it can be trusted.
    fn slope(&self) -> Option<f64> {
        if self.len < 2 {
            return None;
        }
        let dg = self.guess[1] - self.guess[0];
        let d_out = self.out[1] - self.out[0];
        let trusted = (dg <= 0 || d_out <= 0) && d_out.unsigned_abs() < dg.unsigned_abs() * 20;
        trusted.then(|| d_out as f64 / dg as f64)
    }

    fn secant(&self, bracket: &Bracket) -> Option<i64> {
        let m = self.slope()?;
        if (FLAT_SLOPE.0..=FLAT_SLOPE.1).contains(&m) {
            return None;
        }
        let x = ((m * self.guess[0] as f64 - self.out[0] as f64) / (m - 1.0)).round();
        if !x.is_finite() {
            return None;
        }
        let x = x as i64;
        (x > bracket.low && x < bracket.high).then_some(x)
    }
}

pub struct InverseSearch {
    tolerance: i64,
}

impl InverseSearch {
    /// `accuracy` is linear and relative to one LSB of `scale` nanovolts.
    pub fn new(accuracy: f64, scale: i64) -> Self {
        Self {
            tolerance: ((accuracy * scale as f64).round() as i64).max(MIN_TOLERANCE),
        }
    }

    pub fn tolerance(&self) -> i64 {
        self.tolerance
    }

    pub fn solve(
        &self,
        side: &SidePath,
        state: &ChannelState,
        history: &SearchHistory,
        received: i64,
    ) -> Solution {
        self.solve_observed(side, state, history, received, |_| {})
    }

    /// `solve`, reporting the bracket after every trial.
    pub fn solve_observed(
        &self,
        side: &SidePath,
        state: &ChannelState,
        history: &SearchHistory,
        received: i64,
        mut observe: impl FnMut(Bracket),
    ) -> Solution {
        let evaluate = |guess: i64| {
            let trial = side.check(state, guess);
            let out = mixers::decode(received, trial.output());
            (trial, out)
        };

        let mut guess = history.extrapolate(received);
        let (mut trial, mut out) = evaluate(guess);
        let mut evaluations = 1;
        // Deliberately re-aims only a clipped first guess; a clipped trial
        // says nothing about the slope, its output is the better start.
        if trial.clipped() {
            guess = out;
            (trial, out) = evaluate(guess);
            evaluations += 1;
        }

        let mut pairs = Pairs::default();
        if !trial.clipped() {
            pairs.record(guess, out);
        }
        let mut bracket = Bracket::open();
        bracket.narrow(guess, out);
        observe(bracket);

        let mut secant_steps = 0;
        loop {
            let candidate = if secant_steps < MAX_SECANT_STEPS {
                pairs.secant(&bracket)
            } else {
                None
            };
            guess = match candidate {
                Some(x) => {
                    secant_steps += 1;
                    x
                }
                None => bracket.low + bracket.width() / 2,
            };
            guess = bracket.confine(guess);

            (trial, out) = evaluate(guess);
            evaluations += 1;
            if !trial.clipped() {
                pairs.record(guess, out);
            }
            bracket.narrow(guess, out);
            observe(bracket);

            if bracket.width() <= self.tolerance {
                break;
            }
        }

        Solution {
            trial,
            guess,
            output: out,
            evaluations,
        }
    }
}

/// Run the search for one sample and commit the winning trial.
pub fn decode_sample(
    search: &InverseSearch,
    side: &SidePath,
    state: &mut ChannelState,
    history: &mut SearchHistory,
    received: i64,
) -> i64 {
    let solution = search.solve(side, state, history, received);
    let committed = side.update(state, solution.trial);
    history.prev_in = received;
    history.prev_out = solution.output;
    mixers::decode(received, committed.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::Calibration;
    use crate::config::Config;

    /// Small LCG; the tests only need repeatable noise.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> f64 {
            self.0 = self
                .0
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (self.0 >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
        }
    }

    fn side_path(rate: u32, variant: u8) -> SidePath {
        let settings = Config {
            sample_rate: rate,
            filter_variant: variant,
            ..Config::default()
        }
        .validate()
        .unwrap();
        SidePath::new(&settings, &Calibration::nominal(settings.variant)).unwrap()
    }

    #[test]
    fn test_tolerance() {
        assert_eq!(InverseSearch::new(1.0, 61_035).tolerance(), 61_035);
        assert_eq!(InverseSearch::new(0.562_341_325, 61_035).tolerance(), 34_322);
        assert_eq!(InverseSearch::new(1e-5, 61_035).tolerance(), MIN_TOLERANCE);
        assert_eq!(InverseSearch::new(0.562_341_325, 238).tolerance(), 134);
    }

    #[test]
    fn test_bracket_narrowing() {
        let mut b = Bracket::open();
        b.narrow(100, 400);
        assert_eq!(b, Bracket { low: 100, high: 401 });
        b.narrow(300, 200);
        assert_eq!(b, Bracket { low: 199, high: 300 });
        b.narrow(250, 250);
        assert_eq!(b, Bracket { low: 249, high: 251 });
        assert_eq!(b.confine(0), 250);
        assert_eq!(b.confine(900), 250);
    }

    #[test]
    fn test_bracket_stays_ordered_and_shrinks() {
        let search = InverseSearch::new(0.562, 61_035);
        let mut rng = Lcg(0x5eed);
        for (rate, variant) in [(44100, 1), (48000, 2), (32000, 3), (44100, 4), (96000, 4)] {
            let side = side_path(rate, variant);
            let mut state = side.new_channel();
            let mut history = SearchHistory::default();
            for i in 0..3000 {
                // Bursts, silence and full-scale noise.
                let level = match (i / 500) % 3 {
                    0 => 2e9,
                    1 => 0.0,
                    _ => 2e7,
                };
                let received = (level * rng.next()) as i64;
                let mut prev_width = i64::MAX;
                let solution =
                    search.solve_observed(&side, &state, &history, received, |b| {
                        assert!(b.high > b.low, "bracket inverted: {b:?} (rate {rate}, variant {variant})");
                        assert!(b.width() <= prev_width, "bracket grew: {} -> {}", prev_width, b.width());
                        prev_width = b.width();
                    });
                assert!(
                    solution.evaluations <= 48,
                    "search took {} evaluations",
                    solution.evaluations
                );
                side.update(&mut state, solution.trial);
                history.prev_in = received;
                history.prev_out = solution.output;
            }
        }
    }

    #[test]
    fn test_decode_inverts_encode() {
        let side = side_path(44100, 4);
        let search = InverseSearch::new(0.1, 61_035);
        let mut enc = side.new_channel();
        let mut dec = side.new_channel();
        let mut history = SearchHistory::default();
        let mut worst = 0;
        for i in 0..8820 {
            let x = (3e8 * (2.0 * std::f64::consts::PI * 2500.0 * i as f64 / 44100.0).sin()) as i64;
            let encoded = mixers::encode(x, side.commit(&mut enc, x).value);
            let decoded = decode_sample(&search, &side, &mut dec, &mut history, encoded);
            worst = worst.max((decoded - x).abs());
        }
        assert!(worst < 61_035, "decode error {worst} nV exceeds one 16-bit LSB");
    }
}
