/// Main/side mixing for the encoder and decoder.
///
/// The side path is summed into the main signal at 5/6 weight on encode and
/// subtracted at the same weight on decode. Both truncate toward zero.

/// Mix the side-path output into the main signal.
#[inline]
pub fn encode(main: i64, side: i64) -> i64 {
    (main * 6 + side * 5) / 6
}

/// Remove a side-path contribution from an encoded sample.
#[inline]
pub fn decode(main: i64, side: i64) -> i64 {
    (main * 6 - side * 5) / 6
}
