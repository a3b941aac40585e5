/// Raw little-endian PCM packing for byte-stream hosts.
///
/// 8-bit samples are unsigned with a 128 offset; 16- and 24-bit samples are
/// two's complement.

use crate::config::BitDepth;

/// Samples in `bytes`; a trailing partial sample is ignored.
pub fn sample_count(depth: BitDepth, bytes: &[u8]) -> usize {
    bytes.len() / depth.bytes()
}

pub fn unpack(depth: BitDepth, bytes: &[u8]) -> Vec<i32> {
    match depth {
        BitDepth::Eight => bytes.iter().map(|&b| b as i32 - 128).collect(),
        BitDepth::Sixteen => bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as i32)
            .collect(),
        BitDepth::TwentyFour => bytes
            .chunks_exact(3)
            // Place in the top three bytes and shift back to sign-extend.
            .map(|c| i32::from_le_bytes([0, c[0], c[1], c[2]]) >> 8)
            .collect(),
    }
}

/// Samples are saturated to the depth's range before packing.
pub fn pack(depth: BitDepth, samples: &[i32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * depth.bytes());
    for &s in samples {
        let s = depth.saturate(s as i64);
        match depth {
            BitDepth::Eight => out.push((s + 128) as u8),
            BitDepth::Sixteen => out.extend_from_slice(&(s as i16).to_le_bytes()),
            BitDepth::TwentyFour => out.extend_from_slice(&s.to_le_bytes()[..3]),
        }
    }
    out
}
