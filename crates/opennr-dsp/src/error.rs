/// Error taxonomy for the noise-reduction engine.
///
/// Configuration and resource errors are fatal to `Session::start`. Cache
/// errors only ever surface from `CalibrationCache` implementations; the
/// session logs them and carries on as if the cache missed.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NrError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("table allocation failed: {0}")]
    Resource(String),

    #[error("calibration cache: {0}")]
    Cache(String),

    #[error("{len} samples is not a whole number of {channels}-channel frames")]
    FrameLength { len: usize, channels: usize },

    #[error("output buffer holds {output} samples but input has {input}")]
    BufferMismatch { input: usize, output: usize },

    #[error("{len} bytes is not a whole number of {width}-byte samples")]
    PartialSample { len: usize, width: usize },

    #[error("channel {index} out of range for {channels}-channel session")]
    Channel { index: usize, channels: usize },
}

pub type NrResult<T> = Result<T, NrError>;
