//! opennr DSP library: fixed-point simulation of a companding noise-reduction
//! circuit (B-type side-path encoder/decoder).
//!
//! All signal arithmetic is integer nanovolts; no audio framework dependencies.
//! Hosts start a `Session` and feed it interleaved PCM.

// Fixed-point primitives and circuit stages
pub mod fixed;
pub mod mixers;
pub mod filters;
pub mod fet;
pub mod gate;
pub mod sliding;

// Side path and its inversion
pub mod side_path;
pub mod search;

// Calibration
pub mod cache;
pub mod calibrate;

// Host-facing
pub mod config;
pub mod error;
pub mod pcm;
pub mod session;

pub use cache::{CacheKey, CalibrationCache, FileCache, MemoryCache, NoCache};
pub use calibrate::{Calibration, CalibrationPlan};
pub use config::{BitDepth, Config, FilterVariant, Settings};
pub use error::{NrError, NrResult};
pub use session::Session;
