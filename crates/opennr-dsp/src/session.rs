/// Encode/decode session: validated settings, calibrated side path and the
/// per-channel state, driven one interleaved frame buffer at a time.
///
/// A `Session` only exists calibrated; `start` fails rather than returning a
/// half-built one. Channels never interact.

use log::debug;

use crate::cache::CalibrationCache;
use crate::calibrate::{Calibration, CalibrationPlan, load_or_calibrate};
use crate::config::{Config, Settings};
use crate::error::{NrError, NrResult};
use crate::pcm;
use crate::search::{InverseSearch, SearchHistory, decode_sample};
use crate::side_path::{ChannelState, SidePath};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Encode,
    Decode,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Channel {
    side: ChannelState,
    history: SearchHistory,
}

pub struct Session {
    settings: Settings,
    calibration: Calibration,
    side: SidePath,
    search: InverseSearch,
    channels: Vec<Channel>,
}

impl Session {
    /// Validate `config`, build the tables and calibrate (or load a cached
    /// calibration).
    pub fn start(config: &Config, cache: &dyn CalibrationCache) -> NrResult<Self> {
        Self::start_with_plan(config, CalibrationPlan::default(), cache)
    }

    /// `start` with custom calibration test lengths.
    pub fn start_with_plan(
        config: &Config,
        plan: CalibrationPlan,
        cache: &dyn CalibrationCache,
    ) -> NrResult<Self> {
        let settings = config.validate()?;
        let calibration = load_or_calibrate(&settings, plan, cache)?;
        let side = SidePath::new(&settings, &calibration)?;
        let search = InverseSearch::new(settings.accuracy, settings.bit_depth.scale());
        debug!(
            "session: {} Hz, {} ch, {}-bit, variant {}, upsampling {}{}, tolerance {} nV",
            settings.sample_rate,
            settings.channels,
            settings.bit_depth.bits(),
            settings.variant.number(),
            settings.upsampling,
            if settings.upsample_all { " (all stages)" } else { "" },
            search.tolerance()
        );

        let mut session = Self {
            settings,
            calibration,
            side,
            search,
            channels: Vec::new(),
        };
        session.reset();
        Ok(session)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    pub fn side_path(&self) -> &SidePath {
        &self.side
    }

    /// Zero every channel's filter and search state.
    pub fn reset(&mut self) {
        let fresh = Channel {
            side: self.side.new_channel(),
            history: SearchHistory::default(),
        };
        self.channels = vec![fresh; self.settings.channels];
    }

    pub fn encode(&mut self, input: &[i32]) -> NrResult<Vec<i32>> {
        let mut output = vec![0; input.len()];
        self.process_into(Direction::Encode, input, &mut output)?;
        Ok(output)
    }

    pub fn decode(&mut self, input: &[i32]) -> NrResult<Vec<i32>> {
        let mut output = vec![0; input.len()];
        self.process_into(Direction::Decode, input, &mut output)?;
        Ok(output)
    }

    pub fn encode_into(&mut self, input: &[i32], output: &mut [i32]) -> NrResult<()> {
        self.process_into(Direction::Encode, input, output)
    }

    pub fn decode_into(&mut self, input: &[i32], output: &mut [i32]) -> NrResult<()> {
        self.process_into(Direction::Decode, input, output)
    }

    /// Encode raw little-endian PCM at the session's bit depth.
    pub fn encode_bytes(&mut self, input: &[u8]) -> NrResult<Vec<u8>> {
        self.process_bytes(Direction::Encode, input)
    }

    pub fn decode_bytes(&mut self, input: &[u8]) -> NrResult<Vec<u8>> {
        self.process_bytes(Direction::Decode, input)
    }

    /// Encode a single sample on one channel.
    pub fn encode_sample(&mut self, channel: usize, sample: i32) -> NrResult<i32> {
        self.check_channel(channel)?;
        Ok(self.process_sample(Direction::Encode, channel, sample))
    }

    pub fn decode_sample(&mut self, channel: usize, sample: i32) -> NrResult<i32> {
        self.check_channel(channel)?;
        Ok(self.process_sample(Direction::Decode, channel, sample))
    }

    fn check_channel(&self, index: usize) -> NrResult<()> {
        if index < self.settings.channels {
            Ok(())
        } else {
            Err(NrError::Channel {
                index,
                channels: self.settings.channels,
            })
        }
    }

    fn process_bytes(&mut self, direction: Direction, input: &[u8]) -> NrResult<Vec<u8>> {
        let depth = self.settings.bit_depth;
        if input.len() % depth.bytes() != 0 {
            return Err(NrError::PartialSample {
                len: input.len(),
                width: depth.bytes(),
            });
        }
        let samples = pcm::unpack(depth, input);
        let mut output = vec![0; samples.len()];
        self.process_into(direction, &samples, &mut output)?;
        Ok(pcm::pack(depth, &output))
    }

    /// Lengths are checked before any channel state moves.
    fn process_into(
        &mut self,
        direction: Direction,
        input: &[i32],
        output: &mut [i32],
    ) -> NrResult<()> {
        let channels = self.settings.channels;
        if input.len() % channels != 0 {
            return Err(NrError::FrameLength {
                len: input.len(),
                channels,
            });
        }
        if output.len() != input.len() {
            return Err(NrError::BufferMismatch {
                input: input.len(),
                output: output.len(),
            });
        }
        for (i, (&x, y)) in input.iter().zip(output.iter_mut()).enumerate() {
            *y = self.process_sample(direction, i % channels, x);
        }
        Ok(())
    }

    /// Samples outside the bit depth's range are saturated to it first.
    fn process_sample(&mut self, direction: Direction, channel: usize, sample: i32) -> i32 {
        let depth = self.settings.bit_depth;
        let scale = depth.scale();
        let passes = self.settings.input_passes();
        let x = depth.saturate(sample as i64) as i64 * scale;
        let ch = &mut self.channels[channel];

        let value = match direction {
            Direction::Encode => self.side.encode(&mut ch.side, x, passes),
            Direction::Decode => {
                let mut total: i128 = 0;
                for _ in 0..passes {
                    total += decode_sample(&self.search, &self.side, &mut ch.side, &mut ch.history, x)
                        as i128;
                }
                crate::fixed::narrow(total / passes as i128)
            }
        };
        depth.saturate(value / scale)
    }
}
