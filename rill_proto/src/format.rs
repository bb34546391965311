//! Sample, channel and volume definitions shared by both endpoints.

use alloc::vec::Vec;
use core::fmt;
use serde::{Deserialize, Serialize};

/// Highest sample rate a stream may be created or updated with.
pub const RATE_MAX: u32 = 48_000 * 4;

/// Highest number of channels in a single stream.
pub const CHANNELS_MAX: u8 = 32;

/// Microseconds per second.
pub const USEC_PER_SEC: u64 = 1_000_000;

/// Microseconds per millisecond.
pub const USEC_PER_MSEC: u64 = 1_000;

/// Supported sample formats.
///
/// All samples are interleaved and packed. The suffix gives the byte order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    ALaw,
    ULaw,
    S16Le,
    S16Be,
    F32Le,
    F32Be,
    S32Le,
    S32Be,
}

impl SampleFormat {
    /// Returns the size of a single sample in bytes.
    #[inline(always)]
    pub const fn sample_size(self) -> usize {
        use SampleFormat::*;
        match self {
            U8 | ALaw | ULaw => 1,
            S16Le | S16Be => 2,
            F32Le | F32Be | S32Le | S32Be => 4,
        }
    }

    /// Returns whether this is one of the 32-bit integer formats,
    /// which older servers do not understand.
    #[inline(always)]
    pub const fn is_s32(self) -> bool {
        matches!(self, SampleFormat::S32Le | SampleFormat::S32Be)
    }
}

/// Format, rate and channel count of a stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u8,
}

impl SampleSpec {
    #[inline(always)]
    pub const fn new(format: SampleFormat, rate: u32, channels: u8) -> Self {
        Self {
            format,
            rate,
            channels,
        }
    }

    /// A spec is valid if its rate is in `1..=RATE_MAX` and its channel count
    /// in `1..=CHANNELS_MAX`.
    #[inline(always)]
    pub const fn is_valid(&self) -> bool {
        self.rate > 0 && self.rate <= RATE_MAX && self.channels > 0 && self.channels <= CHANNELS_MAX
    }

    /// Size of one frame (one sample for every channel) in bytes.
    #[inline(always)]
    pub const fn frame_size(&self) -> usize {
        self.format.sample_size() * self.channels as usize
    }

    /// Bytes of audio played per second.
    #[inline(always)]
    pub const fn bytes_per_second(&self) -> u64 {
        self.rate as u64 * self.frame_size() as u64
    }

    /// Converts a byte count into the playback time it represents.
    ///
    /// Partial frames are truncated.
    #[inline]
    pub fn bytes_to_usec(&self, length: u64) -> u64 {
        let frame_size = self.frame_size() as u64;
        if frame_size == 0 || self.rate == 0 {
            return 0;
        }

        let frames = length / frame_size;
        let usec = (frames as u128 * USEC_PER_SEC as u128) / self.rate as u128;
        u64::try_from(usec).unwrap_or(u64::MAX)
    }

    /// Converts a duration into a whole number of frames, expressed in bytes.
    #[inline]
    pub fn usec_to_bytes(&self, usec: u64) -> usize {
        let frames = (usec as u128 * self.rate as u128) / USEC_PER_SEC as u128;
        usize::try_from(frames)
            .unwrap_or(usize::MAX)
            .saturating_mul(self.frame_size())
    }
}

impl fmt::Display for SampleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}ch {}Hz", self.format, self.channels, self.rate)
    }
}

/// Speaker position of a single channel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum ChannelPosition {
    Mono,
    FrontLeft,
    FrontRight,
    FrontCenter,
    RearLeft,
    RearRight,
    RearCenter,
    Lfe,
    SideLeft,
    SideRight,
    Aux(u8),
}

/// Maps every channel of a stream to a speaker position.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct ChannelMap {
    pub positions: Vec<ChannelPosition>,
}

impl ChannelMap {
    /// Builds the default layout for `channels` channels.
    ///
    /// Returns `None` if the channel count is zero or above [`CHANNELS_MAX`].
    pub fn auto(channels: u8) -> Option<Self> {
        use ChannelPosition::*;

        if channels == 0 || channels > CHANNELS_MAX {
            return None;
        }

        let positions = match channels {
            1 => alloc::vec![Mono],
            2 => alloc::vec![FrontLeft, FrontRight],
            3 => alloc::vec![FrontLeft, FrontRight, FrontCenter],
            4 => alloc::vec![FrontLeft, FrontRight, RearLeft, RearRight],
            5 => alloc::vec![FrontLeft, FrontRight, RearLeft, RearRight, FrontCenter],
            6 => alloc::vec![FrontLeft, FrontRight, RearLeft, RearRight, FrontCenter, Lfe],
            8 => alloc::vec![
                FrontLeft,
                FrontRight,
                RearLeft,
                RearRight,
                FrontCenter,
                Lfe,
                SideLeft,
                SideRight,
            ],
            n => (0..n).map(Aux).collect(),
        };

        Some(Self { positions })
    }

    #[inline(always)]
    pub fn channels(&self) -> usize {
        self.positions.len()
    }

    /// A map is valid if it is non-empty and not larger than [`CHANNELS_MAX`].
    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        !self.positions.is_empty() && self.positions.len() <= usize::from(CHANNELS_MAX)
    }
}

/// Volume value for unamplified output.
pub const VOLUME_NORM: u32 = 0x10000;

/// Per-channel volumes.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct ChannelVolumes {
    pub values: Vec<u32>,
}

impl ChannelVolumes {
    /// All `channels` channels at [`VOLUME_NORM`].
    #[inline]
    pub fn reset(channels: u8) -> Self {
        Self {
            values: alloc::vec![VOLUME_NORM; usize::from(channels)],
        }
    }

    #[inline(always)]
    pub fn channels(&self) -> usize {
        self.values.len()
    }
}
