//! Encoding
//!
//! This module provides:
//! - The [`Codec`] seam over hardware/software encoders
//! - A bounded raw-frame queue with producer backpressure
//! - [`EncoderSession`], which drives one codec on a dedicated worker
//! - FFmpeg-backed codecs (feature `ffmpeg`)

#[cfg(feature = "ffmpeg")]
mod ffmpeg;
mod queue;
mod session;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::{available_encoders, codec_available, FfmpegCodecFactory};
pub use queue::FrameQueue;
pub use session::{EncoderEvent, EncoderSession, EncoderState, ErrorHook, InputHold};

use crate::config::{AudioConfig, VideoConfig};
use crate::error::Result;
use crate::types::{EncodedSample, FormatDescription, MediaKind};

/// Parameters a codec is created with
#[derive(Debug, Clone, PartialEq)]
pub enum CodecParams {
    /// Video encoder parameters
    Video(VideoConfig),
    /// Audio encoder parameters
    Audio(AudioConfig),
}

impl CodecParams {
    /// Media kind of these parameters
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Video(_) => MediaKind::Video,
            Self::Audio(_) => MediaKind::Audio,
        }
    }

    /// Validate the parameters before a codec is created
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Video(config) => config.validate_strict(),
            Self::Audio(config) => config.validate_strict(),
        }
    }

    /// Target bitrate in bits per second
    pub fn bitrate(&self) -> u32 {
        match self {
            Self::Video(config) => config.bitrate,
            Self::Audio(config) => config.bitrate,
        }
    }

    /// Update the target bitrate
    pub fn set_bitrate(&mut self, bps: u32) {
        match self {
            Self::Video(config) => config.bitrate = bps,
            Self::Audio(config) => config.bitrate = bps,
        }
    }
}

/// One unit of codec output
///
/// Sample bytes are borrowed from the codec and only valid for the
/// duration of the callback.
#[derive(Debug)]
pub enum CodecOutput<'a> {
    /// The output format is known or changed
    FormatChanged(FormatDescription),
    /// An encoded sample
    Sample {
        /// Encoded bytes
        data: &'a [u8],
        /// Presentation timestamp as reported by the codec (microseconds)
        pts_us: u64,
        /// Whether the sample is a key frame
        key_frame: bool,
    },
}

/// An encoder instance
///
/// Implementations are driven from a single worker thread at a time.
pub trait Codec: Send {
    /// Implementation name, for logging
    fn name(&self) -> &str;

    /// Submit one raw frame
    fn submit(&mut self, data: &[u8], pts_us: u64) -> Result<()>;

    /// Deliver every output that is ready
    fn drain(&mut self, out: &mut dyn FnMut(CodecOutput<'_>)) -> Result<()>;

    /// Force the next output to be a key frame; false if unsupported
    fn request_keyframe(&mut self) -> bool {
        false
    }

    /// Change the target bitrate live; false if unsupported
    fn set_bitrate(&mut self, _bps: u32) -> bool {
        false
    }

    /// Signal end of input and deliver the remaining outputs
    fn flush(&mut self, out: &mut dyn FnMut(CodecOutput<'_>)) -> Result<()>;
}

/// Creates codecs for a configuration
pub trait CodecFactory: Send + Sync {
    /// Create a codec, failing with `LivecastError::Prepare` if none accepts `params`
    fn create(&self, params: &CodecParams) -> Result<Box<dyn Codec>>;
}

/// Consumer of encoder output
///
/// Called synchronously on the encoder worker. Implementations must do
/// bounded work and copy any bytes they keep.
pub trait SampleSink: Send + Sync {
    /// Output format known or changed
    fn on_format(&self, format: &FormatDescription);

    /// One encoded sample
    fn on_sample(&self, sample: &EncodedSample<'_>);
}
