//! Core types for livecast
//!
//! These types represent the data flowing between capture, encoding,
//! recording and streaming.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Global handle counter for unique session IDs
static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque handle for a stream session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    /// Create a new unique handle
    pub fn new() -> Self {
        Self(HANDLE_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw handle value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

/// Monotonic clock in microseconds, shared by capture drivers and sessions
pub fn monotonic_us() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Session-start timestamp anchor
///
/// Encoders subtract the anchor from capture timestamps so that all
/// tracks of a session share one time origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionAnchor(u64);

impl SessionAnchor {
    /// Anchor at the current monotonic time
    pub fn now() -> Self {
        Self(monotonic_us())
    }

    /// Anchor at a given monotonic time
    pub fn at(us: u64) -> Self {
        Self(us)
    }

    /// Monotonic time of the anchor
    pub fn as_us(&self) -> u64 {
        self.0
    }

    /// Capture timestamp relative to the anchor
    pub fn relative(&self, timestamp_us: u64) -> u64 {
        timestamp_us.saturating_sub(self.0)
    }
}

/// Kind of media carried by a frame, sample or track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Video
    Video,
    /// Audio
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// Raw capture frame handed to an encoder
///
/// Video frames are planar YUV 4:2:0 at the prepared resolution, audio
/// frames are interleaved signed 16-bit PCM at the prepared rate.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    /// Owned capture buffer
    pub data: Vec<u8>,
    /// Offset of the payload inside `data`
    pub offset: usize,
    /// Payload length in bytes
    pub len: usize,
    /// Capture timestamp (monotonic, microseconds)
    pub timestamp_us: u64,
}

impl MediaFrame {
    /// Create a frame covering the whole buffer
    pub fn new(data: Vec<u8>, timestamp_us: u64) -> Self {
        let len = data.len();
        Self {
            data,
            offset: 0,
            len,
            timestamp_us,
        }
    }

    /// Create a frame covering part of a buffer
    pub fn with_range(data: Vec<u8>, offset: usize, len: usize, timestamp_us: u64) -> Self {
        Self {
            data,
            offset,
            len,
            timestamp_us,
        }
    }

    /// Payload bytes, clamped to the buffer bounds
    pub fn payload(&self) -> &[u8] {
        let start = self.offset.min(self.data.len());
        let end = start.saturating_add(self.len).min(self.data.len());
        &self.data[start..end]
    }
}

/// Flags carried by an encoded sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleFlags {
    /// Sample can be decoded on its own
    pub key_frame: bool,
    /// Sample carries codec configuration rather than media
    pub config: bool,
}

impl SampleFlags {
    /// Flags for a key frame
    pub const KEY: Self = Self {
        key_frame: true,
        config: false,
    };
}

/// One unit of codec output, borrowed for the duration of a delivery
///
/// Consumers that need the bytes after the delivery call returns must
/// copy them with [`EncodedSample::to_owned`].
#[derive(Debug, Clone, Copy)]
pub struct EncodedSample<'a> {
    /// Media kind of the producing encoder
    pub kind: MediaKind,
    /// Encoded bytes
    pub data: &'a [u8],
    /// Presentation timestamp relative to the session anchor (microseconds)
    pub pts_us: u64,
    /// Sample flags
    pub flags: SampleFlags,
}

impl EncodedSample<'_> {
    /// Whether this is a key frame
    pub fn is_key_frame(&self) -> bool {
        self.flags.key_frame
    }

    /// Copy the sample out of the codec buffer
    pub fn to_owned(&self) -> OwnedSample {
        OwnedSample {
            kind: self.kind,
            data: Bytes::copy_from_slice(self.data),
            pts_us: self.pts_us,
            flags: self.flags,
        }
    }
}

/// An encoded sample copied for retention by a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedSample {
    /// Media kind of the producing encoder
    pub kind: MediaKind,
    /// Encoded bytes
    pub data: Bytes,
    /// Presentation timestamp (microseconds)
    pub pts_us: u64,
    /// Sample flags
    pub flags: SampleFlags,
}

impl OwnedSample {
    /// Borrow as an [`EncodedSample`]
    pub fn as_sample(&self) -> EncodedSample<'_> {
        EncodedSample {
            kind: self.kind,
            data: &self.data,
            pts_us: self.pts_us,
            flags: self.flags,
        }
    }
}

/// Codec identifier of an encoded track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    /// H.264 / AVC
    H264,
    /// H.265 / HEVC
    H265,
    /// AAC-LC
    Aac,
    /// Opus
    Opus,
}

impl CodecId {
    /// Media kind of this codec
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::H264 | Self::H265 => MediaKind::Video,
            Self::Aac | Self::Opus => MediaKind::Audio,
        }
    }
}

impl std::fmt::Display for CodecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::H264 => write!(f, "H.264"),
            Self::H265 => write!(f, "H.265"),
            Self::Aac => write!(f, "AAC"),
            Self::Opus => write!(f, "Opus"),
        }
    }
}

/// Track-specific parameters of a format description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackParams {
    /// Video track
    Video {
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
        /// Frames per second
        fps: u32,
    },
    /// Audio track
    Audio {
        /// Sample rate in Hz
        sample_rate: u32,
        /// Channel count
        channels: u32,
    },
}

/// Output format reported by a codec on format change
///
/// For video, `extradata` carries the parameter sets (SPS/PPS, plus VPS
/// for H.265) in Annex-B form; for AAC it is the AudioSpecificConfig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescription {
    /// Codec of the track
    pub codec: CodecId,
    /// Track parameters
    pub params: TrackParams,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Out-of-band codec configuration
    pub extradata: Bytes,
}

impl FormatDescription {
    /// Media kind of the described track
    pub fn kind(&self) -> MediaKind {
        self.codec.kind()
    }

    /// Frame interval in microseconds (video only)
    pub fn frame_interval_us(&self) -> Option<u64> {
        match self.params {
            TrackParams::Video { fps, .. } if fps > 0 => Some(1_000_000 / fps as u64),
            _ => None,
        }
    }
}
