//! Configuration types for livecast
//!
//! Provides encoder settings, session tuning and resolution presets.

mod file;

pub use file::{sample_config, ConfigFile};

use crate::error::{LivecastError, Result};
use crate::types::CodecId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Video codec for encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// H.264 / AVC (most compatible)
    #[default]
    H264,
    /// H.265 / HEVC (better compression)
    H265,
}

impl VideoCodec {
    /// Codec identifier carried in format descriptions
    pub fn id(&self) -> CodecId {
        match self {
            Self::H264 => CodecId::H264,
            Self::H265 => CodecId::H265,
        }
    }

    /// FFmpeg encoder names, hardware first
    pub fn hardware_encoders(&self) -> &'static [&'static str] {
        match self {
            Self::H264 => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
            Self::H265 => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
        }
    }

    /// FFmpeg software encoder names
    pub fn software_encoders(&self) -> &'static [&'static str] {
        match self {
            Self::H264 => &["libx264", "libopenh264"],
            Self::H265 => &["libx265"],
        }
    }

    /// Encoder names to try for a preference, in order
    pub fn candidates(&self, preference: CodecPreference) -> Vec<&'static str> {
        match preference {
            CodecPreference::Hardware => self.hardware_encoders().to_vec(),
            CodecPreference::Software => self.software_encoders().to_vec(),
            CodecPreference::FirstCompatible => self
                .hardware_encoders()
                .iter()
                .chain(self.software_encoders())
                .copied()
                .collect(),
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "h264" | "avc" | "264" => Ok(Self::H264),
            "h265" | "hevc" | "265" => Ok(Self::H265),
            _ => Err(format!("Unknown video codec: {}", s)),
        }
    }
}

/// Audio codec for encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    /// AAC-LC (most compatible)
    #[default]
    Aac,
    /// Opus
    Opus,
}

impl AudioCodec {
    /// Codec identifier carried in format descriptions
    pub fn id(&self) -> CodecId {
        match self {
            Self::Aac => CodecId::Aac,
            Self::Opus => CodecId::Opus,
        }
    }

    /// Get the FFmpeg encoder name
    pub fn ffmpeg_encoder(&self) -> &'static str {
        match self {
            Self::Aac => "aac",
            Self::Opus => "libopus",
        }
    }
}

impl std::fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl std::str::FromStr for AudioCodec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aac" => Ok(Self::Aac),
            "opus" => Ok(Self::Opus),
            _ => Err(format!("Unknown audio codec: {}", s)),
        }
    }
}

/// Which kind of codec implementation to select
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CodecPreference {
    /// First codec that accepts the configuration, hardware first
    #[default]
    FirstCompatible,
    /// Hardware codecs only
    Hardware,
    /// Software codecs only
    Software,
}

impl std::str::FromStr for CodecPreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "first_compatible" | "auto" => Ok(Self::FirstCompatible),
            "hardware" | "hw" => Ok(Self::Hardware),
            "software" | "sw" => Ok(Self::Software),
            _ => Err(format!("Unknown codec preference: {}", s)),
        }
    }
}

/// Output resolution/framerate preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Preset {
    /// 640x480 @ 30fps (default)
    #[default]
    P480_30,
    /// 1280x720 @ 30fps
    P720_30,
    /// 1280x720 @ 60fps
    P720_60,
    /// 1920x1080 @ 30fps
    P1080_30,
    /// 1920x1080 @ 60fps
    P1080_60,
    /// Custom resolution/framerate
    Custom { width: u32, height: u32, fps: u32 },
}

impl Preset {
    /// Get width in pixels
    pub fn width(&self) -> u32 {
        match self {
            Self::P480_30 => 640,
            Self::P720_30 | Self::P720_60 => 1280,
            Self::P1080_30 | Self::P1080_60 => 1920,
            Self::Custom { width, .. } => *width,
        }
    }

    /// Get height in pixels
    pub fn height(&self) -> u32 {
        match self {
            Self::P480_30 => 480,
            Self::P720_30 | Self::P720_60 => 720,
            Self::P1080_30 | Self::P1080_60 => 1080,
            Self::Custom { height, .. } => *height,
        }
    }

    /// Get framerate
    pub fn fps(&self) -> u32 {
        match self {
            Self::P480_30 | Self::P720_30 | Self::P1080_30 => 30,
            Self::P720_60 | Self::P1080_60 => 60,
            Self::Custom { fps, .. } => *fps,
        }
    }

    /// Get suggested bitrate in bits per second
    pub fn suggested_bitrate(&self) -> u32 {
        match self {
            Self::P480_30 => 1200 * 1024,
            Self::P720_30 => 2500 * 1000,
            Self::P720_60 => 4000 * 1000,
            Self::P1080_30 => 4500 * 1000,
            Self::P1080_60 => 6000 * 1000,
            Self::Custom { width, height, fps } => {
                let pixels_per_second = (*width as u64) * (*height as u64) * (*fps as u64);
                // ~0.07 bits per pixel
                ((pixels_per_second * 7) / 100) as u32
            }
        }
    }
}

impl std::fmt::Display for Preset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P480_30 => write!(f, "480p30"),
            Self::P720_30 => write!(f, "720p30"),
            Self::P720_60 => write!(f, "720p60"),
            Self::P1080_30 => write!(f, "1080p30"),
            Self::P1080_60 => write!(f, "1080p60"),
            Self::Custom { width, height, fps } => write!(f, "{}x{}@{}", width, height, fps),
        }
    }
}

impl std::str::FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "480p30" | "vga" => Ok(Self::P480_30),
            "720p30" => Ok(Self::P720_30),
            "720p60" => Ok(Self::P720_60),
            "1080p30" => Ok(Self::P1080_30),
            "1080p60" => Ok(Self::P1080_60),
            other => parse_custom(other).ok_or_else(|| format!("Unknown preset: {}", s)),
        }
    }
}

/// Parse `WIDTHxHEIGHT@FPS`
fn parse_custom(s: &str) -> Option<Preset> {
    let (size, fps) = s.split_once('@')?;
    let (width, height) = size.split_once('x')?;
    Some(Preset::Custom {
        width: width.trim().parse().ok()?,
        height: height.trim().parse().ok()?,
        fps: fps.trim().parse().ok()?,
    })
}

/// Video encoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Video codec
    pub codec: VideoCodec,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Frames per second
    pub fps: u32,
    /// Bitrate in bits per second
    pub bitrate: u32,
    /// Seconds between key frames
    pub iframe_interval: u32,
    /// Rotation in degrees (0, 90, 180, 270)
    pub rotation: u32,
    /// Codec selection preference
    pub preference: CodecPreference,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::default(),
            width: 640,
            height: 480,
            fps: 30,
            bitrate: 1200 * 1024,
            iframe_interval: 2,
            rotation: 0,
            preference: CodecPreference::default(),
        }
    }
}

impl VideoConfig {
    /// Create a config from a preset
    pub fn from_preset(preset: Preset) -> Self {
        Self {
            width: preset.width(),
            height: preset.height(),
            fps: preset.fps(),
            bitrate: preset.suggested_bitrate(),
            ..Self::default()
        }
    }

    /// Set the codec
    pub fn with_codec(mut self, codec: VideoCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Set the resolution
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the framerate
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Set the bitrate in bits per second
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Set the rotation in degrees
    pub fn with_rotation(mut self, rotation: u32) -> Self {
        self.rotation = rotation;
        self
    }

    /// Set the codec preference
    pub fn with_preference(mut self, preference: CodecPreference) -> Self {
        self.preference = preference;
        self
    }

    /// Encoded size after rotation
    pub fn encoded_size(&self) -> (u32, u32) {
        if self.rotation == 90 || self.rotation == 270 {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }

    /// Size in bytes of one YUV 4:2:0 frame at the encoded size
    pub fn frame_size(&self) -> usize {
        let (w, h) = self.encoded_size();
        let (w, h) = (w as usize, h as usize);
        w * h + 2 * (w.div_ceil(2) * h.div_ceil(2))
    }

    /// GOP length in frames
    pub fn gop_length(&self) -> u32 {
        (self.fps * self.iframe_interval).max(1)
    }

    /// Reject configurations no codec can accept
    pub fn validate_strict(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(LivecastError::prepare("Resolution cannot be zero"));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(LivecastError::prepare(format!(
                "Resolution {}x{} must be even for 4:2:0 encoding",
                self.width, self.height
            )));
        }
        if self.width > 7680 || self.height > 4320 {
            return Err(LivecastError::prepare(format!(
                "Resolution {}x{} exceeds maximum supported (7680x4320)",
                self.width, self.height
            )));
        }
        if self.fps == 0 || self.fps > 240 {
            return Err(LivecastError::prepare(format!(
                "Framerate {} outside supported range (1-240)",
                self.fps
            )));
        }
        if self.bitrate == 0 {
            return Err(LivecastError::prepare("Bitrate cannot be zero"));
        }
        if !matches!(self.rotation, 0 | 90 | 180 | 270) {
            return Err(LivecastError::prepare(format!(
                "Rotation {} must be 0, 90, 180 or 270",
                self.rotation
            )));
        }
        Ok(())
    }
}

/// Audio encoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Audio codec
    pub codec: AudioCodec,
    /// Bitrate in bits per second
    pub bitrate: u32,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Stereo (true) or mono
    pub stereo: bool,
    /// Ask the capture driver for echo cancellation
    pub echo_canceler: bool,
    /// Ask the capture driver for noise suppression
    pub noise_suppressor: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            codec: AudioCodec::default(),
            bitrate: 64 * 1024,
            sample_rate: 32000,
            stereo: true,
            echo_canceler: false,
            noise_suppressor: false,
        }
    }
}

impl AudioConfig {
    /// Set the codec
    pub fn with_codec(mut self, codec: AudioCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Set the bitrate in bits per second
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Set the sample rate in Hz
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Set stereo or mono
    pub fn with_stereo(mut self, stereo: bool) -> Self {
        self.stereo = stereo;
        self
    }

    /// Channel count
    pub fn channels(&self) -> u32 {
        if self.stereo { 2 } else { 1 }
    }

    /// Reject configurations no codec can accept
    pub fn validate_strict(&self) -> Result<()> {
        const AAC_RATES: &[u32] = &[8000, 11025, 16000, 22050, 24000, 32000, 44100, 48000];
        const OPUS_RATES: &[u32] = &[8000, 12000, 16000, 24000, 48000];

        let rates = match self.codec {
            AudioCodec::Aac => AAC_RATES,
            AudioCodec::Opus => OPUS_RATES,
        };
        if !rates.contains(&self.sample_rate) {
            return Err(LivecastError::prepare(format!(
                "Sample rate {} Hz not supported by {}",
                self.sample_rate, self.codec
            )));
        }
        if self.bitrate == 0 {
            return Err(LivecastError::prepare("Bitrate cannot be zero"));
        }
        Ok(())
    }
}

/// Transport reliability mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Reliable transport
    #[default]
    Tcp,
    /// Best-effort transport
    Udp,
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            _ => Err(format!("Unknown transport mode: {}", s)),
        }
    }
}

/// Session tuning shared by encoders, client and recorder
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Raw frames buffered per encoder before producers block
    pub queue_capacity: usize,
    /// How long `stop` waits for an encoder worker
    pub stop_timeout: Duration,
    /// Codec resets allowed per encoder run (None = unlimited)
    pub max_codec_resets: Option<u32>,
    /// Reconnect attempts allowed by `retry` (None = unlimited)
    pub retries: Option<u32>,
    /// How long the client waits for video parameter sets
    pub media_info_timeout: Duration,
    /// Encoded samples buffered for the transport
    pub send_cache_size: usize,
    /// Encoded samples buffered by the recorder before writing starts
    pub record_buffer_capacity: usize,
    /// Transport reliability mode
    pub transport_mode: TransportMode,
    /// Interval between bitrate reports
    pub bitrate_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 80,
            stop_timeout: Duration::from_millis(500),
            max_codec_resets: None,
            retries: None,
            media_info_timeout: Duration::from_secs(5),
            send_cache_size: 200,
            record_buffer_capacity: 300,
            transport_mode: TransportMode::default(),
            bitrate_interval: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    /// Limit codec resets per encoder run
    pub fn with_max_codec_resets(mut self, max: u32) -> Self {
        self.max_codec_resets = Some(max);
        self
    }

    /// Limit reconnect attempts
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Set the transport mode
    pub fn with_transport_mode(mut self, mode: TransportMode) -> Self {
        self.transport_mode = mode;
        self
    }

    /// Set the encoder stop timeout
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Set the parameter-set wait
    pub fn with_media_info_timeout(mut self, timeout: Duration) -> Self {
        self.media_info_timeout = timeout;
        self
    }

    /// Set the send cache size
    pub fn with_send_cache_size(mut self, size: usize) -> Self {
        self.send_cache_size = size;
        self
    }

    /// Set the encoder queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}
