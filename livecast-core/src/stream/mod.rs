//! Streaming
//!
//! This module provides:
//! - Endpoint parsing for `rtsp://`, `rtmp://` and `srt://` URLs
//! - The [`Transport`] seam each protocol implements
//! - [`ProtocolClient`], the connection state machine with retry policy
//! - An FFmpeg-backed transport (feature `ffmpeg`)

mod client;
pub mod endpoint;
#[cfg(feature = "ffmpeg")]
mod ffmpeg;
mod transport;

pub use client::{
    ClientState, ClientStats, ConnectionEvent, KeyframeRequest, ProtocolClient, StreamMode,
    NO_VIDEO_INFO, RETRIES_EXHAUSTED,
};
pub use endpoint::{safe_url, Endpoint, Protocol};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::{FfmpegTransport, FfmpegTransportFactory};
pub use transport::{Credentials, Handshake, MediaInfo, Transport, TransportFactory};
