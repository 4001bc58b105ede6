//! Livecast Core Library
//!
//! Capture, encode, and deliver live audio/video to a streaming server and
//! a local recording at the same time.
//!
//! This library provides:
//! - Encoder sessions with a bounded frame queue and codec reset recovery
//! - RTSP, RTMP and SRT protocol clients with retry and authentication
//! - A record controller with pause/resume and key-frame aligned starts
//! - [`StreamSession`], which shares one set of encoders between both sinks
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌────────────────┐    ┌──────────────────┐
//! │ Camera / Mic │───▶│ Encoder        │───▶│ Protocol Client  │──▶ server
//! │ (capture)    │    │ Sessions       │    ├──────────────────┤
//! └──────────────┘    │ (FFmpeg)       │───▶│ Record Controller│──▶ file
//!                     └────────────────┘    └──────────────────┘
//! ```

pub mod capture;
pub mod config;
pub mod encode;
pub mod error;
pub mod metrics;
pub mod record;
pub mod session;
pub mod stream;
pub mod types;

pub use config::{AudioConfig, Preset, SessionConfig, TransportMode, VideoConfig};
pub use error::{LivecastError, Result};
pub use session::{SessionBackends, SessionEvents, SessionStats, StreamSession};
pub use stream::Protocol;
pub use types::{Handle, MediaFrame, MediaKind};
