//! Capture and render seams
//!
//! Platform camera/microphone drivers and GPU render pipelines live
//! outside this crate. They plug in through these traits:
//! - [`VideoSource`] / [`AudioSource`] deliver [`MediaFrame`]s into a [`FrameSink`]
//! - [`RenderPipeline`] sits between the camera and the video encoder
//!
//! [`PassthroughRenderer`] forwards frames unchanged, and the
//! `synthetic` module provides test-pattern sources.

pub mod synthetic;

pub use synthetic::{TestPatternSource, ToneSource};

use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::encode::EncoderSession;
use crate::error::Result;
use crate::types::MediaFrame;

/// Receiver of raw capture frames
pub trait FrameSink: Send + Sync {
    /// Accept one frame; may block for backpressure
    fn on_frame(&self, frame: MediaFrame);
}

impl FrameSink for EncoderSession {
    fn on_frame(&self, frame: MediaFrame) {
        self.push_frame(frame);
    }
}

/// Video capture settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoCaptureSettings {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Frames per second
    pub fps: u32,
    /// Rotation in degrees
    pub rotation: u32,
}

/// Audio capture settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioCaptureSettings {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u32,
    /// Echo cancellation requested
    pub echo_canceler: bool,
    /// Noise suppression requested
    pub noise_suppressor: bool,
}

/// Camera driver contract
///
/// Frames are planar YUV 4:2:0 stamped with [`crate::types::monotonic_us`].
/// A device that cannot be opened fails `start` with `LivecastError::DeviceOpen`.
pub trait VideoSource: Send {
    /// Open the device and start delivering frames
    fn start(&mut self, settings: &VideoCaptureSettings, sink: Arc<dyn FrameSink>) -> Result<()>;

    /// Stop delivering frames and close the device
    fn stop(&mut self);

    /// Switch to the next device (e.g. front/back camera)
    fn switch_device(&mut self) -> Result<()>;

    /// Whether frames are being delivered
    fn is_running(&self) -> bool;
}

/// Microphone driver contract
///
/// Frames are interleaved signed 16-bit little-endian PCM.
pub trait AudioSource: Send {
    /// Open the device and start delivering frames
    fn start(&mut self, settings: &AudioCaptureSettings, sink: Arc<dyn FrameSink>) -> Result<()>;

    /// Stop delivering frames and close the device
    fn stop(&mut self);

    /// Whether frames are being delivered
    fn is_running(&self) -> bool;

    /// Deliver silence instead of captured audio
    fn set_muted(&mut self, muted: bool);

    /// Whether audio is muted
    fn is_muted(&self) -> bool;
}

/// Render/filter pipeline contract
///
/// Frames enter through [`RenderPipeline::input`], are displayed, and
/// are forwarded to the attached encoder input (if any).
pub trait RenderPipeline: Send {
    /// Size frames are rendered at for the encoder
    fn set_encoder_size(&mut self, width: u32, height: u32);

    /// Rate frames are rendered at for the encoder
    fn set_fps(&mut self, fps: u32);

    /// Start rendering
    fn start(&mut self) -> Result<()>;

    /// Stop rendering
    fn stop(&mut self);

    /// Whether rendering is running
    fn is_running(&self) -> bool;

    /// Where capture frames enter the pipeline
    fn input(&self) -> Arc<dyn FrameSink>;

    /// Forward rendered frames to an encoder input
    fn attach_encoder(&mut self, encoder: Arc<dyn FrameSink>);

    /// Stop forwarding rendered frames
    fn detach_encoder(&mut self);
}

/// A sink that forwards to a replaceable target
#[derive(Default)]
pub struct FrameRoute {
    target: RwLock<Option<Arc<dyn FrameSink>>>,
}

impl FrameRoute {
    /// Create an unconnected route
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward frames to `target`
    pub fn connect(&self, target: Arc<dyn FrameSink>) {
        *self.target.write() = Some(target);
    }

    /// Drop frames until connected again
    pub fn disconnect(&self) {
        *self.target.write() = None;
    }

    /// Whether a target is connected
    pub fn is_connected(&self) -> bool {
        self.target.read().is_some()
    }
}

impl FrameSink for FrameRoute {
    fn on_frame(&self, frame: MediaFrame) {
        let target = self.target.read().clone();
        if let Some(target) = target {
            target.on_frame(frame);
        }
    }
}

/// Render pipeline that forwards frames unchanged
///
/// Used when no GPU pipeline is installed; the capture size must
/// already match the encoder size.
pub struct PassthroughRenderer {
    route: Arc<FrameRoute>,
    running: AtomicBool,
    size: (u32, u32),
    fps: u32,
}

impl PassthroughRenderer {
    /// Create a stopped renderer
    pub fn new() -> Self {
        Self {
            route: Arc::new(FrameRoute::new()),
            running: AtomicBool::new(false),
            size: (0, 0),
            fps: 0,
        }
    }

    /// Encoder size last set
    pub fn encoder_size(&self) -> (u32, u32) {
        self.size
    }

    /// Encoder frame rate last set
    pub fn fps(&self) -> u32 {
        self.fps
    }
}

impl Default for PassthroughRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderPipeline for PassthroughRenderer {
    fn set_encoder_size(&mut self, width: u32, height: u32) {
        self.size = (width, height);
    }

    fn set_fps(&mut self, fps: u32) {
        self.fps = fps;
    }

    fn start(&mut self) -> Result<()> {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!(
                "Passthrough renderer started ({}x{} @ {}fps)",
                self.size.0, self.size.1, self.fps
            );
        }
        Ok(())
    }

    fn stop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.route.disconnect();
            info!("Passthrough renderer stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn input(&self) -> Arc<dyn FrameSink> {
        self.route.clone()
    }

    fn attach_encoder(&mut self, encoder: Arc<dyn FrameSink>) {
        debug!("Encoder input attached to renderer");
        self.route.connect(encoder);
    }

    fn detach_encoder(&mut self) {
        debug!("Encoder input detached from renderer");
        self.route.disconnect();
    }
}
