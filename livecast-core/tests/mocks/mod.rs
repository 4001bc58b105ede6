//! Mock infrastructure for testing
//!
//! Deterministic stand-ins for codecs, transports, muxers and capture
//! devices, plus frame helpers.

#![allow(dead_code)]

use bytes::Bytes;
use livecast_core::capture::{
    AudioCaptureSettings, AudioSource, FrameRoute, FrameSink, RenderPipeline,
    VideoCaptureSettings, VideoSource,
};
use livecast_core::encode::{Codec, CodecFactory, CodecOutput, CodecParams};
use livecast_core::error::{LivecastError, Result};
use livecast_core::record::{Muxer, MuxerFactory};
use livecast_core::stream::{
    Credentials, Endpoint, Handshake, MediaInfo, Protocol, Transport, TransportFactory,
};
use livecast_core::types::{
    monotonic_us, EncodedSample, FormatDescription, MediaFrame, MediaKind, OwnedSample,
    TrackParams,
};
use livecast_core::TransportMode;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Annex-B SPS/PPS stand-in
pub const PARAMETER_SETS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xce];

/// Create a solid YUV 4:2:0 frame stamped now
pub fn create_test_frame(width: u32, height: u32, luma: u8) -> MediaFrame {
    let (w, h) = (width as usize, height as usize);
    let mut data = vec![luma; w * h];
    data.resize(w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)), 128);
    MediaFrame::new(data, monotonic_us())
}

/// Create an s16le silence chunk stamped now
pub fn create_audio_frame(samples: usize, channels: usize) -> MediaFrame {
    MediaFrame::new(vec![0; samples * channels * 2], monotonic_us())
}

/// Poll `check` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Output format a mock codec reports for `params`
pub fn format_for(params: &CodecParams) -> FormatDescription {
    match params {
        CodecParams::Video(config) => {
            let (width, height) = config.encoded_size();
            FormatDescription {
                codec: config.codec.id(),
                params: TrackParams::Video {
                    width,
                    height,
                    fps: config.fps,
                },
                bitrate: config.bitrate,
                extradata: Bytes::from_static(PARAMETER_SETS),
            }
        }
        CodecParams::Audio(config) => FormatDescription {
            codec: config.codec.id(),
            params: TrackParams::Audio {
                sample_rate: config.sample_rate,
                channels: config.channels(),
            },
            bitrate: config.bitrate,
            extradata: Bytes::from_static(&[0x12, 0x10]),
        },
    }
}

/// Build an encoded sample over `data`
pub fn sample(kind: MediaKind, data: &[u8], pts_us: u64, key_frame: bool) -> EncodedSample<'_> {
    EncodedSample {
        kind,
        data,
        pts_us,
        flags: livecast_core::types::SampleFlags {
            key_frame,
            config: false,
        },
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Knobs and counters shared by a [`MockCodecFactory`] and its codecs
#[derive(Default)]
pub struct CodecControl {
    /// Codecs created
    pub created: AtomicU32,
    /// Upcoming submits that fail
    pub fail_submits: AtomicU32,
    /// Refuse every prepare
    pub fail_create: AtomicBool,
    /// Codecs ignore key frame requests
    pub no_keyframe_requests: AtomicBool,
    /// Codecs cannot change bitrate live
    pub no_live_bitrate: AtomicBool,
    /// Frames submitted across all codecs
    pub submitted: AtomicU64,
    /// Key frame requests honoured natively
    pub keyframe_requests: AtomicU32,
    /// Bitrates applied live
    pub bitrates: Mutex<Vec<u32>>,
    /// Time each submit takes, in microseconds
    pub submit_delay_us: AtomicU64,
    /// Codecs dropped
    pub released: AtomicU32,
}

/// Codec that emits one sample per frame
pub struct MockCodec {
    control: Arc<CodecControl>,
    params: CodecParams,
    format_sent: bool,
    force_key: bool,
    frames: u64,
    gop: u64,
    ready: Vec<(Vec<u8>, u64, bool)>,
}

impl Codec for MockCodec {
    fn name(&self) -> &str {
        "mock"
    }

    fn submit(&mut self, data: &[u8], pts_us: u64) -> Result<()> {
        self.control.submitted.fetch_add(1, Ordering::SeqCst);
        let delay = self.control.submit_delay_us.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_micros(delay));
        }
        let failing = self
            .control
            .fail_submits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LivecastError::codec("mock codec failure"));
        }

        let key_frame = match self.params {
            CodecParams::Video(_) => self.force_key || self.frames % self.gop == 0,
            CodecParams::Audio(_) => true,
        };
        self.force_key = false;
        self.frames += 1;
        let len = (data.len() / 100).max(1);
        self.ready.push((vec![self.frames as u8; len], pts_us, key_frame));
        Ok(())
    }

    fn drain(&mut self, out: &mut dyn FnMut(CodecOutput<'_>)) -> Result<()> {
        if !self.format_sent {
            self.format_sent = true;
            out(CodecOutput::FormatChanged(format_for(&self.params)));
        }
        for (data, pts_us, key_frame) in self.ready.drain(..) {
            out(CodecOutput::Sample {
                data: &data,
                pts_us,
                key_frame,
            });
        }
        Ok(())
    }

    fn request_keyframe(&mut self) -> bool {
        if self.control.no_keyframe_requests.load(Ordering::SeqCst) {
            return false;
        }
        self.control.keyframe_requests.fetch_add(1, Ordering::SeqCst);
        self.force_key = true;
        true
    }

    fn set_bitrate(&mut self, bps: u32) -> bool {
        if self.control.no_live_bitrate.load(Ordering::SeqCst) {
            return false;
        }
        self.control.bitrates.lock().push(bps);
        true
    }

    fn flush(&mut self, out: &mut dyn FnMut(CodecOutput<'_>)) -> Result<()> {
        self.drain(out)
    }
}

impl Drop for MockCodec {
    fn drop(&mut self) {
        self.control.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory for [`MockCodec`]s
#[derive(Clone, Default)]
pub struct MockCodecFactory {
    pub control: Arc<CodecControl>,
}

impl MockCodecFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CodecFactory for MockCodecFactory {
    fn create(&self, params: &CodecParams) -> Result<Box<dyn Codec>> {
        if self.control.fail_create.load(Ordering::SeqCst) {
            return Err(LivecastError::prepare("no mock codec accepts these parameters"));
        }
        self.control.created.fetch_add(1, Ordering::SeqCst);
        let gop = match params {
            CodecParams::Video(config) => config.gop_length() as u64,
            CodecParams::Audio(_) => 1,
        };
        Ok(Box::new(MockCodec {
            control: self.control.clone(),
            params: params.clone(),
            format_sent: false,
            force_key: false,
            frames: 0,
            gop,
            ready: Vec::new(),
        }))
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Knobs and counters shared by a [`MockTransportFactory`] and its transports
#[derive(Default)]
pub struct TransportControl {
    /// Transports created
    pub created: AtomicU32,
    /// Handshake error message, if the next handshakes should fail
    pub handshake_error: Mutex<Option<String>>,
    /// Credentials the server demands
    pub required: Mutex<Option<Credentials>>,
    /// Fail sends after this many succeeded
    pub fail_send_after: Mutex<Option<u64>>,
    /// Time each send takes, in milliseconds
    pub send_delay_ms: AtomicU64,
    /// Samples sent across all transports
    pub sent: Mutex<Vec<OwnedSample>>,
    /// Media info of the last handshake
    pub last_media: Mutex<Option<MediaInfo>>,
    /// Endpoint of the last handshake
    pub last_endpoint: Mutex<Option<Endpoint>>,
    /// Transport mode of the last handshake
    pub last_mode: Mutex<Option<TransportMode>>,
    /// Transports closed
    pub closed: AtomicU32,
}

impl TransportControl {
    /// Kinds of the samples sent so far
    pub fn sent_kinds(&self) -> Vec<MediaKind> {
        self.sent.lock().iter().map(|s| s.kind).collect()
    }
}

pub struct MockTransport {
    control: Arc<TransportControl>,
    sent: u64,
}

impl Transport for MockTransport {
    fn handshake(
        &mut self,
        endpoint: &Endpoint,
        media: &MediaInfo,
        mode: TransportMode,
    ) -> Result<Handshake> {
        *self.control.last_endpoint.lock() = Some(endpoint.clone());
        *self.control.last_media.lock() = Some(media.clone());
        *self.control.last_mode.lock() = Some(mode);
        if let Some(message) = self.control.handshake_error.lock().clone() {
            return Err(LivecastError::connection(message));
        }
        if self.control.required.lock().is_some() {
            return Ok(Handshake::AuthRequired);
        }
        Ok(Handshake::Ready)
    }

    fn authenticate(&mut self, credentials: &Credentials) -> Result<bool> {
        Ok(self.control.required.lock().as_ref() == Some(credentials))
    }

    fn send(&mut self, sample: &OwnedSample) -> Result<()> {
        if let Some(limit) = *self.control.fail_send_after.lock() {
            if self.sent >= limit {
                return Err(LivecastError::send("Broken pipe"));
            }
        }
        let delay = self.control.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.sent += 1;
        self.control.sent.lock().push(sample.clone());
        Ok(())
    }

    fn close(&mut self) {
        self.control.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory for [`MockTransport`]s
#[derive(Clone, Default)]
pub struct MockTransportFactory {
    pub control: Arc<TransportControl>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Demand `user`/`password` before accepting the session
    pub fn requiring_auth(self, user: &str, password: &str) -> Self {
        *self.control.required.lock() = Some(Credentials {
            user: user.to_string(),
            password: password.to_string(),
        });
        self
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, _protocol: Protocol) -> Result<Box<dyn Transport>> {
        self.control.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransport {
            control: self.control.clone(),
            sent: 0,
        }))
    }
}

// ============================================================================
// Muxer
// ============================================================================

/// One write seen by a [`MockMuxer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxWrite {
    pub track: usize,
    pub pts_us: u64,
    pub key_frame: bool,
    pub len: usize,
}

/// Knobs and counters shared by a [`MockMuxerFactory`] and its muxers
#[derive(Default)]
pub struct MuxControl {
    /// Destinations opened
    pub opened: Mutex<Vec<PathBuf>>,
    /// Refuse to open destinations
    pub fail_open: AtomicBool,
    /// Fail writes after this many succeeded
    pub fail_write_after: Mutex<Option<usize>>,
    /// Tracks added, in order
    pub tracks: Mutex<Vec<FormatDescription>>,
    /// Writes, in order
    pub writes: Mutex<Vec<MuxWrite>>,
    /// Headers written
    pub started: AtomicU32,
    /// Trailers written
    pub finalized: AtomicU32,
}

impl MuxControl {
    /// Writes to the track holding `kind`
    pub fn writes_of(&self, kind: MediaKind) -> Vec<MuxWrite> {
        let tracks = self.tracks.lock();
        let Some(index) = tracks.iter().position(|f| f.kind() == kind) else {
            return Vec::new();
        };
        self.writes
            .lock()
            .iter()
            .filter(|w| w.track == index)
            .cloned()
            .collect()
    }
}

pub struct MockMuxer {
    control: Arc<MuxControl>,
    tracks: usize,
}

impl Muxer for MockMuxer {
    fn add_track(&mut self, format: &FormatDescription) -> Result<usize> {
        self.control.tracks.lock().push(format.clone());
        self.tracks += 1;
        Ok(self.tracks - 1)
    }

    fn start(&mut self) -> Result<()> {
        self.control.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write(&mut self, track: usize, data: &[u8], pts_us: u64, key_frame: bool) -> Result<()> {
        let mut writes = self.control.writes.lock();
        if let Some(limit) = *self.control.fail_write_after.lock() {
            if writes.len() >= limit {
                return Err(LivecastError::record_io("No space left on device"));
            }
        }
        writes.push(MuxWrite {
            track,
            pts_us,
            key_frame,
            len: data.len(),
        });
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.control.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory for [`MockMuxer`]s
#[derive(Clone, Default)]
pub struct MockMuxerFactory {
    pub control: Arc<MuxControl>,
}

impl MockMuxerFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MuxerFactory for MockMuxerFactory {
    fn open(&self, destination: &Path) -> Result<Box<dyn Muxer>> {
        if self.control.fail_open.load(Ordering::SeqCst) {
            return Err(LivecastError::record_io(format!(
                "Permission denied: {:?}",
                destination
            )));
        }
        self.control.opened.lock().push(destination.to_path_buf());
        Ok(Box::new(MockMuxer {
            control: self.control.clone(),
            tracks: 0,
        }))
    }
}

// ============================================================================
// Capture
// ============================================================================

/// Test-side handle of a mock capture device
#[derive(Clone, Default)]
pub struct DeviceHandle {
    sink: Arc<Mutex<Option<Arc<dyn FrameSink>>>>,
    pub starts: Arc<AtomicU32>,
    pub switches: Arc<AtomicU32>,
    pub muted: Arc<AtomicBool>,
    pub fail_start: Arc<AtomicBool>,
}

impl DeviceHandle {
    /// Deliver a frame as the device would; false if stopped
    pub fn push(&self, frame: MediaFrame) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink.on_frame(frame);
                true
            }
            None => false,
        }
    }

    /// Whether the device is delivering frames
    pub fn is_open(&self) -> bool {
        self.sink.lock().is_some()
    }
}

/// Camera driven by the test through a [`DeviceHandle`]
#[derive(Default)]
pub struct MockCamera {
    handle: DeviceHandle,
    settings: Option<VideoCaptureSettings>,
}

impl MockCamera {
    pub fn new() -> (Self, DeviceHandle) {
        let camera = Self::default();
        let handle = camera.handle.clone();
        (camera, handle)
    }
}

impl VideoSource for MockCamera {
    fn start(&mut self, settings: &VideoCaptureSettings, sink: Arc<dyn FrameSink>) -> Result<()> {
        if self.handle.fail_start.load(Ordering::SeqCst) {
            return Err(LivecastError::device_open("mock camera unavailable"));
        }
        self.settings = Some(*settings);
        *self.handle.sink.lock() = Some(sink);
        self.handle.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        *self.handle.sink.lock() = None;
    }

    fn switch_device(&mut self) -> Result<()> {
        self.handle.switches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.handle.is_open()
    }
}

/// Microphone driven by the test through a [`DeviceHandle`]
#[derive(Default)]
pub struct MockMicrophone {
    handle: DeviceHandle,
}

impl MockMicrophone {
    pub fn new() -> (Self, DeviceHandle) {
        let microphone = Self::default();
        let handle = microphone.handle.clone();
        (microphone, handle)
    }
}

impl AudioSource for MockMicrophone {
    fn start(&mut self, _settings: &AudioCaptureSettings, sink: Arc<dyn FrameSink>) -> Result<()> {
        if self.handle.fail_start.load(Ordering::SeqCst) {
            return Err(LivecastError::device_open("mock microphone unavailable"));
        }
        *self.handle.sink.lock() = Some(sink);
        self.handle.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        *self.handle.sink.lock() = None;
    }

    fn is_running(&self) -> bool {
        self.handle.is_open()
    }

    fn set_muted(&mut self, muted: bool) {
        self.handle.muted.store(muted, Ordering::SeqCst);
    }

    fn is_muted(&self) -> bool {
        self.handle.muted.load(Ordering::SeqCst)
    }
}

/// Counts frames forwarded by a [`MockRenderer`]
struct CountingRoute {
    route: FrameRoute,
    forwarded: Arc<AtomicU64>,
}

impl FrameSink for CountingRoute {
    fn on_frame(&self, frame: MediaFrame) {
        if self.route.is_connected() {
            self.forwarded.fetch_add(1, Ordering::SeqCst);
        }
        self.route.on_frame(frame);
    }
}

/// Render pipeline that counts the frames it forwards
pub struct MockRenderer {
    input: Arc<CountingRoute>,
    running: bool,
    pub size: (u32, u32),
}

impl MockRenderer {
    /// Create a renderer and the counter of forwarded frames
    pub fn new() -> (Self, Arc<AtomicU64>) {
        let forwarded = Arc::new(AtomicU64::new(0));
        let renderer = Self {
            input: Arc::new(CountingRoute {
                route: FrameRoute::new(),
                forwarded: forwarded.clone(),
            }),
            running: false,
            size: (0, 0),
        };
        (renderer, forwarded)
    }
}

impl RenderPipeline for MockRenderer {
    fn set_encoder_size(&mut self, width: u32, height: u32) {
        self.size = (width, height);
    }

    fn set_fps(&mut self, _fps: u32) {}

    fn start(&mut self) -> Result<()> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
        self.input.route.disconnect();
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn input(&self) -> Arc<dyn FrameSink> {
        self.input.clone()
    }

    fn attach_encoder(&mut self, encoder: Arc<dyn FrameSink>) {
        self.input.route.connect(encoder);
    }

    fn detach_encoder(&mut self) {
        self.input.route.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_frame_size() {
        let frame = create_test_frame(64, 48, 16);
        assert_eq!(frame.payload().len(), 64 * 48 * 3 / 2);
        assert_eq!(frame.payload()[0], 16);
    }

    #[test]
    fn test_device_handle_push_requires_start() {
        let (mut camera, handle) = MockCamera::new();
        assert!(!handle.push(create_test_frame(4, 4, 0)));

        let route = Arc::new(FrameRoute::new());
        let settings = VideoCaptureSettings {
            width: 4,
            height: 4,
            fps: 30,
            rotation: 0,
        };
        camera.start(&settings, route).unwrap();
        assert!(handle.push(create_test_frame(4, 4, 0)));
        camera.stop();
        assert!(!handle.is_open());
    }
}
