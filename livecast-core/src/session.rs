//! Stream session orchestrator
//!
//! [`StreamSession`] owns one encoder session per media kind, the record
//! controller, the protocol client, and the capture and render
//! attachments. Streaming and recording share the running encoders:
//! the encoders start with whichever sink starts first and stop only
//! when both are off.
//!
//! ```text
//! camera ─▶ capture route ─▶ renderer ─▶ video encoder ─┐
//! microphone ───────────────────────────▶ audio encoder ─┼─▶ fan-out ─▶ recorder
//!                                                        │            └▶ protocol client
//! ```

use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::capture::{
    AudioCaptureSettings, AudioSource, FrameRoute, FrameSink, PassthroughRenderer,
    RenderPipeline, VideoCaptureSettings, VideoSource,
};
use crate::config::{AudioConfig, SessionConfig, VideoConfig};
use crate::encode::{CodecFactory, CodecParams, EncoderEvent, EncoderSession, EncoderState, SampleSink};
use crate::error::{LivecastError, Result};
use crate::metrics::EncoderStats;
use crate::record::{MuxerFactory, RecordController, RecordEvent, RecordStats};
use crate::stream::{safe_url, ClientStats, ConnectionEvent, Protocol, ProtocolClient, TransportFactory};
use crate::types::{EncodedSample, FormatDescription, Handle, MediaKind, SessionAnchor};

/// Codec, transport and muxer implementations a session uses
#[derive(Clone)]
pub struct SessionBackends {
    /// Creates encoders
    pub codecs: Arc<dyn CodecFactory>,
    /// Creates protocol transports
    pub transports: Arc<dyn TransportFactory>,
    /// Opens recording destinations
    pub muxers: Arc<dyn MuxerFactory>,
}

#[cfg(feature = "ffmpeg")]
impl SessionBackends {
    /// FFmpeg encoders, network outputs and file muxers
    pub fn ffmpeg() -> Self {
        Self {
            codecs: Arc::new(crate::encode::FfmpegCodecFactory),
            transports: Arc::new(crate::stream::FfmpegTransportFactory),
            muxers: Arc::new(crate::record::FfmpegMuxerFactory),
        }
    }
}

/// Event receivers for a session
pub struct SessionEvents {
    /// Encoder lifecycle, resets and failures
    pub encoder: UnboundedReceiver<EncoderEvent>,
    /// Connection lifecycle and bitrate reports
    pub connection: UnboundedReceiver<ConnectionEvent>,
    /// Recording status and failures
    pub record: UnboundedReceiver<RecordEvent>,
}

/// Snapshot of session counters
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Video encoder
    pub video: EncoderStats,
    /// Audio encoder
    pub audio: EncoderStats,
    /// Protocol client
    pub client: ClientStats,
    /// Recorder
    pub record: RecordStats,
}

/// Routes encoder output to the recorder and the protocol client
struct Fanout {
    recorder: RwLock<Arc<RecordController>>,
    client: Arc<ProtocolClient>,
    recording: AtomicBool,
    streaming: AtomicBool,
}

impl SampleSink for Fanout {
    fn on_format(&self, format: &FormatDescription) {
        self.recorder.read().set_format(format);
        self.client.set_format(format);
    }

    fn on_sample(&self, sample: &EncodedSample<'_>) {
        if self.recording.load(Ordering::SeqCst) {
            let recorder = self.recorder.read().clone();
            recorder.write_sample(sample);
        }
        if self.streaming.load(Ordering::SeqCst) {
            self.client.send(sample);
        }
    }
}

/// Capture → encode → stream/record orchestrator
pub struct StreamSession {
    handle: Handle,
    config: SessionConfig,
    muxers: Arc<dyn MuxerFactory>,
    record_events: UnboundedSender<RecordEvent>,
    video: Arc<EncoderSession>,
    audio: Arc<EncoderSession>,
    client: Arc<ProtocolClient>,
    fanout: Arc<Fanout>,
    camera: Box<dyn VideoSource>,
    microphone: Option<Box<dyn AudioSource>>,
    capture_route: Arc<FrameRoute>,
    renderer: Box<dyn RenderPipeline>,
    video_config: Option<VideoConfig>,
    audio_config: Option<AudioConfig>,
    anchor: Option<SessionAnchor>,
    previewing: bool,
    streaming: bool,
    recording: bool,
}

impl StreamSession {
    /// Create a session streaming over `protocol`
    ///
    /// Frames from `camera` pass through a [`PassthroughRenderer`] until
    /// another pipeline is installed with
    /// [`StreamSession::replace_render_pipeline`].
    pub fn new(
        protocol: Protocol,
        config: SessionConfig,
        backends: SessionBackends,
        camera: Box<dyn VideoSource>,
        microphone: Option<Box<dyn AudioSource>>,
    ) -> (Self, SessionEvents) {
        let (encoder_tx, encoder_rx) = mpsc::unbounded_channel();
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (record_tx, record_rx) = mpsc::unbounded_channel();

        let video = Arc::new(EncoderSession::new(
            MediaKind::Video,
            backends.codecs.clone(),
            &config,
            encoder_tx.clone(),
        ));
        let audio = Arc::new(EncoderSession::new(
            MediaKind::Audio,
            backends.codecs.clone(),
            &config,
            encoder_tx,
        ));
        let client = Arc::new(ProtocolClient::new(
            protocol,
            backends.transports.clone(),
            &config,
            connection_tx,
        ));
        let recorder = Arc::new(RecordController::new(
            backends.muxers.clone(),
            config.record_buffer_capacity,
            record_tx.clone(),
        ));

        let weak_video: Weak<EncoderSession> = Arc::downgrade(&video);
        client.set_keyframe_request(Arc::new(move || {
            if let Some(video) = weak_video.upgrade() {
                video.request_keyframe();
            }
        }));

        let fanout = Arc::new(Fanout {
            recorder: RwLock::new(recorder),
            client: client.clone(),
            recording: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
        });
        video.set_sink(fanout.clone());
        audio.set_sink(fanout.clone());

        let capture_route = Arc::new(FrameRoute::new());
        let renderer: Box<dyn RenderPipeline> = Box::new(PassthroughRenderer::new());
        capture_route.connect(renderer.input());

        let handle = Handle::new();
        info!("Created {} session {}", protocol, handle);

        let session = Self {
            handle,
            config,
            muxers: backends.muxers,
            record_events: record_tx,
            video,
            audio,
            client,
            fanout,
            camera,
            microphone,
            capture_route,
            renderer,
            video_config: None,
            audio_config: None,
            anchor: None,
            previewing: false,
            streaming: false,
            recording: false,
        };
        let events = SessionEvents {
            encoder: encoder_rx,
            connection: connection_rx,
            record: record_rx,
        };
        (session, events)
    }

    /// Session handle
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The protocol client, for stream options and counters
    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    /// The active record controller
    pub fn recorder(&self) -> Arc<RecordController> {
        self.fanout.recorder.read().clone()
    }

    /// The encoder session for `kind`
    pub fn encoder(&self, kind: MediaKind) -> &EncoderSession {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    /// Whether the camera is displayed
    pub fn is_previewing(&self) -> bool {
        self.previewing
    }

    /// Whether a stream was started and not stopped
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Whether a recording was started and not stopped
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Video parameters of the last successful prepare
    pub fn video_config(&self) -> Option<&VideoConfig> {
        self.video_config.as_ref()
    }

    /// Audio parameters, or `None` when audio is disabled
    pub fn audio_config(&self) -> Option<&AudioConfig> {
        self.audio_config.as_ref()
    }

    /// Prepare the video encoder; false if no codec accepts `config`
    pub fn prepare_video(&mut self, config: VideoConfig) -> bool {
        if self.streaming || self.recording {
            warn!("prepare_video ignored while streaming or recording");
            return false;
        }
        match self.video.prepare(CodecParams::Video(config.clone())) {
            Ok(()) => {
                let (width, height) = config.encoded_size();
                self.renderer.set_encoder_size(width, height);
                self.renderer.set_fps(config.fps);
                info!(
                    "Video prepared: {} {}x{} @ {}fps, {} kbps",
                    config.codec,
                    width,
                    height,
                    config.fps,
                    config.bitrate / 1000
                );
                self.video_config = Some(config);
                true
            }
            Err(e) => {
                error!("Video prepare failed: {}", e);
                false
            }
        }
    }

    /// Prepare the audio encoder; false if no codec accepts `config`
    pub fn prepare_audio(&mut self, config: AudioConfig) -> bool {
        if self.streaming || self.recording {
            warn!("prepare_audio ignored while streaming or recording");
            return false;
        }
        if self.microphone.is_none() {
            warn!("prepare_audio without a microphone, audio stays disabled");
            return false;
        }
        match self.audio.prepare(CodecParams::Audio(config.clone())) {
            Ok(()) => {
                info!(
                    "Audio prepared: {} {}Hz {}ch, {} kbps",
                    config.codec,
                    config.sample_rate,
                    config.channels(),
                    config.bitrate / 1000
                );
                self.audio_config = Some(config);
                true
            }
            Err(e) => {
                error!("Audio prepare failed: {}", e);
                false
            }
        }
    }

    /// Stream and record video only
    pub fn disable_audio(&mut self) {
        if self.streaming || self.recording {
            warn!("disable_audio ignored while streaming or recording");
            return;
        }
        self.audio.stop();
        self.audio_config = None;
        info!("Audio disabled");
    }

    /// Start camera capture and display without encoding
    pub fn start_preview(&mut self) -> Result<()> {
        if self.previewing || self.streaming || self.recording {
            warn!("start_preview ignored, already previewing or encoding");
            return Ok(());
        }
        self.start_capture()?;
        self.previewing = true;
        info!("Preview started");
        Ok(())
    }

    /// Stop the camera; ignored while streaming or recording
    pub fn stop_preview(&mut self) {
        if self.streaming || self.recording {
            warn!("stop_preview ignored while streaming or recording");
            return;
        }
        if !self.previewing {
            warn!("stop_preview ignored, not previewing");
            return;
        }
        self.stop_capture();
        self.previewing = false;
        info!("Preview stopped");
    }

    /// Start streaming to `url`
    ///
    /// Starts the encoders unless a recording already runs them, in which
    /// case a key frame is requested instead. Connection progress arrives
    /// as [`ConnectionEvent`]s.
    pub fn start_stream(&mut self, url: &str) -> Result<()> {
        if self.streaming {
            return Err(LivecastError::invalid_state("already streaming"));
        }
        if self.recording {
            self.video.request_keyframe();
        } else {
            self.start_encoders()?;
        }

        for encoder in [&self.video, &self.audio] {
            if let Some(format) = encoder.format() {
                self.client.set_format(&format);
            }
        }

        self.streaming = true;
        self.fanout.streaming.store(true, Ordering::SeqCst);
        info!("Starting stream to {}", safe_url(url));
        self.client.connect(url);
        Ok(())
    }

    /// Stop streaming; encoders keep running while recording
    pub fn stop_stream(&mut self) {
        if !self.streaming {
            warn!("stop_stream ignored, not streaming");
            return;
        }
        self.fanout.streaming.store(false, Ordering::SeqCst);
        self.client.disconnect();
        self.streaming = false;
        if !self.recording {
            self.stop_encoders();
        }
        info!("Stream stopped");
    }

    /// Start recording to `path`
    ///
    /// Starts the encoders unless a stream already runs them, in which case
    /// a key frame is requested instead.
    pub fn start_record(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if self.recording {
            return Err(LivecastError::invalid_state("already recording"));
        }
        if self.video_config.is_none() {
            return Err(LivecastError::invalid_state("prepare_video must succeed first"));
        }

        let recorder = self.recorder();
        recorder.set_expect_audio(self.audio_config.is_some());
        recorder.start_record(path.as_ref())?;

        if self.streaming {
            self.video.request_keyframe();
        } else if let Err(e) = self.start_encoders() {
            let _ = recorder.stop_record();
            return Err(e);
        }

        self.recording = true;
        self.fanout.recording.store(true, Ordering::SeqCst);
        info!("Recording started: {:?}", path.as_ref());
        Ok(())
    }

    /// Stop recording; encoders keep running while streaming
    pub fn stop_record(&mut self) -> Result<()> {
        if !self.recording {
            warn!("stop_record ignored, not recording");
            return Ok(());
        }
        self.fanout.recording.store(false, Ordering::SeqCst);
        let result = self.recorder().stop_record();
        self.recording = false;
        if !self.streaming {
            self.stop_encoders();
        }
        result
    }

    /// Suspend recording without closing the file
    pub fn pause_record(&self) {
        self.recorder().pause_record();
    }

    /// Resume a paused recording at the next key frame
    pub fn resume_record(&self) {
        self.recorder().resume_record();
        self.video.request_keyframe();
    }

    /// Start streaming to `url` and recording to `path`
    pub fn start_stream_and_record(&mut self, url: &str, path: impl AsRef<Path>) -> Result<()> {
        self.start_stream(url)?;
        if let Err(e) = self.start_record(path) {
            self.stop_stream();
            return Err(e);
        }
        Ok(())
    }

    /// Switch to the next camera without stopping the encoders
    pub fn switch_camera(&mut self) -> Result<()> {
        self.camera.switch_device()
    }

    /// Change the video bitrate while encoding
    pub fn set_video_bitrate_on_fly(&mut self, bps: u32) {
        if let Some(config) = self.video_config.as_mut() {
            config.bitrate = bps;
        }
        self.video.set_bitrate(bps);
    }

    /// Limit the encoded frame rate; `None` removes the limit
    pub fn set_limit_fps_on_fly(&mut self, fps: Option<u32>) {
        self.video.set_fps_limit(fps);
    }

    /// Install another render pipeline
    ///
    /// The swap happens while video encoder input is held, so the
    /// encoder never sees a frame from a half-attached pipeline.
    pub fn replace_render_pipeline(&mut self, mut renderer: Box<dyn RenderPipeline>) -> Result<()> {
        if let Some(config) = &self.video_config {
            let (width, height) = config.encoded_size();
            renderer.set_encoder_size(width, height);
            renderer.set_fps(config.fps);
        }
        let capturing = self.camera.is_running();
        if capturing {
            renderer.start()?;
        }

        let encoding = self.video.is_running();
        {
            let _hold = self.video.hold_input();
            self.renderer.detach_encoder();
            self.capture_route.connect(renderer.input());
            if encoding {
                let input: Arc<dyn FrameSink> = self.video.clone();
                renderer.attach_encoder(input);
            }
        }

        let mut old = std::mem::replace(&mut self.renderer, renderer);
        old.stop();
        info!("Render pipeline replaced");
        Ok(())
    }

    /// Ask the video encoder for a key frame
    pub fn request_keyframe(&self) {
        self.video.request_keyframe();
    }

    /// Reconnect after a connection failure
    pub fn retry(&self, delay: Duration, reason: &str, backup_url: Option<&str>) -> bool {
        self.streaming && self.client.retry(delay, reason, backup_url)
    }

    /// Credentials used if the server demands them
    pub fn set_authorization(&self, user: impl Into<String>, password: impl Into<String>) {
        self.client.set_authorization(user, password);
    }

    /// Send silence instead of microphone audio
    pub fn mute(&mut self) {
        if let Some(microphone) = self.microphone.as_mut() {
            microphone.set_muted(true);
            info!("Microphone muted");
        }
    }

    /// Send microphone audio again
    pub fn unmute(&mut self) {
        if let Some(microphone) = self.microphone.as_mut() {
            microphone.set_muted(false);
            info!("Microphone unmuted");
        }
    }

    /// Whether the microphone is muted
    pub fn is_muted(&self) -> bool {
        self.microphone.as_ref().is_some_and(|m| m.is_muted())
    }

    /// Install a record controller; refused while recording
    pub fn replace_record_controller(&mut self, controller: Arc<RecordController>) -> Result<()> {
        if self.recording {
            return Err(LivecastError::invalid_state(
                "cannot replace the record controller while recording",
            ));
        }
        for encoder in [&self.video, &self.audio] {
            if let Some(format) = encoder.format() {
                controller.set_format(&format);
            }
        }
        *self.fanout.recorder.write() = controller;
        debug!("Record controller replaced");
        Ok(())
    }

    /// A new record controller with this session's muxers and event channel
    pub fn new_record_controller(&self) -> Arc<RecordController> {
        Arc::new(RecordController::new(
            self.muxers.clone(),
            self.config.record_buffer_capacity,
            self.record_events.clone(),
        ))
    }

    /// Counters of every component
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            video: self.video.stats(),
            audio: self.audio.stats(),
            client: self.client.stats(),
            record: self.recorder().stats(),
        }
    }

    fn video_capture_settings(&self) -> Result<VideoCaptureSettings> {
        let config = self
            .video_config
            .as_ref()
            .ok_or_else(|| LivecastError::invalid_state("prepare_video must succeed first"))?;
        Ok(VideoCaptureSettings {
            width: config.width,
            height: config.height,
            fps: config.fps,
            rotation: config.rotation,
        })
    }

    fn start_capture(&mut self) -> Result<()> {
        let settings = self.video_capture_settings()?;
        self.renderer.start()?;
        let sink: Arc<dyn FrameSink> = self.capture_route.clone();
        if let Err(e) = self.camera.start(&settings, sink) {
            self.renderer.stop();
            return Err(e);
        }
        Ok(())
    }

    fn stop_capture(&mut self) {
        self.camera.stop();
        self.renderer.stop();
    }

    /// Prepare again if stopped, returning false for disabled audio
    fn ensure_prepared(&self, kind: MediaKind) -> Result<bool> {
        let (encoder, params) = match kind {
            MediaKind::Video => (
                &self.video,
                self.video_config.clone().map(CodecParams::Video),
            ),
            MediaKind::Audio => (
                &self.audio,
                self.audio_config.clone().map(CodecParams::Audio),
            ),
        };
        let Some(params) = params else {
            return match kind {
                MediaKind::Video => Err(LivecastError::invalid_state(
                    "prepare_video must succeed first",
                )),
                MediaKind::Audio => Ok(false),
            };
        };
        if encoder.state() != EncoderState::Prepared {
            debug!("Re-preparing {} encoder", kind);
            encoder.prepare(params)?;
        }
        Ok(true)
    }

    /// Start both encoders and attach them to capture
    fn start_encoders(&mut self) -> Result<()> {
        let with_audio = self.ensure_prepared(MediaKind::Audio)?;
        self.ensure_prepared(MediaKind::Video)?;

        let anchor = SessionAnchor::now();
        self.anchor = Some(anchor);
        self.recorder().set_expect_audio(with_audio);

        self.video.start(anchor)?;
        if with_audio {
            if let Err(e) = self.audio.start(anchor) {
                self.video.stop();
                return Err(e);
            }
        }

        if !self.previewing {
            if let Err(e) = self.start_capture() {
                self.video.stop();
                self.audio.stop();
                return Err(e);
            }
        }
        let input: Arc<dyn FrameSink> = self.video.clone();
        self.renderer.attach_encoder(input);

        if with_audio {
            if let (Some(microphone), Some(config)) =
                (self.microphone.as_mut(), self.audio_config.as_ref())
            {
                let settings = AudioCaptureSettings {
                    sample_rate: config.sample_rate,
                    channels: config.channels(),
                    echo_canceler: config.echo_canceler,
                    noise_suppressor: config.noise_suppressor,
                };
                let sink: Arc<dyn FrameSink> = self.audio.clone();
                if let Err(e) = microphone.start(&settings, sink) {
                    error!("Microphone failed to start: {}", e);
                    self.stop_encoders();
                    return Err(e);
                }
            }
        }

        info!("Encoders started");
        Ok(())
    }

    /// Detach capture and stop both encoders
    fn stop_encoders(&mut self) {
        if let Some(microphone) = self.microphone.as_mut() {
            microphone.stop();
        }
        {
            let _hold = self.video.hold_input();
            self.renderer.detach_encoder();
        }
        self.video.stop();
        self.audio.stop();
        self.recorder().reset_formats();
        self.anchor = None;

        if !self.previewing {
            self.stop_capture();
        }
        info!("Encoders stopped");
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if self.streaming {
            self.stop_stream();
        }
        if self.recording {
            if let Err(e) = self.stop_record() {
                error!("Failed to stop recording on drop: {}", e);
            }
        }
        if self.previewing {
            self.stop_preview();
        }
        self.video.clear_sink();
        self.audio.clear_sink();
        debug!("Session {} dropped", self.handle);
    }
}
