//! Recording
//!
//! [`RecordController`] muxes encoded samples from both encoder
//! sessions into a container file. Writing begins on the first video key
//! frame once every expected track format is known; earlier samples are
//! buffered (bounded) so the file never starts with undecodable frames.
//! Pauses are cut out of the timeline.

#[cfg(feature = "ffmpeg")]
mod ffmpeg;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::{FfmpegMuxer, FfmpegMuxerFactory};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, trace, warn};

use crate::encode::SampleSink;
use crate::error::{LivecastError, Result};
use crate::types::{EncodedSample, FormatDescription, MediaKind, OwnedSample};

/// Frame interval assumed when the video format has no frame rate
const DEFAULT_FRAME_INTERVAL_US: u64 = 33_333;

/// Container writer
///
/// Timestamps passed to `write` are microseconds from the start of the
/// recording and non-decreasing per track.
pub trait Muxer: Send {
    /// Add a track; returns its index
    fn add_track(&mut self, format: &FormatDescription) -> Result<usize>;

    /// Write the container header
    fn start(&mut self) -> Result<()>;

    /// Write one sample
    fn write(&mut self, track: usize, data: &[u8], pts_us: u64, key_frame: bool) -> Result<()>;

    /// Write the trailer and close the destination
    fn finalize(&mut self) -> Result<()>;
}

/// Opens muxers for a destination
pub trait MuxerFactory: Send + Sync {
    /// Open `destination`, failing with `LivecastError::RecordIo`
    fn open(&self, destination: &Path) -> Result<Box<dyn Muxer>>;
}

/// Recording status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// Never started
    Idle,
    /// Destination open, waiting for formats and a key frame
    Starting,
    /// Writing samples
    Running,
    /// Samples discarded until resumed
    Paused,
    /// Finalized
    Stopped,
    /// Destination failed; stop or start again
    Error,
}

/// Events emitted by the record controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    /// Status changed
    Status(RecordStatus),
    /// Destination could not be opened or written
    Error(String),
}

/// Recording counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordStats {
    /// Samples written
    pub samples_written: u64,
    /// Payload bytes written
    pub bytes_written: u64,
    /// Samples dropped from the start buffer
    pub dropped: u64,
}

struct Recorder {
    status: RecordStatus,
    expect_audio: bool,
    video_format: Option<FormatDescription>,
    audio_format: Option<FormatDescription>,
    destination: Option<PathBuf>,
    muxer: Option<Box<dyn Muxer>>,
    started: bool,
    video_track: Option<usize>,
    audio_track: Option<usize>,
    pending: VecDeque<OwnedSample>,
    origin_us: u64,
    pause_offset_us: u64,
    /// Input timestamp of the last sample written, per track
    last_input: [u64; 2],
    /// Set by resume; holds output until the next video key frame
    resumed_from: Option<u64>,
    last_written: [u64; 2],
    stats: RecordStats,
}

impl Recorder {
    fn new(expect_audio: bool) -> Self {
        Self {
            status: RecordStatus::Idle,
            expect_audio,
            video_format: None,
            audio_format: None,
            destination: None,
            muxer: None,
            started: false,
            video_track: None,
            audio_track: None,
            pending: VecDeque::new(),
            origin_us: 0,
            pause_offset_us: 0,
            last_input: [0; 2],
            resumed_from: None,
            last_written: [0; 2],
            stats: RecordStats::default(),
        }
    }

    fn formats_ready(&self) -> bool {
        self.video_format.is_some() && (!self.expect_audio || self.audio_format.is_some())
    }

    fn frame_interval_us(&self) -> u64 {
        self.video_format
            .as_ref()
            .and_then(FormatDescription::frame_interval_us)
            .unwrap_or(DEFAULT_FRAME_INTERVAL_US)
    }

    fn clear_session(&mut self) {
        self.muxer = None;
        self.started = false;
        self.video_track = None;
        self.audio_track = None;
        self.pending.clear();
        self.origin_us = 0;
        self.pause_offset_us = 0;
        self.last_input = [0; 2];
        self.resumed_from = None;
        self.last_written = [0; 2];
    }
}

fn track_slot(kind: MediaKind) -> usize {
    match kind {
        MediaKind::Video => 0,
        MediaKind::Audio => 1,
    }
}

/// Muxes encoded samples into a file
///
/// All methods take `&self`; share the controller with `Arc`.
pub struct RecordController {
    factory: Arc<dyn MuxerFactory>,
    events: UnboundedSender<RecordEvent>,
    buffer_capacity: usize,
    inner: Mutex<Recorder>,
}

impl RecordController {
    /// Create an idle controller expecting audio and video
    pub fn new(
        factory: Arc<dyn MuxerFactory>,
        buffer_capacity: usize,
        events: UnboundedSender<RecordEvent>,
    ) -> Self {
        Self {
            factory,
            events,
            buffer_capacity: buffer_capacity.max(1),
            inner: Mutex::new(Recorder::new(true)),
        }
    }

    /// Current status
    pub fn status(&self) -> RecordStatus {
        self.inner.lock().status
    }

    /// Whether a recording is open (starting, running or paused)
    pub fn is_recording(&self) -> bool {
        matches!(
            self.status(),
            RecordStatus::Starting | RecordStatus::Running | RecordStatus::Paused
        )
    }

    /// Destination of the current or last recording
    pub fn destination(&self) -> Option<PathBuf> {
        self.inner.lock().destination.clone()
    }

    /// Counters of the current or last recording
    pub fn stats(&self) -> RecordStats {
        self.inner.lock().stats
    }

    /// Whether an audio track must be known before writing starts
    pub fn set_expect_audio(&self, expect_audio: bool) {
        self.inner.lock().expect_audio = expect_audio;
    }

    /// Forget track formats; called when the encoders stop
    pub fn reset_formats(&self) {
        let mut rec = self.inner.lock();
        rec.video_format = None;
        rec.audio_format = None;
        debug!("Record formats reset");
    }

    /// Open `destination` and wait for the first key frame
    pub fn start_record(&self, destination: impl AsRef<Path>) -> Result<()> {
        let destination = destination.as_ref();
        let mut rec = self.inner.lock();
        if matches!(
            rec.status,
            RecordStatus::Starting | RecordStatus::Running | RecordStatus::Paused
        ) {
            return Err(LivecastError::invalid_state(format!(
                "recording already {:?}",
                rec.status
            )));
        }

        rec.clear_session();
        rec.stats = RecordStats::default();
        rec.destination = Some(destination.to_path_buf());

        match self.factory.open(destination) {
            Ok(muxer) => {
                info!("Recording to {:?}", destination);
                rec.muxer = Some(muxer);
                self.set_status(&mut rec, RecordStatus::Starting);
                Ok(())
            }
            Err(e) => {
                error!("Failed to open recording {:?}: {}", destination, e);
                self.set_status(&mut rec, RecordStatus::Error);
                self.emit(RecordEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Suspend writing without closing the file
    pub fn pause_record(&self) {
        let mut rec = self.inner.lock();
        if rec.status != RecordStatus::Running {
            warn!("pause ignored, recording is {:?}", rec.status);
            return;
        }
        // the resumed key frame follows the last written video sample
        let paused_at = rec.last_input[track_slot(MediaKind::Video)];
        rec.resumed_from = Some(paused_at);
        self.set_status(&mut rec, RecordStatus::Paused);
        info!("Recording paused");
    }

    /// Resume writing at the next video key frame
    pub fn resume_record(&self) {
        let mut rec = self.inner.lock();
        if rec.status != RecordStatus::Paused {
            warn!("resume ignored, recording is {:?}", rec.status);
            return;
        }
        self.set_status(&mut rec, RecordStatus::Running);
        info!("Recording resumed");
    }

    /// Finalize and close the file; idempotent
    pub fn stop_record(&self) -> Result<()> {
        let mut rec = self.inner.lock();
        match rec.status {
            RecordStatus::Starting | RecordStatus::Running | RecordStatus::Paused => {}
            RecordStatus::Error => {
                rec.clear_session();
                self.set_status(&mut rec, RecordStatus::Stopped);
                return Ok(());
            }
            RecordStatus::Idle | RecordStatus::Stopped => return Ok(()),
        }

        let started = rec.started;
        let result = match rec.muxer.take() {
            Some(mut muxer) if started => muxer.finalize(),
            _ => {
                warn!("Recording stopped before the first key frame, nothing written");
                Ok(())
            }
        };
        let stats = rec.stats;
        rec.clear_session();

        match result {
            Ok(()) => {
                info!(
                    "Recording stopped: {} samples ({:.2} MB)",
                    stats.samples_written,
                    stats.bytes_written as f64 / 1_000_000.0
                );
                self.set_status(&mut rec, RecordStatus::Stopped);
                Ok(())
            }
            Err(e) => {
                error!("Failed to finalize recording: {}", e);
                self.set_status(&mut rec, RecordStatus::Error);
                self.emit(RecordEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Record a track format
    pub fn set_format(&self, format: &FormatDescription) {
        let mut rec = self.inner.lock();
        match format.kind() {
            MediaKind::Video => rec.video_format = Some(format.clone()),
            MediaKind::Audio => rec.audio_format = Some(format.clone()),
        }
        if rec.status == RecordStatus::Starting {
            self.try_begin(&mut rec);
        }
    }

    /// Accept one encoded sample
    pub fn write_sample(&self, sample: &EncodedSample<'_>) {
        let mut rec = self.inner.lock();
        match rec.status {
            RecordStatus::Starting => {
                self.buffer(&mut rec, sample);
                self.try_begin(&mut rec);
            }
            RecordStatus::Running => {
                if let Some(paused_at) = rec.resumed_from {
                    if sample.kind != MediaKind::Video || !sample.is_key_frame() {
                        return;
                    }
                    let gap = sample.pts_us.saturating_sub(paused_at);
                    let skipped = gap.saturating_sub(rec.frame_interval_us());
                    rec.pause_offset_us += skipped;
                    rec.resumed_from = None;
                    debug!("Pause cut {} us from the recording", skipped);
                }
                self.write(&mut rec, sample);
            }
            // paused or not recording
            _ => {}
        }
    }

    fn buffer(&self, rec: &mut Recorder, sample: &EncodedSample<'_>) {
        let has_key = rec
            .pending
            .iter()
            .any(|s| s.kind == MediaKind::Video && s.flags.key_frame);
        if sample.kind == MediaKind::Video && !sample.is_key_frame() && !has_key {
            trace!("Video sample before first key frame discarded");
            return;
        }

        if rec.pending.len() >= self.buffer_capacity {
            rec.pending.pop_front();
            rec.stats.dropped += 1;
            if rec.stats.dropped == 1 || rec.stats.dropped % 100 == 0 {
                warn!(
                    "Record start buffer full ({}), dropped {} samples",
                    self.buffer_capacity, rec.stats.dropped
                );
            }
        }
        rec.pending.push_back(sample.to_owned());
    }

    /// Start writing if formats are known and a key frame is buffered
    fn try_begin(&self, rec: &mut Recorder) {
        if !rec.formats_ready() {
            return;
        }
        let Some(key_index) = rec
            .pending
            .iter()
            .position(|s| s.kind == MediaKind::Video && s.flags.key_frame)
        else {
            return;
        };

        let origin = rec.pending[key_index].pts_us;
        if let Err(e) = self.open_tracks(rec) {
            self.fail(rec, e);
            return;
        }
        rec.origin_us = origin;
        rec.started = true;
        self.set_status(rec, RecordStatus::Running);
        info!("Recording started at {} us", origin);

        let pending: Vec<OwnedSample> = rec.pending.drain(..).collect();
        for (i, sample) in pending.iter().enumerate() {
            let leading_video = sample.kind == MediaKind::Video && i < key_index;
            if leading_video || sample.pts_us < origin {
                continue;
            }
            self.write(rec, &sample.as_sample());
            if rec.status != RecordStatus::Running {
                break;
            }
        }
    }

    fn open_tracks(&self, rec: &mut Recorder) -> Result<()> {
        let video = rec.video_format.clone();
        let audio = if rec.expect_audio {
            rec.audio_format.clone()
        } else {
            None
        };
        let muxer = rec
            .muxer
            .as_mut()
            .ok_or_else(|| LivecastError::record_io("recording destination not open"))?;

        if let Some(format) = &video {
            rec.video_track = Some(muxer.add_track(format)?);
        }
        if let Some(format) = &audio {
            rec.audio_track = Some(muxer.add_track(format)?);
        }
        muxer.start()
    }

    fn write(&self, rec: &mut Recorder, sample: &EncodedSample<'_>) {
        let slot = track_slot(sample.kind);
        rec.last_input[slot] = rec.last_input[slot].max(sample.pts_us);
        let track = match sample.kind {
            MediaKind::Video => rec.video_track,
            MediaKind::Audio => rec.audio_track,
        };
        let Some(track) = track else {
            return;
        };

        let pts = sample
            .pts_us
            .saturating_sub(rec.origin_us)
            .saturating_sub(rec.pause_offset_us)
            .max(rec.last_written[slot]);
        rec.last_written[slot] = pts;

        let Some(muxer) = rec.muxer.as_mut() else {
            return;
        };
        match muxer.write(track, sample.data, pts, sample.is_key_frame()) {
            Ok(()) => {
                rec.stats.samples_written += 1;
                rec.stats.bytes_written += sample.data.len() as u64;
            }
            Err(e) => self.fail(rec, e),
        }
    }

    fn fail(&self, rec: &mut Recorder, err: LivecastError) {
        error!("Recording failed: {}", err);
        if let Some(mut muxer) = rec.muxer.take() {
            if rec.started {
                if let Err(e) = muxer.finalize() {
                    debug!("Finalize after failure: {}", e);
                }
            }
        }
        rec.started = false;
        rec.pending.clear();
        self.set_status(rec, RecordStatus::Error);
        self.emit(RecordEvent::Error(err.to_string()));
    }

    fn set_status(&self, rec: &mut Recorder, status: RecordStatus) {
        if rec.status != status {
            rec.status = status;
            self.emit(RecordEvent::Status(status));
        }
    }

    fn emit(&self, event: RecordEvent) {
        let _ = self.events.send(event);
    }
}

impl SampleSink for RecordController {
    fn on_format(&self, format: &FormatDescription) {
        self.set_format(format);
    }

    fn on_sample(&self, sample: &EncodedSample<'_>) {
        self.write_sample(sample);
    }
}
