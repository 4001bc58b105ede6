//! Encoder session
//!
//! Drives one codec on a dedicated worker thread: raw frames are pulled
//! from the bounded [`FrameQueue`], submitted to the codec, and every
//! ready output is delivered to the [`SampleSink`] on the same thread.
//!
//! Codec failures are offered to an error hook; when it agrees (the
//! default), the codec is recreated with the prepared parameters and
//! encoding resumes. Timestamp state survives resets.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{Codec, CodecFactory, CodecOutput, CodecParams, FrameQueue, SampleSink};
use crate::config::SessionConfig;
use crate::error::{LivecastError, Result};
use crate::metrics::{EncoderMetrics, EncoderStats};
use crate::types::{
    EncodedSample, FormatDescription, MediaFrame, MediaKind, SampleFlags, SessionAnchor,
};

/// How long the worker waits for a frame before re-checking cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Decides whether a codec failure should be recovered by a reset
pub type ErrorHook = Arc<dyn Fn(MediaKind, &LivecastError) -> bool + Send + Sync>;

/// Encoder session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    /// No codec
    Unprepared,
    /// Codec created, worker not running
    Prepared,
    /// Worker running
    Running,
    /// Worker shutting down
    Stopping,
}

/// Events emitted by an encoder session
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    /// Worker started
    Started(MediaKind),
    /// Worker stopped and codec released
    Stopped(MediaKind),
    /// Codec recreated after a failure
    Reset {
        kind: MediaKind,
        attempt: u32,
        reason: String,
    },
    /// Non-fatal condition, e.g. a live change the codec cannot apply
    Warning { kind: MediaKind, message: String },
    /// Unrecoverable failure; the session stopped
    Fatal { kind: MediaKind, error: String },
}

/// Skips frames to stay under a frame rate
#[derive(Debug)]
struct FpsLimiter {
    interval_us: u64,
    last_us: Option<u64>,
}

impl FpsLimiter {
    fn new(fps: u32) -> Self {
        Self {
            interval_us: 1_000_000 / fps.max(1) as u64,
            last_us: None,
        }
    }

    fn accept(&mut self, ts_us: u64) -> bool {
        // 10% slack so capture jitter does not halve the rate
        let min_gap = self.interval_us - self.interval_us / 10;
        match self.last_us {
            Some(last) if ts_us < last.saturating_add(min_gap) => false,
            _ => {
                self.last_us = Some(ts_us);
                true
            }
        }
    }
}

struct Worker {
    token: CancellationToken,
    done: Receiver<()>,
    thread: JoinHandle<()>,
}

/// State shared between the session handle and its worker
struct Shared {
    kind: MediaKind,
    factory: Arc<dyn CodecFactory>,
    stop_timeout: Duration,
    max_resets: Option<u32>,
    state: Mutex<EncoderState>,
    params: Mutex<Option<CodecParams>>,
    /// Holding this lock holds encoder input
    codec: Mutex<Option<Box<dyn Codec>>>,
    format: Mutex<Option<FormatDescription>>,
    queue: FrameQueue,
    sink: RwLock<Option<Arc<dyn SampleSink>>>,
    error_hook: RwLock<ErrorHook>,
    events: UnboundedSender<EncoderEvent>,
    anchor: Mutex<SessionAnchor>,
    last_pts: AtomicU64,
    resets: AtomicU32,
    keyframe_requested: AtomicBool,
    pending_bitrate: Mutex<Option<u32>>,
    fps_limit: Mutex<Option<FpsLimiter>>,
    run_id: AtomicU64,
    metrics: EncoderMetrics,
}

/// Guard holding encoder input; the worker submits nothing while it lives
///
/// Must not be taken from a [`SampleSink`] callback.
pub struct InputHold<'a> {
    _guard: MutexGuard<'a, Option<Box<dyn Codec>>>,
}

/// One encoder instance with its own worker thread
///
/// All methods take `&self`; share the session with `Arc`.
pub struct EncoderSession {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl EncoderSession {
    /// Create an unprepared session
    pub fn new(
        kind: MediaKind,
        factory: Arc<dyn CodecFactory>,
        config: &SessionConfig,
        events: UnboundedSender<EncoderEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                kind,
                factory,
                stop_timeout: config.stop_timeout,
                max_resets: config.max_codec_resets,
                state: Mutex::new(EncoderState::Unprepared),
                params: Mutex::new(None),
                codec: Mutex::new(None),
                format: Mutex::new(None),
                queue: FrameQueue::new(config.queue_capacity),
                sink: RwLock::new(None),
                error_hook: RwLock::new(Arc::new(|_, _| true)),
                events,
                anchor: Mutex::new(SessionAnchor::at(0)),
                last_pts: AtomicU64::new(0),
                resets: AtomicU32::new(0),
                keyframe_requested: AtomicBool::new(false),
                pending_bitrate: Mutex::new(None),
                fps_limit: Mutex::new(None),
                run_id: AtomicU64::new(0),
                metrics: EncoderMetrics::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Media kind this session encodes
    pub fn kind(&self) -> MediaKind {
        self.shared.kind
    }

    /// Current lifecycle state
    pub fn state(&self) -> EncoderState {
        *self.shared.state.lock()
    }

    /// Whether the worker is running
    pub fn is_running(&self) -> bool {
        self.state() == EncoderState::Running
    }

    /// Parameters of the last successful prepare
    pub fn params(&self) -> Option<CodecParams> {
        self.shared.params.lock().clone()
    }

    /// Last output format reported by the codec in this run
    pub fn format(&self) -> Option<FormatDescription> {
        self.shared.format.lock().clone()
    }

    /// Statistics for the current run
    pub fn stats(&self) -> EncoderStats {
        self.shared
            .metrics
            .snapshot(self.shared.resets.load(Ordering::Relaxed))
    }

    /// Frames waiting for the worker
    pub fn queued_frames(&self) -> usize {
        self.shared.queue.len()
    }

    /// Set the consumer of encoded output
    pub fn set_sink(&self, sink: Arc<dyn SampleSink>) {
        *self.shared.sink.write() = Some(sink);
    }

    /// Remove the consumer of encoded output
    pub fn clear_sink(&self) {
        *self.shared.sink.write() = None;
    }

    /// Replace the hook deciding whether codec failures are recovered
    pub fn set_error_hook<F>(&self, hook: F)
    where
        F: Fn(MediaKind, &LivecastError) -> bool + Send + Sync + 'static,
    {
        *self.shared.error_hook.write() = Arc::new(hook);
    }

    /// Validate `params` and create a codec
    pub fn prepare(&self, params: CodecParams) -> Result<()> {
        let kind = self.shared.kind;
        if params.kind() != kind {
            return Err(LivecastError::prepare(format!(
                "{} parameters given to {} encoder",
                params.kind(),
                kind
            )));
        }

        self.reap_worker();
        let mut state = self.shared.state.lock();
        if matches!(*state, EncoderState::Running | EncoderState::Stopping) {
            return Err(LivecastError::invalid_state(format!(
                "cannot prepare {} encoder while {:?}",
                kind, *state
            )));
        }

        params.validate()?;
        let codec = self.shared.factory.create(&params)?;
        info!("{} encoder prepared with {}", kind, codec.name());

        *self.shared.codec.lock() = Some(codec);
        *self.shared.params.lock() = Some(params);
        *self.shared.format.lock() = None;
        *state = EncoderState::Prepared;
        Ok(())
    }

    /// Spawn the worker; timestamps are made relative to `anchor`
    pub fn start(&self, anchor: SessionAnchor) -> Result<()> {
        let kind = self.shared.kind;
        self.reap_worker();

        let mut state = self.shared.state.lock();
        match *state {
            EncoderState::Prepared => {}
            EncoderState::Running => {
                return Err(LivecastError::invalid_state(format!(
                    "{} encoder already running",
                    kind
                )));
            }
            other => {
                return Err(LivecastError::invalid_state(format!(
                    "cannot start {} encoder while {:?}",
                    kind, other
                )));
            }
        }

        let shared = &self.shared;
        *shared.anchor.lock() = anchor;
        shared.last_pts.store(0, Ordering::SeqCst);
        shared.resets.store(0, Ordering::SeqCst);
        shared.keyframe_requested.store(false, Ordering::SeqCst);
        shared.metrics.reset();
        shared.queue.clear();
        shared.queue.open();

        let run_id = shared.run_id.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        let (done_tx, done_rx) = channel::bounded(1);

        *state = EncoderState::Running;
        let worker_shared = shared.clone();
        let worker_token = token.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("livecast-{}-encoder", kind))
            .spawn(move || worker_shared.run(worker_token, run_id, done_tx));

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                shared.queue.close();
                *state = EncoderState::Prepared;
                return Err(LivecastError::codec(format!(
                    "Failed to spawn {} encoder thread: {}",
                    kind, e
                )));
            }
        };
        drop(state);

        *self.worker.lock() = Some(Worker {
            token,
            done: done_rx,
            thread,
        });

        info!("{} encoder started", kind);
        shared.emit(EncoderEvent::Started(kind));
        Ok(())
    }

    /// Stop the worker and release the codec
    ///
    /// Idempotent. Waits up to the configured stop timeout for the worker;
    /// when called from the worker itself (inside a sink callback) it only
    /// signals, and the worker tears down after the callback returns.
    pub fn stop(&self) {
        let kind = self.shared.kind;
        let worker = self.worker.lock().take();

        let Some(worker) = worker else {
            let was_prepared = *self.shared.state.lock() == EncoderState::Prepared;
            if was_prepared {
                let codec = self.shared.codec.lock().take();
                drop(codec);
                *self.shared.state.lock() = EncoderState::Unprepared;
                debug!("{} encoder released without running", kind);
            }
            return;
        };

        info!("Stopping {} encoder", kind);
        {
            let mut state = self.shared.state.lock();
            if *state == EncoderState::Running {
                *state = EncoderState::Stopping;
            }
        }
        worker.token.cancel();
        self.shared.queue.close();

        if worker.thread.thread().id() == std::thread::current().id() {
            debug!("{} encoder stop requested from its worker", kind);
            return;
        }

        match worker.done.recv_timeout(self.shared.stop_timeout) {
            Ok(()) => {
                let _ = worker.thread.join();
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!("{} encoder worker exited abnormally", kind);
                let _ = worker.thread.join();
                self.shared.force_teardown();
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{} encoder worker did not stop within {:?}, forcing teardown",
                    kind, self.shared.stop_timeout
                );
                self.shared.force_teardown();
            }
        }
    }

    /// Queue a raw frame, blocking while the queue is full
    ///
    /// Returns false if the session is not running.
    pub fn push_frame(&self, frame: MediaFrame) -> bool {
        if !self.is_running() {
            trace!("{} encoder not running, frame ignored", self.shared.kind);
            return false;
        }
        self.shared.queue.push(frame)
    }

    /// Make the next emitted sample a key frame
    ///
    /// Codecs without native support are reset instead.
    pub fn request_keyframe(&self) {
        if self.is_running() {
            debug!("{} encoder key frame requested", self.shared.kind);
            self.shared.keyframe_requested.store(true, Ordering::SeqCst);
        }
    }

    /// Change the target bitrate
    ///
    /// Codecs that cannot change bitrate live keep encoding at the old
    /// rate and an [`EncoderEvent::Warning`] is emitted; the new rate
    /// applies after the next reset.
    pub fn set_bitrate(&self, bps: u32) {
        let kind = self.shared.kind;
        if let Some(params) = self.shared.params.lock().as_mut() {
            params.set_bitrate(bps);
        }

        match self.state() {
            EncoderState::Running => {
                *self.shared.pending_bitrate.lock() = Some(bps);
            }
            EncoderState::Prepared => {
                let applied = self
                    .shared
                    .codec
                    .lock()
                    .as_mut()
                    .map(|codec| codec.set_bitrate(bps))
                    .unwrap_or(false);
                if !applied {
                    self.shared.bitrate_unsupported(bps);
                }
            }
            _ => debug!("{} encoder not prepared, bitrate {} stored", kind, bps),
        }
    }

    /// Skip frames to stay at or below `fps`; `None` removes the limit
    pub fn set_fps_limit(&self, fps: Option<u32>) {
        let kind = self.shared.kind;
        if kind != MediaKind::Video {
            warn!("Frame rate limit ignored for {} encoder", kind);
            return;
        }
        match fps {
            Some(fps) if fps > 0 => {
                info!("{} encoder limited to {} fps", kind, fps);
                *self.shared.fps_limit.lock() = Some(FpsLimiter::new(fps));
            }
            _ => {
                info!("{} encoder frame rate limit removed", kind);
                *self.shared.fps_limit.lock() = None;
            }
        }
    }

    /// Hold encoder input until the guard is dropped
    pub fn hold_input(&self) -> InputHold<'_> {
        InputHold {
            _guard: self.shared.codec.lock(),
        }
    }

    /// Join a worker that already exited on its own
    fn reap_worker(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|w| w.thread.is_finished()) {
            if let Some(w) = worker.take() {
                let _ = w.thread.join();
            }
        }
    }
}

impl Drop for EncoderSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn emit(&self, event: EncoderEvent) {
        let _ = self.events.send(event);
    }

    fn run(self: Arc<Self>, token: CancellationToken, run_id: u64, done: Sender<()>) {
        debug!("{} encoder worker running", self.kind);
        let anchor = *self.anchor.lock();
        let mut fatal = None;

        while !token.is_cancelled() {
            if let Err(e) = self.service_requests() {
                if let Err(e) = self.recover(e) {
                    fatal = Some(e);
                    break;
                }
                continue;
            }

            let Some(frame) = self.queue.pop_timeout(POLL_INTERVAL) else {
                continue;
            };
            if token.is_cancelled() {
                break;
            }

            let pts = anchor.relative(frame.timestamp_us);
            if !self.accept_frame(pts) {
                self.metrics.record_skipped();
                continue;
            }

            if let Err(e) = self.encode_frame(&frame, pts) {
                if let Err(e) = self.recover(e) {
                    fatal = Some(e);
                    break;
                }
            }
        }

        if self.run_id.load(Ordering::SeqCst) == run_id {
            self.teardown(fatal);
        } else {
            debug!("{} encoder worker superseded, skipping teardown", self.kind);
        }
        let _ = done.send(());
    }

    fn accept_frame(&self, pts: u64) -> bool {
        match self.fps_limit.lock().as_mut() {
            Some(limiter) => limiter.accept(pts),
            None => true,
        }
    }

    fn encode_frame(&self, frame: &MediaFrame, pts: u64) -> Result<()> {
        let started = Instant::now();
        let mut guard = self.codec.lock();
        let codec = guard
            .as_mut()
            .ok_or_else(|| LivecastError::codec("codec released while running"))?;

        codec.submit(frame.payload(), pts)?;
        self.metrics.record_input();
        codec.drain(&mut |output| self.deliver(output))?;
        self.metrics.record_encode(started.elapsed());
        Ok(())
    }

    /// Apply key frame and bitrate requests between frames
    fn service_requests(&self) -> Result<()> {
        if self.keyframe_requested.swap(false, Ordering::SeqCst) {
            let supported = self
                .codec
                .lock()
                .as_mut()
                .map(|codec| codec.request_keyframe())
                .unwrap_or(false);
            if !supported {
                debug!("{} codec has no key frame request, resetting", self.kind);
                self.reset_codec()?;
            }
        }

        let pending = self.pending_bitrate.lock().take();
        if let Some(bps) = pending {
            let applied = self
                .codec
                .lock()
                .as_mut()
                .map(|codec| codec.set_bitrate(bps))
                .unwrap_or(false);
            if applied {
                info!("{} encoder bitrate set to {} bps", self.kind, bps);
            } else {
                self.bitrate_unsupported(bps);
            }
        }
        Ok(())
    }

    fn bitrate_unsupported(&self, bps: u32) {
        let message = format!("codec cannot change bitrate live, {} bps not applied", bps);
        warn!("{} encoder: {}", self.kind, message);
        self.emit(EncoderEvent::Warning {
            kind: self.kind,
            message,
        });
    }

    fn deliver(&self, output: CodecOutput<'_>) {
        let sink = self.sink.read().clone();
        match output {
            CodecOutput::FormatChanged(format) => {
                info!(
                    "{} encoder output format: {} {:?}",
                    self.kind, format.codec, format.params
                );
                if let Some(sink) = &sink {
                    sink.on_format(&format);
                }
                *self.format.lock() = Some(format);
            }
            CodecOutput::Sample {
                data,
                pts_us,
                key_frame,
            } => {
                let pts_us = self.correct_pts(pts_us);
                self.metrics.record_output(data.len(), key_frame);
                trace!(
                    "{} sample: pts={} size={} key={}",
                    self.kind,
                    pts_us,
                    data.len(),
                    key_frame
                );
                let sample = EncodedSample {
                    kind: self.kind,
                    data,
                    pts_us,
                    flags: SampleFlags {
                        key_frame,
                        config: false,
                    },
                };
                if let Some(sink) = &sink {
                    sink.on_sample(&sample);
                }
            }
        }
    }

    /// Clamp forward so emitted timestamps never decrease
    fn correct_pts(&self, raw: u64) -> u64 {
        let previous = self.last_pts.fetch_max(raw, Ordering::SeqCst);
        previous.max(raw)
    }

    fn recover(&self, err: LivecastError) -> Result<()> {
        warn!("{} encoder error: {}", self.kind, err);

        let hook = self.error_hook.read().clone();
        if !hook(self.kind, &err) {
            info!("{} encoder recovery declined", self.kind);
            return Err(err);
        }

        let attempt = self.resets.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(max) = self.max_resets {
            if attempt > max {
                return Err(LivecastError::codec(format!(
                    "reset limit of {} reached, last error: {}",
                    max, err
                )));
            }
        }

        self.reset_codec()?;
        self.emit(EncoderEvent::Reset {
            kind: self.kind,
            attempt,
            reason: err.to_string(),
        });
        Ok(())
    }

    /// Recreate the codec with the prepared parameters, holding input
    fn reset_codec(&self) -> Result<()> {
        let params = self
            .params
            .lock()
            .clone()
            .ok_or_else(|| LivecastError::invalid_state("encoder has no parameters"))?;

        let mut codec = self.codec.lock();
        codec.take();
        let fresh = self.factory.create(&params)?;
        info!("{} encoder reset with {}", self.kind, fresh.name());
        *codec = Some(fresh);
        Ok(())
    }

    /// Worker-side shutdown: flush, release, clear
    fn teardown(&self, fatal: Option<LivecastError>) {
        *self.state.lock() = EncoderState::Stopping;
        self.queue.close();

        let codec = self.codec.lock().take();
        if let Some(mut codec) = codec {
            if fatal.is_none() {
                if let Err(e) = codec.flush(&mut |output| self.deliver(output)) {
                    debug!("{} encoder flush failed: {}", self.kind, e);
                }
            }
        }

        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!("{} encoder dropped {} queued frames", self.kind, dropped);
        }
        self.last_pts.store(0, Ordering::SeqCst);
        *self.state.lock() = EncoderState::Unprepared;

        if let Some(err) = fatal {
            error!("{} encoder stopped: {}", self.kind, err);
            self.emit(EncoderEvent::Fatal {
                kind: self.kind,
                error: err.to_string(),
            });
        }
        info!("{} encoder stopped", self.kind);
        self.emit(EncoderEvent::Stopped(self.kind));
    }

    /// Caller-side shutdown when the worker did not finish in time
    fn force_teardown(&self) {
        self.run_id.fetch_add(1, Ordering::SeqCst);
        self.queue.close();
        self.queue.clear();
        if let Some(mut codec) = self.codec.try_lock_for(self.stop_timeout) {
            codec.take();
        } else {
            warn!("{} codec still busy, released on next prepare", self.kind);
        }
        self.last_pts.store(0, Ordering::SeqCst);
        *self.state.lock() = EncoderState::Unprepared;
        self.emit(EncoderEvent::Stopped(self.kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fps_limiter_halves_rate() {
        let mut limiter = FpsLimiter::new(15);
        let accepted = (0..30u64)
            .filter(|i| limiter.accept(i * 33_333))
            .count();
        assert_eq!(accepted, 15);
    }

    #[test]
    fn test_fps_limiter_passes_slower_input() {
        let mut limiter = FpsLimiter::new(30);
        assert!((0..10u64).all(|i| limiter.accept(i * 50_000)));
    }
}
