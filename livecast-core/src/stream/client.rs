//! Protocol client
//!
//! Connection state machine shared by every protocol variant:
//!
//! ```text
//! Idle -> Connecting -> (Authenticating ->) Streaming
//! Connecting/Authenticating -> Failed
//! Failed -> retry() -> Retrying -> Connecting
//! Streaming -> send error -> Disconnected
//! any -> disconnect() -> Disconnecting -> Idle
//! ```
//!
//! Connecting and sending run on one named connection thread per
//! attempt. Samples are handed over through a bounded send cache; a
//! full cache drops the sample and counts it.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::endpoint::{is_retriable, safe_url, Endpoint, Protocol, MALFORMED_ENDPOINT};
use super::transport::{Credentials, Handshake, MediaInfo, Transport, TransportFactory};
use crate::config::{SessionConfig, TransportMode};
use crate::metrics::BitrateMeter;
use crate::types::{EncodedSample, FormatDescription, MediaKind, OwnedSample};

/// How long the sender waits for a sample before re-checking cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Failure reason when no video format arrives before the handshake
pub const NO_VIDEO_INFO: &str = "video parameter sets not received";

/// Failure reason prefix once the retry budget is spent
pub const RETRIES_EXHAUSTED: &str = "retry attempts exhausted";

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not connected
    Idle,
    /// Opening the transport and handshaking
    Connecting,
    /// Sending credentials
    Authenticating,
    /// Sending samples
    Streaming,
    /// Waiting to reconnect
    Retrying,
    /// Closing on request
    Disconnecting,
    /// Connection lost while streaming
    Disconnected,
    /// Connection attempt failed
    Failed,
}

/// Events emitted by a protocol client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection attempt started (masked URL)
    Started(String),
    /// Handshake succeeded without credentials
    Success,
    /// Connection attempt failed
    Failed(String),
    /// Credentials missing or rejected
    AuthError,
    /// Credentials accepted; streaming begins
    AuthSuccess,
    /// Connection closed, with the reason when it was lost
    Disconnected(Option<String>),
    /// Measured outgoing bitrate in bits per second
    NewBitrate(u64),
}

/// Which tracks are sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamMode {
    /// Video and audio
    #[default]
    AudioVideo,
    /// Audio only
    AudioOnly,
    /// Video only
    VideoOnly,
}

impl StreamMode {
    /// Whether samples of `kind` are sent
    pub fn sends(&self, kind: MediaKind) -> bool {
        match (self, kind) {
            (Self::AudioOnly, MediaKind::Video) | (Self::VideoOnly, MediaKind::Audio) => false,
            _ => true,
        }
    }
}

/// Send counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Video samples sent
    pub sent_video: u64,
    /// Audio samples sent
    pub sent_audio: u64,
    /// Video samples dropped on a full cache
    pub dropped_video: u64,
    /// Audio samples dropped on a full cache
    pub dropped_audio: u64,
    /// Payload bytes sent
    pub bytes_sent: u64,
    /// Samples waiting in the cache
    pub cache_len: usize,
    /// Cache capacity
    pub cache_capacity: usize,
}

#[derive(Default)]
struct Counters {
    sent_video: AtomicU64,
    sent_audio: AtomicU64,
    dropped_video: AtomicU64,
    dropped_audio: AtomicU64,
    bytes_sent: AtomicU64,
}

impl Counters {
    fn sent(&self, kind: MediaKind) -> &AtomicU64 {
        match kind {
            MediaKind::Video => &self.sent_video,
            MediaKind::Audio => &self.sent_audio,
        }
    }

    fn dropped(&self, kind: MediaKind) -> &AtomicU64 {
        match kind {
            MediaKind::Video => &self.dropped_video,
            MediaKind::Audio => &self.dropped_audio,
        }
    }
}

struct SendCache {
    tx: Sender<OwnedSample>,
    rx: Receiver<OwnedSample>,
    capacity: usize,
}

impl SendCache {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = channel::bounded(capacity);
        Self { tx, rx, capacity }
    }

    fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }
}

/// Callback asking the video encoder for a key frame
pub type KeyframeRequest = Arc<dyn Fn() + Send + Sync>;

struct Connection {
    token: CancellationToken,
    done: Receiver<()>,
    thread: JoinHandle<()>,
}

struct Inner {
    protocol: Protocol,
    factory: Arc<dyn TransportFactory>,
    events: UnboundedSender<ConnectionEvent>,
    media_info_timeout: Duration,
    stop_timeout: Duration,
    bitrate_interval: Duration,
    /// Holding this lock serializes transitions with the run id check
    state: Mutex<ClientState>,
    run_id: AtomicU64,
    url: Mutex<Option<String>>,
    credentials: Mutex<Option<Credentials>>,
    mode: Mutex<TransportMode>,
    stream_mode: Mutex<StreamMode>,
    media: Mutex<MediaInfo>,
    media_ready: Condvar,
    cache: RwLock<SendCache>,
    counters: Counters,
    max_retries: Mutex<Option<u32>>,
    retries_left: AtomicU32,
    /// Exhaustion already reported since the last budget reset
    exhausted: AtomicBool,
    awaiting_keyframe: AtomicBool,
    keyframe_request: RwLock<Option<KeyframeRequest>>,
    bitrate: BitrateMeter,
}

/// Client for one streaming protocol
///
/// All methods take `&self`; share the client with `Arc`.
pub struct ProtocolClient {
    inner: Arc<Inner>,
    connection: Mutex<Option<Connection>>,
}

impl ProtocolClient {
    /// Create an idle client for `protocol`
    pub fn new(
        protocol: Protocol,
        factory: Arc<dyn TransportFactory>,
        config: &SessionConfig,
        events: UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                protocol,
                factory,
                events,
                media_info_timeout: config.media_info_timeout,
                stop_timeout: config.stop_timeout,
                bitrate_interval: config.bitrate_interval,
                state: Mutex::new(ClientState::Idle),
                run_id: AtomicU64::new(0),
                url: Mutex::new(None),
                credentials: Mutex::new(None),
                mode: Mutex::new(config.transport_mode),
                stream_mode: Mutex::new(StreamMode::default()),
                media: Mutex::new(MediaInfo::default()),
                media_ready: Condvar::new(),
                cache: RwLock::new(SendCache::new(config.send_cache_size)),
                counters: Counters::default(),
                max_retries: Mutex::new(config.retries),
                retries_left: AtomicU32::new(config.retries.unwrap_or(0)),
                exhausted: AtomicBool::new(false),
                awaiting_keyframe: AtomicBool::new(false),
                keyframe_request: RwLock::new(None),
                bitrate: BitrateMeter::new(config.bitrate_interval),
            }),
            connection: Mutex::new(None),
        }
    }

    /// Protocol variant of this client
    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    /// Current connection state
    pub fn state(&self) -> ClientState {
        *self.inner.state.lock()
    }

    /// Whether samples are being sent
    pub fn is_streaming(&self) -> bool {
        self.state() == ClientState::Streaming
    }

    /// Credentials used if the server demands them; they take precedence over URL userinfo
    pub fn set_authorization(&self, user: impl Into<String>, password: impl Into<String>) {
        *self.inner.credentials.lock() = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
    }

    /// Forget stored credentials
    pub fn clear_authorization(&self) {
        *self.inner.credentials.lock() = None;
    }

    /// Reliable or best-effort transport; applies from the next attempt
    pub fn set_transport_mode(&self, mode: TransportMode) {
        *self.inner.mode.lock() = mode;
    }

    /// Send audio only; call before connecting
    pub fn set_only_audio(&self, only_audio: bool) {
        *self.inner.stream_mode.lock() = if only_audio {
            StreamMode::AudioOnly
        } else {
            StreamMode::AudioVideo
        };
    }

    /// Send video only; call before connecting
    pub fn set_only_video(&self, only_video: bool) {
        *self.inner.stream_mode.lock() = if only_video {
            StreamMode::VideoOnly
        } else {
            StreamMode::AudioVideo
        };
    }

    /// Tracks being sent
    pub fn stream_mode(&self) -> StreamMode {
        *self.inner.stream_mode.lock()
    }

    /// Set the reconnect budget (`None` = unlimited)
    pub fn set_retries(&self, retries: Option<u32>) {
        *self.inner.max_retries.lock() = retries;
        self.inner.reset_retries();
    }

    /// Reconnect attempts left, or `None` when unlimited
    pub fn retries_left(&self) -> Option<u32> {
        self.inner
            .max_retries
            .lock()
            .map(|_| self.inner.retries_left.load(Ordering::SeqCst))
    }

    /// Called when streaming starts so the first video sample is a key frame
    pub fn set_keyframe_request(&self, request: KeyframeRequest) {
        *self.inner.keyframe_request.write() = Some(request);
    }

    /// Record a track format; video parameter sets unblock a pending handshake
    pub fn set_format(&self, format: &FormatDescription) {
        let mut media = self.inner.media.lock();
        match format.kind() {
            MediaKind::Video => {
                debug!("Video info set: {} {:?}", format.codec, format.params);
                media.video = Some(format.clone());
                self.inner.media_ready.notify_all();
            }
            MediaKind::Audio => {
                debug!("Audio info set: {} {:?}", format.codec, format.params);
                media.audio = Some(format.clone());
            }
        }
    }

    /// Start connecting to `url`
    ///
    /// Emits [`ConnectionEvent::Started`] and later exactly one of
    /// `Success`, `Failed`, `AuthError` or `AuthSuccess`. Ignored while a
    /// connection is active.
    pub fn connect(&self, url: &str) {
        {
            let state = self.inner.state.lock();
            if !matches!(
                *state,
                ClientState::Idle | ClientState::Failed | ClientState::Disconnected
            ) {
                warn!("connect ignored, client is {:?}", *state);
                return;
            }
        }
        self.shutdown_connection();
        self.inner.reset_retries();
        *self.inner.url.lock() = Some(url.to_string());
        self.spawn(url.to_string(), Duration::ZERO);
    }

    /// Reconnect after a failure
    ///
    /// Returns false without reconnecting when `reason` is not retriable,
    /// no connection was requested, or the attempt budget is exhausted. On
    /// exhaustion the client moves to `Failed` and emits one
    /// `ConnectionEvent::Failed`. Uses `backup_url` instead of the last
    /// URL when given.
    pub fn retry(&self, delay: Duration, reason: &str, backup_url: Option<&str>) -> bool {
        if !is_retriable(reason) {
            debug!("retry refused, reason not retriable: {}", reason);
            return false;
        }

        let Some(last_url) = self.inner.url.lock().clone() else {
            debug!("retry refused, no connection requested");
            return false;
        };

        if self.inner.max_retries.lock().is_some() {
            let took = self
                .inner
                .retries_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if !took {
                info!("retry attempts exhausted");
                *self.inner.state.lock() = ClientState::Failed;
                if !self.inner.exhausted.swap(true, Ordering::SeqCst) {
                    self.inner.emit(ConnectionEvent::Failed(format!(
                        "{}: {}",
                        RETRIES_EXHAUSTED, reason
                    )));
                }
                return false;
            }
        }

        let url = backup_url.map(str::to_string).unwrap_or(last_url);
        info!(
            "Retrying {} connection to {} in {:?}",
            self.inner.protocol,
            safe_url(&url),
            delay
        );
        {
            let mut state = self.inner.state.lock();
            *state = ClientState::Retrying;
            self.inner.run_id.fetch_add(1, Ordering::SeqCst);
        }
        self.shutdown_connection();
        self.inner.clear_cache();
        *self.inner.url.lock() = Some(url.clone());
        self.spawn(url, delay);
        true
    }

    /// Close the connection and return to `Idle`
    ///
    /// Resets the retry budget and clears track formats. Emits
    /// [`ConnectionEvent::Disconnected`] if a connection was requested.
    pub fn disconnect(&self) {
        let requested = self.inner.url.lock().take().is_some();
        {
            let mut state = self.inner.state.lock();
            if *state == ClientState::Idle && !requested {
                return;
            }
            *state = ClientState::Disconnecting;
            self.inner.run_id.fetch_add(1, Ordering::SeqCst);
        }

        info!("Disconnecting {} client", self.inner.protocol);
        self.shutdown_connection();

        let dropped = self.inner.clear_cache();
        if dropped > 0 {
            debug!("Discarded {} cached samples", dropped);
        }
        *self.inner.media.lock() = MediaInfo::default();
        self.inner.reset_retries();
        self.inner.awaiting_keyframe.store(false, Ordering::SeqCst);
        self.inner.bitrate.reset();

        let mut state = self.inner.state.lock();
        *state = ClientState::Idle;
        self.inner.emit(ConnectionEvent::Disconnected(None));
    }

    /// Queue a sample for sending; dropped unless `Streaming`
    pub fn send(&self, sample: &EncodedSample<'_>) {
        if !self.is_streaming() {
            return;
        }
        if !self.stream_mode().sends(sample.kind) {
            return;
        }

        let inner = &self.inner;
        if sample.kind == MediaKind::Video && inner.awaiting_keyframe.load(Ordering::SeqCst) {
            if !sample.is_key_frame() {
                trace!("Video sample dropped while waiting for a key frame");
                return;
            }
            inner.awaiting_keyframe.store(false, Ordering::SeqCst);
            debug!("First key frame queued");
        }

        let tx = inner.cache.read().tx.clone();
        match tx.try_send(sample.to_owned()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                inner.counters.dropped(sample.kind).fetch_add(1, Ordering::Relaxed);
                trace!("Send cache full, {} sample dropped", sample.kind);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Whether the send cache is more than `percent_used` full
    pub fn has_congestion(&self, percent_used: f32) -> bool {
        let cache = self.inner.cache.read();
        let used = cache.rx.len() as f32 / cache.capacity as f32 * 100.0;
        used >= percent_used.clamp(0.0, 100.0)
    }

    /// Replace the send cache with one holding `size` samples
    ///
    /// Samples waiting in the old cache are discarded.
    pub fn resize_cache(&self, size: usize) {
        let old = std::mem::replace(&mut *self.inner.cache.write(), SendCache::new(size));
        let discarded = old.clear();
        info!(
            "Send cache resized to {} ({} samples discarded)",
            size.max(1),
            discarded
        );
    }

    /// Send counters and cache fill
    pub fn stats(&self) -> ClientStats {
        let c = &self.inner.counters;
        let cache = self.inner.cache.read();
        ClientStats {
            sent_video: c.sent_video.load(Ordering::Relaxed),
            sent_audio: c.sent_audio.load(Ordering::Relaxed),
            dropped_video: c.dropped_video.load(Ordering::Relaxed),
            dropped_audio: c.dropped_audio.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            cache_len: cache.rx.len(),
            cache_capacity: cache.capacity,
        }
    }

    /// Zero the sent counters
    pub fn reset_sent(&self) {
        let c = &self.inner.counters;
        c.sent_video.store(0, Ordering::Relaxed);
        c.sent_audio.store(0, Ordering::Relaxed);
        c.bytes_sent.store(0, Ordering::Relaxed);
    }

    /// Zero the dropped counters
    pub fn reset_dropped(&self) {
        let c = &self.inner.counters;
        c.dropped_video.store(0, Ordering::Relaxed);
        c.dropped_audio.store(0, Ordering::Relaxed);
    }

    /// Most recent bitrate measurement in bits per second
    pub fn bitrate(&self) -> u64 {
        self.inner.bitrate.current_bps()
    }

    fn spawn(&self, url: String, delay: Duration) {
        let inner = &self.inner;
        let run_id = {
            let mut state = inner.state.lock();
            if *state != ClientState::Retrying {
                *state = ClientState::Connecting;
            }
            inner.run_id.fetch_add(1, Ordering::SeqCst) + 1
        };

        info!("Starting {} connection to {}", inner.protocol, safe_url(&url));
        inner.emit(ConnectionEvent::Started(safe_url(&url)));

        let token = CancellationToken::new();
        let (done_tx, done_rx) = channel::bounded(1);
        let worker = inner.clone();
        let worker_token = token.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("livecast-{}-client", inner.protocol.to_string().to_lowercase()))
            .spawn(move || {
                worker.run(&url, delay, &worker_token, run_id);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(thread) => {
                *self.connection.lock() = Some(Connection {
                    token,
                    done: done_rx,
                    thread,
                });
            }
            Err(e) => {
                error!("Failed to spawn connection thread: {}", e);
                inner.finish(
                    run_id,
                    ClientState::Failed,
                    ConnectionEvent::Failed(format!("connection thread: {}", e)),
                );
            }
        }
    }

    /// Cancel the connection thread, waiting a bounded time
    fn shutdown_connection(&self) {
        let Some(connection) = self.connection.lock().take() else {
            return;
        };
        connection.token.cancel();

        if connection.thread.thread().id() == std::thread::current().id() {
            return;
        }
        match connection.done.recv_timeout(self.inner.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = connection.thread.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{} connection thread did not stop within {:?}, detaching",
                    self.inner.protocol, self.inner.stop_timeout
                );
            }
        }
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.inner.run_id.fetch_add(1, Ordering::SeqCst);
        self.shutdown_connection();
    }
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn reset_retries(&self) {
        let max = self.max_retries.lock().unwrap_or(0);
        self.retries_left.store(max, Ordering::SeqCst);
        self.exhausted.store(false, Ordering::SeqCst);
    }

    fn clear_cache(&self) -> usize {
        self.cache.read().clear()
    }

    fn is_current(&self, run_id: u64) -> bool {
        self.run_id.load(Ordering::SeqCst) == run_id
    }

    /// Move to `state` if this attempt is still current; true if moved
    fn transition(&self, run_id: u64, state: ClientState) -> bool {
        let mut current = self.state.lock();
        if !self.is_current(run_id) {
            return false;
        }
        *current = state;
        true
    }

    /// Move to `state` and emit `event` if this attempt is still current
    fn finish(&self, run_id: u64, state: ClientState, event: ConnectionEvent) -> bool {
        let mut current = self.state.lock();
        if !self.is_current(run_id) {
            return false;
        }
        *current = state;
        self.emit(event);
        true
    }

    fn fail(&self, run_id: u64, reason: String) {
        if self.finish(run_id, ClientState::Failed, ConnectionEvent::Failed(reason.clone())) {
            error!("{} connection failed: {}", self.protocol, reason);
        }
    }

    /// Connection thread body
    fn run(&self, url: &str, delay: Duration, token: &CancellationToken, run_id: u64) {
        if !delay.is_zero() && sleep_cancellable(delay, token) {
            return;
        }
        if !self.transition(run_id, ClientState::Connecting) {
            return;
        }

        let endpoint = match Endpoint::parse(url) {
            Ok(endpoint) if endpoint.protocol == self.protocol => endpoint,
            Ok(_) => {
                self.fail(
                    run_id,
                    format!("{}, should be: {}", MALFORMED_ENDPOINT, self.protocol.url_hint()),
                );
                return;
            }
            Err(e) => {
                self.fail(run_id, e.to_string());
                return;
            }
        };

        let stream_mode = *self.stream_mode.lock();
        let Some(media) = self.wait_media(stream_mode, token) else {
            if !token.is_cancelled() {
                self.fail(run_id, NO_VIDEO_INFO.to_string());
            }
            return;
        };

        let mut transport = match self.factory.create(self.protocol) {
            Ok(transport) => transport,
            Err(e) => {
                self.fail(run_id, e.to_string());
                return;
            }
        };

        let mode = *self.mode.lock();
        let connected = self.negotiate(transport.as_mut(), &endpoint, &media, mode, run_id);
        if connected && !token.is_cancelled() {
            self.stream(transport.as_mut(), token, run_id);
        }
        transport.close();
        debug!("{} connection thread finished", self.protocol);
    }

    /// Handshake and authenticate; true when streaming may start
    fn negotiate(
        &self,
        transport: &mut dyn Transport,
        endpoint: &Endpoint,
        media: &MediaInfo,
        mode: TransportMode,
        run_id: u64,
    ) -> bool {
        let handshake = match transport.handshake(endpoint, media, mode) {
            Ok(handshake) => handshake,
            Err(e) => {
                self.fail(run_id, e.to_string());
                return false;
            }
        };

        let terminal = match handshake {
            Handshake::Ready => ConnectionEvent::Success,
            Handshake::AuthRequired => {
                if !self.transition(run_id, ClientState::Authenticating) {
                    return false;
                }
                let credentials = self.credentials.lock().clone();
                let Some(credentials) = credentials.or_else(|| endpoint.credentials.clone()) else {
                    warn!("{} server requires credentials, none set", self.protocol);
                    self.finish(run_id, ClientState::Failed, ConnectionEvent::AuthError);
                    return false;
                };
                match transport.authenticate(&credentials) {
                    Ok(true) => ConnectionEvent::AuthSuccess,
                    Ok(false) => {
                        warn!("{} server rejected credentials", self.protocol);
                        self.finish(run_id, ClientState::Failed, ConnectionEvent::AuthError);
                        return false;
                    }
                    Err(e) => {
                        self.fail(run_id, e.to_string());
                        return false;
                    }
                }
            }
        };

        self.reset_retries();
        self.awaiting_keyframe
            .store(media.video.is_some(), Ordering::SeqCst);
        self.bitrate.reset();
        if !self.finish(run_id, ClientState::Streaming, terminal) {
            return false;
        }
        info!(
            "{} streaming to {}:{}{}",
            self.protocol,
            endpoint.host,
            endpoint.port,
            if endpoint.tls { " (tls)" } else { "" }
        );

        if media.video.is_some() {
            let request = self.keyframe_request.read().clone();
            if let Some(request) = request {
                request();
            }
        }
        true
    }

    /// Wait for the formats the handshake needs
    fn wait_media(&self, mode: StreamMode, token: &CancellationToken) -> Option<MediaInfo> {
        let deadline = Instant::now() + self.media_info_timeout;
        let mut media = self.media.lock();

        if mode.sends(MediaKind::Video) {
            if media.video.is_none() {
                info!("Waiting for video parameter sets");
            }
            while media.video.is_none() {
                if token.is_cancelled() || Instant::now() >= deadline {
                    return None;
                }
                let slice = deadline
                    .saturating_duration_since(Instant::now())
                    .min(Duration::from_millis(50));
                self.media_ready.wait_for(&mut media, slice);
            }
        }

        Some(MediaInfo {
            video: media.video.clone().filter(|_| mode.sends(MediaKind::Video)),
            audio: media.audio.clone().filter(|_| mode.sends(MediaKind::Audio)),
        })
    }

    /// Drain the send cache into the transport until cancelled or failed
    fn stream(&self, transport: &mut dyn Transport, token: &CancellationToken, run_id: u64) {
        let mut next_report = Instant::now() + self.bitrate_interval;

        while !token.is_cancelled() {
            if Instant::now() >= next_report {
                next_report += self.bitrate_interval;
                if let Some(bps) = self.bitrate.poll() {
                    if self.is_current(run_id) {
                        self.emit(ConnectionEvent::NewBitrate(bps));
                    }
                }
            }

            let rx = self.cache.read().rx.clone();
            let sample = match rx.recv_timeout(POLL_INTERVAL) {
                Ok(sample) => sample,
                Err(_) => continue,
            };

            match transport.send(&sample) {
                Ok(()) => {
                    self.counters.sent(sample.kind).fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .bytes_sent
                        .fetch_add(sample.data.len() as u64, Ordering::Relaxed);
                    self.bitrate.add(sample.data.len());
                }
                Err(e) => {
                    let reason = e.to_string();
                    if self.finish(
                        run_id,
                        ClientState::Disconnected,
                        ConnectionEvent::Disconnected(Some(reason.clone())),
                    ) {
                        error!("{} connection lost: {}", self.protocol, reason);
                        self.clear_cache();
                    }
                    return;
                }
            }
        }
    }
}

/// Sleep for `delay`; true if cancelled first
fn sleep_cancellable(delay: Duration, token: &CancellationToken) -> bool {
    let deadline = Instant::now() + delay;
    while Instant::now() < deadline {
        if token.is_cancelled() {
            return true;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(left.min(POLL_INTERVAL));
    }
    token.is_cancelled()
}
