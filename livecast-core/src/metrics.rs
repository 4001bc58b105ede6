//! Encoder and transport metrics
//!
//! Provides:
//! - Rolling averages for encode latency and output frame rate
//! - Frame counters (submitted, skipped, emitted)
//! - Windowed bitrate measurement

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Maximum number of samples to keep for rolling averages
const MAX_SAMPLES: usize = 120;

/// Encoder statistics snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncoderStats {
    /// Raw frames accepted by the encoder
    pub frames_in: u64,
    /// Raw frames skipped by the frame rate limiter
    pub frames_skipped: u64,
    /// Encoded samples emitted
    pub samples_out: u64,
    /// Key frames emitted
    pub key_frames: u64,
    /// Encoded bytes emitted
    pub bytes_out: u64,
    /// Codec resets performed in the current run
    pub resets: u32,
    /// Average submit-to-drain time in milliseconds
    pub encode_latency_ms: f64,
    /// Output frames per second
    pub fps: f64,
    /// Output bitrate in kbps
    pub bitrate_kbps: u64,
}

impl EncoderStats {
    /// Format stats as a single-line string for logging
    pub fn format_line(&self) -> String {
        format!(
            "in={} out={} skipped={} keys={} resets={} {:.1}fps {}kbps encode={:.1}ms",
            self.frames_in,
            self.samples_out,
            self.frames_skipped,
            self.key_frames,
            self.resets,
            self.fps,
            self.bitrate_kbps,
            self.encode_latency_ms
        )
    }
}

/// Rolling average calculator for timing data
#[derive(Debug)]
struct RollingAverage {
    samples: VecDeque<Duration>,
    max_samples: usize,
}

impl RollingAverage {
    fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    fn add(&mut self, duration: Duration) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    fn average_ms(&self) -> f64 {
        self.average().as_secs_f64() * 1000.0
    }

    fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Bitrate over a fixed measurement window
#[derive(Debug)]
pub struct BitrateMeter {
    window: Duration,
    bytes: AtomicU64,
    window_start: Mutex<Instant>,
    last_bps: AtomicU64,
}

impl BitrateMeter {
    /// Create a meter reporting once per `window`
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            bytes: AtomicU64::new(0),
            window_start: Mutex::new(Instant::now()),
            last_bps: AtomicU64::new(0),
        }
    }

    /// Count bytes
    pub fn add(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Close the window if it has elapsed, returning its bitrate in bits per second
    pub fn poll(&self) -> Option<u64> {
        let now = Instant::now();
        let mut start = self.window_start.lock();
        let elapsed = now.duration_since(*start);
        if elapsed < self.window {
            return None;
        }

        let bits = self.bytes.swap(0, Ordering::Relaxed) * 8;
        let bps = (bits as f64 / elapsed.as_secs_f64()) as u64;
        self.last_bps.store(bps, Ordering::Relaxed);
        *start = now;
        Some(bps)
    }

    /// Bitrate of the last closed window
    pub fn current_bps(&self) -> u64 {
        self.last_bps.load(Ordering::Relaxed)
    }

    /// Start a fresh window
    pub fn reset(&self) {
        self.bytes.store(0, Ordering::Relaxed);
        self.last_bps.store(0, Ordering::Relaxed);
        *self.window_start.lock() = Instant::now();
    }
}

/// Per-encoder metrics collector
///
/// Written by the encoder worker, read from any thread.
#[derive(Debug)]
pub struct EncoderMetrics {
    encode_latency: RwLock<RollingAverage>,
    output_intervals: RwLock<RollingAverage>,
    last_output: Mutex<Option<Instant>>,
    frames_in: AtomicU64,
    frames_skipped: AtomicU64,
    samples_out: AtomicU64,
    key_frames: AtomicU64,
    bytes_out: AtomicU64,
    bitrate: BitrateMeter,
}

impl Default for EncoderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EncoderMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            encode_latency: RwLock::new(RollingAverage::new(MAX_SAMPLES)),
            output_intervals: RwLock::new(RollingAverage::new(MAX_SAMPLES)),
            last_output: Mutex::new(None),
            frames_in: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            samples_out: AtomicU64::new(0),
            key_frames: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            bitrate: BitrateMeter::new(Duration::from_millis(500)),
        }
    }

    /// Record a frame submitted to the codec
    pub fn record_input(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame skipped by the rate limiter
    pub fn record_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the time one submit+drain took
    pub fn record_encode(&self, duration: Duration) {
        self.encode_latency.write().add(duration);
    }

    /// Record an emitted sample
    pub fn record_output(&self, bytes: usize, key_frame: bool) {
        let now = Instant::now();
        if let Some(last) = self.last_output.lock().replace(now) {
            self.output_intervals.write().add(now.duration_since(last));
        }
        self.samples_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        if key_frame {
            self.key_frames.fetch_add(1, Ordering::Relaxed);
        }
        self.bitrate.add(bytes);
    }

    /// Samples emitted so far
    pub fn samples_out(&self) -> u64 {
        self.samples_out.load(Ordering::Relaxed)
    }

    /// Snapshot the current statistics
    pub fn snapshot(&self, resets: u32) -> EncoderStats {
        let avg_interval = self.output_intervals.read().average();
        let fps = if avg_interval.as_secs_f64() > 0.0 {
            1.0 / avg_interval.as_secs_f64()
        } else {
            0.0
        };
        self.bitrate.poll();

        EncoderStats {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            samples_out: self.samples_out.load(Ordering::Relaxed),
            key_frames: self.key_frames.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            resets,
            encode_latency_ms: self.encode_latency.read().average_ms(),
            fps,
            bitrate_kbps: self.bitrate.current_bps() / 1000,
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.encode_latency.write().clear();
        self.output_intervals.write().clear();
        *self.last_output.lock() = None;
        self.frames_in.store(0, Ordering::Relaxed);
        self.frames_skipped.store(0, Ordering::Relaxed);
        self.samples_out.store(0, Ordering::Relaxed);
        self.key_frames.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        self.bitrate.reset();
    }
}
