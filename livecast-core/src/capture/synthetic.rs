//! Synthetic capture sources
//!
//! A moving gradient for video and a sine tone for audio, each driven
//! by a named thread at the capture rate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{AudioCaptureSettings, AudioSource, FrameSink, VideoCaptureSettings, VideoSource};
use crate::error::{LivecastError, Result};
use crate::types::{monotonic_us, MediaFrame};

/// Samples per audio frame delivered by [`ToneSource`]
const TONE_CHUNK: usize = 1024;

/// Fill a YUV 4:2:0 buffer with a diagonal gradient shifted by `phase`
pub fn gradient_frame(width: u32, height: u32, phase: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let mut data = Vec::with_capacity(w * h + 2 * cw * ch);

    for y in 0..h {
        for x in 0..w {
            data.push(((x + y + phase as usize) * 255 / (w + h).max(1)) as u8);
        }
    }
    for y in 0..ch {
        for _ in 0..cw {
            data.push((y * 255 / ch.max(1)) as u8);
        }
    }
    for _ in 0..ch {
        for x in 0..cw {
            data.push((x * 255 / cw.max(1)) as u8);
        }
    }
    data
}

/// Stop a generator thread
fn stop_thread(token: &mut Option<CancellationToken>, thread: &mut Option<JoinHandle<()>>) {
    if let Some(token) = token.take() {
        token.cancel();
    }
    if let Some(thread) = thread.take() {
        let _ = thread.join();
    }
}

/// Video source producing a moving gradient
pub struct TestPatternSource {
    devices: u32,
    device: u32,
    settings: Option<VideoCaptureSettings>,
    sink: Option<Arc<dyn FrameSink>>,
    token: Option<CancellationToken>,
    thread: Option<JoinHandle<()>>,
}

impl TestPatternSource {
    /// Create a source with one device
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    /// Create a source exposing `devices` switchable devices
    pub fn with_devices(devices: u32) -> Self {
        Self {
            devices: devices.max(1),
            device: 0,
            settings: None,
            sink: None,
            token: None,
            thread: None,
        }
    }

    /// Index of the active device
    pub fn device(&self) -> u32 {
        self.device
    }

    fn spawn(&mut self) -> Result<()> {
        let (Some(settings), Some(sink)) = (self.settings, self.sink.clone()) else {
            return Ok(());
        };
        let token = CancellationToken::new();
        let cancel = token.clone();
        let device = self.device;

        let thread = std::thread::Builder::new()
            .name("livecast-test-pattern".to_string())
            .spawn(move || {
                let interval = Duration::from_micros(1_000_000 / settings.fps.max(1) as u64);
                let mut next = Instant::now();
                let mut phase = device * 64;
                while !cancel.is_cancelled() {
                    let data = gradient_frame(settings.width, settings.height, phase);
                    sink.on_frame(MediaFrame::new(data, monotonic_us()));
                    phase = phase.wrapping_add(2);
                    next += interval;
                    if let Some(wait) = next.checked_duration_since(Instant::now()) {
                        std::thread::sleep(wait);
                    }
                }
            })
            .map_err(|e| LivecastError::device_open(format!("Failed to spawn pattern thread: {}", e)))?;

        self.token = Some(token);
        self.thread = Some(thread);
        Ok(())
    }
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoSource for TestPatternSource {
    fn start(&mut self, settings: &VideoCaptureSettings, sink: Arc<dyn FrameSink>) -> Result<()> {
        if settings.width == 0 || settings.height == 0 || settings.fps == 0 {
            return Err(LivecastError::device_open(format!(
                "Test pattern cannot produce {}x{} @ {}fps",
                settings.width, settings.height, settings.fps
            )));
        }
        self.stop();
        self.settings = Some(*settings);
        self.sink = Some(sink);
        info!(
            "Test pattern started: {}x{} @ {}fps",
            settings.width, settings.height, settings.fps
        );
        self.spawn()
    }

    fn stop(&mut self) {
        if self.thread.is_some() {
            stop_thread(&mut self.token, &mut self.thread);
            debug!("Test pattern stopped");
        }
    }

    fn switch_device(&mut self) -> Result<()> {
        self.device = (self.device + 1) % self.devices;
        info!("Test pattern switched to device {}", self.device);
        if self.thread.is_some() {
            stop_thread(&mut self.token, &mut self.thread);
            self.spawn()?;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for TestPatternSource {
    fn drop(&mut self) {
        stop_thread(&mut self.token, &mut self.thread);
    }
}

/// Audio source producing a sine tone
pub struct ToneSource {
    frequency: f32,
    muted: Arc<AtomicBool>,
    token: Option<CancellationToken>,
    thread: Option<JoinHandle<()>>,
}

impl ToneSource {
    /// Create a source producing `frequency` Hz
    pub fn new(frequency: f32) -> Self {
        Self {
            frequency,
            muted: Arc::new(AtomicBool::new(false)),
            token: None,
            thread: None,
        }
    }
}

impl Default for ToneSource {
    fn default() -> Self {
        Self::new(440.0)
    }
}

impl AudioSource for ToneSource {
    fn start(&mut self, settings: &AudioCaptureSettings, sink: Arc<dyn FrameSink>) -> Result<()> {
        if settings.sample_rate == 0 || settings.channels == 0 {
            return Err(LivecastError::device_open("Tone source needs a sample rate and channels"));
        }
        self.stop();

        let token = CancellationToken::new();
        let cancel = token.clone();
        let muted = self.muted.clone();
        let frequency = self.frequency;
        let settings = *settings;

        let thread = std::thread::Builder::new()
            .name("livecast-tone".to_string())
            .spawn(move || {
                let rate = settings.sample_rate as f32;
                let interval =
                    Duration::from_micros(TONE_CHUNK as u64 * 1_000_000 / settings.sample_rate as u64);
                let mut next = Instant::now();
                let mut t = 0u64;
                while !cancel.is_cancelled() {
                    let silent = muted.load(Ordering::Relaxed);
                    let mut data = Vec::with_capacity(TONE_CHUNK * settings.channels as usize * 2);
                    for i in 0..TONE_CHUNK as u64 {
                        let value = if silent {
                            0
                        } else {
                            let phase = (t + i) as f32 * frequency / rate;
                            ((phase * std::f32::consts::TAU).sin() * 8000.0) as i16
                        };
                        for _ in 0..settings.channels {
                            data.extend_from_slice(&value.to_le_bytes());
                        }
                    }
                    t += TONE_CHUNK as u64;
                    sink.on_frame(MediaFrame::new(data, monotonic_us()));
                    next += interval;
                    if let Some(wait) = next.checked_duration_since(Instant::now()) {
                        std::thread::sleep(wait);
                    }
                }
            })
            .map_err(|e| LivecastError::device_open(format!("Failed to spawn tone thread: {}", e)))?;

        info!(
            "Tone source started: {}Hz, {}ch @ {}Hz",
            frequency, settings.channels, settings.sample_rate
        );
        self.token = Some(token);
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        if self.thread.is_some() {
            stop_thread(&mut self.token, &mut self.thread);
            debug!("Tone source stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }
}

impl Drop for ToneSource {
    fn drop(&mut self) {
        stop_thread(&mut self.token, &mut self.thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Count(Mutex<Vec<usize>>);

    impl FrameSink for Count {
        fn on_frame(&self, frame: MediaFrame) {
            self.0.lock().push(frame.payload().len());
        }
    }

    #[test]
    fn test_gradient_frame_size() {
        assert_eq!(gradient_frame(640, 480, 0).len(), 640 * 480 * 3 / 2);
        assert_eq!(gradient_frame(3, 3, 0).len(), 9 + 2 * 4);
    }

    #[test]
    fn test_pattern_delivers_frames() {
        let sink = Arc::new(Count::default());
        let mut source = TestPatternSource::new();
        let settings = VideoCaptureSettings {
            width: 64,
            height: 48,
            fps: 100,
            rotation: 0,
        };
        source.start(&settings, sink.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        source.stop();

        let sizes = sink.0.lock();
        assert!(!sizes.is_empty());
        assert!(sizes.iter().all(|len| *len == 64 * 48 * 3 / 2));
        assert!(!source.is_running());
    }

    #[test]
    fn test_pattern_rejects_zero_size() {
        let mut source = TestPatternSource::new();
        let settings = VideoCaptureSettings {
            width: 0,
            height: 48,
            fps: 30,
            rotation: 0,
        };
        let err = source
            .start(&settings, Arc::new(Count::default()))
            .unwrap_err();
        assert!(matches!(err, LivecastError::DeviceOpen(_)));
    }

    #[test]
    fn test_switch_device_cycles() {
        let mut source = TestPatternSource::with_devices(2);
        source.switch_device().unwrap();
        assert_eq!(source.device(), 1);
        source.switch_device().unwrap();
        assert_eq!(source.device(), 0);
    }

    #[test]
    fn test_tone_mute_flag() {
        let mut tone = ToneSource::default();
        assert!(!tone.is_muted());
        tone.set_muted(true);
        assert!(tone.is_muted());
    }
}
