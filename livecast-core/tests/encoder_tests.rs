//! Integration tests for encoder sessions
//!
//! FFmpeg-backed tests that depend on installed encoders are marked with #[ignore].

mod mocks;

use livecast_core::config::{AudioConfig, SessionConfig, VideoConfig};
use livecast_core::encode::{
    CodecParams, EncoderEvent, EncoderSession, EncoderState, SampleSink,
};
use livecast_core::error::LivecastError;
use livecast_core::types::{
    EncodedSample, FormatDescription, MediaFrame, MediaKind, OwnedSample, SessionAnchor,
};
use mocks::{create_test_frame, wait_for, MockCodecFactory};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Collect {
    formats: Mutex<Vec<FormatDescription>>,
    samples: Mutex<Vec<OwnedSample>>,
}

impl SampleSink for Collect {
    fn on_format(&self, format: &FormatDescription) {
        self.formats.lock().push(format.clone());
    }

    fn on_sample(&self, sample: &EncodedSample<'_>) {
        self.samples.lock().push(sample.to_owned());
    }
}

fn small_video() -> VideoConfig {
    VideoConfig::default().with_resolution(64, 48)
}

fn video_session(
    factory: &MockCodecFactory,
    config: &SessionConfig,
) -> (EncoderSession, UnboundedReceiver<EncoderEvent>, Arc<Collect>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = EncoderSession::new(MediaKind::Video, Arc::new(factory.clone()), config, tx);
    let sink = Arc::new(Collect::default());
    session.set_sink(sink.clone());
    (session, rx, sink)
}

fn drain_events(rx: &mut UnboundedReceiver<EncoderEvent>) -> Vec<EncoderEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Frame stamped `index` frame intervals after zero
fn frame_at(index: u64, interval_us: u64) -> MediaFrame {
    let mut frame = create_test_frame(64, 48, index as u8);
    frame.timestamp_us = index * interval_us;
    frame
}

#[test]
fn test_prepare_rejects_invalid_config() {
    let factory = MockCodecFactory::new();
    let (session, _rx, _sink) = video_session(&factory, &SessionConfig::default());

    let result = session.prepare(CodecParams::Video(small_video().with_resolution(63, 48)));
    assert!(matches!(result, Err(LivecastError::Prepare(_))));
    assert_eq!(session.state(), EncoderState::Unprepared);
    assert_eq!(factory.control.created.load(Ordering::SeqCst), 0);
}

#[test]
fn test_prepare_rejects_wrong_kind() {
    let factory = MockCodecFactory::new();
    let (session, _rx, _sink) = video_session(&factory, &SessionConfig::default());

    let result = session.prepare(CodecParams::Audio(AudioConfig::default()));
    assert!(matches!(result, Err(LivecastError::Prepare(_))));
}

#[test]
fn test_prepare_fails_without_codec() {
    let factory = MockCodecFactory::new();
    factory.control.fail_create.store(true, Ordering::SeqCst);
    let (session, _rx, _sink) = video_session(&factory, &SessionConfig::default());

    assert!(session.prepare(CodecParams::Video(small_video())).is_err());
    assert_eq!(session.state(), EncoderState::Unprepared);
}

#[test]
fn test_start_requires_prepare() {
    let factory = MockCodecFactory::new();
    let (session, _rx, _sink) = video_session(&factory, &SessionConfig::default());

    let result = session.start(SessionAnchor::now());
    assert!(matches!(result, Err(LivecastError::InvalidState(_))));
}

#[test]
fn test_push_ignored_when_not_running() {
    let factory = MockCodecFactory::new();
    let (session, _rx, _sink) = video_session(&factory, &SessionConfig::default());
    session.prepare(CodecParams::Video(small_video())).unwrap();

    assert!(!session.push_frame(create_test_frame(64, 48, 0)));
    assert_eq!(session.queued_frames(), 0);
}

#[test]
fn test_encodes_frames_in_order() {
    let factory = MockCodecFactory::new();
    let (session, mut rx, sink) = video_session(&factory, &SessionConfig::default());
    session.prepare(CodecParams::Video(small_video())).unwrap();
    session.start(SessionAnchor::at(0)).unwrap();

    for i in 0..10 {
        assert!(session.push_frame(frame_at(i, 33_333)));
    }
    assert!(wait_for(WAIT, || sink.samples.lock().len() == 10));

    let formats = sink.formats.lock().clone();
    assert_eq!(formats.len(), 1);
    assert_eq!(formats[0].kind(), MediaKind::Video);
    assert_eq!(session.format(), Some(formats[0].clone()));

    let samples = sink.samples.lock().clone();
    assert!(samples[0].flags.key_frame);
    assert!(samples.windows(2).all(|w| w[0].pts_us <= w[1].pts_us));
    assert_eq!(samples[9].pts_us, 9 * 33_333);

    session.stop();
    assert_eq!(session.state(), EncoderState::Unprepared);

    let events = drain_events(&mut rx);
    assert_eq!(events.first(), Some(&EncoderEvent::Started(MediaKind::Video)));
    assert_eq!(events.last(), Some(&EncoderEvent::Stopped(MediaKind::Video)));

    let stats = session.stats();
    assert_eq!(stats.samples_out, 10);
    assert_eq!(stats.frames_in, 10);
}

#[test]
fn test_timestamps_clamp_forward() {
    let factory = MockCodecFactory::new();
    let (session, _rx, sink) = video_session(&factory, &SessionConfig::default());
    session.prepare(CodecParams::Video(small_video())).unwrap();
    session.start(SessionAnchor::at(0)).unwrap();

    for index in [0u64, 2, 1, 3, 3] {
        assert!(session.push_frame(frame_at(index, 33_333)));
    }
    assert!(wait_for(WAIT, || sink.samples.lock().len() == 5));

    let pts: Vec<u64> = sink.samples.lock().iter().map(|s| s.pts_us).collect();
    assert_eq!(pts, vec![0, 66_666, 66_666, 99_999, 99_999]);
    session.stop();
}

#[test]
fn test_stop_is_idempotent() {
    let factory = MockCodecFactory::new();
    let (session, mut rx, _sink) = video_session(&factory, &SessionConfig::default());
    session.prepare(CodecParams::Video(small_video())).unwrap();
    session.start(SessionAnchor::now()).unwrap();

    assert!(session.push_frame(frame_at(0, 33_333)));
    assert!(wait_for(WAIT, || factory.control.submitted.load(Ordering::SeqCst) == 1));

    session.stop();
    session.stop();
    assert_eq!(session.state(), EncoderState::Unprepared);
    assert_eq!(factory.control.created.load(Ordering::SeqCst), 1);
    assert_eq!(factory.control.released.load(Ordering::SeqCst), 1);

    assert!(!session.push_frame(frame_at(1, 33_333)));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(factory.control.submitted.load(Ordering::SeqCst), 1);

    let stopped = drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, EncoderEvent::Stopped(_)))
        .count();
    assert_eq!(stopped, 1);
}

#[test]
fn test_burst_blocks_producer_without_loss() {
    const BURST: u64 = 170;

    let factory = MockCodecFactory::new();
    factory.control.submit_delay_us.store(3_000, Ordering::SeqCst);
    let config = SessionConfig::default();
    assert_eq!(config.queue_capacity, 80);
    let (session, _rx, sink) = video_session(&factory, &config);
    session.prepare(CodecParams::Video(small_video())).unwrap();
    session.start(SessionAnchor::at(0)).unwrap();

    let pushed = AtomicU64::new(0);
    std::thread::scope(|scope| {
        scope.spawn(|| {
            for i in 0..BURST {
                assert!(session.push_frame(frame_at(i, 33_333)));
                pushed.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(wait_for(WAIT, || session.queued_frames() == 80));
        assert!(pushed.load(Ordering::SeqCst) < BURST);
    });

    assert_eq!(pushed.load(Ordering::SeqCst), BURST);
    assert!(wait_for(Duration::from_secs(5), || {
        sink.samples.lock().len() == BURST as usize
    }));

    let samples = sink.samples.lock().clone();
    let pts: Vec<u64> = samples.iter().map(|s| s.pts_us).collect();
    let expected: Vec<u64> = (0..BURST).map(|i| i * 33_333).collect();
    assert_eq!(pts, expected);
    assert_eq!(session.stats().frames_in, BURST);
    session.stop();
}

#[test]
fn test_stop_releases_prepared_codec() {
    let factory = MockCodecFactory::new();
    let (session, _rx, _sink) = video_session(&factory, &SessionConfig::default());
    session.prepare(CodecParams::Video(small_video())).unwrap();

    session.stop();
    assert_eq!(session.state(), EncoderState::Unprepared);

    session.prepare(CodecParams::Video(small_video())).unwrap();
    assert_eq!(session.state(), EncoderState::Prepared);
}

#[test]
fn test_codec_failure_resets_and_continues() {
    let factory = MockCodecFactory::new();
    let (session, mut rx, sink) = video_session(&factory, &SessionConfig::default());
    session.prepare(CodecParams::Video(small_video())).unwrap();
    session.start(SessionAnchor::at(0)).unwrap();

    factory.control.fail_submits.store(1, Ordering::SeqCst);
    for i in 0..5 {
        session.push_frame(frame_at(i, 33_333));
    }

    assert!(wait_for(WAIT, || sink.samples.lock().len() == 4));
    assert_eq!(factory.control.created.load(Ordering::SeqCst), 2);
    assert!(session.is_running());

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        EncoderEvent::Reset {
            kind: MediaKind::Video,
            attempt: 1,
            ..
        }
    )));
    assert_eq!(session.stats().resets, 1);
    session.stop();
}

#[test]
fn test_reset_limit_is_fatal() {
    let factory = MockCodecFactory::new();
    let config = SessionConfig::default().with_max_codec_resets(2);
    let (session, mut rx, _sink) = video_session(&factory, &config);
    session.prepare(CodecParams::Video(small_video())).unwrap();
    session.start(SessionAnchor::at(0)).unwrap();

    factory.control.fail_submits.store(u32::MAX, Ordering::SeqCst);
    for i in 0..3 {
        session.push_frame(frame_at(i, 33_333));
    }

    assert!(wait_for(WAIT, || session.state() == EncoderState::Unprepared));
    let events = drain_events(&mut rx);
    let resets = events
        .iter()
        .filter(|e| matches!(e, EncoderEvent::Reset { .. }))
        .count();
    assert_eq!(resets, 2);
    assert!(events.iter().any(|e| matches!(e, EncoderEvent::Fatal { .. })));
    assert!(!session.push_frame(frame_at(4, 33_333)));
    session.stop();
}

#[test]
fn test_error_hook_can_decline_recovery() {
    let factory = MockCodecFactory::new();
    let (session, mut rx, _sink) = video_session(&factory, &SessionConfig::default());
    session.set_error_hook(|_, _| false);
    session.prepare(CodecParams::Video(small_video())).unwrap();
    session.start(SessionAnchor::at(0)).unwrap();

    factory.control.fail_submits.store(1, Ordering::SeqCst);
    session.push_frame(frame_at(0, 33_333));

    assert!(wait_for(WAIT, || !session.is_running()));
    let events = drain_events(&mut rx);
    assert!(!events.iter().any(|e| matches!(e, EncoderEvent::Reset { .. })));
    assert!(events.iter().any(|e| matches!(e, EncoderEvent::Fatal { .. })));
}

#[test]
fn test_keyframe_request_native() {
    let factory = MockCodecFactory::new();
    let (session, _rx, sink) = video_session(&factory, &SessionConfig::default());
    session.prepare(CodecParams::Video(small_video())).unwrap();
    session.start(SessionAnchor::at(0)).unwrap();

    for i in 0..3 {
        session.push_frame(frame_at(i, 33_333));
    }
    assert!(wait_for(WAIT, || sink.samples.lock().len() == 3));

    session.request_keyframe();
    assert!(wait_for(WAIT, || factory.control.keyframe_requests.load(Ordering::SeqCst) == 1));
    session.push_frame(frame_at(3, 33_333));
    assert!(wait_for(WAIT, || sink.samples.lock().len() == 4));

    let samples = sink.samples.lock().clone();
    assert!(!samples[2].flags.key_frame);
    assert!(samples[3].flags.key_frame);
    assert_eq!(factory.control.keyframe_requests.load(Ordering::SeqCst), 1);
    assert_eq!(factory.control.created.load(Ordering::SeqCst), 1);
    session.stop();
}

#[test]
fn test_keyframe_request_resets_unsupported_codec() {
    let factory = MockCodecFactory::new();
    factory.control.no_keyframe_requests.store(true, Ordering::SeqCst);
    let (session, _rx, sink) = video_session(&factory, &SessionConfig::default());
    session.prepare(CodecParams::Video(small_video())).unwrap();
    session.start(SessionAnchor::at(0)).unwrap();

    for i in 0..3 {
        session.push_frame(frame_at(i, 33_333));
    }
    assert!(wait_for(WAIT, || sink.samples.lock().len() == 3));

    session.request_keyframe();
    assert!(wait_for(WAIT, || factory.control.created.load(Ordering::SeqCst) == 2));
    session.push_frame(frame_at(3, 33_333));
    assert!(wait_for(WAIT, || sink.samples.lock().len() == 4));

    assert!(sink.samples.lock()[3].flags.key_frame);
    session.stop();
}

#[test]
fn test_live_bitrate_change() {
    let factory = MockCodecFactory::new();
    let (session, _rx, _sink) = video_session(&factory, &SessionConfig::default());
    session.prepare(CodecParams::Video(small_video())).unwrap();
    session.start(SessionAnchor::at(0)).unwrap();

    session.set_bitrate(500_000);
    session.push_frame(frame_at(0, 33_333));
    assert!(wait_for(WAIT, || factory.control.bitrates.lock().contains(&500_000)));
    assert_eq!(session.params().map(|p| p.bitrate()), Some(500_000));
    session.stop();
}

#[test]
fn test_unsupported_bitrate_change_warns() {
    let factory = MockCodecFactory::new();
    factory.control.no_live_bitrate.store(true, Ordering::SeqCst);
    let (session, mut rx, _sink) = video_session(&factory, &SessionConfig::default());
    session.prepare(CodecParams::Video(small_video())).unwrap();
    session.start(SessionAnchor::at(0)).unwrap();

    session.set_bitrate(500_000);
    session.push_frame(frame_at(0, 33_333));

    let mut events = Vec::new();
    assert!(wait_for(WAIT, || {
        events.extend(drain_events(&mut rx));
        events
            .iter()
            .any(|e| matches!(e, EncoderEvent::Warning { .. }))
    }));
    assert!(session.is_running());
    session.stop();
}

#[test]
fn test_fps_limit_skips_frames() {
    let factory = MockCodecFactory::new();
    let (session, _rx, sink) = video_session(&factory, &SessionConfig::default());
    session.prepare(CodecParams::Video(small_video())).unwrap();
    session.set_fps_limit(Some(15));
    session.start(SessionAnchor::at(0)).unwrap();

    for i in 0..30 {
        session.push_frame(frame_at(i, 33_333));
    }
    assert!(wait_for(WAIT, || session.queued_frames() == 0
        && session.stats().frames_skipped == 15));
    assert_eq!(sink.samples.lock().len(), 15);
    session.stop();
}

#[test]
fn test_hold_input_pauses_submission() {
    let factory = MockCodecFactory::new();
    let (session, _rx, sink) = video_session(&factory, &SessionConfig::default());
    session.prepare(CodecParams::Video(small_video())).unwrap();
    session.start(SessionAnchor::at(0)).unwrap();

    {
        let _hold = session.hold_input();
        session.push_frame(frame_at(0, 33_333));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(factory.control.submitted.load(Ordering::SeqCst), 0);
    }
    assert!(wait_for(WAIT, || sink.samples.lock().len() == 1));
    session.stop();
}

/// Stops its own encoder from the output callback
struct StopOnFirstSample {
    session: Mutex<Weak<EncoderSession>>,
}

impl SampleSink for StopOnFirstSample {
    fn on_format(&self, _format: &FormatDescription) {}

    fn on_sample(&self, _sample: &EncodedSample<'_>) {
        if let Some(session) = self.session.lock().upgrade() {
            session.stop();
        }
    }
}

#[test]
fn test_stop_from_sink_callback() {
    let factory = MockCodecFactory::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let session = Arc::new(EncoderSession::new(
        MediaKind::Video,
        Arc::new(factory.clone()),
        &SessionConfig::default(),
        tx,
    ));
    let sink = Arc::new(StopOnFirstSample {
        session: Mutex::new(Arc::downgrade(&session)),
    });
    session.set_sink(sink);
    session.prepare(CodecParams::Video(small_video())).unwrap();
    session.start(SessionAnchor::at(0)).unwrap();

    session.push_frame(frame_at(0, 33_333));
    assert!(wait_for(WAIT, || session.state() == EncoderState::Unprepared));
}

#[test]
fn test_restart_after_stop() {
    let factory = MockCodecFactory::new();
    let (session, _rx, sink) = video_session(&factory, &SessionConfig::default());

    for _ in 0..2 {
        session.prepare(CodecParams::Video(small_video())).unwrap();
        session.start(SessionAnchor::at(0)).unwrap();
        session.push_frame(frame_at(0, 33_333));
        assert!(wait_for(WAIT, || !sink.samples.lock().is_empty()));
        session.stop();
        sink.samples.lock().clear();
    }
    assert_eq!(sink.formats.lock().len(), 2);
}

#[cfg(feature = "ffmpeg")]
#[test]
#[ignore = "requires FFmpeg with libx264 or a hardware H.264 encoder"]
fn test_ffmpeg_h264_encodes() {
    use livecast_core::encode::FfmpegCodecFactory;

    let (tx, _rx) = mpsc::unbounded_channel();
    let session = EncoderSession::new(
        MediaKind::Video,
        Arc::new(FfmpegCodecFactory),
        &SessionConfig::default(),
        tx,
    );
    let sink = Arc::new(Collect::default());
    session.set_sink(sink.clone());
    session.prepare(CodecParams::Video(small_video())).unwrap();
    session.start(SessionAnchor::at(0)).unwrap();

    for i in 0..60 {
        session.push_frame(frame_at(i, 33_333));
    }
    assert!(wait_for(Duration::from_secs(10), || !sink.samples.lock().is_empty()));
    session.stop();

    let formats = sink.formats.lock();
    assert!(!formats.is_empty());
    assert!(!formats[0].extradata.is_empty());
}

#[cfg(feature = "ffmpeg")]
#[test]
fn test_available_encoders_format() {
    let encoders = livecast_core::encode::available_encoders();
    for encoder in encoders {
        assert!(!encoder.is_empty());
    }
}
