//! Integration tests for configuration system

use livecast_core::config::{
    sample_config, AudioCodec, AudioConfig, CodecPreference, ConfigFile, Preset, SessionConfig,
    TransportMode, VideoCodec, VideoConfig,
};
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_preset_resolution() {
    assert_eq!((Preset::P480_30.width(), Preset::P480_30.height()), (640, 480));
    assert_eq!((Preset::P720_60.width(), Preset::P720_60.height()), (1280, 720));
    assert_eq!((Preset::P1080_30.width(), Preset::P1080_30.height()), (1920, 1080));
    assert_eq!(Preset::P720_60.fps(), 60);
}

#[test]
fn test_preset_from_string() {
    assert_eq!("720p30".parse::<Preset>().ok(), Some(Preset::P720_30));
    assert_eq!("1080p60".parse::<Preset>().ok(), Some(Preset::P1080_60));
    assert_eq!(
        "1280x720@25".parse::<Preset>().ok(),
        Some(Preset::Custom {
            width: 1280,
            height: 720,
            fps: 25
        })
    );
    assert!("invalid".parse::<Preset>().is_err());
}

#[test]
fn test_preset_display_round_trips() {
    for preset in [Preset::P480_30, Preset::P1080_60] {
        assert_eq!(preset.to_string().parse::<Preset>().ok(), Some(preset));
    }
}

#[test]
fn test_codec_from_string() {
    assert_eq!("h264".parse::<VideoCodec>().ok(), Some(VideoCodec::H264));
    assert_eq!("hevc".parse::<VideoCodec>().ok(), Some(VideoCodec::H265));
    assert_eq!("opus".parse::<AudioCodec>().ok(), Some(AudioCodec::Opus));
    assert!("av1".parse::<VideoCodec>().is_err());
}

#[test]
fn test_codec_candidates_follow_preference() {
    let hardware = VideoCodec::H264.candidates(CodecPreference::Hardware);
    assert!(hardware.iter().all(|name| !name.starts_with("lib")));

    let software = VideoCodec::H264.candidates(CodecPreference::Software);
    assert_eq!(software[0], "libx264");

    let all = VideoCodec::H265.candidates(CodecPreference::FirstCompatible);
    assert_eq!(all.first(), Some(&"hevc_nvenc"));
    assert_eq!(all.last(), Some(&"libx265"));
}

#[test]
fn test_video_config_builder() {
    let config = VideoConfig::from_preset(Preset::P720_30)
        .with_codec(VideoCodec::H265)
        .with_bitrate(3_000_000)
        .with_rotation(90);

    assert_eq!(config.codec, VideoCodec::H265);
    assert_eq!(config.bitrate, 3_000_000);
    assert_eq!(config.encoded_size(), (720, 1280));
    assert_eq!(config.frame_size(), 1280 * 720 * 3 / 2);
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_video_config_validation() {
    assert!(VideoConfig::default().with_resolution(0, 480).validate_strict().is_err());
    assert!(VideoConfig::default().with_resolution(641, 480).validate_strict().is_err());
    assert!(VideoConfig::default().with_fps(0).validate_strict().is_err());
    assert!(VideoConfig::default().with_bitrate(0).validate_strict().is_err());
    assert!(VideoConfig::default().with_rotation(45).validate_strict().is_err());
}

#[test]
fn test_audio_config_validation() {
    assert!(AudioConfig::default().validate_strict().is_ok());

    let opus = AudioConfig::default().with_codec(AudioCodec::Opus);
    assert!(opus.validate_strict().is_err());
    assert!(opus.with_sample_rate(48000).validate_strict().is_ok());

    assert_eq!(AudioConfig::default().with_stereo(false).channels(), 1);
}

#[test]
fn test_session_config_defaults() {
    let config = SessionConfig::default();
    assert_eq!(config.queue_capacity, 80);
    assert_eq!(config.send_cache_size, 200);
    assert_eq!(config.media_info_timeout, Duration::from_secs(5));
    assert_eq!(config.max_codec_resets, None);
    assert_eq!(config.retries, None);
    assert_eq!(config.transport_mode, TransportMode::Tcp);
}

#[test]
fn test_config_file_save_and_load() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("livecast").join("config.toml");

    let mut config = ConfigFile::default();
    config.video.preset = "720p60".to_string();
    config.stream.retries = 3;
    config.stream.backup_url = Some("rtmp://backup.example.com/live/key".to_string());
    config.save_to(path.clone()).unwrap();

    let loaded = ConfigFile::load_from(path).unwrap();
    assert_eq!(loaded.video.preset, "720p60");
    assert_eq!(loaded.stream.retries, 3);
    assert_eq!(
        loaded.stream.backup_url.as_deref(),
        Some("rtmp://backup.example.com/live/key")
    );
}

#[test]
fn test_missing_config_file_uses_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config = ConfigFile::load_from(temp_dir.path().join("missing.toml")).unwrap();
    assert_eq!(config.video.preset, "480p30");
    assert!(config.audio.enabled);
}

#[test]
fn test_invalid_config_file_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(&path, "[video\npreset = ").unwrap();

    let err = ConfigFile::load_from(path).unwrap_err();
    assert!(err.to_string().contains("Configuration error"));
}

#[test]
fn test_config_file_builds_runtime_configs() {
    let config: ConfigFile = toml::from_str(
        r#"
        [video]
        preset = "1280x720@30"
        codec = "h265"
        bitrate = 2500

        [audio]
        codec = "opus"
        sample_rate = 48000
        bitrate = 96

        [stream]
        transport = "udp"
        retries = 5
        retry_delay_ms = 250
        cache_size = 64
        "#,
    )
    .unwrap();

    let video = config.video_config().unwrap();
    assert_eq!((video.width, video.height, video.fps), (1280, 720, 30));
    assert_eq!(video.codec, VideoCodec::H265);
    assert_eq!(video.bitrate, 2_500_000);

    let audio = config.audio_config().unwrap().unwrap();
    assert_eq!(audio.codec, AudioCodec::Opus);
    assert_eq!(audio.bitrate, 96_000);
    assert!(audio.validate_strict().is_ok());

    let session = config.session_config().unwrap();
    assert_eq!(session.transport_mode, TransportMode::Udp);
    assert_eq!(session.retries, Some(5));
    assert_eq!(session.send_cache_size, 64);
    assert_eq!(config.retry_delay(), Duration::from_millis(250));
}

#[test]
fn test_disabled_audio_has_no_config() {
    let config: ConfigFile = toml::from_str("[audio]\nenabled = false\n").unwrap();
    assert!(config.audio_config().unwrap().is_none());
}

#[test]
fn test_unknown_values_are_config_errors() {
    let config: ConfigFile = toml::from_str("[video]\ncodec = \"vp9\"\n").unwrap();
    assert!(config.video_config().is_err());

    let config: ConfigFile = toml::from_str("[stream]\ntransport = \"quic\"\n").unwrap();
    assert!(config.session_config().is_err());
}

#[test]
fn test_sample_config_is_valid() {
    let config: ConfigFile = toml::from_str(&sample_config()).unwrap();
    assert!(config.video_config().unwrap().validate_strict().is_ok());
    assert!(config.session_config().is_ok());
}
