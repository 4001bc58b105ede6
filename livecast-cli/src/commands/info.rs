//! Info command - show encoders and supported formats

use anyhow::Result;
use livecast_core::config::{AudioCodec, CodecPreference, Preset, VideoCodec};
use livecast_core::encode;
use livecast_core::stream::Protocol;

/// Show which encoders FFmpeg provides and what livecast supports
pub async fn info() -> Result<()> {
    println!("livecast - System Information\n");

    println!("Video encoders:");
    for codec in [VideoCodec::H264, VideoCodec::H265] {
        let found: Vec<&str> = codec
            .candidates(CodecPreference::FirstCompatible)
            .into_iter()
            .filter(|name| encode::codec_available(name))
            .collect();
        if found.is_empty() {
            println!("  {}: not available", codec);
        } else {
            println!("  {}: {}", codec, found.join(", "));
        }
    }

    println!();
    println!("Audio encoders:");
    for codec in [AudioCodec::Aac, AudioCodec::Opus] {
        let name = codec.ffmpeg_encoder();
        let state = if encode::codec_available(name) { "yes" } else { "no" };
        println!("  {:?} ({}): {}", codec, name, state);
    }

    if encode::available_encoders().is_empty() {
        println!();
        println!("No usable encoders found. FFmpeg must be built with libx264,");
        println!("libopenh264 or a hardware encoder (nvenc, vaapi, qsv).");
    }

    println!();
    println!("Endpoints:");
    for protocol in [Protocol::Rtmp, Protocol::Rtsp, Protocol::Srt] {
        println!(
            "  {:<5} {} (default port {})",
            protocol.to_string(),
            protocol.url_hint(),
            protocol.default_port(false)
        );
    }

    println!();
    println!("Presets:");
    for preset in [
        Preset::P480_30,
        Preset::P720_30,
        Preset::P720_60,
        Preset::P1080_30,
        Preset::P1080_60,
    ] {
        println!(
            "  {:<8} {}x{} @ {}fps, {} kbps",
            preset.to_string(),
            preset.width(),
            preset.height(),
            preset.fps(),
            preset.suggested_bitrate() / 1000
        );
    }
    println!("  Custom sizes use WIDTHxHEIGHT@FPS, e.g. 1280x720@25");

    Ok(())
}
