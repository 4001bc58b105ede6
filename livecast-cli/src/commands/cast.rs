//! Cast command - stream and/or record a test pattern

use anyhow::{bail, Context, Result};
use clap::Args;
use livecast_core::capture::{AudioSource, TestPatternSource, ToneSource};
use livecast_core::config::{ConfigFile, Preset, VideoCodec};
use livecast_core::encode::EncoderEvent;
use livecast_core::record::RecordEvent;
use livecast_core::stream::{safe_url, ConnectionEvent, Endpoint, Protocol};
use livecast_core::{SessionBackends, SessionEvents, StreamSession};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

/// Arguments for the cast command
#[derive(Args)]
pub struct CastArgs {
    /// Stream URL (rtmp://, rtmps://, rtsp://, rtsps:// or srt://)
    #[arg(short, long)]
    url: Option<String>,

    /// Record to this file (relative paths go to the configured record directory)
    #[arg(short, long)]
    record: Option<PathBuf>,

    /// Output preset (480p30, 720p30, 720p60, 1080p30, 1080p60, WxH@FPS)
    #[arg(short, long)]
    preset: Option<String>,

    /// Video codec (h264, h265)
    #[arg(short, long)]
    codec: Option<String>,

    /// Video bitrate in kbps
    #[arg(short, long)]
    bitrate: Option<u32>,

    /// Stream and record video only
    #[arg(long)]
    no_audio: bool,

    /// User for servers that require authentication
    #[arg(long, requires = "password")]
    user: Option<String>,

    /// Password for servers that require authentication
    #[arg(long, requires = "user")]
    password: Option<String>,

    /// Reconnect attempts after a lost connection (0 = unlimited)
    #[arg(long)]
    retries: Option<u32>,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<u64>,
}

/// Run a streaming and/or recording session until interrupted
pub async fn cast(args: CastArgs) -> Result<()> {
    if args.url.is_none() && args.record.is_none() {
        bail!("Nothing to do: pass --url to stream, --record to record, or both");
    }

    let file = ConfigFile::load_or_default();

    let protocol = match &args.url {
        Some(url) => Endpoint::parse(url)?.protocol,
        None => Protocol::Rtmp,
    };

    let mut video = file.video_config()?;
    if let Some(preset) = &args.preset {
        let preset: Preset = preset.parse().map_err(anyhow::Error::msg)?;
        video = video.with_resolution(preset.width(), preset.height()).with_fps(preset.fps());
        if args.bitrate.is_none() && file.video.bitrate == 0 {
            video = video.with_bitrate(preset.suggested_bitrate());
        }
    }
    if let Some(codec) = &args.codec {
        let codec: VideoCodec = codec.parse().map_err(anyhow::Error::msg)?;
        video = video.with_codec(codec);
    }
    if let Some(kbps) = args.bitrate {
        video = video.with_bitrate(kbps * 1000);
    }

    let audio = if args.no_audio { None } else { file.audio_config()? };

    let mut config = file.session_config()?;
    match args.retries {
        Some(0) => config.retries = None,
        Some(n) => config = config.with_retries(n),
        None => {}
    }

    let (width, height) = video.encoded_size();
    println!("livecast - Starting\n");
    println!("Configuration:");
    println!("  Video:      {} {}x{} @ {} fps", video.codec, width, height, video.fps);
    println!("  Bitrate:    {} kbps", video.bitrate / 1000);
    match &audio {
        Some(audio) => println!("  Audio:      {:?} {} Hz", audio.codec, audio.sample_rate),
        None => println!("  Audio:      off"),
    }
    if let Some(url) = &args.url {
        println!("  Stream:     {} ({})", safe_url(url), protocol);
    }
    println!();

    let microphone: Option<Box<dyn AudioSource>> = match audio {
        Some(_) => Some(Box::new(ToneSource::new(440.0))),
        None => None,
    };
    let (mut session, mut events) = StreamSession::new(
        protocol,
        config,
        SessionBackends::ffmpeg(),
        Box::new(TestPatternSource::new()),
        microphone,
    );

    if !session.prepare_video(video) {
        bail!("No video encoder accepts this configuration (try `livecast info`)");
    }
    match audio {
        Some(audio) => {
            if !session.prepare_audio(audio) {
                warn!("Audio encoder unavailable, continuing video only");
                session.disable_audio();
            }
        }
        None => session.disable_audio(),
    }

    if let (Some(user), Some(password)) = (&args.user, &args.password) {
        session.set_authorization(user.clone(), password.clone());
    }

    let record_path = args.record.as_ref().map(|path| {
        if path.is_relative() && !file.record.directory.is_empty() {
            PathBuf::from(&file.record.directory).join(path)
        } else {
            path.clone()
        }
    });

    match (&args.url, &record_path) {
        (Some(url), Some(path)) => session
            .start_stream_and_record(url, path)
            .context("Failed to start")?,
        (Some(url), None) => session.start_stream(url).context("Failed to start stream")?,
        (None, Some(path)) => session.start_record(path).context("Failed to start recording")?,
        (None, None) => bail!("Nothing to do"),
    }
    if let Some(path) = &record_path {
        println!("Recording to {}", path.display());
    }
    println!("Press Ctrl+C to stop...\n");

    let result = run_loop(&session, &mut events, &file, args.duration).await;

    println!("\nStopping...");
    if session.is_recording() {
        session.stop_record()?;
    }
    session.stop_stream();

    let stats = session.stats();
    println!("Video:  {}", stats.video.format_line());
    println!(
        "Sent:   {} video, {} audio samples, {} KiB",
        stats.client.sent_video,
        stats.client.sent_audio,
        stats.client.bytes_sent / 1024
    );
    if record_path.is_some() {
        println!(
            "Record: {} samples, {} KiB",
            stats.record.samples_written,
            stats.record.bytes_written / 1024
        );
    }

    result
}

async fn run_loop(
    session: &StreamSession,
    events: &mut SessionEvents,
    file: &ConfigFile,
    duration: Option<u64>,
) -> Result<()> {
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let stop_after = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(stop_after);

    let mut report = tokio::time::interval(Duration::from_secs(5));
    report.tick().await;

    let backup_url = file.stream.backup_url.as_deref();

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received interrupt signal");
                return Ok(());
            }
            _ = &mut stop_after => {
                info!("Duration elapsed");
                return Ok(());
            }
            Some(event) = events.connection.recv() => match event {
                ConnectionEvent::Started(url) => info!("Connecting to {}", url),
                ConnectionEvent::Success | ConnectionEvent::AuthSuccess => {
                    println!("Connected, streaming.");
                }
                ConnectionEvent::AuthError => {
                    bail!("Authentication failed (pass --user and --password)");
                }
                ConnectionEvent::Failed(reason)
                | ConnectionEvent::Disconnected(Some(reason)) => {
                    warn!("Connection lost: {}", reason);
                    if !session.retry(file.retry_delay(), &reason, backup_url) {
                        bail!("Connection failed: {}", reason);
                    }
                    println!("Reconnecting in {:?}...", file.retry_delay());
                }
                ConnectionEvent::Disconnected(None) => debug!("Disconnected"),
                ConnectionEvent::NewBitrate(bps) => debug!("Outgoing bitrate: {} kbps", bps / 1000),
            },
            Some(event) = events.encoder.recv() => match event {
                EncoderEvent::Fatal { kind, error } => {
                    bail!("{:?} encoder failed: {}", kind, error);
                }
                EncoderEvent::Reset { kind, attempt, reason } => {
                    warn!("{:?} encoder reset #{}: {}", kind, attempt, reason);
                }
                EncoderEvent::Warning { kind, message } => warn!("{:?} encoder: {}", kind, message),
                other => debug!("{:?}", other),
            },
            Some(event) = events.record.recv() => match event {
                RecordEvent::Error(message) => error!("Recording failed: {}", message),
                RecordEvent::Status(status) => debug!("Record status: {:?}", status),
            },
            _ = report.tick() => {
                let stats = session.stats();
                info!("video {}", stats.video.format_line());
            }
        }
    }
}
