//! FFmpeg-backed muxer
//!
//! Writes encoded samples into any container FFmpeg can produce. The
//! same writer serves file recording and network output (flv over
//! RTMP, mpegts over SRT, rtsp).

use ffmpeg_next as ffmpeg;
use ffmpeg::codec::Id;
use ffmpeg::format::context::Output;
use ffmpeg::{Dictionary, Rational};
use std::path::Path;
use tracing::{debug, error, info};

use super::{Muxer, MuxerFactory};
use crate::error::{LivecastError, Result};
use crate::types::{CodecId, FormatDescription, MediaKind, TrackParams};

/// Sample timestamps are microseconds
const INPUT_TIME_BASE: Rational = Rational(1, 1_000_000);

fn codec_id(codec: CodecId) -> Id {
    match codec {
        CodecId::H264 => Id::H264,
        CodecId::H265 => Id::HEVC,
        CodecId::Aac => Id::AAC,
        CodecId::Opus => Id::OPUS,
    }
}

struct Track {
    kind: MediaKind,
    index: usize,
}

/// Container writer over an FFmpeg output context
pub struct FfmpegMuxer {
    target: String,
    output: Output,
    tracks: Vec<Track>,
    header_written: bool,
    finalized: bool,
    packets: u64,
    bytes: u64,
    /// Error constructor for this writer's failures
    error: fn(String) -> LivecastError,
}

impl FfmpegMuxer {
    /// Open a file; the container is chosen from the extension
    pub fn create(path: &Path) -> Result<Self> {
        let output = ffmpeg::format::output(path).map_err(|e| {
            LivecastError::record_io(format!("Failed to create output file {:?}: {}", path, e))
        })?;
        Ok(Self::wrap(
            path.display().to_string(),
            output,
            LivecastError::RecordIo,
        ))
    }

    /// Open a network URL with an explicit container format
    ///
    /// Connection happens here; `options` are protocol options such as
    /// `rtsp_transport`.
    pub fn connect(url: &str, format: &str, options: Dictionary) -> Result<Self> {
        let output = ffmpeg::format::output_as_with(url, format, options)
            .map_err(|e| LivecastError::connection(e.to_string()))?;
        Ok(Self::wrap(url.to_string(), output, LivecastError::Send))
    }

    fn wrap(target: String, output: Output, error: fn(String) -> LivecastError) -> Self {
        Self {
            target,
            output,
            tracks: Vec::new(),
            header_written: false,
            finalized: false,
            packets: 0,
            bytes: 0,
            error,
        }
    }

    /// Track index for a media kind
    pub fn track_of(&self, kind: MediaKind) -> Option<usize> {
        self.tracks.iter().find(|t| t.kind == kind).map(|t| t.index)
    }

    /// Packets written so far
    pub fn packets_written(&self) -> u64 {
        self.packets
    }

    /// Payload bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    fn fail(&self, what: &str, err: ffmpeg::Error) -> LivecastError {
        (self.error)(format!("{}: {}", what, err))
    }
}

impl Muxer for FfmpegMuxer {
    fn add_track(&mut self, format: &FormatDescription) -> Result<usize> {
        if self.header_written {
            return Err((self.error)("cannot add a track after the header".to_string()));
        }

        let id = codec_id(format.codec);
        let mut stream = self
            .output
            .add_stream(id)
            .map_err(|e| (self.error)(format!("Failed to add {} stream: {}", format.kind(), e)))?;

        let codec_par = stream.parameters();
        // SAFETY: ffmpeg-next has no setters for these codec parameters. The
        // pointer comes from the stream just added and stays valid while the
        // output context lives. Extradata is allocated with av_mallocz so the
        // context frees it, padded as FFmpeg requires.
        unsafe {
            let ptr = codec_par.as_ptr() as *mut ffmpeg::ffi::AVCodecParameters;
            (*ptr).codec_id = id.into();
            (*ptr).bit_rate = format.bitrate as i64;
            match format.params {
                TrackParams::Video { width, height, .. } => {
                    (*ptr).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
                    (*ptr).width = width as i32;
                    (*ptr).height = height as i32;
                    (*ptr).format = ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_YUV420P as i32;
                }
                TrackParams::Audio {
                    sample_rate,
                    channels,
                } => {
                    (*ptr).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_AUDIO;
                    (*ptr).sample_rate = sample_rate as i32;
                    (*ptr).ch_layout.nb_channels = channels as i32;
                }
            }

            if !format.extradata.is_empty() {
                let len = format.extradata.len();
                let padding = ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
                let data = ffmpeg::ffi::av_mallocz(len + padding) as *mut u8;
                if !data.is_null() {
                    std::ptr::copy_nonoverlapping(format.extradata.as_ptr(), data, len);
                    (*ptr).extradata = data;
                    (*ptr).extradata_size = len as i32;
                }
            }
        }

        stream.set_time_base(INPUT_TIME_BASE);
        let index = stream.index();
        self.tracks.push(Track {
            kind: format.kind(),
            index,
        });

        debug!(
            "Added {} track {} ({}, {:?})",
            format.kind(),
            index,
            format.codec,
            format.params
        );
        Ok(index)
    }

    fn start(&mut self) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        self.output
            .write_header()
            .map_err(|e| self.fail("Failed to write header", e))?;
        self.header_written = true;
        info!("Muxer started: {} ({} tracks)", self.target, self.tracks.len());
        Ok(())
    }

    fn write(&mut self, track: usize, data: &[u8], pts_us: u64, key_frame: bool) -> Result<()> {
        if !self.header_written {
            self.start()?;
        }

        let mut pkt = ffmpeg::Packet::copy(data);
        pkt.set_stream(track);
        pkt.set_pts(Some(pts_us as i64));
        pkt.set_dts(Some(pts_us as i64));
        if key_frame {
            pkt.set_flags(ffmpeg::packet::Flags::KEY);
        }

        let output_time_base = self
            .output
            .stream(track)
            .map(|s| s.time_base())
            .unwrap_or(INPUT_TIME_BASE);
        pkt.rescale_ts(INPUT_TIME_BASE, output_time_base);

        pkt.write_interleaved(&mut self.output)
            .map_err(|e| self.fail("Failed to write packet", e))?;

        self.packets += 1;
        self.bytes += data.len() as u64;
        if self.packets % 1000 == 0 {
            debug!(
                "Muxed {} packets ({:.2} MB)",
                self.packets,
                self.bytes as f64 / 1_000_000.0
            );
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if !self.header_written || self.finalized {
            return Ok(());
        }
        self.finalized = true;
        self.output
            .write_trailer()
            .map_err(|e| self.fail("Failed to write trailer", e))?;
        info!(
            "Muxer finalized: {} packets ({:.2} MB)",
            self.packets,
            self.bytes as f64 / 1_000_000.0
        );
        Ok(())
    }
}

impl Drop for FfmpegMuxer {
    fn drop(&mut self) {
        if self.header_written && !self.finalized {
            if let Err(e) = self.output.write_trailer() {
                error!("Failed to finalize {} on drop: {}", self.target, e);
            }
        }
    }
}

/// Opens [`FfmpegMuxer`]s for file destinations
#[derive(Debug, Clone, Default)]
pub struct FfmpegMuxerFactory;

impl MuxerFactory for FfmpegMuxerFactory {
    fn open(&self, destination: &Path) -> Result<Box<dyn Muxer>> {
        ffmpeg::init()
            .map_err(|e| LivecastError::record_io(format!("FFmpeg init failed: {}", e)))?;
        Ok(Box::new(FfmpegMuxer::create(destination)?))
    }
}
