//! FFmpeg-backed codecs
//!
//! Video input is planar YUV 4:2:0, audio input is interleaved signed
//! 16-bit PCM. Encoders are opened with global headers so parameter
//! sets arrive out of band in the format description.

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::{self, encoder};
use ffmpeg_next::format::{sample, Pixel, Sample};
use ffmpeg_next::util::frame::audio::Audio;
use ffmpeg_next::util::frame::video::Video;
use ffmpeg_next::util::picture;
use ffmpeg_next::{ChannelLayout, Dictionary, Rational};
use tracing::{debug, info, warn};

use super::{Codec, CodecFactory, CodecOutput, CodecParams};
use crate::config::{AudioCodec, AudioConfig, VideoCodec, VideoConfig};
use crate::error::{LivecastError, Result};
use crate::types::{FormatDescription, TrackParams};

/// Microsecond time base used for video
const MICROS: Rational = Rational(1, 1_000_000);

/// Creates FFmpeg encoders, trying candidates in preference order
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegCodecFactory;

impl CodecFactory for FfmpegCodecFactory {
    fn create(&self, params: &CodecParams) -> Result<Box<dyn Codec>> {
        ffmpeg::init().map_err(|e| LivecastError::prepare(format!("FFmpeg init failed: {}", e)))?;

        match params {
            CodecParams::Video(config) => {
                let candidates = config.codec.candidates(config.preference);
                let mut last_error = None;
                for name in candidates {
                    match FfmpegVideoCodec::open(name, config) {
                        Ok(codec) => return Ok(Box::new(codec)),
                        Err(e) => {
                            debug!("Video encoder {} rejected configuration: {}", name, e);
                            last_error = Some(e);
                        }
                    }
                }
                Err(LivecastError::prepare(format!(
                    "No {} encoder accepted {}x{} @ {}fps ({:?}): {}",
                    config.codec,
                    config.width,
                    config.height,
                    config.fps,
                    config.preference,
                    last_error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no candidates".to_string())
                )))
            }
            CodecParams::Audio(config) => Ok(Box::new(FfmpegAudioCodec::open(config)?)),
        }
    }
}

/// Video encoder
struct FfmpegVideoCodec {
    name: String,
    encoder: encoder::Video,
    frame: Video,
    packet: ffmpeg::Packet,
    pending_format: Option<FormatDescription>,
    force_key: bool,
}

impl FfmpegVideoCodec {
    fn open(name: &str, config: &VideoConfig) -> Result<Self> {
        let codec = encoder::find_by_name(name)
            .ok_or_else(|| LivecastError::prepare(format!("Encoder {} not found", name)))?;

        let mut encoder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|e| {
                LivecastError::prepare(format!("Failed to create encoder context: {}", e))
            })?;

        let (width, height) = config.encoded_size();
        encoder.set_width(width);
        encoder.set_height(height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(MICROS);
        encoder.set_frame_rate(Some(Rational::new(config.fps as i32, 1)));
        encoder.set_bit_rate(config.bitrate as usize);
        encoder.set_max_bit_rate(config.bitrate as usize * 2);
        encoder.set_gop(config.gop_length());
        encoder.set_max_b_frames(0);
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);

        let mut opts = Dictionary::new();
        if name.contains("nvenc") {
            opts.set("preset", "p4");
            opts.set("tune", "ll");
            opts.set("rc", "cbr");
            opts.set("zerolatency", "1");
        } else if name == "libx264" || name == "libx265" {
            opts.set("preset", "veryfast");
            opts.set("tune", "zerolatency");
        }
        if config.codec == VideoCodec::H264 {
            opts.set("profile", "main");
        }

        let encoder = encoder
            .open_with(opts)
            .map_err(|e| LivecastError::prepare(format!("Failed to open {}: {}", name, e)))?;

        info!(
            "Video encoder {} opened: {}x{} @ {}fps, {}kbps",
            name,
            width,
            height,
            config.fps,
            config.bitrate / 1000
        );

        let format = FormatDescription {
            codec: config.codec.id(),
            params: TrackParams::Video {
                width,
                height,
                fps: config.fps,
            },
            bitrate: config.bitrate,
            extradata: extradata(&encoder),
        };

        Ok(Self {
            name: name.to_string(),
            encoder,
            frame: Video::new(Pixel::YUV420P, width, height),
            packet: ffmpeg::Packet::empty(),
            pending_format: Some(format),
            force_key: false,
        })
    }

    fn receive(&mut self, out: &mut dyn FnMut(CodecOutput<'_>)) -> Result<()> {
        if let Some(format) = self.pending_format.take() {
            out(CodecOutput::FormatChanged(format));
        }
        loop {
            match self.encoder.receive_packet(&mut self.packet) {
                Ok(()) => out(CodecOutput::Sample {
                    data: self.packet.data().unwrap_or(&[]),
                    pts_us: self.packet.pts().unwrap_or(0).max(0) as u64,
                    key_frame: self.packet.is_key(),
                }),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => {
                    return Err(LivecastError::codec(format!(
                        "{} failed to receive packet: {}",
                        self.name, e
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Codec for FfmpegVideoCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&mut self, data: &[u8], pts_us: u64) -> Result<()> {
        let (w, h) = (self.frame.width() as usize, self.frame.height() as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        if data.len() < w * h + 2 * cw * ch {
            warn!(
                "Short video frame ({} bytes for {}x{}), skipped",
                data.len(),
                w,
                h
            );
            return Ok(());
        }

        let (y, rest) = data.split_at(w * h);
        let (u, v) = rest.split_at(cw * ch);
        for (plane, (src, width, height)) in [(y, w, h), (u, cw, ch), (v, cw, ch)]
            .into_iter()
            .enumerate()
        {
            let stride = self.frame.stride(plane);
            copy_plane(self.frame.data_mut(plane), stride, src, width, height);
        }

        self.frame.set_pts(Some(pts_us as i64));
        let kind = if std::mem::take(&mut self.force_key) {
            picture::Type::I
        } else {
            picture::Type::None
        };
        self.frame.set_kind(kind);

        self.encoder.send_frame(&self.frame).map_err(|e| {
            LivecastError::codec(format!("{} failed to send frame: {}", self.name, e))
        })
    }

    fn drain(&mut self, out: &mut dyn FnMut(CodecOutput<'_>)) -> Result<()> {
        self.receive(out)
    }

    fn request_keyframe(&mut self) -> bool {
        self.force_key = true;
        true
    }

    fn flush(&mut self, out: &mut dyn FnMut(CodecOutput<'_>)) -> Result<()> {
        self.encoder.send_eof()?;
        self.receive(out)
    }
}

/// Audio encoder
struct FfmpegAudioCodec {
    name: String,
    codec: AudioCodec,
    encoder: encoder::Audio,
    frame: Audio,
    packet: ffmpeg::Packet,
    pending_format: Option<FormatDescription>,
    sample_rate: u32,
    channels: usize,
    frame_size: usize,
    /// Interleaved samples not yet encoded
    buffer: Vec<i16>,
    /// Timestamp of the first submitted sample
    origin_us: Option<u64>,
    /// Samples per channel sent to the encoder
    samples_sent: u64,
}

impl FfmpegAudioCodec {
    fn open(config: &AudioConfig) -> Result<Self> {
        let name = config.codec.ffmpeg_encoder();
        let ffcodec = encoder::find_by_name(name)
            .ok_or_else(|| LivecastError::prepare(format!("Audio encoder {} not found", name)))?;

        let mut encoder = codec::context::Context::new_with_codec(ffcodec)
            .encoder()
            .audio()
            .map_err(|e| {
                LivecastError::prepare(format!("Failed to create audio encoder: {}", e))
            })?;

        let channel_layout = if config.stereo {
            ChannelLayout::STEREO
        } else {
            ChannelLayout::MONO
        };
        let format = sample_format(config.codec);

        encoder.set_rate(config.sample_rate as i32);
        encoder.set_bit_rate(config.bitrate as usize);
        encoder.set_format(format);
        encoder.set_time_base(Rational::new(1, config.sample_rate as i32));
        encoder.set_channel_layout(channel_layout);
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);

        let mut opts = Dictionary::new();
        match config.codec {
            AudioCodec::Aac => opts.set("aac_coder", "twoloop"),
            AudioCodec::Opus => {
                opts.set("application", "lowdelay");
                opts.set("vbr", "on");
            }
        }

        let encoder = encoder.open_with(opts).map_err(|e| {
            LivecastError::prepare(format!("Failed to open audio encoder {}: {}", name, e))
        })?;

        let frame_size = match encoder.frame_size() as usize {
            0 => 1024,
            n => n,
        };

        info!(
            "Audio encoder {} opened: {}ch @ {}Hz, {}kbps, frame_size={}",
            name,
            config.channels(),
            config.sample_rate,
            config.bitrate / 1000,
            frame_size
        );

        let description = FormatDescription {
            codec: config.codec.id(),
            params: TrackParams::Audio {
                sample_rate: config.sample_rate,
                channels: config.channels(),
            },
            bitrate: config.bitrate,
            extradata: extradata(&encoder),
        };

        let mut frame = Audio::new(format, frame_size, channel_layout);
        frame.set_rate(config.sample_rate);

        Ok(Self {
            name: name.to_string(),
            codec: config.codec,
            encoder,
            frame,
            packet: ffmpeg::Packet::empty(),
            pending_format: Some(description),
            sample_rate: config.sample_rate,
            channels: config.channels() as usize,
            frame_size,
            buffer: Vec::with_capacity(frame_size * config.channels() as usize * 2),
            origin_us: None,
            samples_sent: 0,
        })
    }

    /// Encode one full codec frame from the head of the buffer
    fn encode_frame(&mut self, samples: &[i16]) -> Result<()> {
        match self.codec {
            AudioCodec::Aac => {
                // Planar float, one plane per channel
                for ch in 0..self.channels {
                    let plane: Vec<f32> = samples
                        .iter()
                        .skip(ch)
                        .step_by(self.channels)
                        .map(|s| *s as f32 / 32768.0)
                        .collect();
                    let bytes: &[u8] = bytemuck::cast_slice(&plane);
                    let data = self.frame.data_mut(ch);
                    let len = data.len().min(bytes.len());
                    data[..len].copy_from_slice(&bytes[..len]);
                }
            }
            AudioCodec::Opus => {
                let bytes: &[u8] = bytemuck::cast_slice(samples);
                let data = self.frame.data_mut(0);
                let len = data.len().min(bytes.len());
                data[..len].copy_from_slice(&bytes[..len]);
            }
        }

        self.frame.set_pts(Some(self.samples_sent as i64));
        self.samples_sent += self.frame_size as u64;

        self.encoder.send_frame(&self.frame).map_err(|e| {
            LivecastError::codec(format!("{} failed to send audio frame: {}", self.name, e))
        })
    }

    fn receive(&mut self, out: &mut dyn FnMut(CodecOutput<'_>)) -> Result<()> {
        if let Some(format) = self.pending_format.take() {
            out(CodecOutput::FormatChanged(format));
        }
        let origin = self.origin_us.unwrap_or(0);
        loop {
            match self.encoder.receive_packet(&mut self.packet) {
                Ok(()) => {
                    let samples = self.packet.pts().unwrap_or(0).max(0) as u64;
                    out(CodecOutput::Sample {
                        data: self.packet.data().unwrap_or(&[]),
                        pts_us: origin + samples * 1_000_000 / self.sample_rate as u64,
                        key_frame: true,
                    })
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => {
                    return Err(LivecastError::codec(format!(
                        "{} failed to receive audio packet: {}",
                        self.name, e
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Codec for FfmpegAudioCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&mut self, data: &[u8], pts_us: u64) -> Result<()> {
        self.origin_us.get_or_insert(pts_us);
        self.buffer.extend(
            data.chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]])),
        );

        let per_frame = self.frame_size * self.channels;
        while self.buffer.len() >= per_frame {
            let samples: Vec<i16> = self.buffer.drain(..per_frame).collect();
            self.encode_frame(&samples)?;
        }
        Ok(())
    }

    fn drain(&mut self, out: &mut dyn FnMut(CodecOutput<'_>)) -> Result<()> {
        self.receive(out)
    }

    fn request_keyframe(&mut self) -> bool {
        // Every audio frame is independently decodable
        true
    }

    fn flush(&mut self, out: &mut dyn FnMut(CodecOutput<'_>)) -> Result<()> {
        if !self.buffer.is_empty() {
            let mut padded = std::mem::take(&mut self.buffer);
            padded.resize(self.frame_size * self.channels, 0);
            self.encode_frame(&padded)?;
        }
        debug!(
            "Flushing audio encoder ({} samples encoded)",
            self.samples_sent
        );
        self.encoder.send_eof()?;
        self.receive(out)
    }
}

/// Sample layout fed to each audio encoder
fn sample_format(codec: AudioCodec) -> Sample {
    match codec {
        AudioCodec::Aac => Sample::F32(sample::Type::Planar),
        AudioCodec::Opus => Sample::I16(sample::Type::Packed),
    }
}

/// Copy a tightly packed plane into a strided frame plane
fn copy_plane(dst: &mut [u8], dst_stride: usize, src: &[u8], width: usize, height: usize) {
    for (dst_row, src_row) in dst
        .chunks_mut(dst_stride)
        .zip(src.chunks(width))
        .take(height)
    {
        let len = width.min(dst_row.len()).min(src_row.len());
        dst_row[..len].copy_from_slice(&src_row[..len]);
    }
}

/// Out-of-band codec configuration of an opened encoder
fn extradata(ctx: &codec::context::Context) -> Bytes {
    // SAFETY: ffmpeg-next has no extradata accessor. The context pointer is
    // valid for the borrow, and FFmpeg guarantees `extradata` points to
    // `extradata_size` bytes when non-null after a successful open.
    unsafe {
        let ptr = ctx.as_ptr();
        let data = (*ptr).extradata;
        let size = (*ptr).extradata_size;
        if data.is_null() || size <= 0 {
            Bytes::new()
        } else {
            Bytes::copy_from_slice(std::slice::from_raw_parts(data, size as usize))
        }
    }
}

/// Check if an FFmpeg encoder is available by name
pub fn codec_available(name: &str) -> bool {
    ffmpeg::init().ok();
    encoder::find_by_name(name).is_some()
}

/// List the FFmpeg encoders this crate can use on this system
pub fn available_encoders() -> Vec<&'static str> {
    let video = [VideoCodec::H264, VideoCodec::H265]
        .into_iter()
        .flat_map(|c| c.candidates(crate::config::CodecPreference::FirstCompatible));
    let audio = [AudioCodec::Aac, AudioCodec::Opus]
        .into_iter()
        .map(|c| c.ffmpeg_encoder());
    video.chain(audio).filter(|name| codec_available(name)).collect()
}
