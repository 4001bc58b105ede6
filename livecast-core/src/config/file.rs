//! Configuration file loading
//!
//! Loads user configuration from `~/.config/livecast/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{AudioConfig, SessionConfig, TransportMode, VideoConfig};
use crate::error::{LivecastError, Result};

/// Configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Video encoder settings
    #[serde(default)]
    pub video: VideoSettings,

    /// Audio encoder settings
    #[serde(default)]
    pub audio: AudioSettings,

    /// Stream settings
    #[serde(default)]
    pub stream: StreamSettings,

    /// Record settings
    #[serde(default)]
    pub record: RecordSettings,
}

/// Video encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSettings {
    /// Output preset (e.g., "480p30", "1280x720@30")
    #[serde(default = "default_preset")]
    pub preset: String,

    /// Video codec (h264, h265)
    #[serde(default = "default_video_codec")]
    pub codec: String,

    /// Bitrate in kbps (0 = automatic based on preset)
    #[serde(default)]
    pub bitrate: u32,

    /// Codec preference (first_compatible, hardware, software)
    #[serde(default = "default_preference")]
    pub preference: String,

    /// Seconds between key frames
    #[serde(default = "default_iframe_interval")]
    pub iframe_interval: u32,
}

/// Audio encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Enable audio
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Audio codec (aac, opus)
    #[serde(default = "default_audio_codec")]
    pub codec: String,

    /// Bitrate in kbps
    #[serde(default = "default_audio_bitrate")]
    pub bitrate: u32,

    /// Sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Stereo (true) or mono
    #[serde(default = "default_true")]
    pub stereo: bool,
}

/// Stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Transport mode (tcp, udp)
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Reconnect attempts (0 = unlimited)
    #[serde(default)]
    pub retries: u32,

    /// Delay between reconnect attempts in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Encoded samples buffered for sending
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Optional backup URL used when reconnecting
    #[serde(default)]
    pub backup_url: Option<String>,
}

/// Record settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSettings {
    /// Directory for recordings (empty = current directory)
    #[serde(default)]
    pub directory: String,

    /// Container extension (mp4, mkv, ts)
    #[serde(default = "default_container")]
    pub container: String,
}

fn default_preset() -> String {
    "480p30".to_string()
}

fn default_video_codec() -> String {
    "h264".to_string()
}

fn default_preference() -> String {
    "first_compatible".to_string()
}

fn default_iframe_interval() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_audio_bitrate() -> u32 {
    64
}

fn default_sample_rate() -> u32 {
    32000
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_retry_delay() -> u64 {
    5000
}

fn default_cache_size() -> usize {
    200
}

fn default_container() -> String {
    "mp4".to_string()
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            preset: default_preset(),
            codec: default_video_codec(),
            bitrate: 0,
            preference: default_preference(),
            iframe_interval: default_iframe_interval(),
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            codec: default_audio_codec(),
            bitrate: default_audio_bitrate(),
            sample_rate: default_sample_rate(),
            stereo: true,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            retries: 0,
            retry_delay_ms: default_retry_delay(),
            cache_size: default_cache_size(),
            backup_url: None,
        }
    }
}

impl Default for RecordSettings {
    fn default() -> Self {
        Self {
            directory: String::new(),
            container: default_container(),
        }
    }
}

impl ConfigFile {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("livecast").join("config.toml")
        } else if let Some(home) = dirs::home_dir() {
            home.join(".config").join("livecast").join("config.toml")
        } else {
            PathBuf::from("/etc/livecast/config.toml")
        }
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| LivecastError::Config(format!("Failed to read config file: {}", e)))?;

        let config: ConfigFile = toml::from_str(&content)?;

        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load configuration, logging warnings but returning defaults on error
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load config file: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to(Self::default_path())
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LivecastError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)?;

        std::fs::write(&path, content)
            .map_err(|e| LivecastError::Config(format!("Failed to write config file: {}", e)))?;

        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Create a default config file if it doesn't exist
    pub fn create_default_if_missing() -> Result<bool> {
        let path = Self::default_path();
        if path.exists() {
            return Ok(false);
        }

        std::fs::create_dir_all(path.parent().unwrap_or(&path))?;
        std::fs::write(&path, sample_config())?;
        info!("Created default configuration at {:?}", path);
        Ok(true)
    }

    /// Build the video encoder configuration
    pub fn video_config(&self) -> Result<VideoConfig> {
        let preset = self.video.preset.parse().map_err(LivecastError::config)?;
        let mut config = VideoConfig::from_preset(preset)
            .with_codec(self.video.codec.parse().map_err(LivecastError::config)?)
            .with_preference(self.video.preference.parse().map_err(LivecastError::config)?);
        if self.video.bitrate > 0 {
            config.bitrate = self.video.bitrate * 1000;
        }
        config.iframe_interval = self.video.iframe_interval;
        Ok(config)
    }

    /// Build the audio encoder configuration, `None` when audio is disabled
    pub fn audio_config(&self) -> Result<Option<AudioConfig>> {
        if !self.audio.enabled {
            return Ok(None);
        }
        Ok(Some(
            AudioConfig::default()
                .with_codec(self.audio.codec.parse().map_err(LivecastError::config)?)
                .with_bitrate(self.audio.bitrate * 1000)
                .with_sample_rate(self.audio.sample_rate)
                .with_stereo(self.audio.stereo),
        ))
    }

    /// Build the session configuration
    pub fn session_config(&self) -> Result<SessionConfig> {
        let transport: TransportMode = self
            .stream
            .transport
            .parse()
            .map_err(LivecastError::config)?;
        let mut config = SessionConfig::default()
            .with_transport_mode(transport)
            .with_send_cache_size(self.stream.cache_size);
        if self.stream.retries > 0 {
            config = config.with_retries(self.stream.retries);
        }
        Ok(config)
    }

    /// Delay between reconnect attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.stream.retry_delay_ms)
    }
}

/// Generate a sample configuration file
pub fn sample_config() -> String {
    r#"# livecast configuration

[video]
# Output preset: 480p30, 720p30, 720p60, 1080p30, 1080p60, or WIDTHxHEIGHT@FPS
preset = "480p30"

# Video codec: h264, h265
codec = "h264"

# Bitrate in kbps (0 = automatic based on preset)
bitrate = 0

# Codec preference: first_compatible, hardware, software
preference = "first_compatible"

# Seconds between key frames
iframe_interval = 2

[audio]
enabled = true

# Audio codec: aac, opus
codec = "aac"

# Bitrate in kbps
bitrate = 64

# Sample rate in Hz (opus needs 8000, 12000, 16000, 24000 or 48000)
sample_rate = 32000

stereo = true

[stream]
# Transport mode: tcp, udp
transport = "tcp"

# Reconnect attempts (0 = unlimited)
retries = 0

# Delay between reconnect attempts in milliseconds
retry_delay_ms = 5000

# Encoded samples buffered for sending
cache_size = 200

# backup_url = "rtmp://backup.example.com/live/key"

[record]
# Directory for recordings (empty = current directory)
directory = ""

# Container: mp4, mkv, ts
container = "mp4"
"#
    .to_string()
}
