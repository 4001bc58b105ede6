//! Error types for livecast

use thiserror::Error;

/// Result type alias using LivecastError
pub type Result<T> = std::result::Result<T, LivecastError>;

/// Main error type for livecast operations
#[derive(Debug, Error)]
pub enum LivecastError {
    /// Codec configuration rejected or no compatible codec found
    #[error("Prepare error: {0}")]
    Prepare(String),

    /// Codec failed while encoding
    #[error("Codec runtime error: {0}")]
    CodecRuntime(String),

    /// Transport or handshake failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Credentials rejected by the server
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Transport failure while streaming
    #[error("Send error: {0}")]
    Send(String),

    /// Recording destination could not be opened or written
    #[error("Record I/O error: {0}")]
    RecordIo(String),

    /// Capture device could not be opened
    #[error("Device open error: {0}")]
    DeviceOpen(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unsupported operation
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<LivecastError>,
    },
}

impl LivecastError {
    /// Create a prepare error
    pub fn prepare(msg: impl Into<String>) -> Self {
        Self::Prepare(msg.into())
    }

    /// Create a codec runtime error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::CodecRuntime(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a send error
    pub fn send(msg: impl Into<String>) -> Self {
        Self::Send(msg.into())
    }

    /// Create a record I/O error
    pub fn record_io(msg: impl Into<String>) -> Self {
        Self::RecordIo(msg.into())
    }

    /// Create a device open error
    pub fn device_open(msg: impl Into<String>) -> Self {
        Self::DeviceOpen(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context wrappers
    pub fn root(&self) -> &LivecastError {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Suggestion for the user, if one applies
    pub fn user_hint(&self) -> Option<&'static str> {
        match self.root() {
            Self::Prepare(_) => {
                Some("Try a lower resolution, frame rate or bitrate, or another codec preference")
            }
            Self::Connection(_) => Some(
                "Check the stream URL (scheme://host:port/application/streamName) and that the server is reachable",
            ),
            Self::Auth(_) => Some("Check the user and password set with set_authorization"),
            Self::RecordIo(_) => Some("Check that the recording directory exists and is writable"),
            Self::DeviceOpen(_) => {
                Some("Check that the camera or microphone exists and is not used by another application")
            }
            Self::Config(_) => Some("Check your config.toml (livecast config path)"),
            _ => None,
        }
    }

    /// Whether the user can fix this without code changes
    pub fn is_user_recoverable(&self) -> bool {
        matches!(
            self.root(),
            Self::Prepare(_)
                | Self::Connection(_)
                | Self::Auth(_)
                | Self::RecordIo(_)
                | Self::DeviceOpen(_)
                | Self::Config(_)
        )
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}

// Conversions from external error types

impl From<toml::de::Error> for LivecastError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("Failed to parse config file: {}", err))
    }
}

impl From<toml::ser::Error> for LivecastError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Config(format!("Failed to serialize config: {}", err))
    }
}

#[cfg(feature = "ffmpeg")]
impl From<ffmpeg_next::Error> for LivecastError {
    fn from(err: ffmpeg_next::Error) -> Self {
        Self::CodecRuntime(err.to_string())
    }
}
