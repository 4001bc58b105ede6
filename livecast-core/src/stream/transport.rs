//! Transport seam
//!
//! A [`Transport`] performs one protocol's handshake and packet framing
//! over one connection attempt. The [`super::ProtocolClient`] owns the
//! state machine around it.

use super::Endpoint;
use super::endpoint::Protocol;
use crate::config::TransportMode;
use crate::error::Result;
use crate::types::{FormatDescription, OwnedSample};

/// Track formats known when the handshake starts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaInfo {
    /// Video format with parameter sets, when video is sent
    pub video: Option<FormatDescription>,
    /// Audio format, when audio is sent
    pub audio: Option<FormatDescription>,
}

/// Handshake outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Server accepted the session
    Ready,
    /// Server demands credentials before accepting
    AuthRequired,
}

/// User credentials for servers that require them
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name
    pub user: String,
    /// Password
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"****")
            .finish()
    }
}

/// One connection attempt to a streaming server
///
/// Called only from the client's connection thread.
pub trait Transport: Send {
    /// Connect and negotiate the session
    fn handshake(
        &mut self,
        endpoint: &Endpoint,
        media: &MediaInfo,
        mode: TransportMode,
    ) -> Result<Handshake>;

    /// Retry the handshake with credentials; false if rejected
    fn authenticate(&mut self, credentials: &Credentials) -> Result<bool>;

    /// Frame and send one sample
    fn send(&mut self, sample: &OwnedSample) -> Result<()>;

    /// Tear down the session; must not fail
    fn close(&mut self);
}

/// Creates transports for a protocol
pub trait TransportFactory: Send + Sync {
    /// Create an unconnected transport
    fn create(&self, protocol: Protocol) -> Result<Box<dyn Transport>>;
}
