//! Stream endpoint parsing
//!
//! Endpoints follow `scheme://[user:password@]host[:port]/application[/streamName]`.
//! The scheme selects the protocol variant and whether TLS is used. IPv6
//! hosts are bracketed: `rtmp://[::1]:1935/live/key`.

use tracing::debug;

use super::transport::Credentials;
use crate::error::{LivecastError, Result};

/// Failure reason prefix for endpoints that cannot be parsed
pub const MALFORMED_ENDPOINT: &str = "Endpoint malformed";

/// Streaming protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// RTSP/RTP
    Rtsp,
    /// RTMP
    Rtmp,
    /// SRT with MPEG-TS payload
    Srt,
}

impl Protocol {
    /// Protocol and TLS flag for a URL scheme
    pub fn from_scheme(scheme: &str) -> Option<(Self, bool)> {
        match scheme.to_lowercase().as_str() {
            "rtsp" => Some((Self::Rtsp, false)),
            "rtsps" => Some((Self::Rtsp, true)),
            "rtmp" => Some((Self::Rtmp, false)),
            "rtmps" => Some((Self::Rtmp, true)),
            "srt" => Some((Self::Srt, false)),
            _ => None,
        }
    }

    /// Port used when the URL does not name one
    pub fn default_port(&self, tls: bool) -> u16 {
        match (self, tls) {
            (Self::Rtsp, false) => 554,
            (Self::Rtmp, false) => 1935,
            (Self::Rtsp | Self::Rtmp, true) => 443,
            (Self::Srt, _) => 8888,
        }
    }

    /// Example URL shown in malformed-endpoint failures
    pub fn url_hint(&self) -> &'static str {
        match self {
            Self::Rtsp => "rtsp://ip:port/appname/streamname",
            Self::Rtmp => "rtmp://ip:port/appname/streamname",
            Self::Srt => "srt://ip:port/appname/streamname",
        }
    }

    /// FFmpeg container used on the wire
    pub fn format_name(&self) -> &'static str {
        match self {
            Self::Rtsp => "rtsp",
            Self::Rtmp => "flv",
            Self::Srt => "mpegts",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rtsp => write!(f, "RTSP"),
            Self::Rtmp => write!(f, "RTMP"),
            Self::Srt => write!(f, "SRT"),
        }
    }
}

/// A parsed stream endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Protocol variant
    pub protocol: Protocol,
    /// Secure transport requested (`rtsps`, `rtmps`)
    pub tls: bool,
    /// Credentials embedded in the URL
    pub credentials: Option<Credentials>,
    /// Server host, without brackets for IPv6
    pub host: String,
    /// Server port (explicit or protocol default)
    pub port: u16,
    /// Application name
    pub app: String,
    /// Stream name, possibly empty
    pub stream_name: String,
    /// URL as given
    pub url: String,
}

impl Endpoint {
    /// Parse `url`
    ///
    /// Fails with a connection error starting with [`MALFORMED_ENDPOINT`].
    pub fn parse(url: &str) -> Result<Self> {
        let malformed = |hint: &str| {
            LivecastError::connection(format!("{}, should be: {}", MALFORMED_ENDPOINT, hint))
        };

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| malformed("scheme://ip:port/appname/streamname"))?;
        let (protocol, tls) = Protocol::from_scheme(scheme)
            .ok_or_else(|| malformed("rtsp://, rtmp:// or srt:// URL"))?;
        let hint = protocol.url_hint();

        let (authority, path) = rest.split_once('/').ok_or_else(|| malformed(hint))?;
        let (userinfo, authority) = match authority.rsplit_once('@') {
            Some((userinfo, host)) => (Some(userinfo), host),
            None => (None, authority),
        };
        let credentials = userinfo.map(|userinfo| {
            let (user, password) = userinfo.split_once(':').unwrap_or((userinfo, ""));
            Credentials {
                user: user.to_string(),
                password: password.to_string(),
            }
        });

        let (host, port) = match authority.strip_prefix('[') {
            Some(bracketed) => {
                let (host, tail) = bracketed.split_once(']').ok_or_else(|| malformed(hint))?;
                match tail {
                    "" => (host, None),
                    _ => (host, Some(tail.strip_prefix(':').ok_or_else(|| malformed(hint))?)),
                }
            }
            None => match authority.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            },
        };
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| malformed(hint))?,
            None => protocol.default_port(tls),
        };
        if host.is_empty() || port == 0 {
            return Err(malformed(hint));
        }

        let (app, stream_name) = match path.split_once('/') {
            Some((app, stream)) => (app, stream),
            None => (path, ""),
        };
        if app.is_empty() || stream_name.contains('*') {
            return Err(malformed(hint));
        }

        let endpoint = Self {
            protocol,
            tls,
            credentials,
            host: host.to_string(),
            port,
            app: app.to_string(),
            stream_name: stream_name.trim_end_matches('/').to_string(),
            url: url.to_string(),
        };
        debug!(
            "Parsed {} endpoint {}:{} app={}",
            protocol, endpoint.host, endpoint.port, endpoint.app
        );
        Ok(endpoint)
    }

    /// Path component: `/app[/streamName]`
    pub fn path(&self) -> String {
        if self.stream_name.is_empty() {
            format!("/{}", self.app)
        } else {
            format!("/{}/{}", self.app, self.stream_name)
        }
    }

    /// URL with the stream name masked, for logging
    pub fn safe_url(&self) -> String {
        safe_url(&self.url)
    }
}

/// Mask the stream key in a URL for safe logging
pub fn safe_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    // Credentials in the authority are masked too
    let rest = match rest.split_once('@') {
        Some((_, tail)) if !tail.is_empty() => format!("****@{}", tail),
        _ => rest.to_string(),
    };
    match rest.find('/').and_then(|first| rest[first + 1..].find('/').map(|i| first + 1 + i)) {
        Some(idx) if idx + 1 < rest.len() => format!("{}://{}****", scheme, &rest[..=idx]),
        _ => format!("{}://{}", scheme, rest),
    }
}

/// Whether a failure reason may be retried
pub fn is_retriable(reason: &str) -> bool {
    !reason.contains(MALFORMED_ENDPOINT)
}
