//! Error types.
//!
//! Proxy errors stay local to the connection that produced them; the handler
//! turns them into the response the client sees (if any) and closes the
//! socket. Interface and service errors surface to whoever called
//! [`Service::start`](crate::Service::start).

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::http::{RESPONSE_400, RESPONSE_502};

/// Per-connection failures.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed request line or header block.
    #[error("malformed request: {0}")]
    Parse(String),

    /// Request target has no usable host or port.
    #[error("invalid target {0:?}")]
    InvalidTarget(String),

    /// DNS resolution, refusal or timeout while dialing upstream.
    #[error("failed to connect to {addr}: {source}")]
    UpstreamConnect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Upstream failed before any response byte reached the client.
    #[error("upstream I/O error: {0}")]
    UpstreamIo(#[source] io::Error),

    /// Failure after the response had started streaming.
    #[error("relay I/O error: {0}")]
    Relay(#[source] io::Error),

    /// Client went away or stalled while the request was being read.
    #[error("client I/O error: {0}")]
    Client(#[source] io::Error),
}

impl ProxyError {
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse(reason.into())
    }

    pub fn upstream_connect(addr: impl Into<String>, source: io::Error) -> Self {
        Self::UpstreamConnect {
            addr: addr.into(),
            source,
        }
    }

    /// Whether an upstream connection was up when this error happened, i.e.
    /// a relay session took place.
    #[must_use]
    pub fn reached_upstream(&self) -> bool {
        matches!(self, Self::UpstreamIo(_) | Self::Relay(_))
    }

    /// The locally generated response owed to the client for this error.
    ///
    /// CONNECT failures never produce a response: the client only ever sees
    /// the success line or a closed socket.
    #[must_use]
    pub fn response(&self, connect: bool) -> Option<&'static [u8]> {
        match self {
            Self::Parse(_) => Some(RESPONSE_400),
            Self::InvalidTarget(_) | Self::UpstreamConnect { .. } | Self::UpstreamIo(_)
                if !connect =>
            {
                Some(RESPONSE_502)
            }
            _ => None,
        }
    }
}

/// Tunnel interface setup and runtime failures.
#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("invalid interface configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to create tunnel device {name}: {reason}")]
    Create { name: String, reason: String },

    #[error("failed to install route {route} on {name}: {reason}")]
    Route {
        name: String,
        route: String,
        reason: String,
    },

    #[error("interface I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures surfaced by the lifecycle controller.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to bind proxy listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Interface(#[from] InterfaceError),

    #[error("lifecycle task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
