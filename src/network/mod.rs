//! Network module - Handles TCP communication between caller and server
//!
//! Provides:
//! - Connection wrapper shared by the RPC envelope and the raw
//!   bytestream sub-protocols
//! - RPC client opening one connection per outbound call
//! - Sequential pipe server (accept, dispatch, close, repeat)

mod client;
mod connection;
mod server;

pub use client::*;
pub use connection::*;
pub use server::*;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{DEFAULT_ADDRESS, DEFAULT_PORT};

/// The default connection target: an address and a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Raised locally when a communicator channel kind is not supported;
/// no network round trip happens.
#[derive(Error, Debug)]
#[error("unsupported channel kind '{0}'")]
pub struct UnsupportedChannelKind(pub String);

/// How a custom-communicator connection is driven after the handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Raw byte stream, caller-defined wire format.
    Binary,
    /// Length-prefixed JSON frames, as on the control channel.
    Json,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Binary => "binary",
            ChannelKind::Json => "json",
        }
    }
}

impl FromStr for ChannelKind {
    type Err = UnsupportedChannelKind;

    fn from_str(kind: &str) -> Result<Self, Self::Err> {
        match kind {
            "binary" => Ok(ChannelKind::Binary),
            "json" => Ok(ChannelKind::Json),
            other => Err(UnsupportedChannelKind(other.to_string())),
        }
    }
}

/// A connection whose ownership has passed to a communicator, wrapped
/// according to the negotiated channel kind.
#[derive(Debug)]
pub enum CommunicatorChannel {
    Binary(Connection),
    Json(Connection),
}

impl CommunicatorChannel {
    pub fn wrap(kind: ChannelKind, conn: Connection) -> Self {
        match kind {
            ChannelKind::Binary => CommunicatorChannel::Binary(conn),
            ChannelKind::Json => CommunicatorChannel::Json(conn),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            CommunicatorChannel::Binary(_) => ChannelKind::Binary,
            CommunicatorChannel::Json(_) => ChannelKind::Json,
        }
    }

    pub fn into_connection(self) -> Connection {
        match self {
            CommunicatorChannel::Binary(conn) | CommunicatorChannel::Json(conn) => conn,
        }
    }
}

/// A user-registered handler granted permanent ownership of a connection
/// after negotiation. It may keep the connection open indefinitely and
/// run an arbitrary sub-protocol.
#[async_trait]
pub trait Communicator: Send + Sync {
    async fn run(&self, channel: CommunicatorChannel);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint::new("10.0.0.2", 4455);
        assert_eq!(endpoint.to_string(), "10.0.0.2:4455");
        assert_eq!(Endpoint::default().port, DEFAULT_PORT);
    }

    #[test]
    fn test_channel_kind_parsing() {
        assert_eq!("binary".parse::<ChannelKind>().unwrap(), ChannelKind::Binary);
        assert_eq!("json".parse::<ChannelKind>().unwrap(), ChannelKind::Json);
        assert!("msgpack".parse::<ChannelKind>().is_err());
    }
}
