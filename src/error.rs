//! Error types for Soxy
//!
//! This module defines all custom error types used throughout the proxy.
//! Protocol errors are local to a single session and always terminal for it;
//! transport errors cover dialing, reading and writing on either socket.

use crate::socks::{ReplyField, Side};
use std::io;
use thiserror::Error;

/// Main error type for Soxy operations
#[derive(Error, Debug)]
pub enum SoxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// SOCKS5 protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// SOCKS5 handshake errors raised by the codec and the session state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// First byte of a frame was not 5
    #[error("Invalid SOCKS version: {0}")]
    InvalidVersion(u8),

    /// NMETHODS does not match the number of method bytes supplied
    #[error("Wrong method count: declared {declared}, supplied {supplied}")]
    WrongMethodCount {
        /// Value of the NMETHODS byte
        declared: u8,
        /// Number of method bytes actually present
        supplied: usize,
    },

    /// Method byte outside of NoAuth / GSSAPI / UsernamePassword
    #[error("Unsupported authentication method: {0}")]
    UnsupportedMethod(u8),

    /// Method selection did not offer "no authentication required"
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// CMD byte is not CONNECT, BIND or UDP ASSOCIATE
    #[error("Invalid command: {0}")]
    InvalidCommand(u8),

    /// ATYP byte is not IPv4, domain name or IPv6
    #[error("Invalid address type: {0}")]
    InvalidAddressType(u8),

    /// Domain name is empty or not ASCII
    #[error("Malformed domain name")]
    MalformedDomainName,

    /// Frame is truncated or otherwise unusable
    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),
}

/// Errors on the sockets a session owns
#[derive(Error, Debug)]
pub enum TransportError {
    /// Outbound connect to the target or the upstream proxy failed
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        /// `host:port` that was dialed
        addr: String,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },

    /// Read failure
    #[error("Read failed on {side} socket: {source}")]
    Read {
        /// Socket the read was issued on
        side: Side,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },

    /// Write failure
    #[error("Write failed on {side} socket: {source}")]
    Write {
        /// Socket the write was issued on
        side: Side,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },

    /// Peer closed the socket in the middle of a frame
    #[error("{0} socket disconnected")]
    UnexpectedDisconnect(Side),

    /// Upstream proxy answered the forwarded request with a failure
    #[error("Upstream proxy rejected the request: {0:?}")]
    UpstreamRejected(ReplyField),
}

impl TransportError {
    /// Classify a read error, mapping EOF to a disconnect
    pub fn read(side: Side, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::UnexpectedEof {
            TransportError::UnexpectedDisconnect(side)
        } else {
            TransportError::Read { side, source }
        }
    }

    /// Reply code matching a failed outbound connect
    pub fn reply_field(&self) -> Option<ReplyField> {
        match self {
            TransportError::Connect { source, .. } => Some(ReplyField::from(source)),
            TransportError::UpstreamRejected(field) => Some(*field),
            _ => None,
        }
    }
}

/// Error type for a single session run
#[derive(Error, Debug)]
pub enum SessionError {
    /// Handshake rejected
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Socket failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<SessionError> for SoxyError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Protocol(e) => SoxyError::Protocol(e),
            SessionError::Transport(e) => SoxyError::Transport(e),
        }
    }
}
