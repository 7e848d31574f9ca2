//! Transport module for Soxy
//!
//! Outbound dialing abstraction used by sessions, plus the socket options
//! applied to every TCP socket the proxy owns.

mod tcp;

pub use tcp::TcpDialer;

use crate::config::TcpConfig;
use async_trait::async_trait;
use std::fmt::Debug;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Socket options for configuring connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Create socket options from TCP config
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        SocketOpts {
            nodelay: config.nodelay,
            keepalive_secs: Some(config.keepalive_secs),
            keepalive_interval: Some(config.keepalive_interval),
        }
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }

    /// Apply options, logging instead of failing
    pub fn hint(&self, stream: &TcpStream) {
        if let Err(e) = self.apply(stream) {
            tracing::warn!("Failed to apply socket options: {}", e);
        }
    }
}

/// Opens the outbound socket of a session
///
/// A session dials exactly once, either the requested target or the
/// upstream proxy. Tests plug in in-memory streams here.
#[async_trait]
pub trait Dialer: Debug + Send + Sync + 'static {
    /// The stream type produced by this dialer
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + Debug + 'static;

    /// Connect to `host:port`; `host` is a domain name or a textual IP
    async fn connect(&self, host: &str, port: u16) -> io::Result<Self::Stream>;
}
