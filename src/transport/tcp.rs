//! TCP dialer
//!
//! Plain TCP connections to targets and upstream proxies.

use super::{Dialer, SocketOpts};
use async_trait::async_trait;
use std::io;
use tokio::net::TcpStream;
use tracing::debug;

/// Dials outbound sockets over plain TCP
///
/// No connect timeout is applied; a silent peer holds the session until
/// the OS gives up.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    /// Socket options to apply to connections
    socket_opts: SocketOpts,
}

impl TcpDialer {
    /// Create a dialer applying the given socket options
    pub fn new(socket_opts: SocketOpts) -> Self {
        TcpDialer { socket_opts }
    }

    /// Socket options applied after connect
    pub fn socket_opts(&self) -> &SocketOpts {
        &self.socket_opts
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((host, port)).await?;
        self.socket_opts.hint(&stream);

        debug!(
            "TCP connection established to {}",
            stream.peer_addr().map(|a| a.to_string()).unwrap_or_default()
        );

        Ok(stream)
    }
}
