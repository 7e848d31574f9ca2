//! SOCKS5 server
//!
//! Accepts clients, runs each one as its own task and keeps the registry of
//! live sessions. The registry is only touched from the accept loop: session
//! tasks report their end over a channel instead of reaching into it.

mod registry;

pub use registry::{Registry, SessionHandle, SessionId};

use crate::config::{ServerConfig, UpstreamConfig};
use crate::socks::Connection;
use crate::transport::{Dialer, SocketOpts, TcpDialer};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Pause after a failed accept, so descriptor exhaustion does not spin
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Sends the session's close notification when dropped, so a panicking
/// session task still leaves the registry
struct CloseNotifier {
    id: SessionId,
    closed_tx: mpsc::UnboundedSender<SessionId>,
}

impl Drop for CloseNotifier {
    fn drop(&mut self) {
        let _ = self.closed_tx.send(self.id);
    }
}

/// SOCKS5 proxy server
pub struct Server<D: Dialer = TcpDialer> {
    listener: TcpListener,
    dialer: Arc<D>,
    upstream: Option<UpstreamConfig>,
    socket_opts: SocketOpts,
    registry: Registry,
    live: watch::Sender<usize>,
}

impl Server<TcpDialer> {
    /// Bind the listener, dialing outbound sockets over plain TCP
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let socket_opts = SocketOpts::from_tcp_config(&config.tcp);
        Self::with_dialer(config, Arc::new(TcpDialer::new(socket_opts))).await
    }
}

impl<D: Dialer> Server<D> {
    /// Bind the listener with a custom dialer
    pub async fn with_dialer(config: &ServerConfig, dialer: Arc<D>) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind((config.listen_addr.as_str(), config.port))
            .await
            .with_context(|| {
                format!("Failed to listen on {}:{}", config.listen_addr, config.port)
            })?;
        let (live, _) = watch::channel(0);

        Ok(Server {
            listener,
            dialer,
            upstream: config.upstream.clone(),
            socket_opts: SocketOpts::from_tcp_config(&config.tcp),
            registry: Registry::new(),
            live,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Upstream proxy sessions are chained through, if any
    pub fn upstream(&self) -> Option<&UpstreamConfig> {
        self.upstream.as_ref()
    }

    /// Watch the number of live sessions
    pub fn subscribe_live(&self) -> watch::Receiver<usize> {
        self.live.subscribe()
    }

    /// Accept clients until shutdown, then disconnect every live session
    /// and wait for them to report closed
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        info!("Listening on {}", self.local_addr()?);
        match &self.upstream {
            Some(upstream) => info!("Chaining through upstream proxy {}", upstream),
            None => info!("Connecting to targets directly"),
        }

        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer, closed_tx.clone()),
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    }
                },
                Some(id) = closed_rx.recv() => self.on_session_closed(id),
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        drop(closed_tx);
        let asked = self.registry.disconnect_all();
        if asked > 0 {
            info!("Disconnecting {} live sessions", asked);
        }
        while !self.registry.is_empty() {
            match closed_rx.recv().await {
                Some(id) => self.on_session_closed(id),
                None => break,
            }
        }

        info!("Server stopped");
        Ok(())
    }

    fn spawn_session(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        closed_tx: mpsc::UnboundedSender<SessionId>,
    ) {
        self.socket_opts.hint(&stream);

        let (id, cancel) = self.registry.register(peer);
        self.live.send_replace(self.registry.len());
        info!("Accepted session {} from {}", id, peer);

        let conn = Connection::new(stream, self.dialer.clone(), self.upstream.clone());
        let span = info_span!("session", id = %id, peer = %peer);

        tokio::spawn(
            async move {
                let _notifier = CloseNotifier { id, closed_tx };
                match conn.run(cancel).await {
                    Ok(Some(stats)) => info!(
                        "Session closed by {}: {} bytes up, {} bytes down",
                        stats.closed_by, stats.client_to_outbound, stats.outbound_to_client
                    ),
                    Ok(None) => debug!("Session closed before relaying"),
                    Err(e) => warn!("Session failed: {}", e),
                }
            }
            .instrument(span),
        );
    }

    fn on_session_closed(&mut self, id: SessionId) {
        if self.registry.on_session_closed(id) {
            self.live.send_replace(self.registry.len());
        }
    }
}
