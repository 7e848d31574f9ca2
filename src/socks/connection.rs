//! Connection driver
//!
//! Owns the sockets of one session and performs the [`Action`]s its
//! [`Session`] asks for, feeding the outcome of each back as an [`Event`].
//! Actions run strictly in order, so a write always completes before the
//! next read on the same session is issued.

use super::codec::*;
use super::relay::{relay, RelayStats};
use super::session::{Action, Event, FrameKind, Phase, Session, Side};
use crate::config::UpstreamConfig;
use crate::error::{SessionError, TransportError};
use crate::transport::Dialer;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// One accepted client and, once dialed, its outbound socket
pub struct Connection<S, D: Dialer> {
    client: S,
    outbound: Option<D::Stream>,
    dialer: Arc<D>,
    session: Session,
}

impl<S, D> Connection<S, D>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    D: Dialer,
{
    /// Wrap an accepted client; `upstream` selects chaining mode
    pub fn new(client: S, dialer: Arc<D>, upstream: Option<UpstreamConfig>) -> Self {
        Connection {
            client,
            outbound: None,
            dialer,
            session: Session::new(upstream),
        }
    }

    /// Current phase of the session
    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    /// Run the session to completion
    ///
    /// Returns the relay statistics when the session reached the relay
    /// phase, `None` when it ended earlier or was disconnected through
    /// `cancel`. Both sockets are shut down before this returns, whatever
    /// the outcome.
    pub async fn run(
        mut self,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<Option<RelayStats>, SessionError> {
        let result = tokio::select! {
            result = self.drive() => result,
            Ok(()) = &mut cancel => {
                debug!("Session disconnected by server");
                Ok(None)
            }
        };

        self.close().await;
        result
    }

    async fn drive(&mut self) -> Result<Option<RelayStats>, SessionError> {
        let mut pending: VecDeque<Action> = self.session.start().into();

        while let Some(action) = pending.pop_front() {
            let event = match action {
                Action::Read { side, kind } => match self.read_frame(side, kind).await {
                    Ok(bytes) => Event::Frame { side, bytes },
                    Err(SessionError::Transport(TransportError::UnexpectedDisconnect(side))) => {
                        Event::Disconnected { side }
                    }
                    Err(e) => return Err(e),
                },
                Action::Write { side, bytes, tag } => {
                    self.write_frame(side, &bytes).await?;
                    Event::Written { side, tag }
                }
                Action::Dial(target) => {
                    debug!("Dialing {}", target);
                    let stream = match self.dialer.connect(target.host(), target.port()).await {
                        Ok(stream) => stream,
                        Err(source) => {
                            let err = TransportError::Connect {
                                addr: target.to_string(),
                                source,
                            };
                            if let Some(field) = err.reply_field() {
                                // The client already holds a success reply.
                                warn!("Dial to {} failed: {:?}", target, field);
                            }
                            return Err(err.into());
                        }
                    };
                    self.outbound = Some(stream);
                    Event::Connected
                }
                Action::Relay => {
                    let outbound = self
                        .outbound
                        .as_mut()
                        .ok_or(TransportError::UnexpectedDisconnect(Side::Outbound))?;
                    if let Some(request) = self.session.request() {
                        info!("SOCKS5 tunnel established: {}", request);
                    }
                    let stats = relay(&mut self.client, outbound).await;
                    self.session.close();
                    return Ok(Some(stats));
                }
                Action::Close => return Ok(None),
            };

            pending.extend(self.session.handle(event)?);
        }

        Ok(None)
    }

    async fn read_frame(&mut self, side: Side, kind: FrameKind) -> Result<Bytes, SessionError> {
        match side {
            Side::Client => read_frame_from(&mut self.client, side, kind).await,
            Side::Outbound => {
                let stream = self
                    .outbound
                    .as_mut()
                    .ok_or(TransportError::UnexpectedDisconnect(side))?;
                read_frame_from(stream, side, kind).await
            }
        }
    }

    async fn write_frame(&mut self, side: Side, bytes: &[u8]) -> Result<(), TransportError> {
        let result = match side {
            Side::Client => self.client.write_all(bytes).await,
            Side::Outbound => match self.outbound.as_mut() {
                Some(stream) => stream.write_all(bytes).await,
                None => return Err(TransportError::UnexpectedDisconnect(side)),
            },
        };
        result.map_err(|source| TransportError::Write { side, source })
    }

    /// Shut both sockets down; safe to call more than once
    async fn close(&mut self) {
        self.session.close();
        let _ = self.client.shutdown().await;
        if let Some(mut outbound) = self.outbound.take() {
            let _ = outbound.shutdown().await;
        }
    }
}

async fn read_frame_from<R>(reader: &mut R, side: Side, kind: FrameKind) -> Result<Bytes, SessionError>
where
    R: AsyncRead + Unpin,
{
    match kind {
        FrameKind::MethodSelection => read_method_selection(reader, side).await,
        FrameKind::MethodSelectionReply => read_method_selection_reply(reader, side).await,
        FrameKind::ConnectRequest => read_connect_request(reader, side).await,
        FrameKind::ConnectReply => read_connect_reply(reader, side).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::socks::ReplyField;
    use async_trait::async_trait;
    use std::io;
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    const REQUEST: &[u8] = &[5, 1, 0, 1, 10, 0, 0, 1, 0, 80];
    const SUCCESS_REPLY: &[u8] = &[5, 0, 0, 1, 10, 0, 0, 1, 0, 80];

    /// Hands out one pre-made stream, or refuses when it has none
    #[derive(Debug, Default)]
    struct MockDialer {
        stream: Mutex<Option<DuplexStream>>,
        dialed: Mutex<Vec<(String, u16)>>,
    }

    impl MockDialer {
        fn with_stream(stream: DuplexStream) -> Arc<Self> {
            Arc::new(MockDialer {
                stream: Mutex::new(Some(stream)),
                dialed: Mutex::new(Vec::new()),
            })
        }

        fn refusing() -> Arc<Self> {
            Arc::new(MockDialer::default())
        }

        fn dialed(&self) -> Vec<(String, u16)> {
            self.dialed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dialer for MockDialer {
        type Stream = DuplexStream;

        async fn connect(&self, host: &str, port: u16) -> io::Result<DuplexStream> {
            self.dialed.lock().unwrap().push((host.to_string(), port));
            self.stream
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    async fn handshake(client: &mut DuplexStream) {
        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [5, 0]);

        client.write_all(REQUEST).await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, SUCCESS_REPLY);
    }

    #[tokio::test]
    async fn test_direct_session_relays() {
        let (client_end, mut client) = duplex(1024);
        let (outbound_end, mut target) = duplex(1024);
        let dialer = MockDialer::with_stream(outbound_end);

        let conn = Connection::new(client_end, dialer.clone(), None);
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(conn.run(cancel_rx));

        handshake(&mut client).await;

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        target.write_all(b"world").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client);
        let stats = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(stats.closed_by, Side::Client);
        assert_eq!(dialer.dialed(), vec![("10.0.0.1".to_string(), 80)]);

        let mut rest = Vec::new();
        target.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_no_acceptable_method_writes_nothing() {
        // The mock panics on any write.
        let client = tokio_test::io::Builder::new().read(&[5, 1, 2]).build();
        let conn = Connection::new(client, MockDialer::refusing(), None);
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let err = conn.run(cancel_rx).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::NoAcceptableMethod)
        ));
    }

    #[tokio::test]
    async fn test_invalid_version_rejected() {
        let client = tokio_test::io::Builder::new().read(&[4, 1]).build();
        let conn = Connection::new(client, MockDialer::refusing(), None);
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let err = conn.run(cancel_rx).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::InvalidVersion(4))
        ));
    }

    #[tokio::test]
    async fn test_dial_failure_after_optimistic_reply() {
        let (client_end, mut client) = duplex(1024);
        let dialer = MockDialer::refusing();
        let conn = Connection::new(client_end, dialer.clone(), None);
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(conn.run(cancel_rx));

        handshake(&mut client).await;

        let err = handle.await.unwrap().unwrap_err();
        let err = match err {
            SessionError::Transport(err) => err,
            other => panic!("expected a transport error, got {:?}", other),
        };
        assert!(matches!(err, TransportError::Connect { .. }));
        assert_eq!(err.reply_field(), Some(ReplyField::ConnectionRefused));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_command_replies_and_closes() {
        let client = tokio_test::io::Builder::new()
            .read(&[5, 1, 0])
            .write(&[5, 0])
            .read(&[5, 3, 0, 1, 10, 0, 0, 1, 0, 53])
            .write(&[5, 6, 0])
            .build();
        let dialer = MockDialer::refusing();
        let conn = Connection::new(client, dialer.clone(), None);
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        assert!(conn.run(cancel_rx).await.unwrap().is_none());
        assert!(dialer.dialed().is_empty());
    }

    #[tokio::test]
    async fn test_client_disconnect_mid_handshake() {
        let (client_end, mut client) = duplex(1024);
        let conn = Connection::new(client_end, MockDialer::refusing(), None);
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(conn.run(cancel_rx));

        client.write_all(&[5, 2]).await.unwrap();
        drop(client);

        assert!(handle.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chaining_replays_handshake_upstream() {
        let (client_end, mut client) = duplex(1024);
        let (outbound_end, mut upstream) = duplex(1024);
        let dialer = MockDialer::with_stream(outbound_end);

        let conn = Connection::new(
            client_end,
            dialer.clone(),
            Some(UpstreamConfig::new("127.0.0.1", 1081)),
        );
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(conn.run(cancel_rx));

        let fake_upstream = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            upstream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 1, 0]);
            upstream.write_all(&[5, 0]).await.unwrap();

            let mut request = [0u8; 10];
            upstream.read_exact(&mut request).await.unwrap();
            assert_eq!(request, REQUEST);
            upstream
                .write_all(&[5, 0, 0, 1, 192, 168, 0, 1, 0x1f, 0x90])
                .await
                .unwrap();

            let mut buf = [0u8; 4];
            upstream.read_exact(&mut buf).await.unwrap();
            upstream.write_all(&buf).await.unwrap();
        });

        handshake(&mut client).await;

        client.write_all(b"echo").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");

        fake_upstream.await.unwrap();
        let stats = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(stats.closed_by, Side::Outbound);
        assert_eq!(dialer.dialed(), vec![("127.0.0.1".to_string(), 1081)]);
    }

    #[tokio::test]
    async fn test_chaining_upstream_rejection_closes_client() {
        let (client_end, mut client) = duplex(1024);
        let (outbound_end, mut upstream) = duplex(1024);
        let dialer = MockDialer::with_stream(outbound_end);

        let conn = Connection::new(
            client_end,
            dialer,
            Some(UpstreamConfig::new("127.0.0.1", 1081)),
        );
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(conn.run(cancel_rx));

        let fake_upstream = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            upstream.read_exact(&mut greeting).await.unwrap();
            upstream.write_all(&[5, 0]).await.unwrap();
            let mut request = [0u8; 10];
            upstream.read_exact(&mut request).await.unwrap();
            upstream.write_all(&[5, 4, 0]).await.unwrap();
            upstream
        });

        handshake(&mut client).await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::UpstreamRejected(
                ReplyField::ConnectionRefused
            ))
        ));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(fake_upstream.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_tears_down_relay() {
        let (client_end, mut client) = duplex(1024);
        let (outbound_end, mut target) = duplex(1024);
        let dialer = MockDialer::with_stream(outbound_end);

        let conn = Connection::new(client_end, dialer, None);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(conn.run(cancel_rx));

        handshake(&mut client).await;
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        target.read_exact(&mut buf).await.unwrap();

        cancel_tx.send(()).unwrap();
        assert!(handle.await.unwrap().unwrap().is_none());

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        target.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
