//! Per-connection SOCKS5 state machine
//!
//! [`Session`] holds no sockets. It is fed one [`Event`] at a time and
//! answers with the [`Action`]s the connection driver must perform next, so
//! the whole handshake, including the upstream chaining leg, can be exercised
//! without a live socket.
//!
//! ```text
//! AwaitingMethodSelection -> AwaitingRequest -> Dialing
//!     direct:   Dialing -> Relaying
//!     chaining: Dialing -> AwaitingAuthAck -> AwaitingReply -> Relaying
//! any phase -> Closed
//! ```

use super::codec::*;
use super::types::*;
use crate::config::UpstreamConfig;
use crate::error::{ProtocolError, SessionError, TransportError};
use bytes::Bytes;
use std::fmt;
use tracing::{debug, warn};

/// Which of the session's two sockets an I/O event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The downstream client that connected to us
    Client,
    /// The direct target or the upstream proxy
    Outbound,
}

impl Side {
    /// The other socket
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Outbound,
            Side::Outbound => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Outbound => write!(f, "outbound"),
        }
    }
}

/// Session phase; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Waiting for the client's method selection
    AwaitingMethodSelection,
    /// Waiting for the client's connect request
    AwaitingRequest,
    /// Success reply sent; outbound dial pending
    Dialing,
    /// Chaining: method selection replayed upstream, waiting for its reply
    AwaitingAuthAck,
    /// Chaining: request forwarded upstream, waiting for its reply
    AwaitingReply,
    /// Byte-transparent relay
    Relaying,
    /// Both sockets closed
    Closed,
}

/// Handshake frame the driver should read next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `VER, NMETHODS, METHODS`
    MethodSelection,
    /// `VER, METHOD`
    MethodSelectionReply,
    /// `VER, CMD, RSV, ATYP, DST.ADDR, DST.PORT`
    ConnectRequest,
    /// `VER, REP, RSV, [ATYP, BND.ADDR, BND.PORT]`
    ConnectReply,
}

/// Tag carried by a write so its completion can be recognised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTag {
    /// Plain handshake frame
    Frame,
    /// The optimistic success reply; dialing waits for its completion
    SuccessReply,
}

/// Where the outbound socket is opened to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    /// Straight to the requested destination
    Direct {
        /// Textual host
        host: String,
        /// Port
        port: u16,
    },
    /// To the configured upstream SOCKS5 proxy
    Upstream(UpstreamConfig),
}

impl DialTarget {
    /// Host to dial
    pub fn host(&self) -> &str {
        match self {
            DialTarget::Direct { host, .. } => host,
            DialTarget::Upstream(upstream) => &upstream.address,
        }
    }

    /// Port to dial
    pub fn port(&self) -> u16 {
        match self {
            DialTarget::Direct { port, .. } => *port,
            DialTarget::Upstream(upstream) => upstream.port,
        }
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialTarget::Direct { host, port } if host.contains(':') => {
                write!(f, "[{}]:{}", host, port)
            }
            DialTarget::Direct { host, port } => write!(f, "{}:{}", host, port),
            DialTarget::Upstream(upstream) => write!(f, "upstream {}", upstream),
        }
    }
}

/// Something that happened on one of the session's sockets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A complete handshake frame arrived
    Frame {
        /// Socket it arrived on
        side: Side,
        /// Raw frame bytes
        bytes: Bytes,
    },
    /// A write finished
    Written {
        /// Socket written to
        side: Side,
        /// Tag of the write
        tag: WriteTag,
    },
    /// The outbound socket connected
    Connected,
    /// A socket closed
    Disconnected {
        /// Socket that closed
        side: Side,
    },
}

/// Work the driver performs on behalf of the session, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Read one frame
    Read {
        /// Socket to read from
        side: Side,
        /// Frame to read
        kind: FrameKind,
    },
    /// Write bytes
    Write {
        /// Socket to write to
        side: Side,
        /// Bytes to write
        bytes: Bytes,
        /// Tag reported back in [`Event::Written`]
        tag: WriteTag,
    },
    /// Open the outbound socket
    Dial(DialTarget),
    /// Hand both sockets to the relay pump
    Relay,
    /// Close both sockets
    Close,
}

/// SOCKS5 session state machine
#[derive(Debug)]
pub struct Session {
    phase: Phase,
    upstream: Option<UpstreamConfig>,
    /// Client's method selection as received, replayed upstream
    greeting: Option<Bytes>,
    request: Option<ConnectRequest>,
    /// Client's connect request as received, replayed upstream
    raw_request: Option<Bytes>,
    dialed: bool,
}

impl Session {
    /// Create a session; `upstream` selects chaining mode
    pub fn new(upstream: Option<UpstreamConfig>) -> Self {
        Session {
            phase: Phase::AwaitingMethodSelection,
            upstream,
            greeting: None,
            request: None,
            raw_request: None,
            dialed: false,
        }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Request captured during negotiation
    pub fn request(&self) -> Option<&ConnectRequest> {
        self.request.as_ref()
    }

    /// Whether this session tunnels through an upstream proxy
    pub fn is_chaining(&self) -> bool {
        self.upstream.is_some()
    }

    /// First action of every session: wait for the client's greeting
    pub fn start(&self) -> Vec<Action> {
        vec![Action::Read {
            side: Side::Client,
            kind: FrameKind::MethodSelection,
        }]
    }

    /// Move to `Closed`; returns whether this call did the transition
    pub fn close(&mut self) -> bool {
        if self.phase == Phase::Closed {
            return false;
        }
        self.advance(Phase::Closed);
        true
    }

    /// Feed one event, getting back the actions to perform
    ///
    /// Any error is terminal: the session is already `Closed` when it
    /// returns, and the driver only has to tear the sockets down.
    pub fn handle(&mut self, event: Event) -> Result<Vec<Action>, SessionError> {
        let result = self.dispatch(event);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn dispatch(&mut self, event: Event) -> Result<Vec<Action>, SessionError> {
        match (self.phase, event) {
            (Phase::Closed, _) => Ok(Vec::new()),

            (_, Event::Disconnected { side }) => {
                debug!("{} socket disconnected in {:?}", side, self.phase);
                self.close();
                Ok(vec![Action::Close])
            }

            (
                Phase::AwaitingMethodSelection,
                Event::Frame {
                    side: Side::Client,
                    bytes,
                },
            ) => self.on_method_selection(bytes),

            (
                Phase::AwaitingRequest,
                Event::Frame {
                    side: Side::Client,
                    bytes,
                },
            ) => self.on_request(bytes),

            (
                Phase::Dialing,
                Event::Written {
                    side: Side::Client,
                    tag: WriteTag::SuccessReply,
                },
            ) => self.on_reply_flushed(),

            (Phase::Dialing, Event::Connected) => Ok(self.on_connected()),

            (
                Phase::AwaitingAuthAck,
                Event::Frame {
                    side: Side::Outbound,
                    bytes,
                },
            ) => self.on_upstream_method_reply(&bytes),

            (
                Phase::AwaitingReply,
                Event::Frame {
                    side: Side::Outbound,
                    bytes,
                },
            ) => self.on_upstream_connect_reply(&bytes),

            (_, Event::Written { .. }) => Ok(Vec::new()),

            (_, Event::Frame { .. }) | (_, Event::Connected) => {
                Err(ProtocolError::MalformedFrame("event out of phase").into())
            }
        }
    }

    fn on_method_selection(&mut self, bytes: Bytes) -> Result<Vec<Action>, SessionError> {
        let selection = parse_method_selection(&bytes)?;
        if !selection.offers_no_auth() {
            return Err(ProtocolError::NoAcceptableMethod.into());
        }
        debug!("Client offered {:?}", selection.methods);

        self.greeting = Some(bytes);
        self.advance(Phase::AwaitingRequest);
        Ok(vec![
            Action::Write {
                side: Side::Client,
                bytes: encode_method_selection_reply(AuthMethod::NoAuth),
                tag: WriteTag::Frame,
            },
            Action::Read {
                side: Side::Client,
                kind: FrameKind::ConnectRequest,
            },
        ])
    }

    fn on_request(&mut self, bytes: Bytes) -> Result<Vec<Action>, SessionError> {
        let request = parse_connect_request(&bytes)?;

        if request.command != Command::Connect {
            warn!("{} command not supported", request.command);
            self.request = Some(request);
            self.close();
            let reply = ConnectReply::failure(ReplyField::CommandNotSupported);
            return Ok(vec![
                Action::Write {
                    side: Side::Client,
                    bytes: encode_connect_reply(&reply)?,
                    tag: WriteTag::Frame,
                },
                Action::Close,
            ]);
        }

        // Optimistic: the target has not been dialed yet.
        let reply = encode_connect_reply(&ConnectReply::success_for(&request))?;
        self.request = Some(request);
        self.raw_request = Some(bytes);
        self.advance(Phase::Dialing);
        Ok(vec![Action::Write {
            side: Side::Client,
            bytes: reply,
            tag: WriteTag::SuccessReply,
        }])
    }

    fn on_reply_flushed(&mut self) -> Result<Vec<Action>, SessionError> {
        if self.dialed {
            return Ok(Vec::new());
        }
        let target = match (&self.upstream, &self.request) {
            (Some(upstream), _) => DialTarget::Upstream(upstream.clone()),
            (None, Some(request)) => DialTarget::Direct {
                host: request.target_host(),
                port: request.port,
            },
            (None, None) => {
                return Err(ProtocolError::MalformedFrame("reply sent without request").into())
            }
        };
        self.dialed = true;
        Ok(vec![Action::Dial(target)])
    }

    fn on_connected(&mut self) -> Vec<Action> {
        let Some(greeting) = self.greeting.clone().filter(|_| self.is_chaining()) else {
            self.advance(Phase::Relaying);
            return vec![Action::Relay];
        };

        self.advance(Phase::AwaitingAuthAck);
        vec![
            Action::Write {
                side: Side::Outbound,
                bytes: greeting,
                tag: WriteTag::Frame,
            },
            Action::Read {
                side: Side::Outbound,
                kind: FrameKind::MethodSelectionReply,
            },
        ]
    }

    fn on_upstream_method_reply(&mut self, bytes: &[u8]) -> Result<Vec<Action>, SessionError> {
        let reply = parse_method_selection_reply(bytes)?;
        if reply.method != AuthMethod::NoAuth {
            return Err(ProtocolError::NoAcceptableMethod.into());
        }
        // Forwarded verbatim, reserved byte included.
        let forwarded = self
            .raw_request
            .clone()
            .ok_or(ProtocolError::MalformedFrame("no request to forward"))?;

        self.advance(Phase::AwaitingReply);
        Ok(vec![
            Action::Write {
                side: Side::Outbound,
                bytes: forwarded,
                tag: WriteTag::Frame,
            },
            Action::Read {
                side: Side::Outbound,
                kind: FrameKind::ConnectReply,
            },
        ])
    }

    fn on_upstream_connect_reply(&mut self, bytes: &[u8]) -> Result<Vec<Action>, SessionError> {
        // The client already holds its own reply; this one is consumed here.
        let reply = parse_connect_reply(bytes)?;
        if reply.field != ReplyField::Succeed {
            return Err(TransportError::UpstreamRejected(reply.field).into());
        }
        self.advance(Phase::Relaying);
        Ok(vec![Action::Relay])
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(next >= self.phase, "phase regressed: {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }
}
