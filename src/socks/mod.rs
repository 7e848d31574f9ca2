//! SOCKS5 protocol
//!
//! Wire codec, per-connection state machine, connection driver and the
//! relay pump. Only the no-authentication method and the CONNECT command
//! are served; optionally every session is chained through an upstream
//! SOCKS5 proxy.

mod codec;
mod connection;
mod consts;
mod relay;
mod session;
mod types;

pub use codec::{
    encode_connect_reply, encode_connect_request, encode_method_selection,
    encode_method_selection_reply, parse_connect_reply, parse_connect_request,
    parse_method_selection, parse_method_selection_reply, read_connect_reply,
    read_connect_request, read_method_selection, read_method_selection_reply,
};
pub use connection::Connection;
pub use consts::*;
pub use relay::{relay, RelayStats};
pub use session::{Action, DialTarget, Event, FrameKind, Phase, Session, Side, WriteTag};
pub use types::{
    Address, AddressType, AuthMethod, Command, ConnectReply, ConnectRequest, MethodSelection,
    MethodSelectionReply, ReplyField,
};
