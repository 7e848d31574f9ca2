//! SOCKS5 type definitions
//!
//! Defines the handshake frames and the enums carried inside them.

use super::consts::*;
use crate::error::ProtocolError;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Authentication methods a client may offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// No authentication required
    NoAuth,
    /// GSSAPI
    Gssapi,
    /// Username/password
    UsernamePassword,
}

impl AuthMethod {
    /// Convert to SOCKS5 method byte
    pub fn to_byte(self) -> u8 {
        match self {
            AuthMethod::NoAuth => SOCKS5_AUTH_METHOD_NONE,
            AuthMethod::Gssapi => SOCKS5_AUTH_METHOD_GSSAPI,
            AuthMethod::UsernamePassword => SOCKS5_AUTH_METHOD_PASSWORD,
        }
    }

    /// Parse from SOCKS5 method byte
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            SOCKS5_AUTH_METHOD_NONE => Ok(AuthMethod::NoAuth),
            SOCKS5_AUTH_METHOD_GSSAPI => Ok(AuthMethod::Gssapi),
            SOCKS5_AUTH_METHOD_PASSWORD => Ok(AuthMethod::UsernamePassword),
            other => Err(ProtocolError::UnsupportedMethod(other)),
        }
    }
}

/// SOCKS5 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// TCP CONNECT
    Connect,
    /// TCP BIND
    Bind,
    /// UDP ASSOCIATE
    UdpAssociate,
}

impl Command {
    /// Parse a command byte
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            SOCKS5_CMD_TCP_CONNECT => Ok(Command::Connect),
            SOCKS5_CMD_TCP_BIND => Ok(Command::Bind),
            SOCKS5_CMD_UDP_ASSOCIATE => Ok(Command::UdpAssociate),
            other => Err(ProtocolError::InvalidCommand(other)),
        }
    }

    /// Convert to command byte
    pub fn to_byte(self) -> u8 {
        match self {
            Command::Connect => SOCKS5_CMD_TCP_CONNECT,
            Command::Bind => SOCKS5_CMD_TCP_BIND,
            Command::UdpAssociate => SOCKS5_CMD_UDP_ASSOCIATE,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect => write!(f, "CONNECT"),
            Command::Bind => write!(f, "BIND"),
            Command::UdpAssociate => write!(f, "UDP ASSOCIATE"),
        }
    }
}

/// Address type (ATYP) byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    /// IPv4
    Ipv4,
    /// Domain name
    DomainName,
    /// IPv6
    Ipv6,
}

impl AddressType {
    /// Parse an ATYP byte
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            SOCKS5_ADDR_TYPE_IPV4 => Ok(AddressType::Ipv4),
            SOCKS5_ADDR_TYPE_DOMAIN => Ok(AddressType::DomainName),
            SOCKS5_ADDR_TYPE_IPV6 => Ok(AddressType::Ipv6),
            other => Err(ProtocolError::InvalidAddressType(other)),
        }
    }

    /// Convert to ATYP byte
    pub fn to_byte(self) -> u8 {
        match self {
            AddressType::Ipv4 => SOCKS5_ADDR_TYPE_IPV4,
            AddressType::DomainName => SOCKS5_ADDR_TYPE_DOMAIN,
            AddressType::Ipv6 => SOCKS5_ADDR_TYPE_IPV6,
        }
    }
}

/// Address block of a request or reply
///
/// Numeric addresses keep their octets so they round-trip exactly;
/// [`Address::host`] gives the textual form used for dialing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// ASCII domain name, 1..=255 bytes
    Domain(String),
    /// IPv6 address
    Ipv6(Ipv6Addr),
}

impl Address {
    /// Build a domain address, checking length and charset
    pub fn domain(name: impl Into<String>) -> Result<Self, ProtocolError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_DOMAIN_LEN || !name.is_ascii() {
            return Err(ProtocolError::MalformedDomainName);
        }
        Ok(Address::Domain(name))
    }

    /// The ATYP this address is encoded with
    pub fn address_type(&self) -> AddressType {
        match self {
            Address::Ipv4(_) => AddressType::Ipv4,
            Address::Domain(_) => AddressType::DomainName,
            Address::Ipv6(_) => AddressType::Ipv6,
        }
    }

    /// Textual host: the domain itself, or the dotted / colon form of an IP
    pub fn host(&self) -> String {
        match self {
            Address::Ipv4(ip) => ip.to_string(),
            Address::Domain(name) => name.clone(),
            Address::Ipv6(ip) => ip.to_string(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => write!(f, "{}", ip),
            Address::Domain(name) => write!(f, "{}", name),
            Address::Ipv6(ip) => write!(f, "[{}]", ip),
        }
    }
}

/// Reply field (REP) of a connect reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyField {
    /// Succeeded
    Succeed = SOCKS5_REPLY_SUCCEEDED,
    /// General SOCKS server failure
    GeneralFailure = SOCKS5_REPLY_GENERAL_FAILURE,
    /// Connection not allowed by ruleset
    NotAllowed = SOCKS5_REPLY_NOT_ALLOWED,
    /// Network unreachable
    NetworkUnreachable = SOCKS5_REPLY_NETWORK_UNREACHABLE,
    /// Connection refused
    ConnectionRefused = SOCKS5_REPLY_CONNECTION_REFUSED,
    /// TTL expired
    TtlExpired = SOCKS5_REPLY_TTL_EXPIRED,
    /// Command not supported
    CommandNotSupported = SOCKS5_REPLY_COMMAND_NOT_SUPPORTED,
    /// Address type not supported
    AddressTypeNotSupported = SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
}

impl From<ReplyField> for u8 {
    fn from(field: ReplyField) -> Self {
        field as u8
    }
}

impl TryFrom<u8> for ReplyField {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            SOCKS5_REPLY_SUCCEEDED => Ok(ReplyField::Succeed),
            SOCKS5_REPLY_GENERAL_FAILURE => Ok(ReplyField::GeneralFailure),
            SOCKS5_REPLY_NOT_ALLOWED => Ok(ReplyField::NotAllowed),
            SOCKS5_REPLY_NETWORK_UNREACHABLE => Ok(ReplyField::NetworkUnreachable),
            SOCKS5_REPLY_CONNECTION_REFUSED => Ok(ReplyField::ConnectionRefused),
            SOCKS5_REPLY_TTL_EXPIRED => Ok(ReplyField::TtlExpired),
            SOCKS5_REPLY_COMMAND_NOT_SUPPORTED => Ok(ReplyField::CommandNotSupported),
            SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED => Ok(ReplyField::AddressTypeNotSupported),
            _ => Err(ProtocolError::MalformedFrame("unknown reply field")),
        }
    }
}

impl From<&io::Error> for ReplyField {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ReplyField::ConnectionRefused,
            io::ErrorKind::TimedOut => ReplyField::TtlExpired,
            io::ErrorKind::AddrNotAvailable => ReplyField::NetworkUnreachable,
            io::ErrorKind::PermissionDenied => ReplyField::NotAllowed,
            _ => ReplyField::GeneralFailure,
        }
    }
}

/// Method-selection request: `VER, NMETHODS, METHODS`
///
/// Methods keep their wire order, duplicates included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSelection {
    /// Offered methods
    pub methods: Vec<AuthMethod>,
}

impl MethodSelection {
    /// Create a method selection offering the given methods
    pub fn new(methods: Vec<AuthMethod>) -> Self {
        MethodSelection { methods }
    }

    /// Value of the NMETHODS byte
    pub fn number_of_methods(&self) -> u8 {
        self.methods.len() as u8
    }

    /// Whether "no authentication required" is on offer
    pub fn offers_no_auth(&self) -> bool {
        self.methods.contains(&AuthMethod::NoAuth)
    }
}

/// Method-selection reply: `VER, METHOD`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSelectionReply {
    /// Chosen method
    pub method: AuthMethod,
}

/// Connect request: `VER, CMD, RSV, ATYP, DST.ADDR, DST.PORT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Requested command
    pub command: Command,
    /// Destination address
    pub address: Address,
    /// Destination port
    pub port: u16,
}

impl ConnectRequest {
    /// Address type of the destination
    pub fn address_type(&self) -> AddressType {
        self.address.address_type()
    }

    /// Textual destination host
    pub fn target_host(&self) -> String {
        self.address.host()
    }
}

impl fmt::Display for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.command, self.address, self.port)
    }
}

/// Connect reply: `VER, REP, RSV, [ATYP, BND.ADDR, BND.PORT]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    /// Reply field
    pub field: ReplyField,
    /// Bound address, only put on the wire for [`ReplyField::Succeed`]
    pub address: Address,
    /// Bound port, only put on the wire for [`ReplyField::Succeed`]
    pub port: u16,
}

impl ConnectReply {
    /// Success reply echoing the request's target back to the client
    pub fn success_for(request: &ConnectRequest) -> Self {
        ConnectReply {
            field: ReplyField::Succeed,
            address: request.address.clone(),
            port: request.port,
        }
    }

    /// Failure reply without an address block
    pub fn failure(field: ReplyField) -> Self {
        ConnectReply {
            field,
            address: Address::Ipv4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}
