//! SOCKS5 handshake codec
//!
//! Byte-exact parse/encode of the four handshake frames, plus async readers
//! that pull exactly one complete frame off a stream.
//!
//! ```text
//! method selection   VER | NMETHODS | METHODS
//! selection reply    VER | METHOD
//! connect request    VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
//! connect reply      VER | REP | RSV | [ATYP | BND.ADDR | BND.PORT]
//! ```
//!
//! Ports are always in network (big-endian) byte order.

use super::consts::*;
use super::session::Side;
use super::types::*;
use crate::error::{ProtocolError, SessionError, TransportError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Parse a method-selection request
pub fn parse_method_selection(bytes: &[u8]) -> Result<MethodSelection, ProtocolError> {
    let version = *bytes
        .first()
        .ok_or(ProtocolError::MalformedFrame("empty method selection"))?;
    check_version(version)?;

    let declared = bytes.get(1).copied().unwrap_or(0);
    let supplied = bytes.len().saturating_sub(2);
    if bytes.len() < 3 || supplied != declared as usize {
        return Err(ProtocolError::WrongMethodCount { declared, supplied });
    }

    let methods = bytes[2..]
        .iter()
        .map(|&b| AuthMethod::from_byte(b))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(MethodSelection { methods })
}

/// Encode a method-selection request
pub fn encode_method_selection(selection: &MethodSelection) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + selection.methods.len());
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(selection.number_of_methods());
    for method in &selection.methods {
        buf.put_u8(method.to_byte());
    }
    buf.freeze()
}

/// Encode a method-selection reply: always two bytes
pub fn encode_method_selection_reply(method: AuthMethod) -> Bytes {
    Bytes::copy_from_slice(&[SOCKS5_VERSION, method.to_byte()])
}

/// Parse a method-selection reply (client role, against an upstream)
pub fn parse_method_selection_reply(bytes: &[u8]) -> Result<MethodSelectionReply, ProtocolError> {
    match bytes {
        [version, method] => {
            check_version(*version)?;
            if *method == 0xFF {
                return Err(ProtocolError::NoAcceptableMethod);
            }
            Ok(MethodSelectionReply {
                method: AuthMethod::from_byte(*method)?,
            })
        }
        [version, ..] => {
            check_version(*version)?;
            Err(ProtocolError::MalformedFrame("method selection reply length"))
        }
        [] => Err(ProtocolError::MalformedFrame("empty method selection reply")),
    }
}

/// Parse a connect request
///
/// IPv4/IPv6 octets are consumed before the port is read; trailing bytes
/// are rejected.
pub fn parse_connect_request(bytes: &[u8]) -> Result<ConnectRequest, ProtocolError> {
    let mut buf = bytes;
    if !buf.has_remaining() {
        return Err(ProtocolError::MalformedFrame("empty connect request"));
    }
    check_version(buf.get_u8())?;
    if buf.remaining() < 3 {
        return Err(ProtocolError::MalformedFrame("truncated request header"));
    }
    let command = Command::from_byte(buf.get_u8())?;
    let _reserved = buf.get_u8();
    let address_type = AddressType::from_byte(buf.get_u8())?;

    let address = parse_address(&mut buf, address_type)?;
    let port = parse_port(&mut buf)?;
    if buf.has_remaining() {
        return Err(ProtocolError::MalformedFrame("trailing bytes after port"));
    }

    Ok(ConnectRequest {
        command,
        address,
        port,
    })
}

/// Encode a connect request (client role, forwarded to an upstream)
pub fn encode_connect_request(request: &ConnectRequest) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(4 + 1 + MAX_DOMAIN_LEN + 2);
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(request.command.to_byte());
    buf.put_u8(SOCKS5_RESERVED);
    buf.put_u8(request.address_type().to_byte());
    put_address(&mut buf, &request.address)?;
    buf.put_u16(request.port);
    Ok(buf.freeze())
}

/// Encode a connect reply
///
/// Anything but [`ReplyField::Succeed`] is the bare three-byte
/// `VER, REP, RSV` header.
pub fn encode_connect_reply(reply: &ConnectReply) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(4 + 1 + MAX_DOMAIN_LEN + 2);
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(reply.field.into());
    buf.put_u8(SOCKS5_RESERVED);
    if reply.field != ReplyField::Succeed {
        return Ok(buf.freeze());
    }

    buf.put_u8(reply.address.address_type().to_byte());
    put_address(&mut buf, &reply.address)?;
    buf.put_u16(reply.port);
    Ok(buf.freeze())
}

/// Parse a connect reply (client role, received from an upstream)
///
/// Accepts both the bare failure header and a full reply with an
/// address block.
pub fn parse_connect_reply(bytes: &[u8]) -> Result<ConnectReply, ProtocolError> {
    let mut buf = bytes;
    if !buf.has_remaining() {
        return Err(ProtocolError::MalformedFrame("empty connect reply"));
    }
    check_version(buf.get_u8())?;
    if buf.remaining() < 2 {
        return Err(ProtocolError::MalformedFrame("truncated reply header"));
    }
    let field = ReplyField::try_from(buf.get_u8())?;
    let _reserved = buf.get_u8();

    if !buf.has_remaining() {
        if field == ReplyField::Succeed {
            return Err(ProtocolError::MalformedFrame("success reply without address"));
        }
        return Ok(ConnectReply::failure(field));
    }

    let address_type = AddressType::from_byte(buf.get_u8())?;
    let address = parse_address(&mut buf, address_type)?;
    let port = parse_port(&mut buf)?;
    if buf.has_remaining() {
        return Err(ProtocolError::MalformedFrame("trailing bytes after port"));
    }

    Ok(ConnectReply {
        field,
        address,
        port,
    })
}

fn check_version(version: u8) -> Result<(), ProtocolError> {
    if version != SOCKS5_VERSION {
        return Err(ProtocolError::InvalidVersion(version));
    }
    Ok(())
}

fn parse_address(buf: &mut &[u8], address_type: AddressType) -> Result<Address, ProtocolError> {
    match address_type {
        AddressType::Ipv4 => {
            if buf.remaining() < IPV4_ADDR_LEN {
                return Err(ProtocolError::MalformedFrame("truncated IPv4 address"));
            }
            Ok(Address::Ipv4(Ipv4Addr::from(buf.get_u32())))
        }
        AddressType::Ipv6 => {
            if buf.remaining() < IPV6_ADDR_LEN {
                return Err(ProtocolError::MalformedFrame("truncated IPv6 address"));
            }
            Ok(Address::Ipv6(Ipv6Addr::from(buf.get_u128())))
        }
        AddressType::DomainName => {
            if !buf.has_remaining() {
                return Err(ProtocolError::MalformedFrame("missing domain length"));
            }
            let len = buf.get_u8() as usize;
            if len == 0 {
                return Err(ProtocolError::MalformedDomainName);
            }
            if buf.remaining() < len {
                return Err(ProtocolError::MalformedFrame("truncated domain name"));
            }
            let name = &buf[..len];
            if !name.is_ascii() {
                return Err(ProtocolError::MalformedDomainName);
            }
            let name = String::from_utf8_lossy(name).into_owned();
            buf.advance(len);
            Ok(Address::Domain(name))
        }
    }
}

fn parse_port(buf: &mut &[u8]) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::MalformedFrame("truncated port"));
    }
    Ok(buf.get_u16())
}

fn put_address(buf: &mut BytesMut, address: &Address) -> Result<(), ProtocolError> {
    match address {
        Address::Ipv4(ip) => buf.put_slice(&ip.octets()),
        Address::Ipv6(ip) => buf.put_slice(&ip.octets()),
        Address::Domain(name) => {
            let len = u8::try_from(name.len()).map_err(|_| ProtocolError::MalformedDomainName)?;
            if len == 0 || !name.is_ascii() {
                return Err(ProtocolError::MalformedDomainName);
            }
            buf.put_u8(len);
            buf.put_slice(name.as_bytes());
        }
    }
    Ok(())
}

/// Read one complete method-selection request
///
/// A bad version byte fails as soon as it is seen, without waiting for
/// the rest of the frame.
pub async fn read_method_selection<R>(reader: &mut R, side: Side) -> Result<Bytes, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = BytesMut::zeroed(2);
    read_into(reader, side, &mut frame[..]).await?;
    check_version(frame[0])?;

    let methods = frame[1] as usize;
    extend_exact(reader, side, &mut frame, methods).await?;
    Ok(frame.freeze())
}

/// Read one complete method-selection reply
pub async fn read_method_selection_reply<R>(
    reader: &mut R,
    side: Side,
) -> Result<Bytes, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = BytesMut::zeroed(2);
    read_into(reader, side, &mut frame[..]).await?;
    Ok(frame.freeze())
}

/// Read one complete connect request
pub async fn read_connect_request<R>(reader: &mut R, side: Side) -> Result<Bytes, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = BytesMut::zeroed(4);
    read_into(reader, side, &mut frame[..]).await?;
    check_version(frame[0])?;

    let address_type = AddressType::from_byte(frame[3])?;
    read_address_block(reader, side, &mut frame, address_type).await?;
    Ok(frame.freeze())
}

/// Read one complete connect reply
///
/// A non-success header is returned as soon as it is read: servers that
/// omit the address block on failure would otherwise stall the read.
pub async fn read_connect_reply<R>(reader: &mut R, side: Side) -> Result<Bytes, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = BytesMut::zeroed(3);
    read_into(reader, side, &mut frame[..]).await?;
    check_version(frame[0])?;
    if frame[1] != SOCKS5_REPLY_SUCCEEDED {
        return Ok(frame.freeze());
    }

    extend_exact(reader, side, &mut frame, 1).await?;
    let address_type = AddressType::from_byte(frame[3])?;
    read_address_block(reader, side, &mut frame, address_type).await?;
    Ok(frame.freeze())
}

async fn read_address_block<R>(
    reader: &mut R,
    side: Side,
    frame: &mut BytesMut,
    address_type: AddressType,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    let address_len = match address_type {
        AddressType::Ipv4 => IPV4_ADDR_LEN,
        AddressType::Ipv6 => IPV6_ADDR_LEN,
        AddressType::DomainName => {
            extend_exact(reader, side, frame, 1).await?;
            frame[frame.len() - 1] as usize
        }
    };
    extend_exact(reader, side, frame, address_len + 2).await
}

async fn extend_exact<R>(
    reader: &mut R,
    side: Side,
    frame: &mut BytesMut,
    n: usize,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    let start = frame.len();
    frame.resize(start + n, 0);
    read_into(reader, side, &mut frame[start..]).await
}

async fn read_into<R>(reader: &mut R, side: Side, buf: &mut [u8]) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    reader
        .read_exact(buf)
        .await
        .map_err(|e| TransportError::read(side, e))?;
    Ok(())
}
