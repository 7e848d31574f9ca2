//! Byte-transparent relay between the client and the outbound socket
//!
//! Each direction runs its own read-then-write loop so a full write on one
//! side never stalls reads on the other. The first direction to finish,
//! by EOF or error, ends the relay for both.

use super::consts::RELAY_BUFFER_SIZE;
use super::session::Side;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Outcome of a finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Socket whose read side ended the relay
    pub closed_by: Side,
    /// Bytes copied client to outbound
    pub client_to_outbound: u64,
    /// Bytes copied outbound to client
    pub outbound_to_client: u64,
}

/// Relay data bidirectionally until either socket closes
///
/// Bytes are forwarded in arrival order with no inspection. Both streams
/// are dropped on return.
pub async fn relay<C, O>(client: C, outbound: O) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut outbound_read, mut outbound_write) = tokio::io::split(outbound);

    let mut client_to_outbound = 0u64;
    let mut outbound_to_client = 0u64;

    let closed_by = tokio::select! {
        side = pump(&mut client_read, &mut outbound_write, Side::Client, &mut client_to_outbound) => side,
        side = pump(&mut outbound_read, &mut client_write, Side::Outbound, &mut outbound_to_client) => side,
    };

    let _ = client_write.shutdown().await;
    let _ = outbound_write.shutdown().await;

    debug!(
        "Relay closed by {} socket: {} bytes up, {} bytes down",
        closed_by, client_to_outbound, outbound_to_client
    );

    RelayStats {
        closed_by,
        client_to_outbound,
        outbound_to_client,
    }
}

/// Copy `from` into `to` until EOF or error; returns the side that stopped
async fn pump<R, W>(from: &mut R, to: &mut W, from_side: Side, copied: &mut u64) -> Side
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) => return from_side,
            Ok(n) => n,
            Err(e) => {
                debug!("Read from {} socket failed: {}", from_side, e);
                return from_side;
            }
        };
        if let Err(e) = to.write_all(&buf[..n]).await {
            debug!("Write to {} socket failed: {}", from_side.peer(), e);
            return from_side.peer();
        }
        *copied += n as u64;
    }
}
