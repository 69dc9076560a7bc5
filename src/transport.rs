use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};

use crate::error::{CoordError, Result};
use crate::protocol::{Envelope, MAX_DATAGRAM_SIZE};

/// Bind a UDP socket, giving up after `bind_timeout`.
pub async fn bind_socket(addr: SocketAddr, bind_timeout: Duration) -> Result<UdpSocket> {
    match timeout(bind_timeout, UdpSocket::bind(addr)).await {
        Ok(Ok(socket)) => Ok(socket),
        Ok(Err(e)) => Err(CoordError::Io(e)),
        Err(_) => Err(CoordError::BindTimeout(addr)),
    }
}

/// Encode and send one envelope as a single datagram.
pub async fn send_envelope(
    socket: &UdpSocket,
    envelope: &Envelope,
    target: SocketAddr,
) -> Result<()> {
    let bytes = envelope.encode()?;
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(CoordError::Internal(format!(
            "{} message of {} bytes does not fit in a datagram",
            envelope.payload.kind(),
            bytes.len()
        )));
    }
    socket.send_to(&bytes, target).await?;
    Ok(())
}
