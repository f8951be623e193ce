use std::net::SocketAddr;
use std::sync::Arc;

use grouk_core::frame::{AckFrame, StreamFrame};
use grouk_core::{GroukPacket, PacketType};
use grouk_crypto::PacketCipher;
use socket2::SockRef;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::error::Result;

/// Outbound half of a session: where to send and how to seal.
///
/// Every send is one seal followed by one `send_to`, so datagrams from
/// concurrent writers never interleave.
pub(crate) struct Link {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    session_id: u32,
    cipher: PacketCipher,
}

impl Link {
    pub fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        session_id: u32,
        cipher: PacketCipher,
    ) -> Self {
        Self {
            socket,
            peer,
            session_id,
            cipher,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send_sealed(&self, packet_type: PacketType, plaintext: &[u8]) -> Result<()> {
        let sealed = self.cipher.seal(plaintext)?;
        let packet = GroukPacket::new(self.session_id, packet_type, sealed);
        self.socket.send_to(&packet.encode(), self.peer).await?;
        trace!(
            session = self.session_id,
            ?packet_type,
            len = plaintext.len(),
            "sent"
        );
        Ok(())
    }

    pub async fn send_frame(&self, frame: &StreamFrame) -> Result<()> {
        self.send_sealed(PacketType::Data, &frame.encode()).await
    }

    pub async fn send_ack(&self, stream_id: u16, seq: u32) -> Result<()> {
        let ack = AckFrame { stream_id, seq };
        self.send_sealed(PacketType::Ack, &ack.encode()).await
    }
}

/// Send a cleartext handshake packet.
pub(crate) async fn send_plain(
    socket: &UdpSocket,
    peer: SocketAddr,
    session_id: u32,
    packet_type: PacketType,
    payload: &[u8],
) -> Result<()> {
    let packet = GroukPacket::new(session_id, packet_type, payload.to_vec());
    socket.send_to(&packet.encode(), peer).await?;
    Ok(())
}

/// Ask for large kernel buffers; bursts of fragments otherwise overflow the
/// default receive queue. Failure is not fatal.
pub(crate) fn tune_socket(socket: &UdpSocket, size: usize) {
    let sock = SockRef::from(socket);
    if let Err(e) = sock.set_recv_buffer_size(size) {
        debug!("failed to set SO_RCVBUF: {}", e);
    }
    if let Err(e) = sock.set_send_buffer_size(size) {
        debug!("failed to set SO_SNDBUF: {}", e);
    }
}
