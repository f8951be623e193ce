use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use grouk_core::{GroukPacket, PacketType};
use grouk_crypto::PacketCipher;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use crate::config::TransportConfig;
use crate::error::Result;
use crate::handshake::{client_handshake, Established};
use crate::link::{tune_socket, Link};
use crate::session::Session;

/// Dial a listener and return an authenticated session.
///
/// The session owns a fresh ephemeral socket; a background task feeds it
/// datagrams from `server` until the session closes or is dropped.
pub async fn connect(server: SocketAddr, psk: &[u8], config: TransportConfig) -> Result<Session> {
    let bind_addr: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    tune_socket(&socket, config.socket_buffer_size);

    let config = Arc::new(config);
    let Established { session_id, keys } = client_handshake(&socket, server, psk, &config).await?;

    let link = Link::new(
        Arc::clone(&socket),
        server,
        session_id,
        PacketCipher::new(&keys.send),
    );
    let session = Session::new(session_id, link, PacketCipher::new(&keys.recv), config);
    session.activate();
    spawn_reader(socket, server, &session);

    info!(session = session_id, %server, "connected");
    Ok(session)
}

fn spawn_reader(socket: Arc<UdpSocket>, server: SocketAddr, session: &Session) {
    let session_id = session.id();
    let weak = session.downgrade();
    let token = session.close_token();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let (len, from) = tokio::select! {
                _ = token.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        debug!(session = session_id, error = %e, "recv_from failed");
                        continue;
                    }
                },
            };
            if from != server {
                continue;
            }

            let packet = match GroukPacket::decode(Bytes::copy_from_slice(&buf[..len])) {
                Ok(packet) if packet.session_id == session_id => packet,
                Ok(_) => continue,
                Err(e) => {
                    trace!(session = session_id, error = %e, "undecodable datagram");
                    continue;
                }
            };
            // A repeated done after the handshake finished.
            if packet.packet_type == PacketType::HandshakeDone {
                continue;
            }

            let Some(session) = Session::upgrade(&weak) else {
                break;
            };
            session.handle_packet(packet).await;
        }
        debug!(session = session_id, "client reader stopped");
    });
}
