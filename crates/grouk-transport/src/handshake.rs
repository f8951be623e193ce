//! Both halves of the PSK-authenticated X25519 handshake.

use std::net::SocketAddr;

use bytes::Bytes;
use grouk_core::{GroukPacket, HandshakeInit, HandshakeResponse, PacketType, UNASSIGNED_SESSION_ID};
use grouk_crypto::{
    auth_tag, verify_auth_tag, AuthTag, EphemeralKeypair, Role, SessionKey, SessionKeys,
};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::link::send_plain;

/// Keys for a session whose handshake has completed on this side.
pub(crate) struct Established {
    pub session_id: u32,
    pub keys: SessionKeys,
}

/// The client is waiting on the server for one of two replies.
enum ClientPhase {
    AwaitingResponse,
    AwaitingDone {
        session_id: u32,
        keys: SessionKeys,
        tag: AuthTag,
    },
}

/// Run the initiator side over `socket` until the server proves the PSK.
///
/// Init is resent until a response arrives and auth until done arrives,
/// each on the `handshake_retry` cadence. At the deadline the error is
/// `HandshakeTimeout` if the server never answered and `AuthFailed` if it
/// answered but never confirmed the auth tag.
pub(crate) async fn client_handshake(
    socket: &UdpSocket,
    server: SocketAddr,
    psk: &[u8],
    config: &TransportConfig,
) -> Result<Established> {
    let keypair = EphemeralKeypair::generate();
    let init = HandshakeInit {
        public_key: keypair.public_key(),
    }
    .encode();

    let deadline = Instant::now() + config.handshake_timeout();
    let mut phase = ClientPhase::AwaitingResponse;
    let mut buf = vec![0u8; 2048];

    send_plain(socket, server, UNASSIGNED_SESSION_ID, PacketType::HandshakeInit, &init).await?;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(match phase {
                ClientPhase::AwaitingResponse => TransportError::HandshakeTimeout,
                ClientPhase::AwaitingDone { .. } => TransportError::AuthFailed,
            });
        }
        let wait = config.handshake_retry().min(deadline - now);

        let (len, from) = match timeout(wait, socket.recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => {
                match &phase {
                    ClientPhase::AwaitingResponse => {
                        trace!(%server, "resending handshake init");
                        send_plain(socket, server, UNASSIGNED_SESSION_ID, PacketType::HandshakeInit, &init)
                            .await?;
                    }
                    ClientPhase::AwaitingDone { session_id, tag, .. } => {
                        trace!(%server, session = session_id, "resending handshake auth");
                        send_plain(socket, server, *session_id, PacketType::HandshakeAuth, tag).await?;
                    }
                }
                continue;
            }
        };

        if from != server {
            continue;
        }
        let Ok(packet) = GroukPacket::decode(Bytes::copy_from_slice(&buf[..len])) else {
            continue;
        };

        phase = match (phase, packet.packet_type) {
            (ClientPhase::AwaitingResponse, PacketType::HandshakeResponse) => {
                match HandshakeResponse::decode(&packet.payload) {
                    Ok(response) => {
                        let shared = keypair.diffie_hellman(&response.public_key)?;
                        let keys = SessionKeys::derive(&shared, psk, Role::Client)?;
                        let tag = auth_tag(&keys.auth, Role::Client)?;

                        send_plain(socket, server, response.session_id, PacketType::HandshakeAuth, &tag)
                            .await?;
                        ClientPhase::AwaitingDone {
                            session_id: response.session_id,
                            keys,
                            tag,
                        }
                    }
                    Err(e) => {
                        debug!(%server, error = %e, "malformed handshake response");
                        ClientPhase::AwaitingResponse
                    }
                }
            }
            (ClientPhase::AwaitingDone { session_id, keys, .. }, PacketType::HandshakeDone)
                if packet.session_id == session_id =>
            {
                verify_auth_tag(&keys.auth, Role::Server, &packet.payload)
                    .map_err(|_| TransportError::AuthFailed)?;
                return Ok(Established { session_id, keys });
            }
            (phase, packet_type) => {
                trace!(%server, ?packet_type, "ignoring packet during handshake");
                phase
            }
        };
    }
}

/// Listener-side result of answering one handshake init.
pub(crate) struct ServerHandshake {
    pub response_public_key: [u8; 32],
    pub keys: SessionKeys,
}

/// Answer a client's init: fresh key pair, ECDH, key derivation.
///
/// The session id is chosen by the caller, so this can run before the id
/// is reserved.
pub(crate) fn server_respond(init: &HandshakeInit, psk: &[u8]) -> Result<ServerHandshake> {
    let keypair = EphemeralKeypair::generate();
    let shared = keypair.diffie_hellman(&init.public_key)?;
    let keys = SessionKeys::derive(&shared, psk, Role::Server)?;
    Ok(ServerHandshake {
        response_public_key: keypair.public_key(),
        keys,
    })
}

/// Check the client's tag and produce the tag to send back.
pub(crate) fn server_confirm(auth_key: &SessionKey, client_tag: &[u8]) -> Result<AuthTag> {
    verify_auth_tag(auth_key, Role::Client, client_tag).map_err(|_| TransportError::AuthFailed)?;
    Ok(auth_tag(auth_key, Role::Server)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_confirms_matching_psk() {
        let client = EphemeralKeypair::generate();
        let init = HandshakeInit {
            public_key: client.public_key(),
        };
        let server = server_respond(&init, b"psk").unwrap();

        let shared = client
            .diffie_hellman(&server.response_public_key)
            .unwrap();
        let client_keys = SessionKeys::derive(&shared, b"psk", Role::Client).unwrap();
        let client_tag = auth_tag(&client_keys.auth, Role::Client).unwrap();

        let done = server_confirm(&server.keys.auth, &client_tag).unwrap();
        assert!(verify_auth_tag(&client_keys.auth, Role::Server, &done).is_ok());
    }

    #[test]
    fn server_rejects_wrong_psk() {
        let client = EphemeralKeypair::generate();
        let init = HandshakeInit {
            public_key: client.public_key(),
        };
        let server = server_respond(&init, b"right").unwrap();

        let shared = client
            .diffie_hellman(&server.response_public_key)
            .unwrap();
        let client_keys = SessionKeys::derive(&shared, b"wrong", Role::Client).unwrap();
        let client_tag = auth_tag(&client_keys.auth, Role::Client).unwrap();

        assert!(matches!(
            server_confirm(&server.keys.auth, &client_tag),
            Err(TransportError::AuthFailed)
        ));
    }

    #[test]
    fn low_order_client_key_is_rejected() {
        let init = HandshakeInit {
            public_key: [0u8; 32],
        };
        assert!(matches!(
            server_respond(&init, b"psk"),
            Err(TransportError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = TransportConfig {
            handshake_timeout_ms: 300,
            handshake_retry_ms: 100,
            ..TransportConfig::default()
        };

        let result =
            client_handshake(&socket, server.local_addr().unwrap(), b"psk", &config).await;
        assert!(matches!(result, Err(TransportError::HandshakeTimeout)));

        // Init was retransmitted on the retry cadence.
        let mut buf = [0u8; 128];
        let mut inits = 0;
        while let Ok(Ok((n, _))) =
            timeout(std::time::Duration::from_millis(20), server.recv_from(&mut buf)).await
        {
            let packet = GroukPacket::decode(Bytes::copy_from_slice(&buf[..n])).unwrap();
            assert_eq!(packet.packet_type, PacketType::HandshakeInit);
            assert_eq!(packet.session_id, UNASSIGNED_SESSION_ID);
            inits += 1;
        }
        assert!(inits >= 3, "expected retransmitted inits, saw {inits}");
    }
}
