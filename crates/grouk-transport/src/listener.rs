//! Server side: one UDP socket shared by every session.
//!
//! The read loop:
//! 1. Answers handshake inits (id 0) from a spawned responder
//! 2. Verifies handshake auth and promotes pending sessions
//! 3. Hands every other packet to the active session owning its id
//!
//! Two sweepers purge stale pending entries and evict idle sessions.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use grouk_core::handshake::PUBLIC_KEY_SIZE;
use grouk_core::{GroukPacket, HandshakeInit, HandshakeResponse, PacketType, UNASSIGNED_SESSION_ID};
use grouk_crypto::{verify_auth_tag, AuthTag, PacketCipher, Role, SessionKey};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::handshake::{server_confirm, server_respond};
use crate::link::{send_plain, tune_socket, Link};
use crate::session::Session;

/// Why an inbound datagram was dropped. Never sent to the peer.
#[derive(Debug, Error)]
enum DropReason {
    #[error("unknown session {0}")]
    UnknownSession(u32),

    #[error("unexpected {0:?} packet")]
    UnexpectedType(PacketType),

    #[error("session {0} belongs to another address")]
    AddressMismatch(u32),

    #[error("pending table full")]
    PendingFull,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct PendingEntry {
    session: Session,
    auth_key: SessionKey,
    client_public: [u8; PUBLIC_KEY_SIZE],
    response: [u8; HandshakeResponse::SIZE],
    peer: SocketAddr,
    last_seen: Instant,
}

struct ActiveEntry {
    session: Session,
    /// Kept so a retransmitted auth can be answered with the same done tag.
    auth_key: SessionKey,
    done_tag: AuthTag,
}

struct ListenerInner {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    psk: Vec<u8>,
    config: Arc<TransportConfig>,
    pending: Mutex<HashMap<u32, PendingEntry>>,
    active: RwLock<HashMap<u32, ActiveEntry>>,
    accept_tx: mpsc::Sender<Session>,
    token: CancellationToken,
}

/// Accepts authenticated sessions on a UDP address.
pub struct Listener {
    inner: Arc<ListenerInner>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Session>>,
}

impl Listener {
    pub async fn bind(
        addr: SocketAddr,
        psk: impl Into<Vec<u8>>,
        config: TransportConfig,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tune_socket(&socket, config.socket_buffer_size);
        let local_addr = socket.local_addr()?;

        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let inner = Arc::new(ListenerInner {
            socket: Arc::new(socket),
            local_addr,
            psk: psk.into(),
            config: Arc::new(config),
            pending: Mutex::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            accept_tx,
            token: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&inner).run());
        inner.spawn_sweeper(|inner| async move { inner.sweep_pending().await });
        inner.spawn_sweeper(|inner| async move { inner.sweep_idle().await });

        info!(%local_addr, "listening");
        Ok(Self {
            inner,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Authenticated sessions currently tracked.
    pub fn session_count(&self) -> usize {
        self.inner.active.read().len()
    }

    /// Sessions waiting for the client's auth tag.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Wait for the next authenticated session.
    pub async fn accept(&self) -> Result<Session> {
        tokio::select! {
            _ = self.inner.token.cancelled() => Err(TransportError::ListenerClosed),
            session = async { self.accept_rx.lock().await.recv().await } => {
                session.ok_or(TransportError::ListenerClosed)
            }
        }
    }

    /// Stop the read loop and sweepers and close every session. Idempotent.
    pub async fn close(&self) {
        self.inner.token.cancel();

        let pending: Vec<Session> = self
            .inner
            .pending
            .lock()
            .drain()
            .map(|(_, entry)| entry.session)
            .collect();
        let active: Vec<Session> = self
            .inner
            .active
            .write()
            .drain()
            .map(|(_, entry)| entry.session)
            .collect();

        for session in pending {
            session.abort().await;
        }
        for session in active {
            session.close().await;
        }
        info!(local_addr = %self.inner.local_addr, "listener closed");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.inner.token.cancel();
    }
}

impl ListenerInner {
    async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; 2048];

        loop {
            let (len, src) = tokio::select! {
                _ = self.token.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        debug!(error = %e, "recv_from failed");
                        continue;
                    }
                },
            };

            let packet = match GroukPacket::decode(Bytes::copy_from_slice(&buf[..len])) {
                Ok(packet) => packet,
                Err(e) => {
                    trace!(%src, error = %e, "undecodable datagram");
                    continue;
                }
            };

            if let Err(e) = self.handle_packet(packet, src).await {
                debug!(%src, "packet dropped: {}", e);
            }
        }

        debug!("listener read loop stopped");
    }

    async fn handle_packet(
        self: &Arc<Self>,
        packet: GroukPacket,
        src: SocketAddr,
    ) -> std::result::Result<(), DropReason> {
        match packet.packet_type {
            PacketType::HandshakeInit if packet.session_id == UNASSIGNED_SESSION_ID => {
                self.on_init(packet, src).await
            }
            PacketType::HandshakeAuth => self.on_auth(packet, src).await,
            packet_type if packet_type.is_sealed() => {
                let sid = packet.session_id;
                let session = self
                    .active
                    .read()
                    .get(&sid)
                    .map(|entry| entry.session.clone())
                    .ok_or(DropReason::UnknownSession(sid))?;
                if session.peer_addr() != src {
                    return Err(DropReason::AddressMismatch(sid));
                }
                session.handle_packet(packet).await;
                Ok(())
            }
            packet_type => Err(DropReason::UnexpectedType(packet_type)),
        }
    }

    /// Stored response for a retransmitted init, refreshing its pending entry.
    fn pending_response(
        pending: &mut HashMap<u32, PendingEntry>,
        public_key: &[u8; PUBLIC_KEY_SIZE],
        src: SocketAddr,
    ) -> Option<[u8; HandshakeResponse::SIZE]> {
        let entry = pending
            .values_mut()
            .find(|entry| entry.client_public == *public_key && entry.peer == src)?;
        entry.last_seen = Instant::now();
        Some(entry.response)
    }

    async fn on_init(
        self: &Arc<Self>,
        packet: GroukPacket,
        src: SocketAddr,
    ) -> std::result::Result<(), DropReason> {
        let init = HandshakeInit::decode(&packet.payload).map_err(TransportError::from)?;

        let repeated = Self::pending_response(&mut self.pending.lock(), &init.public_key, src);
        if let Some(response) = repeated {
            trace!(%src, "repeating handshake response");
            send_plain(&self.socket, src, UNASSIGNED_SESSION_ID, PacketType::HandshakeResponse, &response)
                .await?;
            return Ok(());
        }
        if self.pending.lock().len() >= self.config.max_pending {
            return Err(DropReason::PendingFull);
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.respond(init, src).await {
                debug!(%src, "handshake init dropped: {}", e);
            }
        });
        Ok(())
    }

    async fn respond(
        &self,
        init: HandshakeInit,
        src: SocketAddr,
    ) -> std::result::Result<(), DropReason> {
        let handshake = server_respond(&init, &self.psk)?;

        let response = {
            let mut pending = self.pending.lock();
            // Another responder for the same init may have finished first.
            if let Some(response) = Self::pending_response(&mut pending, &init.public_key, src) {
                response
            } else {
                if pending.len() >= self.config.max_pending {
                    return Err(DropReason::PendingFull);
                }

                let session_id = {
                    let active = self.active.read();
                    loop {
                        let candidate: u32 = rand::random();
                        if candidate != UNASSIGNED_SESSION_ID
                            && !pending.contains_key(&candidate)
                            && !active.contains_key(&candidate)
                        {
                            break candidate;
                        }
                    }
                };

                let response = HandshakeResponse {
                    session_id,
                    public_key: handshake.response_public_key,
                }
                .encode();
                let link = Link::new(
                    Arc::clone(&self.socket),
                    src,
                    session_id,
                    PacketCipher::new(&handshake.keys.send),
                );
                let session = Session::new(
                    session_id,
                    link,
                    PacketCipher::new(&handshake.keys.recv),
                    Arc::clone(&self.config),
                );

                pending.insert(
                    session_id,
                    PendingEntry {
                        session,
                        auth_key: handshake.keys.auth,
                        client_public: init.public_key,
                        response,
                        peer: src,
                        last_seen: Instant::now(),
                    },
                );
                debug!(session = session_id, %src, "session created, waiting for auth");
                response
            }
        };

        send_plain(&self.socket, src, UNASSIGNED_SESSION_ID, PacketType::HandshakeResponse, &response)
            .await?;
        Ok(())
    }

    async fn on_auth(
        &self,
        packet: GroukPacket,
        src: SocketAddr,
    ) -> std::result::Result<(), DropReason> {
        let sid = packet.session_id;

        let outcome = {
            let mut pending = self.pending.lock();
            match pending.get(&sid) {
                None => None,
                Some(entry) if entry.peer != src => return Err(DropReason::AddressMismatch(sid)),
                Some(entry) => {
                    let verdict = server_confirm(&entry.auth_key, &packet.payload);
                    pending.remove(&sid).map(|entry| match verdict {
                        Ok(done_tag) => {
                            let session = entry.session.clone();
                            self.active.write().insert(
                                sid,
                                ActiveEntry {
                                    session: entry.session,
                                    auth_key: entry.auth_key,
                                    done_tag,
                                },
                            );
                            Ok((session, done_tag))
                        }
                        Err(e) => Err((entry.session, e)),
                    })
                }
            }
        };

        let (session, done_tag) = match outcome {
            None => return self.repeat_done(&packet, src).await,
            Some(Ok(promoted)) => promoted,
            Some(Err((session, e))) => {
                debug!(session = sid, %src, "auth failed, dropping half-open session");
                session.abort().await;
                return Err(e.into());
            }
        };

        session.activate();
        send_plain(&self.socket, src, sid, PacketType::HandshakeDone, &done_tag).await?;
        info!(session = sid, %src, "session authenticated");

        if self.accept_tx.try_send(session.clone()).is_err() {
            warn!(session = sid, "accept backlog full, closing session");
            self.active.write().remove(&sid);
            session.close().await;
        }
        Ok(())
    }

    /// Answer a retransmitted auth for a session that is already active.
    async fn repeat_done(
        &self,
        packet: &GroukPacket,
        src: SocketAddr,
    ) -> std::result::Result<(), DropReason> {
        let sid = packet.session_id;
        let done_tag = {
            let active = self.active.read();
            let entry = active.get(&sid).ok_or(DropReason::UnknownSession(sid))?;
            if entry.session.peer_addr() != src {
                return Err(DropReason::AddressMismatch(sid));
            }
            verify_auth_tag(&entry.auth_key, Role::Client, &packet.payload)
                .map_err(|_| TransportError::AuthFailed)?;
            entry.done_tag
        };

        trace!(session = sid, %src, "repeating handshake done");
        send_plain(&self.socket, src, sid, PacketType::HandshakeDone, &done_tag).await?;
        Ok(())
    }

    fn spawn_sweeper<F, Fut>(self: &Arc<Self>, sweep: F)
    where
        F: Fn(Arc<ListenerInner>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.sweep_interval());
            loop {
                tokio::select! {
                    _ = inner.token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                sweep(Arc::clone(&inner)).await;
            }
        });
    }

    async fn sweep_pending(&self) {
        let timeout = self.config.pending_timeout();
        let expired: Vec<Session> = {
            let mut pending = self.pending.lock();
            let stale: Vec<u32> = pending
                .iter()
                .filter(|(_, entry)| entry.last_seen.elapsed() > timeout)
                .map(|(&sid, _)| sid)
                .collect();
            stale
                .into_iter()
                .filter_map(|sid| pending.remove(&sid))
                .map(|entry| entry.session)
                .collect()
        };

        for session in expired {
            debug!(session = session.id(), "pending session timed out");
            session.abort().await;
        }
    }

    async fn sweep_idle(&self) {
        let timeout = self.config.idle_timeout();
        let evicted: Vec<Session> = {
            let mut active = self.active.write();
            let stale: Vec<u32> = active
                .iter()
                .filter(|(_, entry)| entry.session.is_closed() || entry.session.idle_for() > timeout)
                .map(|(&sid, _)| sid)
                .collect();
            stale
                .into_iter()
                .filter_map(|sid| active.remove(&sid))
                .map(|entry| entry.session)
                .collect()
        };

        for session in evicted {
            if !session.is_closed() {
                info!(session = session.id(), peer = %session.peer_addr(), "evicting idle session");
            }
            session.close().await;
        }
    }
}
