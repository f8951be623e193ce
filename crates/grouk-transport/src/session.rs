//! Authenticated session: one peer, two ciphers, many streams.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use grouk_core::frame::{AckFrame, StreamCommand, StreamFrame};
use grouk_core::{GroukPacket, PacketType};
use grouk_crypto::PacketCipher;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::link::Link;
use crate::state::{Lifecycle, LifecycleEvent, SessionState};
use crate::stream::{Stream, StreamFault, StreamRegistry, StreamShared};

pub(crate) struct SessionInner {
    id: u32,
    link: Arc<Link>,
    recv_cipher: PacketCipher,
    config: Arc<TransportConfig>,
    streams: Arc<StreamRegistry>,
    next_stream_id: AtomicU32,
    last_activity: Mutex<Instant>,
    lifecycle: Lifecycle,
    accept_tx: mpsc::Sender<Stream>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        // Stops the keepalive and every stream's retransmit task.
        self.lifecycle.token().cancel();
    }
}

/// A session handle. Clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session in the `Pending` state.
    pub(crate) fn new(
        id: u32,
        link: Link,
        recv_cipher: PacketCipher,
        config: Arc<TransportConfig>,
    ) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        Self {
            inner: Arc::new(SessionInner {
                id,
                link: Arc::new(link),
                recv_cipher,
                config,
                streams: Arc::new(StreamRegistry::default()),
                next_stream_id: AtomicU32::new(1),
                last_activity: Mutex::new(Instant::now()),
                lifecycle: Lifecycle::new(SessionState::Pending),
                accept_tx,
                accept_rx: tokio::sync::Mutex::new(accept_rx),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.link.peer()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lifecycle.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closing_or_closed()
    }

    /// Time since the last authenticated inbound datagram.
    pub fn idle_for(&self) -> Duration {
        self.inner.last_activity.lock().elapsed()
    }

    pub fn stream_count(&self) -> usize {
        self.inner.streams.len()
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    /// Cancelled as soon as the session starts closing.
    pub(crate) fn close_token(&self) -> CancellationToken {
        self.inner.lifecycle.token().clone()
    }

    pub(crate) fn upgrade(weak: &Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn touch(&self) {
        *self.inner.last_activity.lock() = Instant::now();
    }

    /// Promote a pending session once the peer has proven the PSK.
    pub(crate) fn activate(&self) -> bool {
        match self.inner.lifecycle.apply(LifecycleEvent::Authenticated) {
            Ok(_) => {
                self.touch();
                self.spawn_keepalive();
                true
            }
            Err(e) => {
                debug!(session = self.inner.id, error = %e, "activation refused");
                false
            }
        }
    }

    fn spawn_keepalive(&self) {
        let weak = self.downgrade();
        let token = self.inner.lifecycle.token().clone();
        let period = self.inner.config.keepalive_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(session) = Session::upgrade(&weak) else {
                    return;
                };
                if let Err(e) = session.inner.link.send_sealed(PacketType::Ping, &[]).await {
                    debug!(session = session.inner.id, error = %e, "keepalive send failed");
                }
            }
        });
    }

    fn allocate_stream_id(&self) -> Result<u16> {
        self.inner
            .next_stream_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                (next <= u32::from(u16::MAX)).then_some(next + 1)
            })
            .map(|id| id as u16)
            .map_err(|_| TransportError::StreamIdExhausted)
    }

    fn new_stream(&self, id: u16, recv_next: u32) -> Arc<StreamShared> {
        StreamShared::new(
            id,
            recv_next,
            Arc::clone(&self.inner.link),
            Arc::clone(&self.inner.config),
            Arc::downgrade(&self.inner.streams),
            self.inner.lifecycle.token().child_token(),
        )
    }

    /// Open a new outbound stream.
    ///
    /// Ids are handed out from 1 upward and never reused; once all 65535
    /// are spent every further call fails with `StreamIdExhausted`.
    pub async fn open_stream(&self) -> Result<Stream> {
        if self.state() != SessionState::Active {
            return Err(TransportError::SessionClosed);
        }

        let shared = loop {
            let id = self.allocate_stream_id()?;
            let shared = self.new_stream(id, 1);
            if self.inner.streams.insert(Arc::clone(&shared)) {
                break shared;
            }
        };
        shared.spawn_retransmit();
        shared.send_open().await?;

        debug!(session = self.inner.id, stream = shared.id(), "stream opened");
        Ok(Stream::from_shared(shared))
    }

    /// Wait for the peer to open a stream.
    pub async fn accept_stream(&self) -> Result<Stream> {
        let token = self.inner.lifecycle.token();
        tokio::select! {
            _ = token.cancelled() => Err(TransportError::SessionClosed),
            stream = async { self.inner.accept_rx.lock().await.recv().await } => {
                stream.ok_or(TransportError::SessionClosed)
            }
        }
    }

    /// Close the session and every stream on it, telling the peer. Idempotent.
    pub async fn close(&self) {
        self.shutdown(true).await
    }

    /// Close without notifying the peer.
    pub(crate) async fn abort(&self) {
        self.shutdown(false).await
    }

    async fn shutdown(&self, notify_peer: bool) {
        if self
            .inner
            .lifecycle
            .apply(LifecycleEvent::CloseRequested)
            .is_err()
        {
            return;
        }

        for stream in self.inner.streams.drain() {
            stream.teardown(StreamFault::SessionClosed);
        }
        if notify_peer {
            if let Err(e) = self.inner.link.send_sealed(PacketType::Close, &[]).await {
                debug!(session = self.inner.id, error = %e, "failed to send close");
            }
        }

        let _ = self.inner.lifecycle.apply(LifecycleEvent::Finished);
        info!(session = self.inner.id, peer = %self.peer_addr(), "session closed");
    }

    /// Process one datagram addressed to this session.
    ///
    /// Only sealed types are accepted, and nothing is acted on (liveness
    /// included) unless the payload authenticates.
    pub(crate) async fn handle_packet(&self, packet: GroukPacket) {
        if self.state() != SessionState::Active {
            return;
        }
        if !packet.packet_type.is_sealed() {
            trace!(session = self.inner.id, packet_type = ?packet.packet_type, "unexpected cleartext packet");
            return;
        }

        let plaintext = match self.inner.recv_cipher.open(&packet.payload) {
            Ok(plaintext) => Bytes::from(plaintext),
            Err(e) => {
                trace!(session = self.inner.id, error = %e, "dropping unauthenticated packet");
                return;
            }
        };
        self.touch();

        let result = match packet.packet_type {
            PacketType::Data => self.on_stream_frame(plaintext).await,
            PacketType::Ack => self.on_ack(&plaintext),
            PacketType::Ping => self.inner.link.send_sealed(PacketType::Pong, &[]).await,
            PacketType::Pong => Ok(()),
            PacketType::Close => {
                debug!(session = self.inner.id, "peer closed session");
                self.abort().await;
                Ok(())
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            debug!(session = self.inner.id, error = %e, "inbound packet dropped");
        }
    }

    async fn on_stream_frame(&self, plaintext: Bytes) -> Result<()> {
        let frame = StreamFrame::decode(plaintext)?;

        if frame.command == StreamCommand::Open {
            return self.on_open(frame).await;
        }

        match self.inner.streams.get(frame.stream_id) {
            Some(stream) => {
                stream.receive(frame.seq, frame.command, frame.payload);
                self.inner.link.send_ack(frame.stream_id, frame.seq).await
            }
            // Late retransmission for a finished stream: ack so the peer stops.
            None if self.inner.streams.is_retired(frame.stream_id) => {
                self.inner.link.send_ack(frame.stream_id, frame.seq).await
            }
            // Data that overtook its open; the peer will resend it.
            None => {
                trace!(session = self.inner.id, stream = frame.stream_id, "frame for unknown stream");
                Ok(())
            }
        }
    }

    async fn on_open(&self, frame: StreamFrame) -> Result<()> {
        let id = frame.stream_id;
        if self.inner.streams.get(id).is_some() || self.inner.streams.is_retired(id) {
            return self.inner.link.send_ack(id, frame.seq).await;
        }

        let shared = self.new_stream(id, frame.seq.wrapping_add(1));
        if !self.inner.streams.insert(Arc::clone(&shared)) {
            return Ok(());
        }

        if self
            .inner
            .accept_tx
            .try_send(Stream::from_shared(Arc::clone(&shared)))
            .is_err()
        {
            // Not acked, so the peer retries the open once the backlog drains.
            debug!(session = self.inner.id, stream = id, "stream backlog full, open deferred");
            self.inner.streams.remove(id);
            return Ok(());
        }

        shared.spawn_retransmit();
        debug!(session = self.inner.id, stream = id, "stream accepted");
        self.inner.link.send_ack(id, frame.seq).await
    }

    fn on_ack(&self, plaintext: &[u8]) -> Result<()> {
        let ack = AckFrame::decode(plaintext)?;
        if let Some(stream) = self.inner.streams.get(ack.stream_id) {
            stream.on_ack(ack.seq);
        }
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.link.peer())
            .field("state", &self.state())
            .finish()
    }
}
