//! Reliable, ordered byte streams multiplexed over a session.
//!
//! Each direction numbers its fragments from 1. On the opening side the
//! open frame takes sequence 1 and travels through the unacked table like
//! data, so a lost open is retransmitted. The receiver acknowledges every
//! fragment individually; there is no cumulative ack.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use grouk_core::frame::{StreamCommand, StreamFrame};
use grouk_core::MAX_FRAGMENT_SIZE;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::link::Link;

/// Why a stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamFault {
    LocalClose,
    RemoteClose,
    SessionClosed,
    RetransmitExhausted,
}

impl StreamFault {
    fn error(self) -> TransportError {
        match self {
            StreamFault::LocalClose | StreamFault::RemoteClose => TransportError::StreamClosed,
            StreamFault::SessionClosed => TransportError::SessionClosed,
            StreamFault::RetransmitExhausted => TransportError::MaxRetransmitExceeded,
        }
    }

    /// Orderly shutdowns read as end-of-stream rather than an error.
    fn is_clean(self) -> bool {
        matches!(self, StreamFault::LocalClose | StreamFault::RemoteClose)
    }
}

struct SendEntry {
    payload: Bytes,
    command: StreamCommand,
    sent_at: Instant,
    retries: u32,
}

struct SendState {
    next_seq: u32,
    unacked: HashMap<u32, SendEntry>,
    closing: bool,
}

struct RecvState {
    next: u32,
    reorder: BTreeMap<u32, Bytes>,
    queue: VecDeque<Bytes>,
    /// Sequence number carried by the peer's close frame.
    fin: Option<u32>,
    eof: bool,
}

impl RecvState {
    fn new(next: u32) -> Self {
        Self {
            next,
            reorder: BTreeMap::new(),
            queue: VecDeque::new(),
            fin: None,
            eof: false,
        }
    }

    fn insert(&mut self, seq: u32, command: StreamCommand, payload: Bytes) {
        if self.eof || seq < self.next {
            return;
        }
        if self.fin.is_some_and(|fin| seq >= fin) {
            return;
        }

        match command {
            StreamCommand::Data => {
                self.reorder.entry(seq).or_insert(payload);
            }
            StreamCommand::Close => {
                self.fin = Some(seq);
                // Anything sequenced after the close can never be delivered.
                self.reorder.split_off(&seq);
            }
            StreamCommand::Open => {}
        }
    }

    /// Move consecutive fragments into the delivery queue.
    ///
    /// Returns true if this call reached the peer's close marker.
    fn pump(&mut self, capacity: usize) -> bool {
        while self.queue.len() < capacity {
            let Some(chunk) = self.reorder.remove(&self.next) else {
                break;
            };
            if !chunk.is_empty() {
                self.queue.push_back(chunk);
            }
            self.next = self.next.wrapping_add(1);
        }

        if !self.eof && self.fin == Some(self.next) {
            self.eof = true;
            return true;
        }
        false
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Option<usize> {
        let mut chunk = self.queue.pop_front()?;
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.queue.push_front(chunk.split_off(n));
        }
        Some(n)
    }
}

pub(crate) struct StreamShared {
    id: u16,
    link: Arc<Link>,
    config: Arc<TransportConfig>,
    registry: Weak<StreamRegistry>,
    token: CancellationToken,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    fault: Mutex<Option<StreamFault>>,
    /// Signalled when an unacked entry is released or the stream stops.
    window: Notify,
    /// Signalled when bytes become readable or the stream stops.
    readable: Notify,
}

impl StreamShared {
    /// `recv_next` is the first sequence number expected from the peer.
    pub(crate) fn new(
        id: u16,
        recv_next: u32,
        link: Arc<Link>,
        config: Arc<TransportConfig>,
        registry: Weak<StreamRegistry>,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            link,
            config,
            registry,
            token,
            send: Mutex::new(SendState {
                next_seq: 1,
                unacked: HashMap::new(),
                closing: false,
            }),
            recv: Mutex::new(RecvState::new(recv_next)),
            fault: Mutex::new(None),
            window: Notify::new(),
            readable: Notify::new(),
        })
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    fn current_fault(&self) -> Option<StreamFault> {
        *self.fault.lock()
    }

    fn write_error(&self, send: &SendState) -> Option<TransportError> {
        if let Some(fault) = self.current_fault() {
            return Some(fault.error());
        }
        if self.token.is_cancelled() {
            return Some(TransportError::SessionClosed);
        }
        if send.closing {
            return Some(TransportError::StreamClosed);
        }
        None
    }

    /// Wait for a window slot, then record `payload` under a fresh sequence number.
    async fn reserve(&self, command: StreamCommand, payload: Bytes) -> Result<u32> {
        let window = self.config.send_window.max(1);
        loop {
            let notified = self.window.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut send = self.send.lock();
                if let Some(err) = self.write_error(&send) {
                    return Err(err);
                }
                if send.unacked.len() < window {
                    let seq = send.next_seq;
                    send.next_seq = seq.wrapping_add(1);
                    send.unacked.insert(
                        seq,
                        SendEntry {
                            payload,
                            command,
                            sent_at: Instant::now(),
                            retries: 0,
                        },
                    );
                    return Ok(seq);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.token.cancelled() => {}
            }
        }
    }

    pub(crate) async fn send_open(&self) -> Result<()> {
        let seq = self.reserve(StreamCommand::Open, Bytes::new()).await?;
        self.link
            .send_frame(&StreamFrame::new(self.id, seq, StreamCommand::Open, Bytes::new()))
            .await
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        if let Some(err) = self.write_error(&self.send.lock()) {
            return Err(err);
        }

        for chunk in data.chunks(MAX_FRAGMENT_SIZE) {
            let payload = Bytes::copy_from_slice(chunk);
            let seq = self.reserve(StreamCommand::Data, payload.clone()).await?;
            self.link
                .send_frame(&StreamFrame::new(self.id, seq, StreamCommand::Data, payload))
                .await?;
        }
        Ok(data.len())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let capacity = self.config.recv_queue.max(1);

        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut recv = self.recv.lock();
                if let Some(n) = recv.read_into(buf) {
                    let reached_end = recv.pump(capacity);
                    drop(recv);
                    if reached_end {
                        self.teardown(StreamFault::RemoteClose);
                    }
                    return Ok(n);
                }
                if recv.eof {
                    return Ok(0);
                }
            }

            if let Some(fault) = self.current_fault() {
                return if fault.is_clean() {
                    Ok(0)
                } else {
                    Err(fault.error())
                };
            }
            if self.token.is_cancelled() {
                return Err(TransportError::SessionClosed);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.token.cancelled() => {}
            }
        }
    }

    /// Feed one inbound stream frame. Acknowledging it is the caller's job.
    pub(crate) fn receive(&self, seq: u32, command: StreamCommand, payload: Bytes) {
        let capacity = self.config.recv_queue.max(1);
        let (readable, reached_end) = {
            let mut recv = self.recv.lock();
            let before = recv.queue.len();
            recv.insert(seq, command, payload);
            let reached_end = recv.pump(capacity);
            (recv.queue.len() != before, reached_end)
        };

        if readable || reached_end {
            self.readable.notify_waiters();
        }
        if reached_end {
            self.teardown(StreamFault::RemoteClose);
        }
    }

    pub(crate) fn on_ack(&self, seq: u32) {
        let released = self.send.lock().unacked.remove(&seq).is_some();
        if released {
            trace!(stream = self.id, seq, "acked");
            self.window.notify_waiters();
        }
    }

    /// Returns once the close marker is sent, or after `close_linger` if data
    /// is still unacknowledged. In that case the stream keeps retransmitting in
    /// the background and only sends the marker once everything is acked, or
    /// tears down with `RetransmitExhausted`.
    async fn close(self: &Arc<Self>) {
        {
            let mut send = self.send.lock();
            if send.closing || self.current_fault().is_some() {
                return;
            }
            send.closing = true;
        }

        let finishing = tokio::spawn(Arc::clone(self).finish());
        if tokio::time::timeout(self.config.close_linger(), finishing)
            .await
            .is_err()
        {
            debug!(stream = self.id, "close linger expired with data in flight");
        }
    }

    async fn finish(self: Arc<Self>) {
        self.drain().await;

        // A marker ahead of unacked data would name a sequence number the
        // peer can never reach.
        if self.token.is_cancelled() || self.current_fault().is_some() {
            return;
        }

        let seq = {
            let mut send = self.send.lock();
            let seq = send.next_seq;
            send.next_seq = seq.wrapping_add(1);
            seq
        };
        let frame = StreamFrame::new(self.id, seq, StreamCommand::Close, Bytes::new());
        if let Err(e) = self.link.send_frame(&frame).await {
            debug!(stream = self.id, error = %e, "failed to send stream close");
        }

        self.teardown(StreamFault::LocalClose);
    }

    /// Wait for every sent fragment to be acknowledged, or for the stream to stop.
    async fn drain(&self) {
        loop {
            let notified = self.window.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.send.lock().unacked.is_empty() {
                return;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.token.cancelled() => return,
            }
        }
    }

    /// Stop the stream for good. Only the first fault is recorded.
    pub(crate) fn teardown(&self, fault: StreamFault) {
        {
            let mut current = self.fault.lock();
            if current.is_some() {
                return;
            }
            *current = Some(fault);
        }

        self.token.cancel();
        self.send.lock().unacked.clear();
        if let Some(registry) = self.registry.upgrade() {
            registry.retire(self.id);
        }
        self.window.notify_waiters();
        self.readable.notify_waiters();
        debug!(stream = self.id, ?fault, "stream stopped");
    }

    /// Entries whose retransmission timeout has elapsed, already marked as resent.
    ///
    /// Returns the offending sequence number once an entry runs out of retries.
    fn collect_due(&self, now: Instant) -> std::result::Result<Vec<StreamFrame>, u32> {
        let mut send = self.send.lock();
        let mut due = Vec::new();

        for (&seq, entry) in send.unacked.iter_mut() {
            if now.duration_since(entry.sent_at) < self.config.rto(entry.retries) {
                continue;
            }
            if entry.retries >= self.config.max_retransmits {
                return Err(seq);
            }
            entry.retries += 1;
            entry.sent_at = now;
            due.push(StreamFrame::new(
                self.id,
                seq,
                entry.command,
                entry.payload.clone(),
            ));
        }

        due.sort_unstable_by_key(|frame| frame.seq);
        Ok(due)
    }

    pub(crate) fn spawn_retransmit(self: &Arc<Self>) {
        let stream = Arc::clone(self);
        tokio::spawn(async move { stream.retransmit_loop().await });
    }

    async fn retransmit_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.retransmit_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self.collect_due(Instant::now()) {
                Ok(frames) => {
                    for frame in frames {
                        trace!(stream = self.id, seq = frame.seq, "retransmit");
                        if let Err(e) = self.link.send_frame(&frame).await {
                            debug!(stream = self.id, error = %e, "retransmit send failed");
                        }
                    }
                }
                Err(seq) => {
                    warn!(stream = self.id, seq, "retransmit limit reached, dropping stream");
                    self.teardown(StreamFault::RetransmitExhausted);
                    return;
                }
            }
        }
    }
}

/// Handle to one stream. Clones share the same stream, so one task can read
/// while another writes.
#[derive(Clone)]
pub struct Stream {
    shared: Arc<StreamShared>,
}

impl Stream {
    pub(crate) fn from_shared(shared: Arc<StreamShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> u16 {
        self.shared.id
    }

    /// Send `data` reliably, blocking while the send window is full.
    ///
    /// Returns once every fragment has been handed to the socket, not when
    /// the peer has acknowledged it.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.shared.write(data).await
    }

    /// Read the next in-order bytes. `Ok(0)` means end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.shared.read(buf).await
    }

    /// Fill `buf` completely or fail with `StreamClosed` at end of stream.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.shared.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(TransportError::StreamClosed);
            }
            filled += n;
        }
        Ok(())
    }

    /// Stop writing, then tell the peer once every written byte has been
    /// acknowledged. Waits at most `close_linger`; delivery of anything still
    /// in flight continues after this returns. Idempotent.
    pub async fn close(&self) {
        self.shared.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.current_fault().is_some()
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("fault", &self.shared.current_fault())
            .finish()
    }
}

/// Per-session map of live streams, plus the ids that have finished.
///
/// Ids are never reused, so retired ids are remembered to keep late
/// retransmissions from reopening a stream.
#[derive(Default)]
pub(crate) struct StreamRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    live: HashMap<u16, Arc<StreamShared>>,
    retired: HashSet<u16>,
}

impl StreamRegistry {
    pub fn get(&self, id: u16) -> Option<Arc<StreamShared>> {
        self.inner.lock().live.get(&id).cloned()
    }

    pub fn is_retired(&self, id: u16) -> bool {
        self.inner.lock().retired.contains(&id)
    }

    /// Register a stream. Fails if the id is live or retired.
    pub fn insert(&self, stream: Arc<StreamShared>) -> bool {
        let mut inner = self.inner.lock();
        let id = stream.id();
        if inner.live.contains_key(&id) || inner.retired.contains(&id) {
            return false;
        }
        inner.live.insert(id, stream);
        true
    }

    /// Forget a stream without retiring its id.
    pub fn remove(&self, id: u16) -> Option<Arc<StreamShared>> {
        self.inner.lock().live.remove(&id)
    }

    pub fn retire(&self, id: u16) {
        let mut inner = self.inner.lock();
        inner.live.remove(&id);
        inner.retired.insert(id);
    }

    pub fn drain(&self) -> Vec<Arc<StreamShared>> {
        self.inner.lock().live.drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use grouk_core::{GroukPacket, PacketType};
    use grouk_crypto::{PacketCipher, SessionKey};
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    use super::*;

    const KEY: [u8; 32] = [3; 32];

    fn fast_config() -> TransportConfig {
        TransportConfig {
            retransmit_tick_ms: 5,
            initial_rto_ms: 30,
            max_rto_ms: 1_000,
            ..TransportConfig::default()
        }
    }

    /// A stream whose link points at a bare UDP socket standing in for the peer.
    async fn harness(config: TransportConfig, recv_next: u32) -> (Stream, UdpSocket, PacketCipher) {
        let local = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link = Arc::new(Link::new(
            local,
            peer.local_addr().unwrap(),
            7,
            PacketCipher::new(&SessionKey::from_bytes(KEY)),
        ));
        let shared = StreamShared::new(
            5,
            recv_next,
            link,
            Arc::new(config),
            Weak::new(),
            CancellationToken::new(),
        );
        shared.spawn_retransmit();
        (
            Stream::from_shared(shared),
            peer,
            PacketCipher::new(&SessionKey::from_bytes(KEY)),
        )
    }

    async fn recv_frame(peer: &UdpSocket, cipher: &PacketCipher) -> StreamFrame {
        let mut buf = [0u8; 2048];
        let (n, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .expect("frame within deadline")
            .unwrap();
        let packet = GroukPacket::decode(Bytes::copy_from_slice(&buf[..n])).unwrap();
        assert_eq!(packet.packet_type, PacketType::Data);
        assert_eq!(packet.session_id, 7);
        StreamFrame::decode(Bytes::from(cipher.open(&packet.payload).unwrap())).unwrap()
    }

    #[tokio::test]
    async fn retransmits_with_backoff_until_acked() {
        let (stream, peer, cipher) = harness(fast_config(), 1).await;
        stream.write(b"hello").await.unwrap();

        let mut copies = Vec::new();
        let mut arrivals = Vec::new();
        for _ in 0..4 {
            copies.push(recv_frame(&peer, &cipher).await);
            arrivals.push(Instant::now());
        }

        for frame in &copies {
            assert_eq!(frame.seq, 1);
            assert_eq!(frame.command, StreamCommand::Data);
            assert_eq!(&frame.payload[..], b"hello");
        }

        let gaps: Vec<Duration> = arrivals.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(
                pair[1] + Duration::from_millis(10) >= pair[0],
                "retransmit intervals shrank: {gaps:?}"
            );
        }

        stream.shared.on_ack(1);
        assert!(stream.shared.send.lock().unacked.is_empty());
        let mut buf = [0u8; 2048];
        assert!(
            timeout(Duration::from_millis(300), peer.recv_from(&mut buf))
                .await
                .is_err(),
            "acked fragment was resent"
        );

        let (receiver, _peer, _) = harness(fast_config(), 1).await;
        for frame in &copies {
            receiver
                .shared
                .receive(frame.seq, frame.command, frame.payload.clone());
        }
        let n = receiver.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(timeout(Duration::from_millis(50), receiver.read(&mut buf))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn retransmit_exhaustion_tears_down_stream() {
        let config = TransportConfig {
            retransmit_tick_ms: 5,
            initial_rto_ms: 10,
            max_rto_ms: 20,
            max_retransmits: 2,
            ..TransportConfig::default()
        };
        let (stream, _peer, _) = harness(config, 1).await;
        stream.write(b"lost").await.unwrap();

        timeout(Duration::from_secs(2), async {
            while !stream.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(
            stream.write(b"more").await,
            Err(TransportError::MaxRetransmitExceeded)
        ));
        let mut buf = [0u8; 8];
        assert!(matches!(
            stream.read(&mut buf).await,
            Err(TransportError::MaxRetransmitExceeded)
        ));
    }

    #[tokio::test]
    async fn reorders_and_deduplicates() {
        let (stream, _peer, _) = harness(fast_config(), 1).await;
        let shared = &stream.shared;
        shared.receive(3, StreamCommand::Data, Bytes::from_static(b"c"));
        shared.receive(1, StreamCommand::Data, Bytes::from_static(b"a"));
        shared.receive(1, StreamCommand::Data, Bytes::from_static(b"a"));
        shared.receive(2, StreamCommand::Data, Bytes::from_static(b"b"));
        shared.receive(3, StreamCommand::Data, Bytes::from_static(b"c"));
        shared.receive(2, StreamCommand::Data, Bytes::from_static(b"b"));

        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        for _ in 0..3 {
            let n = stream.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abc");
        assert!(timeout(Duration::from_millis(50), stream.read(&mut buf))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn close_marker_is_ordered_end_of_stream() {
        let (stream, _peer, _) = harness(fast_config(), 1).await;
        let shared = &stream.shared;
        shared.receive(3, StreamCommand::Close, Bytes::new());
        shared.receive(4, StreamCommand::Data, Bytes::from_static(b"late"));
        shared.receive(2, StreamCommand::Data, Bytes::from_static(b"b"));
        assert!(!stream.is_closed());
        shared.receive(1, StreamCommand::Data, Bytes::from_static(b"a"));

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"a");
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"b");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(stream.is_closed());
        assert!(matches!(
            stream.write(b"x").await,
            Err(TransportError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn partial_reads_keep_the_remainder() {
        let (stream, _peer, _) = harness(fast_config(), 1).await;
        stream
            .shared
            .receive(1, StreamCommand::Data, Bytes::from_static(b"hello world"));

        let mut buf = [0u8; 5];
        let mut out = Vec::new();
        while out.len() < 11 {
            let n = stream.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn delivery_pauses_when_queue_is_full() {
        let config = TransportConfig {
            recv_queue: 2,
            ..fast_config()
        };
        let (stream, _peer, _) = harness(config, 1).await;
        for (seq, byte) in [(1u32, b"1"), (2, b"2"), (3, b"3")] {
            stream
                .shared
                .receive(seq, StreamCommand::Data, Bytes::from_static(byte));
        }
        {
            let recv = stream.shared.recv.lock();
            assert_eq!(recv.queue.len(), 2);
            assert!(recv.reorder.contains_key(&3));
        }

        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        for _ in 0..3 {
            let n = stream.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"123");
    }

    #[tokio::test]
    async fn window_blocks_until_ack() {
        let config = TransportConfig {
            send_window: 2,
            initial_rto_ms: 10_000,
            max_rto_ms: 10_000,
            ..fast_config()
        };
        let (stream, _peer, _) = harness(config, 1).await;
        stream.write(b"a").await.unwrap();
        stream.write(b"b").await.unwrap();

        assert!(timeout(Duration::from_millis(100), stream.write(b"c"))
            .await
            .is_err());

        let writer = stream.clone();
        let pending = tokio::spawn(async move { writer.write(b"c").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        stream.shared.on_ack(1);
        let written = timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(written, 1);
    }

    #[tokio::test]
    async fn close_waits_for_acks_then_sends_marker() {
        let config = TransportConfig {
            initial_rto_ms: 10_000,
            max_rto_ms: 10_000,
            close_linger_ms: 2_000,
            ..fast_config()
        };
        let (stream, peer, cipher) = harness(config, 1).await;
        stream.write(b"x").await.unwrap();
        let data = recv_frame(&peer, &cipher).await;
        assert_eq!(data.seq, 1);

        let closer = stream.clone();
        let closing = tokio::spawn(async move { closer.close().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!closing.is_finished());

        stream.shared.on_ack(1);
        timeout(Duration::from_secs(1), closing)
            .await
            .unwrap()
            .unwrap();

        let marker = recv_frame(&peer, &cipher).await;
        assert_eq!(marker.command, StreamCommand::Close);
        assert_eq!(marker.seq, 2);
        assert!(stream.is_closed());

        // Idempotent.
        stream.close().await;
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn marker_waits_for_acks_past_the_linger() {
        let config = TransportConfig {
            initial_rto_ms: 10_000,
            max_rto_ms: 10_000,
            close_linger_ms: 50,
            ..fast_config()
        };
        let (stream, peer, cipher) = harness(config, 1).await;
        stream.write(b"x").await.unwrap();
        assert_eq!(recv_frame(&peer, &cipher).await.seq, 1);

        timeout(Duration::from_secs(1), stream.close()).await.unwrap();
        assert!(!stream.is_closed());
        assert!(matches!(
            stream.write(b"y").await,
            Err(TransportError::StreamClosed)
        ));

        let mut buf = [0u8; 2048];
        assert!(
            timeout(Duration::from_millis(100), peer.recv_from(&mut buf))
                .await
                .is_err(),
            "marker sent ahead of unacked data"
        );

        stream.shared.on_ack(1);
        let marker = recv_frame(&peer, &cipher).await;
        assert_eq!(marker.command, StreamCommand::Close);
        assert_eq!(marker.seq, 2);
        timeout(Duration::from_secs(1), async {
            while !stream.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn unacked_close_exhausts_retries_without_a_marker() {
        let config = TransportConfig {
            retransmit_tick_ms: 5,
            initial_rto_ms: 10,
            max_rto_ms: 20,
            max_retransmits: 3,
            close_linger_ms: 20,
            ..TransportConfig::default()
        };
        let (stream, peer, cipher) = harness(config, 1).await;
        stream.write(b"payload").await.unwrap();
        stream.close().await;

        let mut frames = Vec::new();
        let mut buf = [0u8; 2048];
        while let Ok(received) = timeout(Duration::from_millis(300), peer.recv_from(&mut buf)).await {
            let (n, _) = received.unwrap();
            let packet = GroukPacket::decode(Bytes::copy_from_slice(&buf[..n])).unwrap();
            let frame =
                StreamFrame::decode(Bytes::from(cipher.open(&packet.payload).unwrap())).unwrap();
            frames.push((frame.seq, frame.command));
        }

        assert_eq!(frames, vec![(1, StreamCommand::Data); 4]);
        assert!(stream.is_closed());
        let mut out = [0u8; 8];
        assert!(matches!(
            stream.read(&mut out).await,
            Err(TransportError::MaxRetransmitExceeded)
        ));
    }

    #[test]
    fn registry_never_reuses_ids() {
        let registry = StreamRegistry::default();
        assert_eq!(registry.len(), 0);
        registry.retire(9);
        assert!(registry.is_retired(9));
        assert!(registry.get(9).is_none());
    }
}
