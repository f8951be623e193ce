use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for sessions, streams and the listener.
///
/// Durations are stored as integer milliseconds so the struct maps directly
/// onto a JSON config file. Missing fields fall back to the protocol
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Overall deadline for the client handshake.
    pub handshake_timeout_ms: u64,
    /// Resend cadence for handshake init/auth while waiting for a reply.
    pub handshake_retry_ms: u64,
    /// Pending (unauthenticated) sessions idle this long are purged.
    pub pending_timeout_ms: u64,
    /// Active sessions with no authenticated traffic this long are evicted.
    pub idle_timeout_ms: u64,
    /// How often the listener sweeps pending and idle sessions.
    pub sweep_interval_ms: u64,
    pub keepalive_interval_ms: u64,
    pub retransmit_tick_ms: u64,
    pub initial_rto_ms: u64,
    pub max_rto_ms: u64,
    /// Resends allowed per fragment before the stream is torn down.
    pub max_retransmits: u32,
    /// Unacknowledged fragments allowed in flight per stream.
    pub send_window: usize,
    /// In-order chunks buffered per stream before delivery pauses.
    pub recv_queue: usize,
    /// Sessions (listener) or streams (session) waiting to be accepted.
    pub accept_backlog: usize,
    /// Upper bound on the listener's pending-auth table.
    pub max_pending: usize,
    /// How long `Stream::close` waits for in-flight data to be acknowledged.
    pub close_linger_ms: u64,
    /// SO_RCVBUF / SO_SNDBUF requested for transport sockets.
    pub socket_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            handshake_retry_ms: 2_000,
            pending_timeout_ms: 30_000,
            idle_timeout_ms: 5 * 60 * 1000,
            sweep_interval_ms: 10_000,
            keepalive_interval_ms: 20_000,
            retransmit_tick_ms: 50,
            initial_rto_ms: 200,
            max_rto_ms: 2_000,
            max_retransmits: 10,
            send_window: 128,
            recv_queue: 256,
            accept_backlog: 32,
            max_pending: 256,
            close_linger_ms: 2_000,
            socket_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn handshake_retry(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_ms.max(1))
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }

    pub fn retransmit_tick(&self) -> Duration {
        Duration::from_millis(self.retransmit_tick_ms.max(1))
    }

    pub fn close_linger(&self) -> Duration {
        Duration::from_millis(self.close_linger_ms)
    }

    /// Retransmission timeout for a fragment already resent `retries` times.
    ///
    /// Grows linearly from `initial_rto` and saturates at `max_rto`.
    pub fn rto(&self, retries: u32) -> Duration {
        let scaled = self
            .initial_rto_ms
            .saturating_mul(u64::from(retries).saturating_add(1));
        Duration::from_millis(scaled.min(self.max_rto_ms))
    }
}
