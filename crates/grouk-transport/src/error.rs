use grouk_core::PacketError;
use grouk_crypto::CryptoError;
use thiserror::Error;

/// Errors surfaced by sessions, streams, the listener and the dialer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("authentication failed")]
    AuthFailed,

    #[error("session closed")]
    SessionClosed,

    #[error("listener closed")]
    ListenerClosed,

    #[error("stream closed")]
    StreamClosed,

    #[error("stream id space exhausted")]
    StreamIdExhausted,

    #[error("maximum retransmissions exceeded")]
    MaxRetransmitExceeded,

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
