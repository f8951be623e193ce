//! Core Grouk protocol types, framing, and constants.
//!
//! This crate provides:
//! - The outer datagram header (`GroukPacket`)
//! - Stream and ACK sub-frames carried inside encrypted data packets
//! - Cleartext handshake payloads
//!
//! # Packet Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Session ID                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |            Payload (sealed for Type >= 0x10) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! There is no magic and no version field: apart from the 5-byte header every
//! post-handshake datagram is indistinguishable from random bytes.

#![forbid(unsafe_code)]

pub mod frame;
pub mod handshake;

pub use frame::{AckFrame, StreamCommand, StreamFrame};
pub use handshake::{HandshakeInit, HandshakeResponse};

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Session id carried by handshake-init before the responder assigns one.
pub const UNASSIGNED_SESSION_ID: u32 = 0;

/// Outer header: `[SessionID (4B)][Type (1B)]`.
pub const HEADER_SIZE: usize = 5;

/// Datagram budget chosen to stay clear of IP fragmentation.
pub const MAX_DATAGRAM_SIZE: usize = 1400;

/// Random nonce prepended to every sealed payload.
pub const SEAL_NONCE_SIZE: usize = 12;

/// AEAD authentication tag appended to every sealed payload.
pub const SEAL_TAG_SIZE: usize = 16;

/// `[StreamID (2B)][Seq (4B)][Ack (4B)]`
pub const STREAM_HEADER_SIZE: usize = 10;

/// One command byte follows the stream header.
pub const STREAM_COMMAND_SIZE: usize = 1;

/// Largest stream payload that still fits one datagram after sealing.
pub const MAX_FRAGMENT_SIZE: usize = MAX_DATAGRAM_SIZE
    - HEADER_SIZE
    - SEAL_NONCE_SIZE
    - SEAL_TAG_SIZE
    - STREAM_HEADER_SIZE
    - STREAM_COMMAND_SIZE;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: {0} bytes, minimum {1}")]
    TooShort(usize, usize),
    #[error("unknown packet type: 0x{0:02x}")]
    UnknownType(u8),
    #[error("unknown stream command: 0x{0:02x}")]
    UnknownCommand(u8),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

/// Wire packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client ephemeral public key.
    HandshakeInit = 0x01,
    /// Assigned session id and responder public key.
    HandshakeResponse = 0x02,
    /// Client PSK-bound auth tag.
    HandshakeAuth = 0x03,
    /// Server PSK-bound auth tag.
    HandshakeDone = 0x04,
    /// Stream frame.
    Data = 0x10,
    /// Per-fragment acknowledgment.
    Ack = 0x11,
    Ping = 0x12,
    Pong = 0x13,
    /// Session teardown.
    Close = 0x14,
}

impl PacketType {
    /// Whether the payload of this type travels sealed under the session cipher.
    pub fn is_sealed(self) -> bool {
        (self as u8) >= (PacketType::Data as u8)
    }

    pub fn is_handshake(self) -> bool {
        !self.is_sealed()
    }
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::HandshakeInit),
            0x02 => Ok(Self::HandshakeResponse),
            0x03 => Ok(Self::HandshakeAuth),
            0x04 => Ok(Self::HandshakeDone),
            0x10 => Ok(Self::Data),
            0x11 => Ok(Self::Ack),
            0x12 => Ok(Self::Ping),
            0x13 => Ok(Self::Pong),
            0x14 => Ok(Self::Close),
            _ => Err(PacketError::UnknownType(value)),
        }
    }
}

/// One datagram on the wire. The payload is opaque at this layer: callers seal
/// and open it according to [`PacketType::is_sealed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroukPacket {
    pub session_id: u32,
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl GroukPacket {
    pub fn new(session_id: u32, packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            session_id,
            packet_type,
            payload: payload.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32(self.session_id);
        buf.put_u8(self.packet_type as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::TooShort(bytes.len(), HEADER_SIZE));
        }

        let session_id = bytes.get_u32();
        let packet_type = PacketType::try_from(bytes.get_u8())?;

        Ok(Self {
            session_id,
            packet_type,
            payload: bytes,
        })
    }
}
