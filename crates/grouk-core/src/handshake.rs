//! Cleartext handshake payloads.
//!
//! ```text
//! Client                                   Listener
//!   | HandshakeInit     [client pub (32B)]     |  session id 0
//!   |----------------------------------------->|
//!   | HandshakeResponse [sid (4B)][pub (32B)]  |  session id 0
//!   |<-----------------------------------------|
//!   | HandshakeAuth     [HMAC tag (32B)]       |  session id = sid
//!   |----------------------------------------->|
//!   | HandshakeDone     [HMAC tag (32B)]       |  only if the tag verified
//!   |<-----------------------------------------|
//! ```

use crate::PacketError;

/// X25519 public key length.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// HMAC-SHA256 tag length used by `HandshakeAuth` and `HandshakeDone`.
pub const AUTH_TAG_SIZE: usize = 32;

/// Payload of `HandshakeInit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeInit {
    pub public_key: [u8; PUBLIC_KEY_SIZE],
}

impl HandshakeInit {
    /// Encoded size in bytes.
    pub const SIZE: usize = PUBLIC_KEY_SIZE;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        self.public_key
    }

    /// Trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < Self::SIZE {
            return Err(PacketError::TooShort(buf.len(), Self::SIZE));
        }

        let mut public_key = [0u8; PUBLIC_KEY_SIZE];
        public_key.copy_from_slice(&buf[..PUBLIC_KEY_SIZE]);
        Ok(Self { public_key })
    }
}

/// Payload of `HandshakeResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Responder-chosen, never zero.
    pub session_id: u32,
    pub public_key: [u8; PUBLIC_KEY_SIZE],
}

impl HandshakeResponse {
    /// Encoded size in bytes.
    pub const SIZE: usize = 4 + PUBLIC_KEY_SIZE;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.session_id.to_be_bytes());
        buf[4..].copy_from_slice(&self.public_key);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < Self::SIZE {
            return Err(PacketError::TooShort(buf.len(), Self::SIZE));
        }

        let session_id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if session_id == 0 {
            return Err(PacketError::Malformed("session id 0 in handshake response"));
        }

        let mut public_key = [0u8; PUBLIC_KEY_SIZE];
        public_key.copy_from_slice(&buf[4..Self::SIZE]);

        Ok(Self {
            session_id,
            public_key,
        })
    }
}
