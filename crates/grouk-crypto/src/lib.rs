//! Cryptographic primitives for Grouk.
//!
//! This crate provides:
//! - Ephemeral X25519 key pairs and shared-secret computation
//! - HKDF-SHA256 derivation of per-direction session keys bound to a PSK
//! - ChaCha20-Poly1305 sealing with a random nonce per packet
//! - HMAC-SHA256 auth tags proving PSK knowledge during the handshake
//!
//! # Design
//!
//! The handshake is an anonymous ECDH. The PSK is mixed in as the HKDF salt,
//! so a peer without it derives unrelated keys and cannot produce a valid
//! auth tag. Three keys come out of one shared secret:
//!
//! ```text
//! client_send = HKDF(secret, psk, "grouk-client-send-v1")
//! server_send = HKDF(secret, psk, "grouk-server-send-v1")
//! auth        = HKDF(secret, psk, "grouk-auth-v1")
//! ```
//!
//! Every sealed payload carries its own random nonce, so datagrams can be
//! opened in any order.

#![forbid(unsafe_code)]

pub mod auth;
pub mod cipher;
pub mod keys;

pub use auth::{auth_tag, verify_auth_tag, AuthTag};
pub use cipher::PacketCipher;
pub use keys::{derive_key, EphemeralKeypair, Role, SessionKey, SessionKeys, SharedSecret};

use thiserror::Error;

/// Cryptographic failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("sealed payload too short: {0} bytes")]
    TooShort(usize),

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed")]
    Decryption,

    #[error("invalid public key length: {0}")]
    InvalidPublicKey(usize),

    #[error("non-contributory shared secret")]
    WeakSharedSecret,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("auth tag mismatch")]
    AuthMismatch,
}
