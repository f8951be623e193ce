//! Per-direction AEAD for sealed packet payloads.
//!
//! # Wire Format
//!
//! ```text
//! [12 bytes: random nonce] [ciphertext] [16 bytes: auth tag]
//! ```
//!
//! The nonce is drawn fresh for every packet rather than derived from a
//! counter. Retransmitted fragments are re-sealed, and the receiver never
//! has to track nonce state to open reordered datagrams.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use grouk_core::{SEAL_NONCE_SIZE, SEAL_TAG_SIZE};
use rand::RngCore;

use crate::keys::SessionKey;
use crate::CryptoError;

/// Bytes added to every sealed payload.
pub const SEAL_OVERHEAD: usize = SEAL_NONCE_SIZE + SEAL_TAG_SIZE;

/// ChaCha20-Poly1305 cipher for one direction of a session.
pub struct PacketCipher {
    aead: ChaCha20Poly1305,
}

impl PacketCipher {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
        }
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; SEAL_NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .aead
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut sealed = Vec::with_capacity(SEAL_NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Authenticate and decrypt a payload produced by [`PacketCipher::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::TooShort(sealed.len()));
        }

        let (nonce, ciphertext) = sealed.split_at(SEAL_NONCE_SIZE);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decryption)
    }
}
