//! Ephemeral key exchange and session key derivation.

use grouk_core::handshake::PUBLIC_KEY_SIZE;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

/// Symmetric key length for ChaCha20-Poly1305 and HMAC-SHA256.
pub const KEY_SIZE: usize = 32;

/// HKDF salt used when the PSK is empty.
const DEFAULT_SALT: &[u8] = b"grouk-default-salt-v1";

pub(crate) const LABEL_CLIENT_SEND: &[u8] = b"grouk-client-send-v1";
pub(crate) const LABEL_SERVER_SEND: &[u8] = b"grouk-server-send-v1";
pub(crate) const LABEL_AUTH: &[u8] = b"grouk-auth-v1";

/// Which end of the handshake a party plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// X25519 key pair used for exactly one handshake.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeypair {
    /// Generate a new key pair from the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Compute the shared secret with a peer's public key.
    ///
    /// Low-order peer keys yield an all-zero secret and are rejected.
    pub fn diffie_hellman(&self, peer_public: &[u8]) -> Result<SharedSecret, CryptoError> {
        let peer: [u8; PUBLIC_KEY_SIZE] = peer_public
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey(peer_public.len()))?;

        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakSharedSecret);
        }

        Ok(SharedSecret(*shared.as_bytes()))
    }
}

/// Raw ECDH output. Never used as a key directly.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// 256-bit symmetric key, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// HKDF-SHA256 with the PSK as salt and `label` as info.
pub fn derive_key(
    secret: &SharedSecret,
    psk: &[u8],
    label: &[u8],
) -> Result<SessionKey, CryptoError> {
    let salt = if psk.is_empty() { DEFAULT_SALT } else { psk };
    let hkdf = Hkdf::<Sha256>::new(Some(salt), secret.as_bytes());

    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(label, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;

    let key = SessionKey(okm);
    okm.zeroize();
    Ok(key)
}

/// The three keys a handshake produces, oriented for one role.
pub struct SessionKeys {
    /// Seals what this side sends.
    pub send: SessionKey,
    /// Opens what the peer sends.
    pub recv: SessionKey,
    /// Keys the handshake auth tags.
    pub auth: SessionKey,
}

impl SessionKeys {
    pub fn derive(secret: &SharedSecret, psk: &[u8], role: Role) -> Result<Self, CryptoError> {
        let client_send = derive_key(secret, psk, LABEL_CLIENT_SEND)?;
        let server_send = derive_key(secret, psk, LABEL_SERVER_SEND)?;
        let auth = derive_key(secret, psk, LABEL_AUTH)?;

        let (send, recv) = match role {
            Role::Client => (client_send, server_send),
            Role::Server => (server_send, client_send),
        };

        Ok(Self { send, recv, auth })
    }
}
