//! Handshake auth tags.
//!
//! Each side proves it derived the same auth key by sending
//! `HMAC-SHA256(auth_key, "grouk-auth-v1-" || role)`. The role suffix keeps
//! a tag from one direction from being replayed in the other.

use grouk_core::handshake::AUTH_TAG_SIZE;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::keys::{Role, SessionKey};
use crate::CryptoError;

type HmacSha256 = Hmac<Sha256>;

pub type AuthTag = [u8; AUTH_TAG_SIZE];

fn auth_message(role: Role) -> &'static [u8] {
    match role {
        Role::Client => b"grouk-auth-v1-client",
        Role::Server => b"grouk-auth-v1-server",
    }
}

fn mac_for(key: &SessionKey, role: Role) -> Result<HmacSha256, CryptoError> {
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::KeyDerivation)?;
    mac.update(auth_message(role));
    Ok(mac)
}

/// Compute the tag `role` sends.
pub fn auth_tag(key: &SessionKey, role: Role) -> Result<AuthTag, CryptoError> {
    Ok(mac_for(key, role)?.finalize().into_bytes().into())
}

/// Verify in constant time that `tag` is the one `role` should have sent.
pub fn verify_auth_tag(key: &SessionKey, role: Role, tag: &[u8]) -> Result<(), CryptoError> {
    mac_for(key, role)?
        .verify_slice(tag)
        .map_err(|_| CryptoError::AuthMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_verifies_for_same_role() {
        let key = SessionKey::from_bytes([9; 32]);
        let tag = auth_tag(&key, Role::Client).unwrap();
        assert!(verify_auth_tag(&key, Role::Client, &tag).is_ok());
    }

    #[test]
    fn roles_are_not_interchangeable() {
        let key = SessionKey::from_bytes([9; 32]);
        let client = auth_tag(&key, Role::Client).unwrap();
        let server = auth_tag(&key, Role::Server).unwrap();
        assert_ne!(client, server);
        assert_eq!(
            verify_auth_tag(&key, Role::Server, &client),
            Err(CryptoError::AuthMismatch)
        );
    }

    #[test]
    fn wrong_key_fails() {
        let tag = auth_tag(&SessionKey::from_bytes([1; 32]), Role::Client).unwrap();
        assert_eq!(
            verify_auth_tag(&SessionKey::from_bytes([2; 32]), Role::Client, &tag),
            Err(CryptoError::AuthMismatch)
        );
    }

    #[test]
    fn truncated_tag_fails() {
        let key = SessionKey::from_bytes([9; 32]);
        let tag = auth_tag(&key, Role::Client).unwrap();
        assert_eq!(
            verify_auth_tag(&key, Role::Client, &tag[..16]),
            Err(CryptoError::AuthMismatch)
        );
    }
}
