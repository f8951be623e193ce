//! Both halves of the key agreement driven through the public API.

use grouk_crypto::{
    auth_tag, verify_auth_tag, CryptoError, EphemeralKeypair, PacketCipher, Role, SessionKeys,
};

struct Sides {
    client: SessionKeys,
    server: SessionKeys,
}

fn agree(client_psk: &[u8], server_psk: &[u8]) -> Sides {
    let client_pair = EphemeralKeypair::generate();
    let server_pair = EphemeralKeypair::generate();

    let client_secret = client_pair.diffie_hellman(&server_pair.public_key()).unwrap();
    let server_secret = server_pair.diffie_hellman(&client_pair.public_key()).unwrap();

    Sides {
        client: SessionKeys::derive(&client_secret, client_psk, Role::Client).unwrap(),
        server: SessionKeys::derive(&server_secret, server_psk, Role::Server).unwrap(),
    }
}

#[test]
fn matching_psk_authenticates_both_ways() {
    let sides = agree(b"shared", b"shared");

    let client_tag = auth_tag(&sides.client.auth, Role::Client).unwrap();
    verify_auth_tag(&sides.server.auth, Role::Client, &client_tag).unwrap();

    let server_tag = auth_tag(&sides.server.auth, Role::Server).unwrap();
    verify_auth_tag(&sides.client.auth, Role::Server, &server_tag).unwrap();

    // A reflected tag is not a proof.
    assert_eq!(
        verify_auth_tag(&sides.client.auth, Role::Server, &client_tag),
        Err(CryptoError::AuthMismatch)
    );
}

#[test]
fn directions_use_independent_keys() {
    let sides = agree(b"shared", b"shared");
    let client_out = PacketCipher::new(&sides.client.send);
    let server_in = PacketCipher::new(&sides.server.recv);
    let server_out = PacketCipher::new(&sides.server.send);
    let client_in = PacketCipher::new(&sides.client.recv);

    let upstream = client_out.seal(b"to server").unwrap();
    assert_eq!(server_in.open(&upstream).unwrap(), b"to server");
    assert_eq!(client_in.open(&upstream), Err(CryptoError::Decryption));

    let downstream = server_out.seal(b"to client").unwrap();
    assert_eq!(client_in.open(&downstream).unwrap(), b"to client");
}

#[test]
fn mismatched_psk_fails_auth_and_decryption() {
    let sides = agree(b"right", b"wrong");

    let client_tag = auth_tag(&sides.client.auth, Role::Client).unwrap();
    assert_eq!(
        verify_auth_tag(&sides.server.auth, Role::Client, &client_tag),
        Err(CryptoError::AuthMismatch)
    );

    let sealed = PacketCipher::new(&sides.client.send).seal(b"secret").unwrap();
    assert_eq!(
        PacketCipher::new(&sides.server.recv).open(&sealed),
        Err(CryptoError::Decryption)
    );
}

#[test]
fn single_bit_flips_never_open() {
    let sides = agree(b"", b"");
    let seal = PacketCipher::new(&sides.client.send);
    let open = PacketCipher::new(&sides.server.recv);

    let sealed = seal.seal(b"integrity").unwrap();
    for byte in 0..sealed.len() {
        for bit in 0..8 {
            let mut corrupted = sealed.clone();
            corrupted[byte] ^= 1 << bit;
            assert!(open.open(&corrupted).is_err());
        }
    }
    assert_eq!(open.open(&sealed).unwrap(), b"integrity");
}
