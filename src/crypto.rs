use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha3::Sha3_256;
use subtle::ConstantTimeEq;

use crate::{BakeryError, Result};

type HmacSha3 = Hmac<Sha3_256>;

/// Size of HMAC-SHA3-256 output in bytes (32 bytes = 256 bits)
pub const SIGNATURE_SIZE: usize = 32;

/// Size of an XSalsa20-Poly1305 nonce
pub const NONCE_SIZE: usize = 24;

/// Generates an HMAC-SHA3-256 signature over a single message.
pub fn keyed_hash(key: &[u8], message: &[u8]) -> [u8; SIGNATURE_SIZE] {
    let mut mac = <HmacSha3 as Mac>::new_from_slice(key).expect("HMAC can take key of any length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Generates an HMAC-SHA3-256 signature over two messages.
///
/// Each part is hashed separately before the outer MAC, so distinct
/// splits of the same byte stream produce distinct signatures. Used to
/// chain third-party caveats, which contribute both their verification
/// id and their caveat id to the signature.
pub fn keyed_hash2(key: &[u8], d1: &[u8], d2: &[u8]) -> [u8; SIGNATURE_SIZE] {
    let h1 = keyed_hash(key, d1);
    let h2 = keyed_hash(key, d2);
    let mut mac = <HmacSha3 as Mac>::new_from_slice(key).expect("HMAC can take key of any length");
    mac.update(&h1);
    mac.update(&h2);
    mac.finalize().into_bytes().into()
}

/// Constant-time signature comparison.
pub fn sigs_equal(a: &[u8; SIGNATURE_SIZE], b: &[u8; SIGNATURE_SIZE]) -> bool {
    a.ct_eq(b).into()
}

/// Fills an N-byte array from the system CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Seals `plaintext` with XSalsa20-Poly1305 under `key`, returning
/// `nonce ‖ ciphertext`.
pub fn secretbox_seal(key: &[u8; SIGNATURE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    let nonce_bytes: [u8; NONCE_SIZE] = random_bytes();
    let nonce = Nonce::from(nonce_bytes);
    let sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| BakeryError::Crypto("cannot seal verification id".into()))?;
    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Opens a `nonce ‖ ciphertext` blob produced by [`secretbox_seal`].
pub fn secretbox_open(key: &[u8; SIGNATURE_SIZE], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_SIZE {
        return Err(BakeryError::Crypto("sealed blob too short".into()));
    }
    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
    cipher
        .decrypt(nonce, &data[NONCE_SIZE..])
        .map_err(|_| BakeryError::Crypto("cannot open sealed blob".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyed_hash_deterministic() {
        let sig1 = keyed_hash(b"secret key", b"hello world");
        let sig2 = keyed_hash(b"secret key", b"hello world");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), SIGNATURE_SIZE);
    }

    #[test]
    fn test_keyed_hash_different_keys() {
        assert_ne!(keyed_hash(b"key1", b"msg"), keyed_hash(b"key2", b"msg"));
    }

    #[test]
    fn test_keyed_hash2_distinguishes_splits() {
        let base = keyed_hash(b"root", b"id");
        // Same concatenated byte stream, different split.
        assert_ne!(
            keyed_hash2(&base, b"aa", b"bb"),
            keyed_hash2(&base, b"a", b"abb")
        );
        assert_ne!(
            keyed_hash2(&base, b"aa", b"bb"),
            keyed_hash2(&base, b"bb", b"aa")
        );
    }

    #[test]
    fn test_sigs_equal() {
        let a = keyed_hash(b"k", b"m");
        let mut b = a;
        assert!(sigs_equal(&a, &b));
        b[0] ^= 0xff;
        assert!(!sigs_equal(&a, &b));
    }

    #[test]
    fn test_secretbox_roundtrip() {
        let key = keyed_hash(b"root", b"id");
        let sealed = secretbox_seal(&key, b"discharge root key").unwrap();
        let opened = secretbox_open(&key, &sealed).unwrap();
        assert_eq!(opened, b"discharge root key");
    }

    #[test]
    fn test_secretbox_wrong_key_fails() {
        let key = keyed_hash(b"root", b"id");
        let other = keyed_hash(b"root", b"other");
        let sealed = secretbox_seal(&key, b"secret").unwrap();
        assert!(secretbox_open(&other, &sealed).is_err());
    }

    #[test]
    fn test_secretbox_nonce_varies() {
        let key = keyed_hash(b"root", b"id");
        let a = secretbox_seal(&key, b"secret").unwrap();
        let b = secretbox_seal(&key, b"secret").unwrap();
        assert_ne!(a, b);
    }
}
