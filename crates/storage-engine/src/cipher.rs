//! Authenticated encryption: a Fernet-equivalent AES-128-CBC + HMAC-SHA-256 construction.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use storage_core::Key;
use subtle::ConstantTimeEq;
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type HmacSha256 = Hmac<Sha256>;

const VERSION: u8 = 0x01;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Errors raised by an [`AuthenticatedCipher`].
#[derive(Debug, Error)]
pub enum CipherError {
    /// The authentication tag did not verify, or the envelope was malformed.
    #[error("authentication failed: {0}")]
    AuthError(String),
}

/// Symmetric authenticated encryption over opaque byte strings.
///
/// Implementations must produce a self-framed envelope (fresh IV + ciphertext
/// + authentication tag) on every `encrypt` call, and successive calls with
/// identical inputs must not produce identical outputs.
pub trait AuthenticatedCipher {
    /// Encrypt `plaintext` under `key`, returning a self-framed envelope.
    fn encrypt(&self, key: &Key, plaintext: &[u8]) -> Vec<u8>;
    /// Decrypt an envelope produced by `encrypt`. Fails if the tag does not
    /// verify or the envelope is malformed.
    fn decrypt(&self, key: &Key, envelope: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// AES-128-CBC + HMAC-SHA-256, framed as `version || iv || ciphertext || tag`
/// with the tag computed over everything preceding it ("Fernet" equivalent).
#[derive(Debug, Clone, Copy, Default)]
pub struct FernetCipher;

impl FernetCipher {
    fn mac(key: &Key, body: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(key.signing_key())
            .expect("HMAC accepts keys of any length");
        mac.update(body);
        mac.finalize().into_bytes().to_vec()
    }
}

impl AuthenticatedCipher for FernetCipher {
    fn encrypt(&self, key: &Key, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_LEN];
        getrandom::getrandom(&mut iv).expect("OS RNG unavailable");

        let ct = Aes128CbcEnc::new_from_slices(key.encryption_key(), &iv)
            .expect("key/iv lengths are fixed and valid")
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut body = Vec::with_capacity(1 + IV_LEN + ct.len());
        body.push(VERSION);
        body.extend_from_slice(&iv);
        body.extend_from_slice(&ct);

        let tag = Self::mac(key, &body);
        body.extend_from_slice(&tag);
        body
    }

    fn decrypt(&self, key: &Key, envelope: &[u8]) -> Result<Vec<u8>, CipherError> {
        if envelope.len() < 1 + IV_LEN + TAG_LEN {
            return Err(CipherError::AuthError("envelope too short".into()));
        }
        let (body, tag) = envelope.split_at(envelope.len() - TAG_LEN);
        let expected_tag = Self::mac(key, body);
        if expected_tag.ct_eq(tag).unwrap_u8() != 1 {
            return Err(CipherError::AuthError("tag mismatch".into()));
        }
        if body[0] != VERSION {
            return Err(CipherError::AuthError("unsupported envelope version".into()));
        }
        let iv = &body[1..1 + IV_LEN];
        let ct = &body[1 + IV_LEN..];

        Aes128CbcDec::new_from_slices(key.encryption_key(), iv)
            .map_err(|e| CipherError::AuthError(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ct)
            .map_err(|e| CipherError::AuthError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips() {
        let key = Key::generate();
        let cipher = FernetCipher;
        let ct = cipher.encrypt(&key, b"hello world");
        let pt = cipher.decrypt(&key, &ct).unwrap();
        assert_eq!(pt, b"hello world");
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let key = Key::generate();
        let cipher = FernetCipher;
        let ct = cipher.encrypt(&key, b"");
        assert_eq!(cipher.decrypt(&key, &ct).unwrap(), b"");
    }

    #[test]
    fn successive_encryptions_differ() {
        let key = Key::generate();
        let cipher = FernetCipher;
        let a = cipher.encrypt(&key, b"same input");
        let b = cipher.encrypt(&key, b"same input");
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&key, &a).unwrap(), cipher.decrypt(&key, &b).unwrap());
    }

    #[test]
    fn tampered_tag_rejected() {
        let key = Key::generate();
        let cipher = FernetCipher;
        let mut ct = cipher.encrypt(&key, b"hello world");
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert!(matches!(cipher.decrypt(&key, &ct), Err(CipherError::AuthError(_))));
    }

    #[test]
    fn wrong_key_rejected() {
        let key = Key::generate();
        let other = Key::generate();
        let cipher = FernetCipher;
        let ct = cipher.encrypt(&key, b"hello world");
        assert!(cipher.decrypt(&other, &ct).is_err());
    }

    #[test]
    fn truncated_envelope_rejected() {
        let key = Key::generate();
        let cipher = FernetCipher;
        assert!(cipher.decrypt(&key, b"short").is_err());
    }
}
