//! AES-256-GCM codec, grounded in
//! `original_source/go-gost/x/internal/util/crypto/aes.go`'s `AESCrypto`:
//! key = SHA-256(secret), nonce is 12 random bytes prepended to the
//! ciphertext, the whole thing base64-standard-encoded. The teacher's own
//! `cli/src/rs_encrypt.rs` uses AES-256-CBC via the `aes`/`cipher`/
//! `block-padding` family; since the wire format needs tamper detection we
//! reach for `aes-gcm`, a sibling crate in the same `RustCrypto` family.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("ciphertext is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("ciphertext shorter than the nonce")]
    Short,
    #[error("ciphertext is empty")]
    Empty,
    #[error("GCM authentication failed")]
    TagMismatch,
}

/// AES-256-GCM codec keyed by SHA-256 of a shared secret string.
pub struct Codec {
    cipher: Aes256Gcm,
}

impl Codec {
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypts `plaintext`, returning `base64(nonce || ciphertext || tag)`.
    /// Panics only if `plaintext` is empty, matching the spec's rejection
    /// of empty input (callers should check before calling).
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        assert!(!plaintext.is_empty(), "refusing to encrypt empty plaintext");
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .expect("AES-GCM encryption is infallible for in-memory buffers");
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        BASE64.encode(out)
    }

    /// Decodes and decrypts a `base64(nonce || ciphertext || tag)` blob.
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, DecryptError> {
        if encoded.is_empty() {
            return Err(DecryptError::Empty);
        }
        let raw = BASE64.decode(encoded)?;
        if raw.len() <= NONCE_LEN {
            return Err(DecryptError::Short);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(nonce_bytes.into(), ciphertext)
            .map_err(|_| DecryptError::TagMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let codec = Codec::new("topsecret");
        let encoded = codec.encrypt(b"hello controller");
        let decoded = codec.decrypt(&encoded).unwrap();
        assert_eq!(decoded, b"hello controller");
    }

    #[test]
    fn different_secrets_cannot_decrypt() {
        let encoded = Codec::new("topsecret").encrypt(b"payload");
        let err = Codec::new("wrong").decrypt(&encoded).unwrap_err();
        assert!(matches!(err, DecryptError::TagMismatch));
    }

    #[test]
    fn rejects_malformed_base64() {
        let err = Codec::new("topsecret").decrypt("not base64!!").unwrap_err();
        assert!(matches!(err, DecryptError::Base64(_)));
    }

    #[test]
    fn rejects_short_ciphertext() {
        let short = BASE64.encode(b"tooshort");
        let err = Codec::new("topsecret").decrypt(&short).unwrap_err();
        assert!(matches!(err, DecryptError::Short));
    }

    #[test]
    fn rejects_empty_input() {
        let err = Codec::new("topsecret").decrypt("").unwrap_err();
        assert!(matches!(err, DecryptError::Empty));
    }
}
