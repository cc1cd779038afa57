//! Authenticated encryption for data stored at rest: schedule configuration
//! bags and webhook URLs (spec.md §3, §6 "Encryption"). Ciphertext is
//! `base64(nonce || aes-256-gcm(plaintext))`, so the key is never stored
//! alongside it and a fresh nonce is drawn per call (distinct ciphertexts
//! for identical plaintexts, per §8 invariant 8).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

use crate::error::Error;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct EncryptionKey(Key<Aes256Gcm>);

impl EncryptionKey {
    /// Derives a 32-byte key from an arbitrary-length secret via SHA-256, so
    /// operators can hand us any `ENCRYPTION_KEY` string.
    pub fn from_secret(secret: &str) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        let digest = hasher.finalize();
        EncryptionKey(*Key::<Aes256Gcm>::from_slice(&digest))
    }
}

/// Startup refuses to proceed without a key unless `allow_unencrypted` is
/// set (spec.md §6). When unencrypted, `NoopCipher` round-trips in plaintext
/// so the rest of the system doesn't need to special-case it.
#[derive(Clone)]
pub enum Cipher {
    Aes256Gcm(EncryptionKey),
    Noop,
}

impl Cipher {
    pub fn new(key: Option<EncryptionKey>) -> Self {
        match key {
            Some(key) => Cipher::Aes256Gcm(key),
            None => Cipher::Noop,
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, Error> {
        match self {
            Cipher::Noop => Ok(format!("plain:{plaintext}")),
            Cipher::Aes256Gcm(key) => {
                let cipher = Aes256Gcm::new(&key.0);
                let mut nonce_bytes = [0u8; NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce_bytes);
                let nonce = Nonce::from_slice(&nonce_bytes);
                let ciphertext = cipher
                    .encrypt(nonce, plaintext.as_bytes())
                    .map_err(|e| Error::internal(format!("encryption failed: {e}")))?;
                let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                out.extend_from_slice(&nonce_bytes);
                out.extend_from_slice(&ciphertext);
                Ok(format!("enc:{}", BASE64.encode(out)))
            }
        }
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, Error> {
        match stored.split_once(':') {
            Some(("plain", rest)) => Ok(rest.to_string()),
            Some(("enc", rest)) => {
                let Cipher::Aes256Gcm(key) = self else {
                    return Err(Error::internal(
                        "ciphertext present but no encryption key configured",
                    ));
                };
                let raw = BASE64
                    .decode(rest)
                    .map_err(|e| Error::internal(format!("invalid ciphertext encoding: {e}")))?;
                if raw.len() < NONCE_LEN {
                    return Err(Error::internal("ciphertext too short"));
                }
                let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
                let cipher = Aes256Gcm::new(&key.0);
                let nonce = Nonce::from_slice(nonce_bytes);
                let plaintext = cipher
                    .decrypt(nonce, ciphertext)
                    .map_err(|e| Error::internal(format!("decryption failed: {e}")))?;
                String::from_utf8(plaintext)
                    .map_err(|e| Error::internal(format!("decrypted payload not utf8: {e}")))
            }
            _ => Err(Error::internal("unrecognized ciphertext envelope")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let cipher = Cipher::new(Some(EncryptionKey::from_secret("super-secret")));
        let plaintext = r#"{"bootstrap.servers":"kafka:9092"}"#;
        let ct1 = cipher.encrypt(plaintext).unwrap();
        let ct2 = cipher.encrypt(plaintext).unwrap();
        assert_ne!(ct1, ct2, "nonces must differ for identical plaintexts");
        assert_eq!(cipher.decrypt(&ct1).unwrap(), plaintext);
        assert_eq!(cipher.decrypt(&ct2).unwrap(), plaintext);
    }

    #[test]
    fn noop_roundtrip_when_unencrypted() {
        let cipher = Cipher::new(None);
        let plaintext = "https://hooks.example.com/abc";
        let ct = cipher.encrypt(plaintext).unwrap();
        assert_eq!(cipher.decrypt(&ct).unwrap(), plaintext);
    }
}
