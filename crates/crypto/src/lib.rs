//! Authenticated encryption for secrets at rest.
//!
//! AES-256-GCM with a fresh random nonce per call. Every ciphertext carries
//! the version of the key that produced it; the service holds the current
//! write key plus any retired decrypt-only keys, so key rotation is a config
//! change rather than a data migration.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use ar_domain::config::CryptoConfig;
use ar_domain::error::{Error, Result};

/// GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

/// One encrypted value as persisted: ciphertext, nonce, and tag are stored
/// as separate columns so tampering with any of them is detectable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedRecord {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub tag: Vec<u8>,
    pub key_version: u32,
}

pub struct CryptoService {
    /// All keys we can decrypt with, by version.
    keys: HashMap<u32, Aes256Gcm>,
    /// Version used for new ciphertexts.
    current_version: u32,
}

impl CryptoService {
    /// Build the service from config. Fails if the master key is missing or
    /// malformed; the relay refuses to start without a usable key.
    pub fn from_config(config: &CryptoConfig) -> Result<Self> {
        let master = decode_key(&config.master_key)
            .map_err(|e| Error::Config(format!("AR_MASTER_KEY: {e}")))?;

        let mut keys = HashMap::new();
        keys.insert(config.key_version, master);

        for (version, encoded) in &config.retired_keys {
            // The current version always wins over a retired key of the same
            // version.
            if *version == config.key_version {
                continue;
            }
            let key = decode_key(encoded)
                .map_err(|e| Error::Config(format!("retired key v{version}: {e}")))?;
            keys.insert(*version, key);
        }

        Ok(Self {
            keys,
            current_version: config.key_version,
        })
    }

    /// Encrypt with the current key. The nonce is freshly generated from the
    /// OS RNG on every call.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedRecord> {
        let cipher = self
            .keys
            .get(&self.current_version)
            .ok_or(Error::KeyUnavailable(self.current_version))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::AuthFailure)?;

        // aes-gcm appends the tag to the ciphertext; split it back out.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        Ok(EncryptedRecord {
            ciphertext: sealed,
            nonce: nonce.to_vec(),
            tag,
            key_version: self.current_version,
        })
    }

    /// Decrypt a record. Fails with `KeyUnavailable` if the record was
    /// written by a key we don't hold, `AuthFailure` if any byte of
    /// ciphertext, nonce, or tag has been altered.
    pub fn decrypt(&self, record: &EncryptedRecord) -> Result<Vec<u8>> {
        let cipher = self
            .keys
            .get(&record.key_version)
            .ok_or(Error::KeyUnavailable(record.key_version))?;

        if record.nonce.len() != 12 {
            return Err(Error::AuthFailure);
        }
        let nonce = Nonce::from_slice(&record.nonce);

        let mut sealed = record.ciphertext.clone();
        sealed.extend_from_slice(&record.tag);

        cipher
            .decrypt(nonce, sealed.as_ref())
            .map_err(|_| Error::AuthFailure)
    }

    /// Generate a fresh 256-bit key, base64-encoded for operator config.
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        BASE64.encode(key)
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }
}

fn decode_key(encoded: &str) -> std::result::Result<Aes256Gcm, String> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| format!("invalid base64: {e}"))?;
    if bytes.len() != 32 {
        return Err(format!("expected 32 bytes, got {}", bytes.len()));
    }
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> CryptoService {
        let config = CryptoConfig {
            master_key: CryptoService::generate_key(),
            key_version: 1,
            retired_keys: HashMap::new(),
        };
        CryptoService::from_config(&config).unwrap()
    }

    #[test]
    fn round_trip_is_identity() {
        let svc = service();
        let record = svc.encrypt(b"sk-ant-secret").unwrap();
        assert_eq!(record.key_version, 1);
        assert_eq!(svc.decrypt(&record).unwrap(), b"sk-ant-secret");
    }

    #[test]
    fn nonces_are_fresh_per_call() {
        let svc = service();
        let a = svc.encrypt(b"same plaintext").unwrap();
        let b = svc.encrypt(b"same plaintext").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let svc = service();
        let mut record = svc.encrypt(b"payload").unwrap();
        record.ciphertext[0] ^= 0x01;
        assert!(matches!(svc.decrypt(&record), Err(Error::AuthFailure)));
    }

    #[test]
    fn tampered_nonce_fails_auth() {
        let svc = service();
        let mut record = svc.encrypt(b"payload").unwrap();
        record.nonce[0] ^= 0x01;
        assert!(matches!(svc.decrypt(&record), Err(Error::AuthFailure)));
    }

    #[test]
    fn tampered_tag_fails_auth() {
        let svc = service();
        let mut record = svc.encrypt(b"payload").unwrap();
        record.tag[0] ^= 0x01;
        assert!(matches!(svc.decrypt(&record), Err(Error::AuthFailure)));
    }

    #[test]
    fn unknown_key_version_is_reported() {
        let svc = service();
        let mut record = svc.encrypt(b"payload").unwrap();
        record.key_version = 9;
        assert!(matches!(
            svc.decrypt(&record),
            Err(Error::KeyUnavailable(9))
        ));
    }

    #[test]
    fn retired_key_still_decrypts() {
        let old_key = CryptoService::generate_key();
        let old = CryptoService::from_config(&CryptoConfig {
            master_key: old_key.clone(),
            key_version: 1,
            retired_keys: HashMap::new(),
        })
        .unwrap();
        let record = old.encrypt(b"written under v1").unwrap();

        // Rotate: v2 becomes current, v1 is retired.
        let rotated = CryptoService::from_config(&CryptoConfig {
            master_key: CryptoService::generate_key(),
            key_version: 2,
            retired_keys: HashMap::from([(1, old_key)]),
        })
        .unwrap();

        assert_eq!(rotated.decrypt(&record).unwrap(), b"written under v1");
        // New writes carry the current version.
        assert_eq!(rotated.encrypt(b"x").unwrap().key_version, 2);
    }
}
