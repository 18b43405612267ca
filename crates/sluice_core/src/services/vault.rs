//! Field-level credential encryption.
//!
//! Every sensitive connection field passes through [`Vault`] on its way into
//! and out of the local store. Blobs are `base64(nonce || ciphertext)` under
//! AES-256-GCM with a fresh random nonce per encryption, so equal plaintexts
//! never produce equal blobs and tampered blobs fail authentication.

use crate::error::{SluiceError, SluiceResult};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Symmetric encryptor for sensitive fields.
#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// Create a vault from a raw 32-byte key.
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self { cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)) }
    }

    /// Create a vault from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> SluiceResult<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| SluiceError::vault(format!("encryption key is not valid base64: {e}")))?;
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            SluiceError::vault(format!(
                "encryption key must be exactly {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::new(&key))
    }

    /// Create a vault from optional configured key material.
    ///
    /// An absent key is a vault error: there is no plaintext mode.
    pub fn from_config(encoded: Option<&str>) -> SluiceResult<Self> {
        match encoded {
            Some(key) if !key.trim().is_empty() => Self::from_base64(key),
            _ => Err(SluiceError::vault("no encryption key configured (set SLUICE_ENCRYPTION_KEY)")),
        }
    }

    /// Generate a fresh base64-encoded key for operators.
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        BASE64.encode(key)
    }

    /// Encrypt a plaintext field into a storable blob.
    pub fn encrypt(&self, plaintext: &str) -> SluiceResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| SluiceError::vault(format!("encrypt: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Decrypt a stored blob back into its plaintext field.
    pub fn decrypt(&self, blob: &str) -> SluiceResult<String> {
        let data = BASE64
            .decode(blob)
            .map_err(|e| SluiceError::vault(format!("stored blob is not valid base64: {e}")))?;
        if data.len() < NONCE_LEN {
            return Err(SluiceError::vault("ciphertext too short (missing nonce)"));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| SluiceError::vault(format!("decrypt: {e}")))?;
        String::from_utf8(plaintext)
            .map_err(|e| SluiceError::vault(format!("decrypted field is not UTF-8: {e}")))
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::from_base64(&Vault::generate_key()).unwrap()
    }

    #[test]
    fn test_round_trip_including_empty_and_delimiters() {
        let vault = vault();
        for plaintext in ["", "secret", "a:b;c|d=e", "::", "ünïcødé ✓", "line\nbreak\0nul"] {
            let blob = vault.encrypt(plaintext).unwrap();
            assert_eq!(vault.decrypt(&blob).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_nonce_makes_blobs_distinct() {
        let vault = vault();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_is_vault_error() {
        let blob = vault().encrypt("secret").unwrap();
        let err = vault().decrypt(&blob).unwrap_err();
        assert!(matches!(err, SluiceError::Vault { .. }));
    }

    #[test]
    fn test_malformed_blobs_are_vault_errors() {
        let vault = vault();
        assert!(matches!(vault.decrypt("not base64!"), Err(SluiceError::Vault { .. })));
        assert!(matches!(vault.decrypt("AAAA"), Err(SluiceError::Vault { .. })));

        let mut blob = BASE64.decode(vault.encrypt("secret").unwrap()).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(vault.decrypt(&BASE64.encode(blob)), Err(SluiceError::Vault { .. })));
    }

    #[test]
    fn test_absent_or_short_key_rejected() {
        assert!(matches!(Vault::from_config(None), Err(SluiceError::Vault { .. })));
        assert!(matches!(Vault::from_config(Some("  ")), Err(SluiceError::Vault { .. })));
        let short = BASE64.encode([7u8; 16]);
        assert!(matches!(Vault::from_base64(&short), Err(SluiceError::Vault { .. })));
    }
}
