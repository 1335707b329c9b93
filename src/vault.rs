//! Secret-at-rest sealing for account sessions and API hashes.
//!
//! Secrets are sealed with XChaCha20-Poly1305 under a single process key and
//! stored as `base64(nonce || ciphertext)`. A blob sealed under another key, or
//! one that was tampered with, fails to open; callers treat that as "the
//! credentials are unusable" and send the user back through login.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use tracing::info;

use crate::config::{expand_home, VaultConfig};
use crate::error::{AdError, Result};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

/// Seals and opens secrets with a single symmetric key.
#[derive(Clone)]
pub struct Vault {
    cipher: XChaCha20Poly1305,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").field("key", &"[REDACTED]").finish()
    }
}

impl Vault {
    /// Build a vault from raw key bytes.
    pub fn from_key(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(AdError::Vault(format!(
                "vault key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        let cipher = XChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| AdError::Vault(format!("invalid vault key: {}", e)))?;
        Ok(Self { cipher })
    }

    /// Build a vault from a base64-encoded key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let key = B64
            .decode(encoded.trim())
            .map_err(|e| AdError::Vault(format!("vault key is not base64: {}", e)))?;
        Self::from_key(&key)
    }

    /// Resolve the key from config: explicit key first, then the key file.
    ///
    /// The key file is created with a fresh random key the first time it is
    /// needed and reused on every later start.
    pub fn from_config(cfg: &VaultConfig) -> Result<Self> {
        if let Some(key) = cfg.key.as_deref().filter(|k| !k.trim().is_empty()) {
            return Self::from_base64(key);
        }
        Self::load_or_create(&expand_home(&cfg.key_file))
    }

    /// Read the key file, generating it if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let encoded = std::fs::read_to_string(path)?;
            return Self::from_base64(&encoded);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let encoded = Self::generate_key_b64();
        std::fs::write(path, &encoded)?;
        info!(path = %path.display(), "Generated new vault key");
        Self::from_base64(&encoded)
    }

    /// A fresh random key, base64-encoded.
    pub fn generate_key_b64() -> String {
        let key = XChaCha20Poly1305::generate_key(&mut OsRng);
        B64.encode(key)
    }

    /// Seal a secret.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| AdError::Vault("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(B64.encode(sealed))
    }

    /// Open a sealed secret.
    pub fn decrypt(&self, sealed: &str) -> Result<String> {
        let raw = B64
            .decode(sealed.trim())
            .map_err(|_| AdError::Vault("sealed value is not base64".to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(AdError::Vault("sealed value is truncated".to_string()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| AdError::Vault("decryption failed (wrong key or corrupt)".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|_| AdError::Vault("decrypted value is not UTF-8".to_string()))
    }
}
