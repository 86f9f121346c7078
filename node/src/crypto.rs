//! Encryption at rest.
//!
//! Keys are never stored by the node. A [`KeyProvider`] hands out raw key
//! material, from which purpose-specific [`SecretKey`]s are derived with a
//! one-way hash, so the field key and the archive key differ even when they
//! come from the same passphrase.

use crate::error::{Result, StoreError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use tally_engine::Document;

/// Length of a derived key in bytes.
pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SEALED_MAGIC: &[u8; 4] = b"TLYE";

/// Derivation label for field-level encryption keys.
pub const FIELD_KEY_CONTEXT: &str = "tally/field/v1";
/// Derivation label for archive encryption keys.
pub const ARCHIVE_KEY_CONTEXT: &str = "tally/archive/v1";

/// Marker key of an encrypted field value.
pub const ENCRYPTED_MARKER: &str = "$enc";
const ENCRYPTED_VERSION: &str = "v1";

/// A 256-bit symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    /// Derive a key from key material and a context label.
    pub fn derive(context: &str, material: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(context.as_bytes());
        hasher.update([0u8]);
        hasher.update(material);
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| StoreError::Crypto(format!("AES key init failed: {e}")))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Encrypt bytes with AES-256-GCM under a random nonce.
///
/// Output layout: `magic || nonce || ciphertext`.
pub fn seal(key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = key.cipher()?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| StoreError::Crypto(format!("AES-GCM encrypt failed: {e}")))?;

    let mut out = Vec::with_capacity(SEALED_MAGIC.len() + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(SEALED_MAGIC);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt bytes produced by [`seal`].
pub fn open(key: &SecretKey, sealed: &[u8]) -> Result<Vec<u8>> {
    if !sealed.starts_with(SEALED_MAGIC) {
        return Err(StoreError::Crypto("payload is not sealed".to_string()));
    }
    if sealed.len() < SEALED_MAGIC.len() + NONCE_LEN {
        return Err(StoreError::Crypto("sealed payload too short".to_string()));
    }
    let nonce_end = SEALED_MAGIC.len() + NONCE_LEN;
    let nonce = &sealed[SEALED_MAGIC.len()..nonce_end];
    key.cipher()?
        .decrypt(Nonce::from_slice(nonce), &sealed[nonce_end..])
        .map_err(|_| StoreError::Crypto("AES-GCM decrypt failed: wrong key or corrupted data".to_string()))
}

/// Source of key material. Injected so the node never hardcodes secrets.
#[async_trait]
pub trait KeyProvider: Send + Sync + fmt::Debug {
    /// Raw key material (a passphrase or random bytes).
    async fn key_material(&self) -> Result<Vec<u8>>;
}

/// Key material held in memory, e.g. from an environment variable.
#[derive(Clone)]
pub struct StaticKeyProvider {
    material: Vec<u8>,
}

impl StaticKeyProvider {
    pub fn new(material: impl Into<Vec<u8>>) -> Self {
        Self {
            material: material.into(),
        }
    }
}

impl fmt::Debug for StaticKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticKeyProvider(..)")
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn key_material(&self) -> Result<Vec<u8>> {
        if self.material.is_empty() {
            return Err(StoreError::Crypto("encryption key is empty".to_string()));
        }
        Ok(self.material.clone())
    }
}

/// Key material read from a file on every request.
#[derive(Debug, Clone)]
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl KeyProvider for FileKeyProvider {
    async fn key_material(&self) -> Result<Vec<u8>> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|e| StoreError::io(format!("reading key file {}", self.path.display()), e))?;
        let end = raw
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map_or(0, |i| i + 1);
        let start = raw[..end]
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(end);
        let trimmed = raw[start..end].to_vec();
        if trimmed.is_empty() {
            return Err(StoreError::Crypto(format!(
                "key file {} is empty",
                self.path.display()
            )));
        }
        Ok(trimmed)
    }
}

/// Encrypts one designated field of sensitive documents.
#[derive(Debug, Clone)]
pub struct FieldCipher {
    key: SecretKey,
}

impl FieldCipher {
    pub fn new(key: SecretKey) -> Self {
        Self { key }
    }

    /// Whether a stored value is in encrypted form.
    pub fn is_encrypted(value: &Value) -> bool {
        value
            .as_object()
            .and_then(|o| o.get(ENCRYPTED_MARKER))
            .is_some()
    }

    /// Encrypt a JSON value into `{"$enc": "v1", "data": <base64>}`.
    pub fn encrypt_value(&self, value: &Value) -> Result<Value> {
        let plaintext = serde_json::to_vec(value)?;
        let sealed = seal(&self.key, &plaintext)?;
        Ok(json!({ ENCRYPTED_MARKER: ENCRYPTED_VERSION, "data": BASE64.encode(sealed) }))
    }

    /// Decrypt a stored value. Plaintext values pass through unchanged.
    pub fn decrypt_value(&self, value: &Value) -> Result<Value> {
        if !Self::is_encrypted(value) {
            return Ok(value.clone());
        }
        let version = value.get(ENCRYPTED_MARKER).and_then(Value::as_str);
        if version != Some(ENCRYPTED_VERSION) {
            return Err(StoreError::Crypto(format!(
                "unsupported encrypted field version {version:?}"
            )));
        }
        let data = value
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Crypto("encrypted field has no data".to_string()))?;
        let sealed = BASE64
            .decode(data)
            .map_err(|e| StoreError::Crypto(format!("encrypted field is not base64: {e}")))?;
        let plaintext = open(&self.key, &sealed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Copy of `doc` with `field` encrypted. Missing or null fields are left alone.
    pub fn encrypt_document(&self, doc: &Document, field: &str) -> Result<Document> {
        let mut out = doc.clone();
        if let Some(value) = out.fields.get_mut(field) {
            if !value.is_null() && !Self::is_encrypted(value) {
                *value = self.encrypt_value(value)?;
            }
        }
        Ok(out)
    }

    /// Decrypt `field` of `doc` in place.
    pub fn decrypt_document(&self, doc: &mut Document, field: &str) -> Result<()> {
        if let Some(value) = doc.fields.get_mut(field) {
            *value = self.decrypt_value(value)?;
        }
        Ok(())
    }
}
