//! AES-256-GCM encryption of values before they reach durable storage.
//!
//! Sealed values are self-describing JSON objects:
//!
//! ```json
//! {"encrypted": true, "data": "<base64(nonce || ciphertext)>", "algorithm": "AES-GCM", "version": 1}
//! ```
//!
//! When encryption is unavailable the same envelope carries the plaintext
//! with `"encrypted": false`, so readers never need to know which path the
//! writer took.
//!
//! ## Design
//! - One 256-bit key per profile, persisted as a JWK under `_gartenplaner_enc_key`
//! - Fresh 96-bit nonce per seal
//! - Failures are reported through [`ErrorReporter`] and replaced with a
//!   safe default: plaintext on seal, `None` on unseal
//! - Rotation keeps the old key until every tracked entry has been
//!   re-sealed and verified, and restores the original bytes on failure

use crate::config::EncryptionConfig;
use crate::reporting::{ErrorKind, ErrorReport, ErrorReporter};
use crate::storage::{self, DurableStorage, ENCRYPTION_KEY_KEY, SALT_KEY};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Algorithm label written into sealed values.
pub const ALGORITHM: &str = "AES-GCM";

/// Envelope format version.
pub const SEAL_VERSION: u32 = 1;

/// Key length in bits.
pub const KEY_LENGTH_BITS: u32 = 256;

/// Nonce size for AES-256-GCM (12 bytes / 96 bits).
const NONCE_SIZE: usize = 12;

/// PBKDF2 salt size (16 bytes).
const SALT_SIZE: usize = 16;

/// `format` marker for values that were strings before sealing.
const FORMAT_TEXT: &str = "text";

// ── Envelope ────────────────────────────────────────────────────

/// A value as written to storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SealedValue {
    pub encrypted: bool,
    /// Plaintext value, or base64 of nonce‖ciphertext when `encrypted`.
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    /// `"text"` when the sealed value was a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Why sealing fell back to plaintext.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SealedValue {
    fn plaintext(data: Value, error: Option<String>) -> Self {
        Self {
            encrypted: false,
            data,
            algorithm: None,
            version: None,
            format: None,
            error,
        }
    }

    /// Interpret `value` as an envelope. Anything without a boolean
    /// `encrypted` flag and a `data` field is not one.
    pub fn parse(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if !obj.get("encrypted").is_some_and(Value::is_boolean) || !obj.contains_key("data") {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    /// Serialize for storage.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Exportable key form (JSON Web Key, symmetric).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Jwk {
    kty: String,
    k: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ext: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    key_ops: Vec<String>,
}

impl Jwk {
    fn from_key(key: &[u8; 32]) -> Self {
        Self {
            kty: "oct".into(),
            k: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key),
            alg: Some("A256GCM".into()),
            ext: Some(true),
            key_ops: vec!["encrypt".into(), "decrypt".into()],
        }
    }

    fn to_key(&self) -> anyhow::Result<[u8; 32]> {
        if self.kty != "oct" {
            anyhow::bail!("Unsupported key type '{}'", self.kty);
        }
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(self.k.trim_end_matches('='))
            .map_err(|e| anyhow::anyhow!("Invalid key material: {e}"))?;
        if bytes.len() != 32 {
            anyhow::bail!("AES key must be exactly 32 bytes, got {}", bytes.len());
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(key)
    }
}

/// Capability and key state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionStatus {
    pub supported: bool,
    pub key_loaded: bool,
    pub algorithm: &'static str,
    pub key_length: u32,
    pub ready: bool,
}

/// Outcome of a successful key rotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    /// Storage keys re-sealed under the new key.
    pub rotated: Vec<String>,
    /// Encrypted entries the old key could not open (left untouched).
    pub skipped: Vec<String>,
}

// ── Primitives ──────────────────────────────────────────────────

fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encrypt `plaintext`, returning base64(nonce‖ciphertext).
fn encrypt_with(key: &[u8; 32], plaintext: &[u8]) -> anyhow::Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("AES cipher init failed: {e}"))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("AES encryption failed: {e}"))?;

    let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
}

/// Decrypt base64(nonce‖ciphertext).
fn decrypt_with(key: &[u8; 32], encoded: &str) -> anyhow::Result<Vec<u8>> {
    let combined = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| anyhow::anyhow!("Invalid base64 payload: {e}"))?;
    if combined.len() < NONCE_SIZE {
        anyhow::bail!("Encrypted data too short");
    }
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("AES cipher init failed: {e}"))?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| anyhow::anyhow!("AES decryption failed: {e}"))
}

fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(passphrase.as_bytes(), salt, iterations, &mut key);
    key
}

/// Round-trip a random payload to confirm the cipher works here.
fn self_test() -> bool {
    let key = generate_key();
    encrypt_with(&key, b"self-test")
        .and_then(|sealed| decrypt_with(&key, &sealed))
        .is_ok_and(|plain| plain == b"self-test")
}

/// Turn decrypted bytes back into a value.
fn decode_plaintext(bytes: Vec<u8>, format: Option<&str>) -> anyhow::Result<Value> {
    let text = String::from_utf8(bytes)
        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 in plaintext: {e}"))?;
    if format == Some(FORMAT_TEXT) {
        return Ok(Value::String(text));
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

// ── Engine ──────────────────────────────────────────────────────

/// Seals and unseals stored values and owns the key lifecycle.
pub struct EncryptionAtRest {
    storage: Arc<dyn DurableStorage>,
    reporter: Arc<dyn ErrorReporter>,
    config: EncryptionConfig,
    supported: bool,
    key: Mutex<Option<[u8; 32]>>,
}

impl EncryptionAtRest {
    /// Create the engine and self-test the cipher. No key is loaded yet; call
    /// [`Self::ensure_key`].
    pub fn new(
        storage: Arc<dyn DurableStorage>,
        reporter: Arc<dyn ErrorReporter>,
        config: EncryptionConfig,
    ) -> Self {
        let supported = config.enabled && self_test();
        if config.enabled && !supported {
            reporter.report(ErrorReport::new(
                ErrorKind::Crypto,
                "new",
                "AES-GCM self-test failed, values will be stored unencrypted",
            ));
        }
        Self {
            storage,
            reporter,
            config,
            supported,
            key: Mutex::new(None),
        }
    }

    /// Whether sealing can encrypt at all.
    pub fn is_available(&self) -> bool {
        self.supported
    }

    pub fn has_key(&self) -> bool {
        self.key.lock().is_some()
    }

    pub fn status(&self) -> EncryptionStatus {
        let key_loaded = self.has_key();
        EncryptionStatus {
            supported: self.supported,
            key_loaded,
            algorithm: ALGORITHM,
            key_length: KEY_LENGTH_BITS,
            ready: self.supported && key_loaded,
        }
    }

    fn report(&self, kind: ErrorKind, function: &str, message: impl Into<String>, context: Value) {
        self.reporter
            .report(ErrorReport::new(kind, function, message).with_context(context));
    }

    /// Load the persisted key, or generate and persist a new one. Idempotent.
    ///
    /// A stored key that cannot be parsed is an error and is left in place,
    /// since replacing it would make existing ciphertext unreadable.
    pub fn ensure_key(&self) -> anyhow::Result<()> {
        if !self.supported {
            anyhow::bail!("Encryption is not available");
        }
        let mut slot = self.key.lock();
        if slot.is_some() {
            return Ok(());
        }

        let stored = match self.storage.get(ENCRYPTION_KEY_KEY) {
            Ok(stored) => stored,
            Err(e) => {
                self.report(ErrorKind::Storage, "ensure_key", format!("Failed to read key: {e}"), Value::Null);
                return Err(e.into());
            }
        };

        if let Some(raw) = stored {
            let key = serde_json::from_str::<Jwk>(&raw)
                .map_err(anyhow::Error::from)
                .and_then(|jwk| jwk.to_key());
            return match key {
                Ok(key) => {
                    *slot = Some(key);
                    tracing::debug!("Loaded encryption key");
                    Ok(())
                }
                Err(e) => {
                    self.report(
                        ErrorKind::Crypto,
                        "ensure_key",
                        format!("Failed to import encryption key: {e}"),
                        Value::Null,
                    );
                    Err(e.context("Stored encryption key is unusable"))
                }
            };
        }

        let key = generate_key();
        if let Err(e) = storage::write_json(self.storage.as_ref(), ENCRYPTION_KEY_KEY, &Jwk::from_key(&key)) {
            self.report(ErrorKind::Storage, "ensure_key", format!("Failed to persist key: {e}"), Value::Null);
            return Err(e.into());
        }
        *slot = Some(key);
        tracing::info!("Generated new encryption key");
        Ok(())
    }

    // ── Seal / unseal ───────────────────────────────────────────

    /// Seal a value. Never fails: without a key the value is wrapped as
    /// plaintext.
    pub fn seal(&self, value: &Value) -> SealedValue {
        let key = *self.key.lock();
        self.seal_under(key.as_ref(), value)
    }

    fn seal_under(&self, key: Option<&[u8; 32]>, value: &Value) -> SealedValue {
        if !self.supported {
            return SealedValue::plaintext(value.clone(), None);
        }
        let Some(key) = key else {
            self.report(
                ErrorKind::Crypto,
                "seal",
                "Encryption not available - storing unencrypted data",
                serde_json::json!({ "supported": self.supported, "keyLoaded": false }),
            );
            return SealedValue::plaintext(value.clone(), None);
        };
        if value.is_null() {
            let message = "Cannot encrypt null data";
            self.report(ErrorKind::Crypto, "seal", message, Value::Null);
            return SealedValue::plaintext(Value::Null, Some(message.into()));
        }

        let (plaintext, format) = match value {
            Value::String(s) => (s.clone(), Some(FORMAT_TEXT.to_string())),
            other => (other.to_string(), None),
        };
        match encrypt_with(key, plaintext.as_bytes()) {
            Ok(data) => SealedValue {
                encrypted: true,
                data: Value::String(data),
                algorithm: Some(ALGORITHM.into()),
                version: Some(SEAL_VERSION),
                format,
                error: None,
            },
            Err(e) => {
                self.report(ErrorKind::Crypto, "seal", format!("Encryption failed: {e}"), Value::Null);
                SealedValue::plaintext(value.clone(), Some(e.to_string()))
            }
        }
    }

    /// Seal any serializable value.
    pub fn seal_json<T: Serialize + ?Sized>(&self, value: &T) -> SealedValue {
        match serde_json::to_value(value) {
            Ok(v) => self.seal(&v),
            Err(e) => {
                self.report(ErrorKind::Crypto, "seal_json", format!("Serialization failed: {e}"), Value::Null);
                SealedValue::plaintext(Value::Null, Some(e.to_string()))
            }
        }
    }

    /// Seal `values` and pass the envelopes to `write` while the key is
    /// held. A rotation cannot run between sealing and storing, so nothing
    /// lands in storage under a key that has already been replaced.
    ///
    /// `write` must not call back into this engine.
    pub fn seal_and_write<R>(
        &self,
        values: &[Value],
        write: impl FnOnce(Vec<SealedValue>) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let slot = self.key.lock();
        let sealed = values.iter().map(|v| self.seal_under(slot.as_ref(), v)).collect();
        write(sealed)
    }

    /// Open a stored value.
    ///
    /// Values that are not envelopes are returned unchanged. `None` means
    /// the data is unreadable (no key, wrong key, or tampered).
    pub fn unseal(&self, stored: &Value) -> Option<Value> {
        let Some(sealed) = SealedValue::parse(stored) else {
            return Some(stored.clone());
        };
        if !sealed.encrypted {
            return Some(sealed.data);
        }

        let Some(key) = *self.key.lock() else {
            self.report(
                ErrorKind::Crypto,
                "unseal",
                "Cannot decrypt - encryption key not available",
                serde_json::json!({ "supported": self.supported }),
            );
            return None;
        };
        let Value::String(encoded) = &sealed.data else {
            self.report(ErrorKind::Crypto, "unseal", "Invalid encrypted data format", Value::Null);
            return None;
        };

        match decrypt_with(&key, encoded).and_then(|bytes| decode_plaintext(bytes, sealed.format.as_deref())) {
            Ok(value) => Some(value),
            Err(e) => {
                self.report(
                    ErrorKind::Crypto,
                    "unseal",
                    format!("Decryption failed: {e}"),
                    serde_json::json!({ "algorithm": sealed.algorithm, "version": sealed.version }),
                );
                None
            }
        }
    }

    /// Open a raw stored string. Non-JSON text is treated as a legacy
    /// plaintext string.
    pub fn unseal_str(&self, raw: &str) -> Option<Value> {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.unseal(&value),
            Err(_) => Some(Value::String(raw.to_string())),
        }
    }

    /// Open a stored value and decode it into `T`.
    pub fn unseal_as<T: DeserializeOwned>(&self, stored: &Value) -> Option<T> {
        let value = self.unseal(stored)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                self.report(ErrorKind::Crypto, "unseal_as", format!("Unexpected data shape: {e}"), Value::Null);
                None
            }
        }
    }

    // ── Key lifecycle ───────────────────────────────────────────

    /// Re-seal every encrypted application entry under a fresh key.
    ///
    /// Either every readable entry and the key are replaced, or storage and
    /// the in-memory key are restored to their previous state.
    pub fn rotate_key(&self) -> anyhow::Result<RotationReport> {
        let result = self.rotate_inner();
        if let Err(e) = &result {
            self.report(ErrorKind::Crypto, "rotate_key", format!("Key rotation failed: {e:#}"), Value::Null);
        }
        result
    }

    fn rotate_inner(&self) -> anyhow::Result<RotationReport> {
        if !self.supported {
            anyhow::bail!("Key rotation not possible - encryption unavailable");
        }
        let mut slot = self.key.lock();
        let Some(old_key) = *slot else {
            anyhow::bail!("Key rotation not possible - no key loaded");
        };
        tracing::info!("Starting key rotation");

        let mut report = RotationReport::default();
        // (storage key, original raw, re-sealed raw)
        let mut staged: Vec<(String, String, String)> = Vec::new();
        let new_key = generate_key();

        for storage_key in self.storage.keys()? {
            if !storage::is_app_key(&storage_key) {
                continue;
            }
            let Some(raw) = self.storage.get(&storage_key)? else {
                continue;
            };
            let Some(sealed) = serde_json::from_str::<Value>(&raw)
                .ok()
                .and_then(|v| SealedValue::parse(&v))
                .filter(|s| s.encrypted)
            else {
                continue;
            };
            let Some(encoded) = sealed.data.as_str() else {
                report.skipped.push(storage_key);
                continue;
            };
            let plaintext = match decrypt_with(&old_key, encoded) {
                Ok(p) => p,
                Err(e) => {
                    self.report(
                        ErrorKind::Crypto,
                        "rotate_key",
                        format!("Skipping unreadable entry: {e}"),
                        serde_json::json!({ "key": storage_key }),
                    );
                    report.skipped.push(storage_key);
                    continue;
                }
            };

            let data = encrypt_with(&new_key, &plaintext)?;
            if decrypt_with(&new_key, &data)? != plaintext {
                anyhow::bail!("Re-sealed entry '{storage_key}' failed verification");
            }
            let resealed = SealedValue {
                encrypted: true,
                data: Value::String(data),
                algorithm: Some(ALGORITHM.into()),
                version: Some(SEAL_VERSION),
                format: sealed.format,
                error: None,
            };
            staged.push((storage_key, raw, serde_json::to_string(&resealed)?));
        }

        let old_jwk = self.storage.get(ENCRYPTION_KEY_KEY)?;
        let commit = || -> anyhow::Result<()> {
            for (storage_key, _, resealed) in &staged {
                self.storage.set(storage_key, resealed)?;
            }
            storage::write_json(self.storage.as_ref(), ENCRYPTION_KEY_KEY, &Jwk::from_key(&new_key))?;
            Ok(())
        };

        if let Err(e) = commit() {
            for (storage_key, original, _) in &staged {
                if let Err(restore_err) = self.storage.set(storage_key, original) {
                    self.report(
                        ErrorKind::Storage,
                        "rotate_key",
                        format!("Failed to restore entry: {restore_err}"),
                        serde_json::json!({ "key": storage_key }),
                    );
                }
            }
            let restored = match &old_jwk {
                Some(jwk) => self.storage.set(ENCRYPTION_KEY_KEY, jwk),
                None => self.storage.remove(ENCRYPTION_KEY_KEY),
            };
            if let Err(restore_err) = restored {
                self.report(
                    ErrorKind::Storage,
                    "rotate_key",
                    format!("Failed to restore encryption key: {restore_err}"),
                    Value::Null,
                );
            }
            return Err(e.context("Key rotation rolled back"));
        }

        *slot = Some(new_key);
        report.rotated = staged.into_iter().map(|(k, _, _)| k).collect();
        tracing::info!(
            rotated = report.rotated.len(),
            skipped = report.skipped.len(),
            "Key rotation finished"
        );
        Ok(report)
    }

    fn check_passphrase(&self, passphrase: &str) -> anyhow::Result<()> {
        if passphrase.chars().count() < self.config.min_passphrase_len {
            anyhow::bail!(
                "Password must be at least {} characters",
                self.config.min_passphrase_len
            );
        }
        Ok(())
    }

    /// Load the PBKDF2 salt, creating and persisting one if absent.
    fn load_or_create_salt(&self) -> anyhow::Result<Vec<u8>> {
        if let Some(encoded) = self.storage.get(SALT_KEY)? {
            let salt = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| anyhow::anyhow!("Invalid stored salt: {e}"))?;
            if salt.is_empty() {
                anyhow::bail!("Stored salt is empty");
            }
            return Ok(salt);
        }
        let mut salt = vec![0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        self.storage
            .set(SALT_KEY, &base64::engine::general_purpose::STANDARD.encode(&salt))?;
        Ok(salt)
    }

    fn passphrase_key(&self, passphrase: &str) -> anyhow::Result<[u8; 32]> {
        self.check_passphrase(passphrase)?;
        let salt = self.load_or_create_salt()?;
        Ok(derive_key(passphrase, &salt, self.config.pbkdf2_iterations))
    }

    /// Export the key as JWK text, or wrapped under `passphrase`
    /// (base64 of nonce‖ciphertext under a PBKDF2-HMAC-SHA256 key).
    pub fn export_key(&self, passphrase: Option<&str>) -> anyhow::Result<String> {
        let Some(key) = *self.key.lock() else {
            self.report(ErrorKind::Crypto, "export_key", "Cannot export key - no key available", Value::Null);
            anyhow::bail!("No key available to export");
        };
        let jwk = serde_json::to_string(&Jwk::from_key(&key))?;
        let Some(passphrase) = passphrase else {
            return Ok(jwk);
        };

        let exported = self
            .passphrase_key(passphrase)
            .and_then(|wrap_key| encrypt_with(&wrap_key, jwk.as_bytes()));
        if let Err(e) = &exported {
            self.report(
                ErrorKind::Crypto,
                "export_key",
                format!("Key export failed: {e}"),
                serde_json::json!({ "passwordProtected": true }),
            );
        }
        exported
    }

    /// Replace the key with one from [`Self::export_key`] output. On any
    /// failure the previous key stays active and persisted.
    pub fn import_key_from_backup(&self, data: &str, passphrase: Option<&str>) -> anyhow::Result<()> {
        let result = self.import_inner(data, passphrase);
        if let Err(e) = &result {
            self.report(
                ErrorKind::Crypto,
                "import_key_from_backup",
                format!("Failed to import key from backup: {e}"),
                serde_json::json!({ "passwordProtected": passphrase.is_some() }),
            );
        }
        result
    }

    fn import_inner(&self, data: &str, passphrase: Option<&str>) -> anyhow::Result<()> {
        let data = data.trim();
        if data.is_empty() {
            anyhow::bail!("Invalid key data format");
        }
        let jwk_text = match passphrase {
            Some(passphrase) => {
                let wrap_key = self.passphrase_key(passphrase)?;
                let plain = decrypt_with(&wrap_key, data)
                    .map_err(|e| e.context("Wrong password or corrupted backup"))?;
                String::from_utf8(plain).map_err(|e| anyhow::anyhow!("Invalid key data: {e}"))?
            }
            None => data.to_string(),
        };
        let jwk: Jwk = serde_json::from_str(&jwk_text)
            .map_err(|e| anyhow::anyhow!("Invalid key data format: {e}"))?;
        let new_key = jwk.to_key()?;

        let mut slot = self.key.lock();
        let previous = self.storage.get(ENCRYPTION_KEY_KEY)?;
        if let Err(e) = storage::write_json(self.storage.as_ref(), ENCRYPTION_KEY_KEY, &Jwk::from_key(&new_key)) {
            let restored = match &previous {
                Some(raw) => self.storage.set(ENCRYPTION_KEY_KEY, raw),
                None => self.storage.remove(ENCRYPTION_KEY_KEY),
            };
            if let Err(restore_err) = restored {
                tracing::error!(error = %restore_err, "Failed to restore encryption key");
            }
            return Err(anyhow::Error::from(e).context("Failed to persist imported key"));
        }
        *slot = Some(new_key);
        tracing::info!("Imported encryption key from backup");
        Ok(())
    }

    /// Erase the key and salt. Later seals fall back to plaintext and old
    /// ciphertext becomes unreadable.
    pub fn clear_keys(&self) -> anyhow::Result<()> {
        let mut slot = self.key.lock();
        let removed = self
            .storage
            .remove(ENCRYPTION_KEY_KEY)
            .and_then(|()| self.storage.remove(SALT_KEY));
        if let Err(e) = removed {
            self.report(ErrorKind::Storage, "clear_keys", format!("Failed to erase key material: {e}"), Value::Null);
            return Err(anyhow::Error::from(e).context("Failed to clear keys"));
        }
        *slot = None;
        tracing::info!("Encryption keys cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporting::ErrorLog;
    use crate::storage::{MemoryStorage, TASKS_KEY};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn fast_config() -> EncryptionConfig {
        EncryptionConfig {
            pbkdf2_iterations: 10,
            ..EncryptionConfig::default()
        }
    }

    fn engine_with(storage: Arc<MemoryStorage>) -> (EncryptionAtRest, Arc<ErrorLog>) {
        let log = Arc::new(ErrorLog::in_memory());
        let engine = EncryptionAtRest::new(storage, log.clone(), fast_config());
        (engine, log)
    }

    fn ready_engine() -> (EncryptionAtRest, Arc<MemoryStorage>, Arc<ErrorLog>) {
        let storage = Arc::new(MemoryStorage::new());
        let (engine, log) = engine_with(storage.clone());
        engine.ensure_key().unwrap();
        (engine, storage, log)
    }

    #[test]
    fn seal_unseal_roundtrips() {
        let (engine, _, _) = ready_engine();
        for value in [json!("hello"), json!({"a": 1}), json!(42), json!([1, "two"]), json!("123")] {
            let sealed = engine.seal(&value);
            assert!(sealed.encrypted);
            assert_eq!(sealed.algorithm.as_deref(), Some(ALGORITHM));
            assert_eq!(engine.unseal(&sealed.to_json()), Some(value));
        }
    }

    #[test]
    fn nonce_is_fresh_per_seal() {
        let (engine, _, _) = ready_engine();
        let a = engine.seal(&json!("same"));
        let b = engine.seal(&json!("same"));
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn tampered_ciphertext_is_unreadable() {
        let (engine, _, log) = ready_engine();
        let sealed = engine.seal(&json!({"task": "water roses"}));
        let encoded = sealed.data.as_str().unwrap();
        let mut bytes = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = SealedValue {
            data: Value::String(base64::engine::general_purpose::STANDARD.encode(&bytes)),
            ..sealed
        };
        assert_eq!(engine.unseal(&tampered.to_json()), None);
        assert_eq!(log.recent().last().unwrap().kind, ErrorKind::Crypto);
    }

    #[test]
    fn unseal_without_key_is_none() {
        let storage = Arc::new(MemoryStorage::new());
        let (engine, log) = engine_with(storage);
        assert_eq!(engine.unseal(&json!({"encrypted": true, "data": "anything"})), None);
        assert_eq!(log.recent().len(), 1);
    }

    #[test]
    fn non_envelopes_pass_through() {
        let (engine, _, _) = ready_engine();
        assert_eq!(engine.unseal(&json!([1, 2])), Some(json!([1, 2])));
        assert_eq!(engine.unseal(&json!({"title": "x"})), Some(json!({"title": "x"})));
        assert_eq!(
            engine.unseal(&json!({"encrypted": false, "data": {"a": 1}})),
            Some(json!({"a": 1}))
        );
        assert_eq!(engine.unseal_str("not json"), Some(json!("not json")));
    }

    #[test]
    fn seal_without_key_falls_back_to_plaintext() {
        let storage = Arc::new(MemoryStorage::new());
        let (engine, log) = engine_with(storage);
        let sealed = engine.seal(&json!({"a": 1}));
        assert!(!sealed.encrypted);
        assert_eq!(sealed.data, json!({"a": 1}));
        assert_eq!(log.recent().len(), 1);
    }

    #[test]
    fn disabled_engine_is_plaintext_only() {
        let storage = Arc::new(MemoryStorage::new());
        let log = Arc::new(ErrorLog::in_memory());
        let config = EncryptionConfig {
            enabled: false,
            ..fast_config()
        };
        let engine = EncryptionAtRest::new(storage, log.clone(), config);
        assert!(!engine.is_available());
        assert!(engine.ensure_key().is_err());
        let sealed = engine.seal(&json!("x"));
        assert!(!sealed.encrypted);
        assert!(!engine.status().ready);
        assert!(log.recent().is_empty());
    }

    #[test]
    fn null_falls_back_with_error() {
        let (engine, _, log) = ready_engine();
        let sealed = engine.seal(&Value::Null);
        assert!(!sealed.encrypted);
        assert!(sealed.error.is_some());
        assert_eq!(log.recent().len(), 1);
    }

    #[test]
    fn typed_helpers() {
        let (engine, _, _) = ready_engine();
        let sealed = engine.seal_json(&vec![3u32, 1, 2]);
        let back: Vec<u32> = engine.unseal_as(&sealed.to_json()).unwrap();
        assert_eq!(back, vec![3, 1, 2]);
        assert!(engine.unseal_as::<Vec<u32>>(&engine.seal(&json!("text")).to_json()).is_none());
    }

    #[test]
    fn key_persists_across_instances() {
        let storage = Arc::new(MemoryStorage::new());
        let (first, _) = engine_with(storage.clone());
        first.ensure_key().unwrap();
        first.ensure_key().unwrap();
        let sealed = first.seal(&json!("persisted"));

        let (second, _) = engine_with(storage.clone());
        second.ensure_key().unwrap();
        assert_eq!(second.unseal(&sealed.to_json()), Some(json!("persisted")));

        let jwk: Value = serde_json::from_str(&storage.get(ENCRYPTION_KEY_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(jwk["kty"], "oct");
        assert_eq!(jwk["alg"], "A256GCM");
    }

    #[test]
    fn corrupt_stored_key_is_not_replaced() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(ENCRYPTION_KEY_KEY, "{\"kty\":\"oct\",\"k\":\"short\"}").unwrap();
        let (engine, log) = engine_with(storage.clone());
        assert!(engine.ensure_key().is_err());
        assert!(!engine.has_key());
        assert_eq!(
            storage.get(ENCRYPTION_KEY_KEY).unwrap().as_deref(),
            Some("{\"kty\":\"oct\",\"k\":\"short\"}")
        );
        assert_eq!(log.recent()[0].kind, ErrorKind::Crypto);
    }

    #[test]
    fn rotation_reseals_tracked_entries() {
        let (engine, storage, _) = ready_engine();
        let tasks = json!([{"id": 1, "title": "Hecke schneiden"}]);
        storage
            .set(TASKS_KEY, &engine.seal(&tasks).to_json().to_string())
            .unwrap();
        storage
            .set("gartenplaner_note", &engine.seal(&json!("plain note")).to_json().to_string())
            .unwrap();
        storage.set("gartenplaner_presence", "{}").unwrap();
        let old_jwk = storage.get(ENCRYPTION_KEY_KEY).unwrap();
        let old_raw = storage.get(TASKS_KEY).unwrap().unwrap();

        let report = engine.rotate_key().unwrap();
        assert_eq!(report.rotated.len(), 2);
        assert!(report.skipped.is_empty());
        assert_ne!(storage.get(ENCRYPTION_KEY_KEY).unwrap(), old_jwk);
        assert_ne!(storage.get(TASKS_KEY).unwrap().unwrap(), old_raw);

        // A fresh instance loading the new key reads everything.
        let (fresh, _) = engine_with(storage.clone());
        fresh.ensure_key().unwrap();
        assert_eq!(fresh.unseal_str(&storage.get(TASKS_KEY).unwrap().unwrap()), Some(tasks));
        assert_eq!(
            fresh.unseal_str(&storage.get("gartenplaner_note").unwrap().unwrap()),
            Some(json!("plain note"))
        );
        assert_eq!(storage.get("gartenplaner_presence").unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn rotation_skips_unreadable_entries() {
        let (engine, storage, _) = ready_engine();
        storage
            .set(TASKS_KEY, "{\"encrypted\":true,\"data\":\"AAAAAAAAAAAAAAAAAAAAAAAAAAAA\"}")
            .unwrap();
        let report = engine.rotate_key().unwrap();
        assert_eq!(report.skipped, vec![TASKS_KEY.to_string()]);
        assert!(report.rotated.is_empty());
    }

    /// Storage that refuses writes to one key, and optionally listing.
    struct FailingStorage {
        inner: MemoryStorage,
        fail_key: parking_lot::Mutex<Option<String>>,
        fail_keys: AtomicBool,
    }

    impl DurableStorage for FailingStorage {
        fn get(&self, key: &str) -> Result<Option<String>, crate::storage::StorageError> {
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: &str) -> Result<(), crate::storage::StorageError> {
            if self.fail_key.lock().as_deref() == Some(key) {
                return Err(crate::storage::StorageError::Backend("write refused".into()));
            }
            self.inner.set(key, value)
        }
        fn remove(&self, key: &str) -> Result<(), crate::storage::StorageError> {
            self.inner.remove(key)
        }
        fn keys(&self) -> Result<Vec<String>, crate::storage::StorageError> {
            if self.fail_keys.load(Ordering::SeqCst) {
                return Err(crate::storage::StorageError::Backend("listing refused".into()));
            }
            self.inner.keys()
        }
        fn subscribe(&self) -> tokio::sync::broadcast::Receiver<crate::storage::StorageEvent> {
            self.inner.subscribe()
        }
    }

    #[test]
    fn rotation_waits_for_sealed_writes() {
        let (engine, storage, _) = ready_engine();
        let engine = Arc::new(engine);

        let rotation = engine
            .seal_and_write(&[json!("Laub rechen")], |sealed| {
                let rotating = engine.clone();
                let rotation = std::thread::spawn(move || rotating.rotate_key());
                std::thread::sleep(std::time::Duration::from_millis(50));
                assert!(!rotation.is_finished());
                storage.set(TASKS_KEY, &sealed[0].to_json().to_string())?;
                Ok(rotation)
            })
            .unwrap();
        let report = rotation.join().unwrap().unwrap();

        assert_eq!(report.rotated, vec![TASKS_KEY.to_string()]);
        assert_eq!(
            engine.unseal_str(&storage.get(TASKS_KEY).unwrap().unwrap()),
            Some(json!("Laub rechen"))
        );
    }

    #[test]
    fn rotation_failure_before_commit_is_reported() {
        let storage = Arc::new(FailingStorage {
            inner: MemoryStorage::new(),
            fail_key: parking_lot::Mutex::new(None),
            fail_keys: AtomicBool::new(false),
        });
        let log = Arc::new(ErrorLog::in_memory());
        let engine = EncryptionAtRest::new(storage.clone(), log.clone(), fast_config());
        engine.ensure_key().unwrap();
        let sealed = engine.seal(&json!("Zwiebeln stecken")).to_json().to_string();
        storage.set(TASKS_KEY, &sealed).unwrap();
        let old_jwk = storage.get(ENCRYPTION_KEY_KEY).unwrap();

        storage.fail_keys.store(true, Ordering::SeqCst);
        assert!(engine.rotate_key().is_err());

        let recent = log.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, ErrorKind::Crypto);
        assert_eq!(recent[0].function, "rotate_key");
        assert_eq!(storage.get(ENCRYPTION_KEY_KEY).unwrap(), old_jwk);
        assert_eq!(engine.unseal_str(&sealed), Some(json!("Zwiebeln stecken")));
    }

    #[test]
    fn rotation_rolls_back_on_write_failure() {
        let storage = Arc::new(FailingStorage {
            inner: MemoryStorage::new(),
            fail_key: parking_lot::Mutex::new(None),
            fail_keys: AtomicBool::new(false),
        });
        let engine = EncryptionAtRest::new(
            storage.clone(),
            Arc::new(ErrorLog::in_memory()),
            fast_config(),
        );
        engine.ensure_key().unwrap();
        let tasks = engine.seal(&json!([{"id": 1}])).to_json().to_string();
        storage.set(TASKS_KEY, &tasks).unwrap();
        let jwk_before = storage.get(ENCRYPTION_KEY_KEY).unwrap();

        // Entries are written first, then the key write fails.
        *storage.fail_key.lock() = Some(ENCRYPTION_KEY_KEY.to_string());
        assert!(engine.rotate_key().is_err());
        *storage.fail_key.lock() = None;

        assert_eq!(storage.get(ENCRYPTION_KEY_KEY).unwrap(), jwk_before);
        assert_eq!(storage.get(TASKS_KEY).unwrap().as_deref(), Some(tasks.as_str()));
        // The old key is still active.
        assert_eq!(engine.unseal_str(&tasks), Some(json!([{"id": 1}])));
    }

    #[test]
    fn export_import_plain_jwk() {
        let (engine, _, _) = ready_engine();
        let sealed = engine.seal(&json!({"k": "v"}));
        let exported = engine.export_key(None).unwrap();

        let (other, _, _) = ready_engine();
        assert_eq!(other.unseal(&sealed.to_json()), None);
        other.import_key_from_backup(&exported, None).unwrap();
        assert_eq!(other.unseal(&sealed.to_json()), Some(json!({"k": "v"})));
    }

    #[test]
    fn export_import_with_passphrase() {
        let (engine, storage, _) = ready_engine();
        let sealed = engine.seal(&json!("secret"));
        let exported = engine.export_key(Some("correct horse")).unwrap();
        assert!(storage.get(SALT_KEY).unwrap().is_some());
        assert!(!exported.contains("kty"));

        // Replace the key, then restore it from the backup.
        engine.rotate_key().unwrap();
        assert_eq!(engine.unseal(&sealed.to_json()), None);
        engine
            .import_key_from_backup(&exported, Some("correct horse"))
            .unwrap();
        assert_eq!(engine.unseal(&sealed.to_json()), Some(json!("secret")));
    }

    #[test]
    fn import_failure_keeps_previous_key() {
        let (engine, storage, _) = ready_engine();
        let sealed = engine.seal(&json!(7));
        let exported = engine.export_key(Some("correct horse")).unwrap();
        let jwk_before = storage.get(ENCRYPTION_KEY_KEY).unwrap();

        assert!(engine.import_key_from_backup(&exported, Some("wrong horse")).is_err());
        assert!(engine.import_key_from_backup("", None).is_err());
        assert!(engine.import_key_from_backup("{\"kty\":\"RSA\",\"k\":\"\"}", None).is_err());
        assert!(engine.import_key_from_backup(&exported, Some("short")).is_err());

        assert_eq!(storage.get(ENCRYPTION_KEY_KEY).unwrap(), jwk_before);
        assert_eq!(engine.unseal(&sealed.to_json()), Some(json!(7)));
    }

    #[test]
    fn export_requires_key_and_long_passphrase() {
        let storage = Arc::new(MemoryStorage::new());
        let (engine, _) = engine_with(storage);
        assert!(engine.export_key(None).is_err());
        engine.ensure_key().unwrap();
        assert!(engine.export_key(Some("1234567")).is_err());
        assert!(engine.export_key(Some("12345678")).is_ok());
    }

    #[test]
    fn clear_keys_fails_closed() {
        let (engine, storage, _) = ready_engine();
        engine.export_key(Some("long enough")).unwrap();
        let sealed = engine.seal(&json!("gone"));
        engine.clear_keys().unwrap();

        assert!(storage.get(ENCRYPTION_KEY_KEY).unwrap().is_none());
        assert!(storage.get(SALT_KEY).unwrap().is_none());
        assert_eq!(engine.unseal(&sealed.to_json()), None);
        assert!(!engine.seal(&json!("later")).encrypted);
        assert!(!engine.status().key_loaded);
    }

    #[test]
    fn status_reflects_readiness() {
        let (engine, _, _) = ready_engine();
        let status = engine.status();
        assert!(status.supported && status.key_loaded && status.ready);
        assert_eq!(status.key_length, 256);
    }
}
