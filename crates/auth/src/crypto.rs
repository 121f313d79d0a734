//! Reversible field encryption keyed by the process secret.
//!
//! Ciphertext layout: `[version: u8][nonce: 12 bytes][ChaCha20-Poly1305 ciphertext + tag]`.
//! The AEAD key is derived from the secret with HKDF-SHA256. The secret is
//! resolved from a [`SecretSource`] on every call, so rotating it at runtime
//! takes effect immediately.

use std::sync::{Arc, RwLock};

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use gatehouse_core::SecurityError;

const CIPHERTEXT_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const KDF_SALT: &[u8] = b"gatehouse.field-cipher.salt.v1";
const KDF_INFO: &[u8] = b"gatehouse.field-cipher.key.v1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Authentication tag did not verify under the current key.
    #[error("invalid decryption key")]
    InvalidKey,

    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    #[error("no secret key configured")]
    MissingSecret,

    #[error("encryption failed")]
    Encrypt,

    #[error("field encoding failed: {0}")]
    Encoding(String),
}

impl From<CryptoError> for SecurityError {
    fn from(value: CryptoError) -> Self {
        SecurityError::crypto(value.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Secret sources
// ─────────────────────────────────────────────────────────────────────────────

/// Where the process secret comes from. Consulted on every encrypt/decrypt.
pub trait SecretSource: Send + Sync {
    fn secret(&self) -> Option<SecretString>;
}

impl<S> SecretSource for Arc<S>
where
    S: SecretSource + ?Sized,
{
    fn secret(&self) -> Option<SecretString> {
        (**self).secret()
    }
}

/// A secret that can be replaced at runtime.
#[derive(Clone, Default)]
pub struct SharedSecret {
    inner: Arc<RwLock<Option<SecretString>>>,
}

impl SharedSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        let s = Self::default();
        s.set(secret);
        s
    }

    pub fn set(&self, secret: impl Into<String>) {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(SecretString::from(secret.into()));
    }
}

impl SecretSource for SharedSecret {
    fn secret(&self) -> Option<SecretString> {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl core::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Secret read from an environment variable at call time.
#[derive(Debug, Clone)]
pub struct EnvSecret {
    pub var: String,
}

impl SecretSource for EnvSecret {
    fn secret(&self) -> Option<SecretString> {
        std::env::var(&self.var)
            .ok()
            .filter(|v| !v.is_empty())
            .map(SecretString::from)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Raw AEAD
// ─────────────────────────────────────────────────────────────────────────────

fn derive_key(secret: &SecretString) -> Result<Key, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), secret.expose_secret().as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(KDF_INFO, &mut okm)
        .map_err(|_| CryptoError::Malformed("hkdf output length".into()))?;
    Ok(Key::clone_from_slice(&okm))
}

/// Encrypt `plaintext` under `secret`.
pub fn seal(secret: &SecretString, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(&derive_key(secret)?);
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ct = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(1 + NONCE_LEN + ct.len());
    out.push(CIPHERTEXT_VERSION);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Decrypt `ciphertext` under `secret`; a tag mismatch is [`CryptoError::InvalidKey`].
pub fn open(secret: &SecretString, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (version, rest) = ciphertext
        .split_first()
        .ok_or_else(|| CryptoError::Malformed("empty ciphertext".into()))?;
    if *version != CIPHERTEXT_VERSION {
        return Err(CryptoError::Malformed(format!(
            "unsupported ciphertext version {version}"
        )));
    }
    if rest.len() < NONCE_LEN {
        return Err(CryptoError::Malformed("ciphertext shorter than nonce".into()));
    }
    let (nonce, body) = rest.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(&derive_key(secret)?);
    cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| CryptoError::InvalidKey)
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed fields
// ─────────────────────────────────────────────────────────────────────────────

/// How an encrypted column's plaintext is encoded. Stored in column metadata
/// as `text`, `json` or `bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Json,
    Bytes,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Bytes => "bytes",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            "bytes" => Some(Self::Bytes),
            _ => None,
        }
    }

    fn encode(&self, value: &FieldValue) -> Result<Vec<u8>, CryptoError> {
        match (self, value) {
            (Self::Text, FieldValue::Text(s)) => Ok(s.as_bytes().to_vec()),
            (Self::Json, FieldValue::Json(v)) => {
                serde_json::to_vec(v).map_err(|e| CryptoError::Encoding(e.to_string()))
            }
            (Self::Bytes, FieldValue::Bytes(b)) => Ok(b.clone()),
            (kind, _) => Err(CryptoError::Encoding(format!(
                "value does not match field kind '{}'",
                kind.as_str()
            ))),
        }
    }

    fn decode(&self, raw: Vec<u8>) -> Result<FieldValue, CryptoError> {
        match self {
            Self::Text => String::from_utf8(raw)
                .map(FieldValue::Text)
                .map_err(|e| CryptoError::Encoding(e.to_string())),
            Self::Json => serde_json::from_slice(&raw)
                .map(FieldValue::Json)
                .map_err(|e| CryptoError::Encoding(e.to_string())),
            Self::Bytes => Ok(FieldValue::Bytes(raw)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

/// Encrypts typed field values under whatever secret the source holds now.
#[derive(Clone)]
pub struct FieldCipher {
    source: Arc<dyn SecretSource>,
}

impl FieldCipher {
    pub fn new(source: Arc<dyn SecretSource>) -> Self {
        Self { source }
    }

    fn current(&self) -> Result<SecretString, CryptoError> {
        self.source.secret().ok_or(CryptoError::MissingSecret)
    }

    pub fn encrypt(&self, value: &FieldValue, kind: FieldKind) -> Result<Vec<u8>, CryptoError> {
        seal(&self.current()?, &kind.encode(value)?)
    }

    pub fn decrypt(&self, ciphertext: &[u8], kind: FieldKind) -> Result<FieldValue, CryptoError> {
        kind.decode(open(&self.current()?, ciphertext)?)
    }
}

impl core::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.to_string())
    }

    #[test]
    fn roundtrip_and_wrong_key() {
        let secret = SharedSecret::new("K1");
        let cipher = FieldCipher::new(Arc::new(secret.clone()));

        let c1 = cipher.encrypt(&text("s3cret"), FieldKind::Text).unwrap();
        assert_eq!(c1[0], CIPHERTEXT_VERSION);
        assert_eq!(cipher.decrypt(&c1, FieldKind::Text).unwrap(), text("s3cret"));

        // Rotation at runtime is picked up on the next call.
        secret.set("K2");
        assert_eq!(
            cipher.decrypt(&c1, FieldKind::Text),
            Err(CryptoError::InvalidKey)
        );
        assert_eq!(CryptoError::InvalidKey.to_string(), "invalid decryption key");
    }

    #[test]
    fn nonces_are_fresh() {
        let k = SecretString::from("K".to_string());
        let a = seal(&k, b"same").unwrap();
        let b = seal(&k, b"same").unwrap();
        assert_ne!(a, b);
        assert_eq!(open(&k, &a).unwrap(), b"same");
    }

    #[test]
    fn json_fields() {
        let cipher = FieldCipher::new(Arc::new(SharedSecret::new("K")));
        let v = FieldValue::Json(serde_json::json!({"host": "db", "port": 5432}));
        let ct = cipher.encrypt(&v, FieldKind::Json).unwrap();
        assert_eq!(cipher.decrypt(&ct, FieldKind::Json).unwrap(), v);
        assert!(matches!(
            cipher.encrypt(&v, FieldKind::Text),
            Err(CryptoError::Encoding(_))
        ));
    }

    #[test]
    fn malformed_and_missing_secret() {
        let k = SecretString::from("K".to_string());
        assert!(matches!(open(&k, &[]), Err(CryptoError::Malformed(_))));
        assert!(matches!(open(&k, &[9, 1, 2]), Err(CryptoError::Malformed(_))));

        let cipher = FieldCipher::new(Arc::new(SharedSecret::default()));
        assert_eq!(
            cipher.encrypt(&text("x"), FieldKind::Text),
            Err(CryptoError::MissingSecret)
        );
    }
}
