//! Secret-at-rest codec
//!
//! Sensitive settings are stored as `enc:` + base64(nonce ‖ AES-256-GCM
//! ciphertext). Values without the prefix are legacy plaintext and pass
//! through untouched, as does everything when no key is available.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use tracing::{info, warn};

use crate::store::Store;

/// Prefix marking an encrypted value
pub const ENCRYPTED_PREFIX: &str = "enc:";

/// Row in `system_secrets` holding the generated key
pub const KEY_SECRET_NAME: &str = "system_encryption_key";

const KEY_LEN: usize = 32;

/// Structural failures of the codec
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretError {
    /// Payload after the prefix is not valid base64
    #[error("encrypted value is not valid base64")]
    Malformed,
    /// Payload shorter than nonce + tag
    #[error("encrypted value is too short")]
    TooShort,
    /// Authentication failed (wrong key or tampered data)
    #[error("decryption failed")]
    Decrypt,
    /// Key is not 32 bytes
    #[error("invalid encryption key")]
    InvalidKey,
}

/// AES-256 key for settings at rest. An empty key disables the codec.
#[derive(Clone, Default)]
pub struct SecretKey(Vec<u8>);

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("len", &self.0.len())
            .finish()
    }
}

impl SecretKey {
    /// Key with no material; the codec becomes a passthrough
    #[must_use]
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Parse exactly 64 hex characters
    pub fn from_hex(hex_key: &str) -> Result<Self, SecretError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|_| SecretError::InvalidKey)?;
        if bytes.len() != KEY_LEN {
            return Err(SecretError::InvalidKey);
        }
        Ok(Self(bytes))
    }

    /// Fresh random key from the system RNG
    pub fn generate() -> Result<Self, SecretError> {
        let mut bytes = vec![0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| SecretError::InvalidKey)?;
        Ok(Self(bytes))
    }

    /// Whether the codec is disabled
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hex form for persistence
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    fn aead(&self) -> Result<LessSafeKey, SecretError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.0).map_err(|_| SecretError::InvalidKey)?;
        Ok(LessSafeKey::new(unbound))
    }
}

/// Whether a stored value carries the encrypted prefix
#[must_use]
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}

/// Encrypt a plaintext value.
///
/// Returns the input unchanged when the key or the value is empty, or when
/// the value is already encrypted.
pub fn encrypt(key: &SecretKey, plaintext: &str) -> Result<String, SecretError> {
    if key.is_empty() || plaintext.is_empty() || is_encrypted(plaintext) {
        return Ok(plaintext.to_string());
    }

    let aead = key.aead()?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| SecretError::InvalidKey)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut data = plaintext.as_bytes().to_vec();
    aead.seal_in_place_append_tag(nonce, Aad::empty(), &mut data)
        .map_err(|_| SecretError::Decrypt)?;

    let mut combined = Vec::with_capacity(NONCE_LEN + data.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&data);

    Ok(format!("{ENCRYPTED_PREFIX}{}", STANDARD.encode(combined)))
}

/// Decrypt a stored value.
///
/// Values without the prefix, or any value when the key is empty, are
/// returned unchanged.
pub fn decrypt(key: &SecretKey, stored: &str) -> Result<String, SecretError> {
    if key.is_empty() {
        return Ok(stored.to_string());
    }
    let Some(payload) = stored.strip_prefix(ENCRYPTED_PREFIX) else {
        return Ok(stored.to_string());
    };

    let combined = STANDARD.decode(payload).map_err(|_| SecretError::Malformed)?;
    if combined.len() < NONCE_LEN + AES_256_GCM.tag_len() {
        return Err(SecretError::TooShort);
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| SecretError::TooShort)?;
    let aead = key.aead()?;

    let mut data = ciphertext.to_vec();
    let plaintext = aead
        .open_in_place(nonce, Aad::empty(), &mut data)
        .map_err(|_| SecretError::Decrypt)?;

    String::from_utf8(plaintext.to_vec()).map_err(|_| SecretError::Decrypt)
}

/// Resolve the process key: `ENCRYPTION_KEY`, then the persisted row, then a
/// freshly generated key written to that row.
///
/// Never fails; on total failure the codec runs with an empty key.
pub async fn resolve_key(env_key: Option<&str>, store: &Store) -> SecretKey {
    if let Some(raw) = env_key.filter(|k| !k.trim().is_empty()) {
        match SecretKey::from_hex(raw) {
            Ok(key) => {
                info!("Using encryption key from ENCRYPTION_KEY");
                return key;
            }
            Err(_) => warn!("ENCRYPTION_KEY must be exactly 64 hex characters; ignoring it"),
        }
    }

    match store.get_secret(KEY_SECRET_NAME).await {
        Ok(Some(stored)) => match SecretKey::from_hex(&stored) {
            Ok(key) => return key,
            Err(_) => warn!("Stored encryption key is malformed; generating a new one"),
        },
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "Failed to read stored encryption key; secrets stay in plaintext");
            return SecretKey::empty();
        }
    }

    let generated = match SecretKey::generate() {
        Ok(key) => key,
        Err(e) => {
            warn!(error = %e, "Failed to generate encryption key; secrets stay in plaintext");
            return SecretKey::empty();
        }
    };

    if let Err(e) = store.put_secret(KEY_SECRET_NAME, &generated.to_hex()).await {
        warn!(error = %e, "Failed to persist encryption key; secrets stay in plaintext");
        return SecretKey::empty();
    }

    info!("Generated and stored a new encryption key");
    generated
}
