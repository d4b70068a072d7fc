//! Random token generation

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use rand::RngExt;
use sha2::{Digest, Sha256};

/// Length of the stored API-key prefix
pub const API_KEY_PREFIX_LEN: usize = 8;

/// Session token: 32 random bytes, hex encoded (64 chars)
#[must_use]
pub fn session_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

/// Anti-forgery token: 32 random bytes, hex encoded (64 chars)
#[must_use]
pub fn csrf_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

/// API key: 32 random bytes, hex encoded. The first
/// [`API_KEY_PREFIX_LEN`] characters are stored verbatim for lookup.
#[must_use]
pub fn api_key() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

/// Lookup prefix of an API key, or `None` when the key is too short
#[must_use]
pub fn api_key_prefix(key: &str) -> Option<&str> {
    key.get(..API_KEY_PREFIX_LEN)
}

/// Per-request CSP nonce: 128 bits, base64
#[must_use]
pub fn csp_nonce() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    STANDARD.encode(bytes)
}

/// OIDC state parameter: 128 bits, URL-safe base64
#[must_use]
pub fn oidc_state() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a PKCE code verifier and its S256 challenge
#[must_use]
pub fn pkce_pair() -> (String, String) {
    let verifier_bytes: [u8; 32] = rand::rng().random();
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

    (verifier, challenge)
}
