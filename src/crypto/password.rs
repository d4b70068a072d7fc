//! Argon2id password hashing and verification.
//!
//! Local passwords are pre-hashed with SHA-256 before Argon2id so arbitrarily
//! long inputs cost the same. Hashes written before the pre-hash existed are
//! plain Argon2id over the raw password and keep verifying.

use argon2::{
    Argon2,
    password_hash::{
        PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString, rand_core::OsRng,
    },
};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Credential tag for users that authenticate against the directory
pub const LDAP_USER: &str = "LDAP_USER";

/// Credential tag for users that authenticate through OpenID Connect
pub const OIDC_USER: &str = "OIDC_USER";

fn prehash(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn argon2_hash(input: &[u8]) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(input, &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal(format!("Password hashing failed: {e}")))
}

fn argon2_verify(input: &[u8], parsed: &PasswordHash<'_>) -> bool {
    Argon2::default().verify_password(input, parsed).is_ok()
}

/// Hash a password for storage: Argon2id over hex(SHA-256(password)).
pub fn hash_password(password: &str) -> Result<String> {
    argon2_hash(prehash(password).as_bytes())
}

/// Hash the raw password without the pre-hash step.
pub fn hash_password_legacy(password: &str) -> Result<String> {
    argon2_hash(password.as_bytes())
}

/// Verify a password against a stored hash.
///
/// Both the pre-hashed and the raw candidate are always evaluated so the
/// timing does not reveal which format the stored hash uses. External-user
/// tags and unparseable hashes never verify.
#[must_use]
pub fn verify_password(password: &str, stored: &str) -> bool {
    if is_external_tag(stored) {
        return false;
    }
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };

    let prehashed = argon2_verify(prehash(password).as_bytes(), &parsed);
    let legacy = argon2_verify(password.as_bytes(), &parsed);
    prehashed | legacy
}

/// Hash an opaque secret (API keys): single Argon2id pass.
pub fn hash_secret(secret: &str) -> Result<String> {
    argon2_hash(secret.as_bytes())
}

/// Verify an opaque secret with a single Argon2id comparison.
#[must_use]
pub fn verify_secret(secret: &str, stored: &str) -> bool {
    PasswordHash::new(stored).is_ok_and(|parsed| argon2_verify(secret.as_bytes(), &parsed))
}

/// Whether the credential column holds an external-provider tag
#[must_use]
pub fn is_external_tag(stored: &str) -> bool {
    stored == LDAP_USER || stored == OIDC_USER
}
