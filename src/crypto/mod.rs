//! Cryptographic primitives: secrets at rest, password hashing, tokens

pub mod password;
pub mod secret;
pub mod token;

pub use password::{LDAP_USER, OIDC_USER, hash_password, verify_password};
pub use secret::{SecretError, SecretKey};

use subtle::ConstantTimeEq;

/// Constant-time string equality
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
