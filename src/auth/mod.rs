//! Authentication
//!
//! Every request is resolved to at most one [`AuthUser`] by a chain of
//! [`Identifier`]s (API key, trusted proxy, session cookie). Interactive
//! logins go through [`CredentialVerifier`] (local, LDAP) or the OIDC
//! authorization-code flow, and end in a fresh session from
//! [`SessionManager`].

pub mod identity;
pub mod ldap;
pub mod oidc;
pub mod session;
pub mod verifier;

pub use identity::{
    ApiKeyIdentifier, Identifier, ProxyIdentifier, RequestIdentity, Resolver, SessionIdentifier,
};
pub use oidc::{OidcClient, OidcError, validate_redirect};
pub use session::{CSRF_COOKIE, SESSION_COOKIE, SessionManager};
pub use verifier::CredentialVerifier;

use serde::Serialize;

use crate::crypto::{LDAP_USER, OIDC_USER};
use crate::settings::SystemSettings;
use crate::store::User;

/// How an identity was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthSource {
    /// Local password
    Local,
    /// Directory bind
    Ldap,
    /// OpenID Connect
    Oidc,
    /// Trusted reverse-proxy headers
    Proxy,
    /// API key
    #[serde(rename = "apikey")]
    ApiKey,
}

impl AuthSource {
    /// Source implied by a stored password-credential tag
    #[must_use]
    pub fn from_credential_tag(tag: &str) -> Self {
        match tag {
            LDAP_USER => Self::Ldap,
            OIDC_USER => Self::Oidc,
            _ => Self::Local,
        }
    }
}

/// The identity attached to a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthUser {
    /// Login name
    pub username: String,
    /// Display name
    pub display_name: String,
    /// Email, when known
    pub email: Option<String>,
    /// Group memberships
    pub groups: Vec<String>,
    /// How the identity was established
    pub source: AuthSource,
    /// Backing user row; `None` for proxy and API-key identities
    #[serde(skip)]
    pub user_id: Option<i64>,
    /// API-key permissions
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

impl AuthUser {
    /// Identity for a stored user row
    #[must_use]
    pub fn from_user(user: &User) -> Self {
        Self {
            username: user.username.clone(),
            display_name: if user.display_name.is_empty() {
                user.username.clone()
            } else {
                user.display_name.clone()
            },
            email: user.email.clone(),
            groups: user.groups.clone(),
            source: AuthSource::from_credential_tag(&user.password_hash),
            user_id: Some(user.id),
            permissions: Vec::new(),
        }
    }

    /// Whether the user holds an admin group
    #[must_use]
    pub fn is_admin(&self, settings: &SystemSettings) -> bool {
        settings.is_admin_groups(&self.groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(tag: &str, groups: &[&str]) -> User {
        User {
            id: 7,
            username: "alice".into(),
            email: None,
            display_name: String::new(),
            groups: groups.iter().map(|g| (*g).to_string()).collect(),
            password_hash: tag.into(),
            created_at: 0,
        }
    }

    #[test]
    fn source_follows_credential_tag() {
        assert_eq!(AuthUser::from_user(&user(LDAP_USER, &[])).source, AuthSource::Ldap);
        assert_eq!(AuthUser::from_user(&user(OIDC_USER, &[])).source, AuthSource::Oidc);
        assert_eq!(AuthUser::from_user(&user("$argon2id$...", &[])).source, AuthSource::Local);
    }

    #[test]
    fn admin_check_is_case_insensitive() {
        let settings = SystemSettings::default();
        assert!(AuthUser::from_user(&user("x", &["Admin"])).is_admin(&settings));
        assert!(!AuthUser::from_user(&user("x", &["staff"])).is_admin(&settings));
    }

    #[test]
    fn display_name_falls_back_to_username() {
        assert_eq!(AuthUser::from_user(&user("x", &[])).display_name, "alice");
    }
}
