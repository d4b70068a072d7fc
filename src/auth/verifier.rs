//! Username/password verification (local accounts, then the directory)

use std::sync::{Arc, LazyLock};

use tracing::{debug, info, warn};

use super::ldap::{Directory, LdapDirectory};
use crate::crypto::LDAP_USER;
use crate::crypto::password::{hash_password, verify_password};
use crate::settings::{LdapSettings, SettingsHandle};
use crate::store::{Store, User};
use crate::{Error, Result};

// Compared against when no local user exists, so a miss costs about as
// much as a wrong password.
static DUMMY_HASH: LazyLock<Option<String>> =
    LazyLock::new(|| hash_password("dashgate-timing-equaliser").ok());

/// Checks login credentials against every enabled provider
pub struct CredentialVerifier {
    store: Store,
    settings: Arc<SettingsHandle>,
    directory: Arc<dyn Directory>,
}

impl CredentialVerifier {
    /// Verifier using the real LDAP client
    #[must_use]
    pub fn new(store: Store, settings: Arc<SettingsHandle>) -> Self {
        Self::with_directory(store, settings, Arc::new(LdapDirectory))
    }

    /// Verifier with a custom directory client
    #[must_use]
    pub fn with_directory(store: Store, settings: Arc<SettingsHandle>, directory: Arc<dyn Directory>) -> Self {
        Self {
            store,
            settings,
            directory,
        }
    }

    /// The user the credentials belong to. Every failure is
    /// [`Error::InvalidCredentials`] except storage errors.
    pub async fn verify(&self, username: &str, password: &str) -> Result<User> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(Error::InvalidCredentials);
        }
        let settings = self.settings.snapshot();
        let existing = self.store.lookup_user_by_username(username).await?;

        if let Some(user) = existing.as_ref().filter(|u| u.is_local()) {
            if settings.local_auth_enabled && check_password(password, &user.password_hash).await {
                return Ok(user.clone());
            }
            // A local account never falls through to the directory
            debug!(username, "Local password rejected");
            return Err(Error::InvalidCredentials);
        }

        if settings.ldap.is_configured() {
            return self.verify_directory(&settings.ldap, username, password).await;
        }

        if let Some(dummy) = DUMMY_HASH.as_ref() {
            let _ = check_password(password, dummy).await;
        }
        Err(Error::InvalidCredentials)
    }

    async fn verify_directory(
        &self,
        ldap: &LdapSettings,
        username: &str,
        password: &str,
    ) -> Result<User> {
        let profile = match self.directory.authenticate(ldap, username, password).await {
            Ok(profile) => profile,
            Err(e) => {
                info!(username, error = %e, "Directory login failed");
                return Err(Error::InvalidCredentials);
            }
        };
        match self.store.upsert_external_user(&profile, LDAP_USER).await {
            Ok(user) => Ok(user),
            Err(Error::Conflict(msg)) => {
                warn!(username, %msg, "Directory login refused");
                Err(Error::InvalidCredentials)
            }
            Err(e) => Err(e),
        }
    }
}

async fn check_password(password: &str, stored: &str) -> bool {
    let password = password.to_string();
    let stored = stored.to_string();
    tokio::task::spawn_blocking(move || verify_password(&password, &stored))
        .await
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::auth::ldap::LdapError;
    use crate::config::AuthMode;
    use crate::crypto::SecretKey;
    use crate::crypto::password::hash_password_legacy;
    use crate::store::{ExternalUser, NewUser};

    struct FakeDirectory;

    #[async_trait]
    impl Directory for FakeDirectory {
        async fn authenticate(
            &self,
            _settings: &LdapSettings,
            username: &str,
            password: &str,
        ) -> std::result::Result<ExternalUser, LdapError> {
            if password == "dir-pass" {
                Ok(ExternalUser {
                    username: username.to_string(),
                    email: Some(format!("{username}@dir.lan")),
                    display_name: username.to_uppercase(),
                    groups: vec!["media".into()],
                })
            } else {
                Err(LdapError::UserBind)
            }
        }
    }

    async fn verifier(ldap: bool) -> (CredentialVerifier, Store) {
        let store = Store::in_memory().await.unwrap();
        let settings = SettingsHandle::load(store.clone(), SecretKey::empty(), HashMap::new(), AuthMode::Local)
            .await
            .unwrap();
        if ldap {
            let mut next = (*settings.snapshot()).clone();
            next.ldap = LdapSettings {
                enabled: true,
                url: "ldaps://dir.lan".into(),
                base_dn: "dc=lan".into(),
                ..LdapSettings::default()
            };
            settings.publish(next).await.unwrap();
        }
        let verifier =
            CredentialVerifier::with_directory(store.clone(), Arc::new(settings), Arc::new(FakeDirectory));
        (verifier, store)
    }

    async fn local_user(store: &Store, name: &str, hash: String) {
        store
            .create_user(&NewUser {
                username: name.into(),
                display_name: name.into(),
                groups: vec!["admin".into()],
                password_hash: hash,
                ..NewUser::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn local_and_legacy_hashes_verify() {
        let (verifier, store) = verifier(false).await;
        local_user(&store, "alice", hash_password("s3cret").unwrap()).await;
        local_user(&store, "old", hash_password_legacy("legacy").unwrap()).await;

        assert_eq!(verifier.verify("alice", "s3cret").await.unwrap().username, "alice");
        assert_eq!(verifier.verify("old", "legacy").await.unwrap().username, "old");
        assert!(matches!(
            verifier.verify("alice", "nope").await,
            Err(Error::InvalidCredentials)
        ));
        assert!(matches!(
            verifier.verify("ghost", "s3cret").await,
            Err(Error::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn directory_login_creates_external_user() {
        let (verifier, store) = verifier(true).await;
        let user = verifier.verify("carol", "dir-pass").await.unwrap();
        assert_eq!(user.password_hash, LDAP_USER);
        assert_eq!(user.groups, vec!["media"]);
        assert_eq!(store.count_users().await.unwrap(), 1);

        assert!(matches!(
            verifier.verify("carol", "wrong").await,
            Err(Error::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn directory_cannot_take_over_local_accounts() {
        let (verifier, store) = verifier(true).await;
        local_user(&store, "alice", hash_password("s3cret").unwrap()).await;
        assert!(matches!(
            verifier.verify("alice", "dir-pass").await,
            Err(Error::InvalidCredentials)
        ));
        let alice = store.lookup_user_by_username("alice").await.unwrap().unwrap();
        assert!(alice.is_local());
    }

    #[tokio::test]
    async fn empty_password_is_rejected_up_front() {
        let (verifier, _) = verifier(true).await;
        assert!(matches!(verifier.verify("carol", "").await, Err(Error::InvalidCredentials)));
    }
}
