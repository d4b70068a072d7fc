//! Runtime settings
//!
//! Settings an administrator changes from the UI are persisted row-per-key in
//! `system_settings`. Sensitive values are encrypted at rest with the process
//! key. Readers take an `Arc` snapshot; writers persist first, then publish a
//! whole new snapshot under the write lock. Network bootstrap that depends on
//! new settings (OIDC discovery) happens between the copy and the publish,
//! never while the lock is held.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::AuthMode;
use crate::crypto::secret::{self, SecretKey};
use crate::discovery::SourceTag;
use crate::store::Store;
use crate::{Error, Result};

/// Placeholder returned instead of stored secrets; sending it back keeps the old value
pub const REDACTED: &str = "********";

/// Setting keys stored encrypted when a key is available
pub const SENSITIVE_KEYS: &[&str] = &[
    "ldap_bind_password",
    "oidc_client_secret",
    "traefik_password",
    "npm_password",
    "caddy_password",
    "docker_password",
];

const SEEDED_MARKER: &str = "auth_mode_seeded";
const PROXY_MIGRATION_MARKER: &str = "trusted_proxies_migrated";

/// Ranges assumed for the reverse proxy when proxy auth was enabled without any
const PRIVATE_RANGES: &[&str] = &["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

/// Directory (LDAP) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LdapSettings {
    /// Accept directory logins
    pub enabled: bool,
    /// `ldaps://host:636` or `ldap://host:389` (StartTLS)
    pub url: String,
    /// Service account DN
    pub bind_dn: String,
    /// Service account password
    pub bind_password: String,
    /// Search base
    pub base_dn: String,
    /// Search filter; `{username}` is replaced by the escaped login name
    pub user_filter: String,
    /// Upgrade `ldap://` connections with StartTLS
    pub starttls: bool,
}

impl Default for LdapSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            bind_dn: String::new(),
            bind_password: String::new(),
            base_dn: String::new(),
            user_filter: "(uid={username})".to_string(),
            starttls: true,
        }
    }
}

impl LdapSettings {
    /// Enabled and complete enough to attempt a bind
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.enabled && !self.url.trim().is_empty() && !self.base_dn.trim().is_empty()
    }
}

/// OpenID Connect settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcSettings {
    /// Offer the OIDC flow
    pub enabled: bool,
    /// Issuer URL (discovery document at `/.well-known/openid-configuration`)
    pub issuer: String,
    /// Client id
    pub client_id: String,
    /// Client secret
    pub client_secret: String,
    /// Absolute callback URL registered with the provider
    pub redirect_url: String,
    /// Space separated scopes
    pub scopes: String,
    /// Claim carrying the group list
    pub groups_claim: String,
}

impl Default for OidcSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            issuer: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_url: String::new(),
            scopes: "openid profile email groups".to_string(),
            groups_claim: "groups".to_string(),
        }
    }
}

impl OidcSettings {
    /// Enabled and complete enough to start a flow
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.enabled && !self.issuer.trim().is_empty() && !self.client_id.trim().is_empty()
    }
}

/// Trusted reverse-proxy header auth
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Accept `Remote-User` headers from trusted proxies
    pub enabled: bool,
    /// Addresses or CIDRs of trusted proxies
    pub trusted_proxies: Vec<String>,
}

/// Connection settings of one discovery source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Poll this source
    pub enabled: bool,
    /// API URL, socket path or (nginx) config directory
    pub url: String,
    /// Basic-auth / login user
    pub username: String,
    /// Basic-auth / login password
    pub password: String,
}

impl SourceSettings {
    /// Copy with the password replaced by [`REDACTED`]
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            password: redact(&self.password),
            ..self.clone()
        }
    }
}

/// Runtime-editable settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    /// Accept local username/password logins
    pub local_auth_enabled: bool,
    /// Directory settings
    pub ldap: LdapSettings,
    /// OpenID Connect settings
    pub oidc: OidcSettings,
    /// Reverse-proxy header auth
    pub proxy: ProxySettings,
    /// Groups granting admin rights (case-insensitive)
    pub admin_groups: Vec<String>,
    /// First administrator exists
    pub setup_completed: bool,
    /// Discovery sources, edited through their own endpoint
    #[serde(skip)]
    pub sources: HashMap<SourceTag, SourceSettings>,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            local_auth_enabled: true,
            ldap: LdapSettings::default(),
            oidc: OidcSettings::default(),
            proxy: ProxySettings::default(),
            admin_groups: vec!["admin".to_string()],
            setup_completed: false,
            sources: HashMap::new(),
        }
    }
}

fn redact(value: &str) -> String {
    if value.is_empty() {
        String::new()
    } else {
        REDACTED.to_string()
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn flag(value: bool) -> String {
    value.to_string()
}

impl SystemSettings {
    /// Where an unauthenticated browser is sent, or `None` when no
    /// interactive provider is enabled (proxy-only deployments answer 401).
    #[must_use]
    pub fn login_redirect(&self) -> Option<&'static str> {
        let form = self.local_auth_enabled || self.ldap.is_configured();
        match (form, self.oidc.is_configured()) {
            (true, _) => Some("/login"),
            (false, true) => Some("/auth/oidc"),
            (false, false) => None,
        }
    }

    /// Whether any of `groups` is an admin group
    #[must_use]
    pub fn is_admin_groups(&self, groups: &[String]) -> bool {
        groups.iter().any(|g| {
            let g = g.trim();
            self.admin_groups.iter().any(|a| a.trim().eq_ignore_ascii_case(g))
        })
    }

    /// Copy with every secret replaced by [`REDACTED`]
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.ldap.bind_password = redact(&copy.ldap.bind_password);
        copy.oidc.client_secret = redact(&copy.oidc.client_secret);
        copy.sources = copy
            .sources
            .iter()
            .map(|(tag, s)| (*tag, s.redacted()))
            .collect();
        copy
    }

    /// Take secrets from `previous` wherever this copy holds [`REDACTED`]
    pub fn keep_redacted_secrets(&mut self, previous: &Self) {
        if self.ldap.bind_password == REDACTED {
            self.ldap.bind_password.clone_from(&previous.ldap.bind_password);
        }
        if self.oidc.client_secret == REDACTED {
            self.oidc.client_secret.clone_from(&previous.oidc.client_secret);
        }
    }

    /// Decode persisted rows. Also returns the sensitive keys that failed to
    /// decrypt so callers never overwrite them with the empty fallback.
    fn from_rows(rows: &HashMap<String, String>, key: &SecretKey) -> (Self, Vec<String>) {
        let mut s = Self::default();
        let undecryptable = RefCell::new(Vec::new());

        let get = |k: &str| -> Option<String> {
            let raw = rows.get(k)?;
            if SENSITIVE_KEYS.contains(&k) {
                match secret::decrypt(key, raw) {
                    Ok(plain) => Some(plain),
                    Err(e) => {
                        error!(setting = k, error = %e, "Cannot decrypt setting; treating it as empty");
                        undecryptable.borrow_mut().push(k.to_string());
                        Some(String::new())
                    }
                }
            } else {
                Some(raw.clone())
            }
        };
        let get_bool = |k: &str, default: bool| get(k).map_or(default, |v| v == "true");

        s.local_auth_enabled = get_bool("local_auth_enabled", s.local_auth_enabled);
        s.setup_completed = get_bool("setup_completed", false);
        if let Some(v) = get("admin_groups") {
            s.admin_groups = parse_list(&v);
        }

        s.ldap.enabled = get_bool("ldap_enabled", false);
        s.ldap.url = get("ldap_url").unwrap_or_default();
        s.ldap.bind_dn = get("ldap_bind_dn").unwrap_or_default();
        s.ldap.bind_password = get("ldap_bind_password").unwrap_or_default();
        s.ldap.base_dn = get("ldap_base_dn").unwrap_or_default();
        if let Some(v) = get("ldap_user_filter").filter(|v| !v.is_empty()) {
            s.ldap.user_filter = v;
        }
        s.ldap.starttls = get_bool("ldap_starttls", s.ldap.starttls);

        s.oidc.enabled = get_bool("oidc_enabled", false);
        s.oidc.issuer = get("oidc_issuer").unwrap_or_default();
        s.oidc.client_id = get("oidc_client_id").unwrap_or_default();
        s.oidc.client_secret = get("oidc_client_secret").unwrap_or_default();
        s.oidc.redirect_url = get("oidc_redirect_url").unwrap_or_default();
        if let Some(v) = get("oidc_scopes").filter(|v| !v.is_empty()) {
            s.oidc.scopes = v;
        }
        if let Some(v) = get("oidc_groups_claim").filter(|v| !v.is_empty()) {
            s.oidc.groups_claim = v;
        }

        s.proxy.enabled = get_bool("proxy_auth_enabled", false);
        s.proxy.trusted_proxies = get("trusted_proxies").map(|v| parse_list(&v)).unwrap_or_default();

        for tag in SourceTag::ALL {
            let name = tag.as_str();
            s.sources.insert(
                tag,
                SourceSettings {
                    enabled: get_bool(&format!("{name}_enabled"), false),
                    url: get(&format!("{name}_url")).unwrap_or_default(),
                    username: get(&format!("{name}_username")).unwrap_or_default(),
                    password: get(&format!("{name}_password")).unwrap_or_default(),
                },
            );
        }

        (s, undecryptable.into_inner())
    }

    fn plain_rows(&self) -> Vec<(String, String)> {
        let mut rows = vec![
            ("local_auth_enabled".to_string(), flag(self.local_auth_enabled)),
            ("setup_completed".to_string(), flag(self.setup_completed)),
            ("admin_groups".to_string(), self.admin_groups.join(",")),
            ("ldap_enabled".to_string(), flag(self.ldap.enabled)),
            ("ldap_url".to_string(), self.ldap.url.clone()),
            ("ldap_bind_dn".to_string(), self.ldap.bind_dn.clone()),
            ("ldap_bind_password".to_string(), self.ldap.bind_password.clone()),
            ("ldap_base_dn".to_string(), self.ldap.base_dn.clone()),
            ("ldap_user_filter".to_string(), self.ldap.user_filter.clone()),
            ("ldap_starttls".to_string(), flag(self.ldap.starttls)),
            ("oidc_enabled".to_string(), flag(self.oidc.enabled)),
            ("oidc_issuer".to_string(), self.oidc.issuer.clone()),
            ("oidc_client_id".to_string(), self.oidc.client_id.clone()),
            ("oidc_client_secret".to_string(), self.oidc.client_secret.clone()),
            ("oidc_redirect_url".to_string(), self.oidc.redirect_url.clone()),
            ("oidc_scopes".to_string(), self.oidc.scopes.clone()),
            ("oidc_groups_claim".to_string(), self.oidc.groups_claim.clone()),
            ("proxy_auth_enabled".to_string(), flag(self.proxy.enabled)),
            ("trusted_proxies".to_string(), self.proxy.trusted_proxies.join(",")),
        ];

        for (tag, source) in &self.sources {
            let name = tag.as_str();
            rows.push((format!("{name}_enabled"), flag(source.enabled)));
            rows.push((format!("{name}_url"), source.url.clone()));
            rows.push((format!("{name}_username"), source.username.clone()));
            rows.push((format!("{name}_password"), source.password.clone()));
        }
        rows
    }

    fn to_rows(&self, key: &SecretKey) -> Result<Vec<(String, String)>> {
        let mut rows = self.plain_rows();
        for (k, v) in &mut rows {
            if SENSITIVE_KEYS.contains(&k.as_str()) {
                *v = secret::encrypt(key, v)?;
            }
        }

        Ok(rows)
    }
}

/// Shared handle to the live settings
#[derive(Debug)]
pub struct SettingsHandle {
    current: RwLock<Arc<SystemSettings>>,
    // Serializes copy, persist and swap across writers
    write: tokio::sync::Mutex<()>,
    // Sensitive keys whose stored value could not be decrypted with this key
    undecryptable: Mutex<HashSet<String>>,
    store: Store,
    key: SecretKey,
    pinned: HashMap<SourceTag, SourceSettings>,
}

impl SettingsHandle {
    /// Load settings, seeding provider toggles from `mode` on first start and
    /// running the one-time trusted-proxy migration.
    pub async fn load(
        store: Store,
        key: SecretKey,
        pinned: HashMap<SourceTag, SourceSettings>,
        mode: AuthMode,
    ) -> Result<Self> {
        let rows = store.load_settings().await?;
        let (mut settings, undecryptable) = SystemSettings::from_rows(&rows, &key);
        let mut dirty = false;

        if !rows.contains_key(SEEDED_MARKER) {
            seed_from_mode(&mut settings, mode);
            info!(?mode, "Seeded authentication providers from AUTH_MODE");
            dirty = true;
        }

        if !rows.contains_key(PROXY_MIGRATION_MARKER) {
            if settings.proxy.enabled && settings.proxy.trusted_proxies.is_empty() {
                warn!(
                    ranges = ?PRIVATE_RANGES,
                    "Proxy auth enabled without trusted proxies; trusting private ranges once. Review this in system settings"
                );
                settings.proxy.trusted_proxies = PRIVATE_RANGES.iter().map(ToString::to_string).collect();
            }
            dirty = true;
        }

        // Rewrites legacy plaintext secrets in encrypted form as well
        let needs_encrypt = !key.is_empty()
            && SENSITIVE_KEYS
                .iter()
                .any(|k| rows.get(*k).is_some_and(|v| !v.is_empty() && !secret::is_encrypted(v)));

        if dirty || needs_encrypt {
            let mut pairs = settings.to_rows(&key)?;
            pairs.retain(|(k, _)| !undecryptable.contains(k));
            pairs.push((SEEDED_MARKER.to_string(), "true".to_string()));
            pairs.push((PROXY_MIGRATION_MARKER.to_string(), "true".to_string()));
            store.save_settings(&pairs).await?;
        }

        Ok(Self {
            current: RwLock::new(Arc::new(settings)),
            write: tokio::sync::Mutex::new(()),
            undecryptable: Mutex::new(undecryptable.into_iter().collect()),
            store,
            key,
            pinned,
        })
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<SystemSettings> {
        self.current.read().clone()
    }

    /// Persist and publish a new snapshot. Sources pinned by the environment
    /// are left as they are.
    pub async fn publish(&self, next: SystemSettings) -> Result<()> {
        let _guard = self.write.lock().await;
        let previous = self.snapshot();
        self.commit(&previous, next).await
    }

    /// Apply `change` to a copy of the current snapshot, then persist and
    /// publish it. Concurrent writers queue behind each other.
    pub async fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut SystemSettings) -> Result<()>,
    {
        let _guard = self.write.lock().await;
        let previous = self.snapshot();
        let mut next = (*previous).clone();
        change(&mut next)?;
        self.commit(&previous, next).await
    }

    async fn commit(&self, previous: &SystemSettings, mut next: SystemSettings) -> Result<()> {
        for tag in self.pinned.keys() {
            if let Some(prev) = previous.sources.get(tag) {
                next.sources.insert(*tag, prev.clone());
            }
        }

        let rows = {
            let mut undecryptable = self.undecryptable.lock();
            if undecryptable.is_empty() {
                next.to_rows(&self.key)?
            } else {
                // Rows we could not read are only rewritten when the value changed
                let before: HashMap<String, String> = previous.plain_rows().into_iter().collect();
                let changed: HashSet<String> = next
                    .plain_rows()
                    .into_iter()
                    .filter(|(k, v)| before.get(k) != Some(v))
                    .map(|(k, _)| k)
                    .collect();
                undecryptable.retain(|k| !changed.contains(k));
                let mut rows = next.to_rows(&self.key)?;
                rows.retain(|(k, _)| !undecryptable.contains(k));
                rows
            }
        };

        self.store.save_settings(&rows).await?;
        *self.current.write() = Arc::new(next);
        Ok(())
    }

    /// Whether a source is pinned by the environment
    #[must_use]
    pub fn is_pinned(&self, tag: SourceTag) -> bool {
        self.pinned.contains_key(&tag)
    }

    /// Effective settings of a source (environment pin wins)
    #[must_use]
    pub fn source(&self, tag: SourceTag) -> SourceSettings {
        if let Some(pinned) = self.pinned.get(&tag) {
            return pinned.clone();
        }
        self.snapshot().sources.get(&tag).cloned().unwrap_or_default()
    }

    /// Replace a source's settings. Pinned sources answer `Conflict`.
    pub async fn update_source(&self, tag: SourceTag, mut update: SourceSettings) -> Result<()> {
        if self.is_pinned(tag) {
            return Err(Error::Conflict(format!(
                "{tag} is configured by environment variables"
            )));
        }
        self.update(|next| {
            if update.password == REDACTED {
                update.password = next.sources.get(&tag).map(|s| s.password.clone()).unwrap_or_default();
            }
            next.sources.insert(tag, update);
            Ok(())
        })
        .await
    }

    /// Record that the first administrator exists
    pub async fn mark_setup_complete(&self) -> Result<()> {
        if self.snapshot().setup_completed {
            return Ok(());
        }
        self.update(|next| {
            next.setup_completed = true;
            Ok(())
        })
        .await
    }
}

fn seed_from_mode(settings: &mut SystemSettings, mode: AuthMode) {
    match mode {
        AuthMode::Local => settings.local_auth_enabled = true,
        AuthMode::Ldap => {
            settings.local_auth_enabled = true;
            settings.ldap.enabled = true;
        }
        AuthMode::Oidc => {
            settings.local_auth_enabled = false;
            settings.oidc.enabled = true;
        }
        AuthMode::Proxy => {
            settings.local_auth_enabled = false;
            settings.proxy.enabled = true;
        }
        AuthMode::Hybrid => {
            settings.local_auth_enabled = true;
            settings.ldap.enabled = true;
            settings.oidc.enabled = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SecretKey {
        SecretKey::from_hex(&"11".repeat(32)).unwrap()
    }

    #[tokio::test]
    async fn sensitive_values_are_encrypted_at_rest() {
        let store = Store::in_memory().await.unwrap();
        let handle = SettingsHandle::load(store.clone(), key(), HashMap::new(), AuthMode::Local)
            .await
            .unwrap();

        let mut next = (*handle.snapshot()).clone();
        next.ldap.bind_password = "s3cr3t".into();
        next.ldap.url = "ldaps://dir.lan".into();
        handle.publish(next).await.unwrap();

        let rows = store.load_settings().await.unwrap();
        assert!(rows["ldap_bind_password"].starts_with("enc:"));
        assert_eq!(rows["ldap_url"], "ldaps://dir.lan");

        let reloaded = SettingsHandle::load(store, key(), HashMap::new(), AuthMode::Local)
            .await
            .unwrap();
        assert_eq!(reloaded.snapshot().ldap.bind_password, "s3cr3t");
    }

    #[tokio::test]
    async fn legacy_plaintext_secret_is_upgraded() {
        let store = Store::in_memory().await.unwrap();
        store.save_setting("oidc_client_secret", "plain").await.unwrap();
        let handle = SettingsHandle::load(store.clone(), key(), HashMap::new(), AuthMode::Local)
            .await
            .unwrap();

        assert_eq!(handle.snapshot().oidc.client_secret, "plain");
        assert!(store.load_settings().await.unwrap()["oidc_client_secret"].starts_with("enc:"));
    }

    #[tokio::test]
    async fn wrong_key_yields_empty_secret() {
        let store = Store::in_memory().await.unwrap();
        store
            .save_setting(
                "npm_password",
                &secret::encrypt(&key(), "pw").unwrap(),
            )
            .await
            .unwrap();
        let other = SecretKey::from_hex(&"22".repeat(32)).unwrap();
        let handle = SettingsHandle::load(store.clone(), other, HashMap::new(), AuthMode::Local)
            .await
            .unwrap();
        assert_eq!(handle.source(SourceTag::Npm).password, "");
        drop(handle);

        let reloaded = SettingsHandle::load(store, key(), HashMap::new(), AuthMode::Local)
            .await
            .unwrap();
        assert_eq!(reloaded.source(SourceTag::Npm).password, "pw");
    }

    #[tokio::test]
    async fn unreadable_secret_survives_later_writes() {
        let store = Store::in_memory().await.unwrap();
        let handle = SettingsHandle::load(store.clone(), key(), HashMap::new(), AuthMode::Local)
            .await
            .unwrap();
        let mut next = (*handle.snapshot()).clone();
        next.ldap.bind_password = "pw".into();
        handle.publish(next).await.unwrap();

        let other = SecretKey::from_hex(&"22".repeat(32)).unwrap();
        let rotated = SettingsHandle::load(store.clone(), other, HashMap::new(), AuthMode::Local)
            .await
            .unwrap();
        assert_eq!(rotated.snapshot().ldap.bind_password, "");
        rotated.mark_setup_complete().await.unwrap();
        rotated
            .update_source(
                SourceTag::Caddy,
                SourceSettings {
                    enabled: true,
                    url: "http://caddy.lan:2019".into(),
                    ..SourceSettings::default()
                },
            )
            .await
            .unwrap();

        let reloaded = SettingsHandle::load(store, key(), HashMap::new(), AuthMode::Local)
            .await
            .unwrap();
        assert_eq!(reloaded.snapshot().ldap.bind_password, "pw");
        assert!(reloaded.snapshot().setup_completed);
        assert!(reloaded.source(SourceTag::Caddy).enabled);
    }

    #[tokio::test]
    async fn unreadable_secret_is_written_once_replaced() {
        let store = Store::in_memory().await.unwrap();
        store
            .save_setting("ldap_bind_password", &secret::encrypt(&key(), "old").unwrap())
            .await
            .unwrap();
        let other = SecretKey::from_hex(&"22".repeat(32)).unwrap();
        let handle = SettingsHandle::load(store.clone(), other.clone(), HashMap::new(), AuthMode::Local)
            .await
            .unwrap();
        handle
            .update(|s| {
                s.ldap.bind_password = "new".into();
                Ok(())
            })
            .await
            .unwrap();

        let reloaded = SettingsHandle::load(store, other, HashMap::new(), AuthMode::Local)
            .await
            .unwrap();
        assert_eq!(reloaded.snapshot().ldap.bind_password, "new");
    }

    #[tokio::test]
    async fn concurrent_source_updates_are_both_kept() {
        let store = Store::in_memory().await.unwrap();
        let handle = SettingsHandle::load(store.clone(), key(), HashMap::new(), AuthMode::Local)
            .await
            .unwrap();
        let source = |url: &str| SourceSettings {
            enabled: true,
            url: url.into(),
            ..SourceSettings::default()
        };

        let (caddy, npm) = tokio::join!(
            handle.update_source(SourceTag::Caddy, source("http://caddy.lan:2019")),
            handle.update_source(SourceTag::Npm, source("http://npm.lan:81")),
        );
        caddy.unwrap();
        npm.unwrap();
        assert!(handle.source(SourceTag::Caddy).enabled);
        assert!(handle.source(SourceTag::Npm).enabled);

        let reloaded = SettingsHandle::load(store, key(), HashMap::new(), AuthMode::Local)
            .await
            .unwrap();
        assert_eq!(reloaded.source(SourceTag::Caddy).url, "http://caddy.lan:2019");
        assert_eq!(reloaded.source(SourceTag::Npm).url, "http://npm.lan:81");
    }

    #[tokio::test]
    async fn failed_change_publishes_nothing() {
        let store = Store::in_memory().await.unwrap();
        let handle = SettingsHandle::load(store, key(), HashMap::new(), AuthMode::Local)
            .await
            .unwrap();
        let err = handle
            .update(|s| {
                s.admin_groups.clear();
                Err(Error::Config("rejected".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(handle.snapshot().admin_groups, vec!["admin".to_string()]);
    }

    #[tokio::test]
    async fn auth_mode_seeds_only_once() {
        let store = Store::in_memory().await.unwrap();
        let first = SettingsHandle::load(store.clone(), key(), HashMap::new(), AuthMode::Oidc)
            .await
            .unwrap();
        assert!(first.snapshot().oidc.enabled);
        assert!(!first.snapshot().local_auth_enabled);

        let second = SettingsHandle::load(store, key(), HashMap::new(), AuthMode::Local)
            .await
            .unwrap();
        assert!(second.snapshot().oidc.enabled);
    }

    #[tokio::test]
    async fn trusted_proxy_migration_runs_once() {
        let store = Store::in_memory().await.unwrap();
        let handle = SettingsHandle::load(store.clone(), key(), HashMap::new(), AuthMode::Proxy)
            .await
            .unwrap();
        assert_eq!(handle.snapshot().proxy.trusted_proxies.len(), 3);

        let mut next = (*handle.snapshot()).clone();
        next.proxy.trusted_proxies.clear();
        handle.publish(next).await.unwrap();

        let reloaded = SettingsHandle::load(store, key(), HashMap::new(), AuthMode::Proxy)
            .await
            .unwrap();
        assert!(reloaded.snapshot().proxy.trusted_proxies.is_empty());
    }

    #[tokio::test]
    async fn pinned_source_rejects_updates() {
        let store = Store::in_memory().await.unwrap();
        let pinned = HashMap::from([(
            SourceTag::Traefik,
            SourceSettings {
                enabled: true,
                url: "http://traefik.lan:8080".into(),
                ..SourceSettings::default()
            },
        )]);
        let handle = SettingsHandle::load(store, key(), pinned, AuthMode::Local)
            .await
            .unwrap();

        let err = handle
            .update_source(SourceTag::Traefik, SourceSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(handle.source(SourceTag::Traefik).url, "http://traefik.lan:8080");

        handle
            .update_source(
                SourceTag::Caddy,
                SourceSettings {
                    enabled: true,
                    url: "http://caddy.lan:2019".into(),
                    ..SourceSettings::default()
                },
            )
            .await
            .unwrap();
        assert!(handle.source(SourceTag::Caddy).enabled);
    }

    #[test]
    fn login_redirect_is_a_function_of_providers() {
        let mut s = SystemSettings::default();
        assert_eq!(s.login_redirect(), Some("/login"));

        s.local_auth_enabled = false;
        s.oidc = OidcSettings {
            enabled: true,
            issuer: "https://id.lan".into(),
            client_id: "dashgate".into(),
            ..OidcSettings::default()
        };
        assert_eq!(s.login_redirect(), Some("/auth/oidc"));

        s.oidc.enabled = false;
        s.proxy.enabled = true;
        assert_eq!(s.login_redirect(), None);
    }

    #[test]
    fn admin_membership_is_case_insensitive() {
        let s = SystemSettings {
            admin_groups: vec!["Admins".into(), "ops".into()],
            ..SystemSettings::default()
        };
        assert!(s.is_admin_groups(&["admins".into()]));
        assert!(s.is_admin_groups(&["family".into(), "OPS".into()]));
        assert!(!s.is_admin_groups(&["family".into()]));
        assert!(!s.is_admin_groups(&[]));
    }

    #[test]
    fn redaction_round_trip_keeps_secrets() {
        let mut s = SystemSettings::default();
        s.ldap.bind_password = "pw".into();
        let mut edited = s.redacted();
        assert_eq!(edited.ldap.bind_password, REDACTED);
        assert_eq!(edited.oidc.client_secret, "");

        edited.keep_redacted_secrets(&s);
        assert_eq!(edited.ldap.bind_password, "pw");
    }
}
