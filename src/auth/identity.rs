//! Request identity resolution
//!
//! Strategies run in a fixed order and the first one that recognises the
//! request wins:
//!
//! | Order | Strategy | Credential |
//! |-------|----------|------------|
//! | 1 | [`ApiKeyIdentifier`] | `X-API-Key`, `Authorization: Bearer`/`ApiKey` |
//! | 2 | [`ProxyIdentifier`] | `Remote-*` headers from a trusted peer |
//! | 3 | [`SessionIdentifier`] | `dashgate_session` cookie |

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use ipnetwork::IpNetwork;
use tracing::{debug, warn};

use super::session::{SESSION_COOKIE, SessionManager, cookie_values};
use super::{AuthSource, AuthUser};
use crate::Result;
use crate::crypto::password::verify_secret;
use crate::crypto::token::{API_KEY_PREFIX_LEN, api_key_prefix};
use crate::settings::SettingsHandle;
use crate::store::{ApiKey, Store, now_secs};

/// Hash comparisons allowed per presented API key
pub const MAX_KEY_COMPARISONS: usize = 3;

/// What a strategy may look at
#[derive(Debug, Clone)]
pub struct RequestIdentity {
    /// Request headers
    pub headers: HeaderMap,
    /// Transport peer address
    pub peer: Option<IpAddr>,
}

impl RequestIdentity {
    /// Identity input for one request
    #[must_use]
    pub fn new(headers: HeaderMap, peer: Option<IpAddr>) -> Self {
        Self { headers, peer }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// One identification strategy
#[async_trait]
pub trait Identifier: Send + Sync {
    /// The identity this strategy finds in the request, if any
    async fn identify(&self, request: &RequestIdentity) -> Option<AuthUser>;
}

/// API key from `X-API-Key` or an `Authorization: Bearer|ApiKey` header
#[must_use]
pub fn presented_api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.trim());
    }
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, value) = auth.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") || scheme.eq_ignore_ascii_case("apikey") {
        Some(value.trim())
    } else {
        None
    }
}

/// Outcome of an API-key lookup
#[derive(Debug, Default)]
pub struct KeyLookup {
    /// Row that verified
    pub matched: Option<ApiKey>,
    /// Hash comparisons performed
    pub comparisons: usize,
    /// Lookup stopped at the comparison cap
    pub capped: bool,
}

/// Authenticates API keys by prefix lookup and Argon2 verification
pub struct ApiKeyIdentifier {
    store: Store,
}

impl ApiKeyIdentifier {
    /// Strategy over the key table
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Verify `key` against the rows sharing its prefix. Expired rows are
    /// skipped without counting; at most [`MAX_KEY_COMPARISONS`] rows are
    /// verified. `last_used_at` is written only after the row list has been
    /// fully read.
    pub async fn lookup(&self, key: &str) -> Result<KeyLookup> {
        let Some(prefix) = api_key_prefix(key) else {
            return Ok(KeyLookup::default());
        };
        let rows = self.store.list_api_keys_by_prefix(prefix).await?;
        let now = now_secs();
        let mut lookup = KeyLookup::default();

        for row in rows {
            if row.is_expired(now) {
                continue;
            }
            if lookup.comparisons == MAX_KEY_COMPARISONS {
                warn!(prefix, "Too many API keys share a prefix; refusing further comparisons");
                lookup.capped = true;
                break;
            }
            lookup.comparisons += 1;

            let candidate = key.to_string();
            let hash = row.key_hash.clone();
            let ok = tokio::task::spawn_blocking(move || verify_secret(&candidate, &hash))
                .await
                .unwrap_or(false);
            if ok {
                lookup.matched = Some(row);
                break;
            }
        }

        if let Some(row) = &lookup.matched {
            if let Err(e) = self.store.touch_api_key(row.id, now).await {
                debug!(error = %e, key_id = row.id, "Failed to record API key use");
            }
        }
        Ok(lookup)
    }
}

#[async_trait]
impl Identifier for ApiKeyIdentifier {
    async fn identify(&self, request: &RequestIdentity) -> Option<AuthUser> {
        let key = presented_api_key(&request.headers)?;
        if key.len() < API_KEY_PREFIX_LEN {
            return None;
        }
        let lookup = match self.lookup(key).await {
            Ok(lookup) => lookup,
            Err(e) => {
                warn!(error = %e, "API key lookup failed");
                return None;
            }
        };
        let row = lookup.matched?;
        Some(AuthUser {
            username: row.username.clone(),
            display_name: if row.name.is_empty() { row.username } else { row.name },
            email: None,
            groups: row.groups,
            source: AuthSource::ApiKey,
            user_id: None,
            permissions: row.permissions,
        })
    }
}

/// Trusts `Remote-*` headers from configured proxy addresses
pub struct ProxyIdentifier {
    settings: Arc<SettingsHandle>,
    warned: AtomicBool,
}

impl ProxyIdentifier {
    /// Strategy reading the proxy settings on every request
    #[must_use]
    pub fn new(settings: Arc<SettingsHandle>) -> Self {
        Self {
            settings,
            warned: AtomicBool::new(false),
        }
    }
}

/// Whether `peer` is one of `trusted` (addresses or CIDRs). IPv4-mapped
/// IPv6 peers are compared as IPv4.
#[must_use]
pub fn is_trusted_peer(peer: IpAddr, trusted: &[String]) -> bool {
    let peer = peer.to_canonical();
    trusted.iter().any(|entry| match IpNetwork::from_str(entry.trim()) {
        Ok(net) => net.contains(peer),
        Err(_) => {
            debug!(entry, "Ignoring unparseable trusted proxy entry");
            false
        }
    })
}

fn split_groups(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Identifier for ProxyIdentifier {
    async fn identify(&self, request: &RequestIdentity) -> Option<AuthUser> {
        let settings = self.settings.snapshot();
        if !settings.proxy.enabled {
            return None;
        }
        if settings.proxy.trusted_proxies.is_empty() {
            if !self.warned.swap(true, Ordering::Relaxed) {
                warn!("Proxy auth is enabled but no trusted proxies are configured; ignoring Remote-User");
            }
            return None;
        }

        let username = request.header("remote-user")?;
        let peer = request.peer?;
        if !is_trusted_peer(peer, &settings.proxy.trusted_proxies) {
            debug!(%peer, "Remote-User from untrusted peer ignored");
            return None;
        }

        Some(AuthUser {
            username: username.to_string(),
            display_name: request.header("remote-name").unwrap_or(username).to_string(),
            email: request.header("remote-email").map(ToString::to_string),
            groups: split_groups(request.header("remote-groups")),
            source: AuthSource::Proxy,
            user_id: None,
            permissions: Vec::new(),
        })
    }
}

/// Resolves the session cookie
pub struct SessionIdentifier {
    sessions: Arc<SessionManager>,
}

impl SessionIdentifier {
    /// Strategy over the session manager
    #[must_use]
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Identifier for SessionIdentifier {
    async fn identify(&self, request: &RequestIdentity) -> Option<AuthUser> {
        for token in cookie_values(&request.headers, SESSION_COOKIE) {
            match self.sessions.validate(token).await {
                Ok(Some(found)) => return Some(AuthUser::from_user(&found.user)),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Session lookup failed");
                    return None;
                }
            }
        }
        None
    }
}

/// Ordered chain of strategies
pub struct Resolver {
    identifiers: Vec<Arc<dyn Identifier>>,
}

impl Resolver {
    /// Chain over arbitrary strategies
    #[must_use]
    pub fn new(identifiers: Vec<Arc<dyn Identifier>>) -> Self {
        Self { identifiers }
    }

    /// API key, then trusted proxy, then session cookie
    #[must_use]
    pub fn standard(store: Store, settings: Arc<SettingsHandle>, sessions: Arc<SessionManager>) -> Self {
        Self::new(vec![
            Arc::new(ApiKeyIdentifier::new(store)),
            Arc::new(ProxyIdentifier::new(settings)),
            Arc::new(SessionIdentifier::new(sessions)),
        ])
    }

    /// First identity any strategy finds
    pub async fn resolve(&self, request: &RequestIdentity) -> Option<AuthUser> {
        for identifier in &self.identifiers {
            if let Some(user) = identifier.identify(request).await {
                return Some(user);
            }
        }
        None
    }
}
