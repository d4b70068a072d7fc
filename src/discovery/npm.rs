//! Nginx Proxy Manager API source

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::http::{Auth, SourceClient, join};
use super::{DiscoveredApp, RouteSource, SourceTag};
use crate::Result;
use crate::settings::SourceSettings;

/// Tokens are refreshed this many seconds before they expire
const REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// Assumed lifetime when NPM answers with an unreadable expiry
const FALLBACK_LIFETIME_SECS: i64 = 60 * 60;

#[derive(Serialize)]
struct TokenRequest<'a> {
    identity: &'a str,
    secret: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(default)]
    expires: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
    // Credentials the token was minted for
    identity: String,
    url: String,
}

/// Proxy host row of `/api/nginx/proxy-hosts`
#[derive(Debug, Deserialize)]
pub struct ProxyHost {
    /// Domains served by the host
    #[serde(default)]
    pub domain_names: Vec<String>,
    /// Enabled flag (bool or 0/1 depending on NPM version)
    #[serde(default)]
    pub enabled: Value,
    /// Certificate id, 0 when plain HTTP
    #[serde(default)]
    pub certificate_id: Value,
    /// Runtime metadata (`nginx_online`)
    #[serde(default)]
    pub meta: Value,
}

/// Polls NPM proxy hosts with a cached API token
pub struct NpmSource {
    client: SourceClient,
    token: RwLock<Option<CachedToken>>,
}

impl NpmSource {
    /// New source using the shared client
    #[must_use]
    pub fn new(client: SourceClient) -> Self {
        Self {
            client,
            token: RwLock::new(None),
        }
    }

    /// Current token, logging in again when it is missing, near expiry or
    /// was minted for other credentials. The write lock is held across the
    /// check and the refresh so concurrent callers log in once.
    async fn token(&self, settings: &SourceSettings) -> Result<String> {
        let mut cached = self.token.write().await;
        if let Some(current) = cached.as_ref() {
            let fresh = current.expires_at - Utc::now() > TimeDelta::seconds(REFRESH_MARGIN_SECS);
            if fresh && current.identity == settings.username && current.url == settings.url {
                return Ok(current.token.clone());
            }
        }

        debug!("Requesting NPM token");
        let url = join(&settings.url, "/api/tokens");
        let body = TokenRequest {
            identity: &settings.username,
            secret: &settings.password,
        };
        let response: TokenResponse = match self.client.post_json(&url, &body).await {
            Ok(r) => r,
            Err(e) => {
                *cached = None;
                return Err(e);
            }
        };

        let expires_at = response
            .expires
            .as_deref()
            .and_then(|e| DateTime::parse_from_rfc3339(e).ok())
            .map(|e| e.with_timezone(&Utc))
            .unwrap_or_else(|| Utc::now() + TimeDelta::seconds(FALLBACK_LIFETIME_SECS));

        let token = response.token.clone();
        *cached = Some(CachedToken {
            token: response.token,
            expires_at,
            identity: settings.username.clone(),
            url: settings.url.clone(),
        });
        Ok(token)
    }

    async fn forget_token(&self) {
        *self.token.write().await = None;
    }
}

#[async_trait]
impl RouteSource for NpmSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Npm
    }

    async fn poll(&self, settings: &SourceSettings) -> Result<Vec<DiscoveredApp>> {
        let token = self.token(settings).await?;
        let url = join(&settings.url, "/api/nginx/proxy-hosts");
        match self
            .client
            .get_json::<Vec<ProxyHost>>(&url, Auth::Bearer(&token))
            .await
        {
            Ok(hosts) => Ok(parse_hosts(&hosts)),
            Err(e) => {
                // A rejected token is re-minted on the next tick
                self.forget_token().await;
                Err(e)
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        Value::String(s) => !s.is_empty() && s != "0",
        _ => false,
    }
}

/// Map enabled proxy hosts to apps using their first domain
#[must_use]
pub fn parse_hosts(hosts: &[ProxyHost]) -> Vec<DiscoveredApp> {
    let mut apps = Vec::new();
    for host in hosts {
        if !truthy(&host.enabled) {
            continue;
        }
        let Some(domain) = host.domain_names.first().filter(|d| !d.is_empty()) else {
            continue;
        };
        if host.meta.get("nginx_online").is_some_and(|v| !truthy(v)) {
            debug!(domain, "NPM reports host offline");
        }
        let scheme = if truthy(&host.certificate_id) { "https" } else { "http" };
        apps.push(DiscoveredApp::new(domain.clone(), format!("{scheme}://{domain}")));
    }
    apps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_disabled_hosts_and_picks_first_domain() {
        let hosts: Vec<ProxyHost> = serde_json::from_str(
            r#"[
                {"domain_names": ["jellyfin.lan", "tv.lan"], "enabled": 1, "certificate_id": 3,
                 "meta": {"nginx_online": true}},
                {"domain_names": ["old.lan"], "enabled": 0, "certificate_id": 0},
                {"domain_names": ["paperless.lan"], "enabled": true, "certificate_id": 0,
                 "meta": {"nginx_online": false}},
                {"domain_names": [], "enabled": true}
            ]"#,
        )
        .unwrap();

        assert_eq!(
            parse_hosts(&hosts),
            vec![
                DiscoveredApp::new("jellyfin.lan", "https://jellyfin.lan"),
                DiscoveredApp::new("paperless.lan", "http://paperless.lan"),
            ]
        );
    }

    #[test]
    fn truthiness_covers_npm_encodings() {
        assert!(truthy(&Value::from(1)));
        assert!(truthy(&Value::from(true)));
        assert!(truthy(&Value::from("new")));
        assert!(!truthy(&Value::from(0)));
        assert!(!truthy(&Value::Null));
    }
}
