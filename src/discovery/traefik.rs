//! Traefik API source

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use super::http::{Auth, SourceClient, join};
use super::{DiscoveredApp, RouteSource, SourceTag};
use crate::Result;
use crate::settings::SourceSettings;

static HOST_RULE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"Host\(`([^`]+)`\)").unwrap()
});

/// Router entry of `/api/http/routers`
#[derive(Debug, Deserialize)]
pub struct Router {
    /// Router name (`name@provider`)
    pub name: String,
    /// Matching rule
    #[serde(default)]
    pub rule: String,
    /// TLS block present
    #[serde(default)]
    pub tls: Option<serde_json::Value>,
    /// Entry points
    #[serde(default, rename = "entryPoints")]
    pub entry_points: Vec<String>,
}

/// Polls Traefik's HTTP routers
pub struct TraefikSource {
    client: SourceClient,
}

impl TraefikSource {
    /// New source using the shared client
    #[must_use]
    pub fn new(client: SourceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RouteSource for TraefikSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Traefik
    }

    async fn poll(&self, settings: &SourceSettings) -> Result<Vec<DiscoveredApp>> {
        let url = join(&settings.url, "/api/http/routers");
        let routers: Vec<Router> = self
            .client
            .get_json(&url, Auth::Basic(&settings.username, &settings.password))
            .await?;
        Ok(parse_routers(&routers))
    }
}

/// Map routers to apps: internal routers are skipped, the first `Host(...)`
/// of the rule becomes the URL.
#[must_use]
pub fn parse_routers(routers: &[Router]) -> Vec<DiscoveredApp> {
    let mut apps: Vec<DiscoveredApp> = Vec::new();
    for router in routers {
        if router.name.starts_with("api@") || router.name.starts_with("dashboard@") {
            continue;
        }
        let Some(host) = HOST_RULE
            .captures(&router.rule)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
        else {
            continue;
        };

        let secure = router.tls.is_some()
            || router
                .entry_points
                .iter()
                .any(|e| e.contains("secure") || e.contains("443"));
        let scheme = if secure { "https" } else { "http" };
        let url = format!("{scheme}://{host}");
        if apps.iter().any(|a| a.url == url) {
            continue;
        }

        let name = router.name.split('@').next().unwrap_or(&router.name);
        apps.push(DiscoveredApp::new(name, url));
    }
    apps
}
