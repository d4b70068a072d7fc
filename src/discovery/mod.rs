//! Route discovery
//!
//! Five sources (Docker, Traefik, nginx, Nginx Proxy Manager, Caddy) are
//! polled by independent, cancellable workers. Each worker keeps the latest
//! snapshot in memory; the dashboard merges those snapshots with the
//! per-URL overrides an administrator saved.
//!
//! Nothing discovered is shown to non-admins until it has an override row.

pub mod caddy;
pub mod docker;
pub mod http;
pub mod nginx;
pub mod npm;
pub mod traefik;
mod worker;

pub use worker::SourceWorker;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::apps::{AppEntry, Category};
use crate::config::DiscoveryConfig;
use crate::settings::{SettingsHandle, SourceSettings};
use crate::store::{DiscoveredOverride, Store};
use crate::{Error, Result};

/// Category used for opted-in entries whose override names none
pub const DEFAULT_CATEGORY: &str = "Discovered";

/// Provenance of a discovered entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    /// Docker Engine API
    Docker,
    /// Traefik API
    Traefik,
    /// nginx configuration directory
    Nginx,
    /// Nginx Proxy Manager API
    Npm,
    /// Caddy admin API
    Caddy,
}

impl SourceTag {
    /// Every source, in poll-start order
    pub const ALL: [Self; 5] = [Self::Docker, Self::Traefik, Self::Nginx, Self::Npm, Self::Caddy];

    /// Lowercase tag
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Traefik => "traefik",
            Self::Nginx => "nginx",
            Self::Npm => "npm",
            Self::Caddy => "caddy",
        }
    }

    /// Prefix of the environment variables that pin this source
    #[must_use]
    pub fn env_prefix(self) -> &'static str {
        match self {
            Self::Docker => "DOCKER",
            Self::Traefik => "TRAEFIK",
            Self::Nginx => "NGINX",
            Self::Npm => "NPM",
            Self::Caddy => "CADDY",
        }
    }

    /// Location used when a pinned source names none
    #[must_use]
    pub fn default_url(self) -> &'static str {
        match self {
            Self::Docker => "unix:///var/run/docker.sock",
            Self::Traefik => "http://traefik:8080",
            Self::Nginx => "/etc/nginx/conf.d",
            Self::Npm => "http://npm:81",
            Self::Caddy => "http://caddy:2019",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::NotFound(format!("discovery source {s}")))
    }
}

impl SourceTag {
    /// Check a configured location before it is saved: nginx takes an
    /// absolute directory, docker a socket path or HTTP(S) URL, the rest an
    /// HTTP(S) URL with a host.
    pub fn validate_location(self, location: &str) -> Result<()> {
        let location = location.trim();
        match self {
            Self::Nginx => {
                if !Path::new(location).is_absolute() {
                    return Err(Error::Config(format!(
                        "nginx needs an absolute config directory, got {location:?}"
                    )));
                }
                Ok(())
            }
            Self::Docker => match docker::Endpoint::parse(location) {
                docker::Endpoint::Socket(path) if Path::new(&path).is_absolute() => Ok(()),
                docker::Endpoint::Socket(path) => Err(Error::Config(format!(
                    "docker socket path must be absolute, got {path:?}"
                ))),
                docker::Endpoint::Http(url) => http_location(self, &url),
            },
            Self::Traefik | Self::Npm | Self::Caddy => http_location(self, location),
        }
    }
}

fn http_location(tag: SourceTag, location: &str) -> Result<()> {
    let url = Url::parse(location).map_err(|e| Error::Config(format!("invalid {tag} URL {location:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Config(format!("{tag} URL must use http or https")));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::Config(format!("{tag} URL has no host")));
    }
    Ok(())
}

/// One application found by a source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredApp {
    /// Display name
    pub name: String,
    /// Link target
    pub url: String,
    /// Icon name or URL
    pub icon: String,
    /// Short description
    pub description: String,
    /// Groups asserted by labels (docker only)
    pub groups: Vec<String>,
    /// Dependencies asserted by labels (docker only)
    pub depends_on: Vec<String>,
}

impl DiscoveredApp {
    /// Entry with a name and URL only
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ..Self::default()
        }
    }
}

/// A discovered app with its provenance and saved override
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredEntry {
    /// The app as the source reported it
    #[serde(flatten)]
    pub app: DiscoveredApp,
    /// Which source reported it
    pub source: SourceTag,
    /// Admin override, if one exists
    #[serde(rename = "override")]
    pub override_row: Option<DiscoveredOverride>,
}

/// A pollable origin of routes
#[async_trait]
pub trait RouteSource: Send + Sync {
    /// Provenance tag
    fn tag(&self) -> SourceTag;

    /// Fetch the current routes
    async fn poll(&self, settings: &SourceSettings) -> Result<Vec<DiscoveredApp>>;
}

/// Owns every source worker
pub struct DiscoveryManager {
    workers: HashMap<SourceTag, Arc<SourceWorker>>,
    settings: Arc<SettingsHandle>,
    store: Store,
    root: CancellationToken,
}

impl DiscoveryManager {
    /// Manager over the five built-in sources
    pub fn new(
        config: &DiscoveryConfig,
        settings: Arc<SettingsHandle>,
        store: Store,
        root: CancellationToken,
    ) -> Result<Self> {
        let client = http::SourceClient::new(config)?;
        let sources: Vec<Arc<dyn RouteSource>> = vec![
            Arc::new(docker::DockerSource::new(client.clone())),
            Arc::new(traefik::TraefikSource::new(client.clone())),
            Arc::new(nginx::NginxSource::new()),
            Arc::new(npm::NpmSource::new(client.clone())),
            Arc::new(caddy::CaddySource::new(client)),
        ];
        Ok(Self::with_sources(sources, config, settings, store, root))
    }

    /// Manager over arbitrary sources
    #[must_use]
    pub fn with_sources(
        sources: Vec<Arc<dyn RouteSource>>,
        config: &DiscoveryConfig,
        settings: Arc<SettingsHandle>,
        store: Store,
        root: CancellationToken,
    ) -> Self {
        let workers = sources
            .into_iter()
            .map(|source| {
                let tag = source.tag();
                let worker = SourceWorker::new(source, Arc::clone(&settings), config.poll_interval);
                (tag, Arc::new(worker))
            })
            .collect();
        Self {
            workers,
            settings,
            store,
            root,
        }
    }

    /// Start enabled sources and stop disabled ones
    pub async fn sync(&self) {
        for (tag, worker) in &self.workers {
            if self.settings.source(*tag).enabled {
                worker.start(&self.root).await;
            } else {
                worker.stop().await;
            }
        }
    }

    /// Restart one source so new settings take effect
    pub async fn restart(&self, tag: SourceTag) {
        let Some(worker) = self.workers.get(&tag) else {
            return;
        };
        worker.stop().await;
        if self.settings.source(tag).enabled {
            worker.start(&self.root).await;
        }
    }

    /// Worker for a source
    #[must_use]
    pub fn worker(&self, tag: SourceTag) -> Option<&Arc<SourceWorker>> {
        self.workers.get(&tag)
    }

    /// Snapshots of every running source, each entry paired with its override
    pub async fn discovered(&self) -> Result<Vec<DiscoveredEntry>> {
        let overrides: HashMap<String, DiscoveredOverride> = self
            .store
            .list_overrides()
            .await?
            .into_iter()
            .map(|o| (o.url.clone(), o))
            .collect();

        let mut tags: Vec<_> = self.workers.keys().copied().collect();
        tags.sort();

        let mut entries = Vec::new();
        for tag in tags {
            let worker = &self.workers[&tag];
            if !worker.is_running().await {
                continue;
            }
            for app in worker.snapshot().iter() {
                entries.push(DiscoveredEntry {
                    app: app.clone(),
                    source: tag,
                    override_row: overrides.get(&app.url).cloned(),
                });
            }
        }
        Ok(entries)
    }

    /// Link targets of every discovered entry after overrides, as the
    /// dashboard shows them (for the health probe)
    pub async fn urls(&self) -> Result<Vec<String>> {
        Ok(merge(&self.discovered().await?)
            .into_iter()
            .flat_map(|c| c.apps)
            .map(|app| app.url)
            .collect())
    }

    /// Stop every worker
    pub async fn shutdown(&self) {
        for worker in self.workers.values() {
            worker.stop().await;
        }
        info!("Discovery stopped");
    }
}

/// Apply overrides and group discovered entries into categories.
///
/// Hidden overrides keep the entry for admins only, flagged as hidden.
/// Entries without an override get an empty allow-list, which the
/// authorization filter treats as admin-only.
/// Non-empty override fields replace discovered ones; override groups win
/// over label groups.
#[must_use]
pub fn merge(entries: &[DiscoveredEntry]) -> Vec<Category> {
    let mut categories: Vec<Category> = Vec::new();

    for entry in entries {
        let (app, category) = match &entry.override_row {
            Some(o) => {
                let pick = |value: Option<&String>, fallback: &str| {
                    value
                        .map(|v| v.trim())
                        .filter(|v| !v.is_empty())
                        .unwrap_or(fallback)
                        .to_string()
                };
                let app = AppEntry {
                    name: pick(o.name.as_ref(), &entry.app.name),
                    url: pick(o.new_url.as_ref(), &entry.app.url),
                    icon: pick(o.icon.as_ref(), &entry.app.icon),
                    description: pick(o.description.as_ref(), &entry.app.description),
                    groups: if o.groups.is_empty() {
                        entry.app.groups.clone()
                    } else {
                        o.groups.clone()
                    },
                    depends_on: entry.app.depends_on.clone(),
                    source: Some(entry.source),
                    hidden: o.hidden,
                };
                (app, pick(o.category.as_ref(), DEFAULT_CATEGORY))
            }
            None => (
                AppEntry {
                    name: entry.app.name.clone(),
                    url: entry.app.url.clone(),
                    icon: entry.app.icon.clone(),
                    description: entry.app.description.clone(),
                    groups: Vec::new(),
                    depends_on: entry.app.depends_on.clone(),
                    source: Some(entry.source),
                    hidden: false,
                },
                DEFAULT_CATEGORY.to_string(),
            ),
        };

        match categories.iter_mut().find(|c| c.name == category) {
            Some(existing) => existing.apps.push(app),
            None => categories.push(Category {
                name: category,
                apps: vec![app],
            }),
        }
    }

    categories
}
