//! Docker Engine API source
//!
//! Containers opt in with `dashgate.enable=true`; the remaining
//! `dashgate.*` labels describe the entry.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::http::{Auth, SourceClient, join};
use super::{DiscoveredApp, RouteSource, SourceTag};
use crate::Result;
use crate::settings::SourceSettings;

const LABEL_PREFIX: &str = "dashgate.";

/// Container row of `/containers/json`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    /// Container names, each with a leading `/`
    #[serde(default)]
    pub names: Vec<String>,
    /// Container labels
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Where the Docker API lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix socket path
    Socket(String),
    /// HTTP(S) base URL
    Http(String),
}

impl Endpoint {
    /// Interpret a configured location: `unix://` and bare paths are
    /// sockets, `tcp://` becomes `http://`.
    #[must_use]
    pub fn parse(location: &str) -> Self {
        let location = location.trim();
        if let Some(path) = location.strip_prefix("unix://") {
            Self::Socket(path.to_string())
        } else if location.starts_with('/') {
            Self::Socket(location.to_string())
        } else if let Some(rest) = location.strip_prefix("tcp://") {
            Self::Http(format!("http://{rest}"))
        } else {
            Self::Http(location.to_string())
        }
    }
}

/// Lists labelled containers from the Docker daemon
pub struct DockerSource {
    client: SourceClient,
}

impl DockerSource {
    /// New source using the shared client for TCP endpoints
    #[must_use]
    pub fn new(client: SourceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RouteSource for DockerSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Docker
    }

    async fn poll(&self, settings: &SourceSettings) -> Result<Vec<DiscoveredApp>> {
        let containers: Vec<Container> = match Endpoint::parse(&settings.url) {
            Endpoint::Socket(path) => {
                let body = socket::get(&path, "/containers/json", self.client.max_bytes()).await?;
                serde_json::from_slice(&body)?
            }
            Endpoint::Http(base) => {
                let url = join(&base, "/containers/json");
                self.client
                    .get_json(&url, Auth::Basic(&settings.username, &settings.password))
                    .await?
            }
        };
        debug!(count = containers.len(), "Docker containers listed");
        Ok(parse_containers(&containers))
    }
}

fn split_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Map opted-in containers to apps. Containers without a `dashgate.url`
/// label are skipped.
#[must_use]
pub fn parse_containers(containers: &[Container]) -> Vec<DiscoveredApp> {
    let mut apps = Vec::new();
    for container in containers {
        let label = |key: &str| container.labels.get(&format!("{LABEL_PREFIX}{key}"));
        if !label("enable").is_some_and(|v| v.trim().eq_ignore_ascii_case("true")) {
            continue;
        }
        let Some(url) = label("url").map(|u| u.trim()).filter(|u| !u.is_empty()) else {
            debug!(names = ?container.names, "Opted-in container has no dashgate.url label");
            continue;
        };
        let name = label("name")
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .or_else(|| container.names.first().map(|n| n.trim_start_matches('/').to_string()))
            .unwrap_or_else(|| url.to_string());

        apps.push(DiscoveredApp {
            name,
            url: url.to_string(),
            icon: label("icon").cloned().unwrap_or_default(),
            description: label("description").cloned().unwrap_or_default(),
            groups: split_list(label("groups")),
            depends_on: split_list(label("depends_on")),
        });
    }
    apps
}

#[cfg(unix)]
mod socket {
    use bytes::Bytes;
    use http_body_util::{BodyExt, Empty, Limited};
    use hyper::Request;
    use hyper::header::HOST;
    use hyper_util::rt::TokioIo;
    use tokio::net::UnixStream;
    use tracing::debug;

    use crate::{Error, Result};

    /// One HTTP/1.1 GET over the daemon socket, body capped at `max` bytes
    pub async fn get(path: &str, uri: &str, max: usize) -> Result<Bytes> {
        let stream = UnixStream::connect(path).await?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::Internal(format!("Docker socket handshake failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Docker socket connection closed");
            }
        });

        let request = Request::builder()
            .uri(uri)
            .header(HOST, "docker")
            .body(Empty::<Bytes>::new())
            .map_err(|e| Error::Internal(format!("Bad Docker request: {e}")))?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::Internal(format!("Docker request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Internal(format!("Docker answered HTTP {status}")));
        }

        let body = Limited::new(response.into_body(), max)
            .collect()
            .await
            .map_err(|e| Error::Internal(format!("Docker response rejected: {e}")))?;
        Ok(body.to_bytes())
    }
}

#[cfg(not(unix))]
mod socket {
    use bytes::Bytes;

    use crate::{Error, Result};

    pub async fn get(_path: &str, _uri: &str, _max: usize) -> Result<Bytes> {
        Err(Error::Config("Docker sockets are only supported on Unix".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(names: &[&str], labels: &[(&str, &str)]) -> Container {
        Container {
            names: names.iter().map(|n| (*n).to_string()).collect(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    #[test]
    fn endpoints_parse() {
        assert_eq!(
            Endpoint::parse("unix:///var/run/docker.sock"),
            Endpoint::Socket("/var/run/docker.sock".into())
        );
        assert_eq!(Endpoint::parse("/run/docker.sock"), Endpoint::Socket("/run/docker.sock".into()));
        assert_eq!(
            Endpoint::parse("tcp://socket-proxy:2375"),
            Endpoint::Http("http://socket-proxy:2375".into())
        );
        assert_eq!(
            Endpoint::parse("https://docker.lan"),
            Endpoint::Http("https://docker.lan".into())
        );
    }

    #[test]
    fn only_opted_in_containers_with_urls() {
        let containers = vec![
            container(
                &["/grafana"],
                &[
                    ("dashgate.enable", "true"),
                    ("dashgate.url", "https://grafana.lan"),
                    ("dashgate.groups", "ops, admin,,"),
                    ("dashgate.depends_on", "prometheus"),
                    ("dashgate.icon", "grafana.svg"),
                ],
            ),
            container(&["/db"], &[("dashgate.url", "https://db.lan")]),
            container(&["/nourl"], &[("dashgate.enable", "true")]),
            container(
                &["/wiki"],
                &[
                    ("dashgate.enable", "TRUE"),
                    ("dashgate.name", "Wiki"),
                    ("dashgate.url", "https://wiki.lan"),
                ],
            ),
        ];

        let apps = parse_containers(&containers);
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].name, "grafana");
        assert_eq!(apps[0].groups, vec!["ops", "admin"]);
        assert_eq!(apps[0].depends_on, vec!["prometheus"]);
        assert_eq!(apps[0].icon, "grafana.svg");
        assert_eq!(apps[1].name, "Wiki");
        assert!(apps[1].groups.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_socket_is_an_error() {
        assert!(socket::get("/nonexistent/docker.sock", "/containers/json", 1024).await.is_err());
    }
}
