//! Caddy admin API source

use async_trait::async_trait;
use serde_json::Value;

use super::http::{Auth, SourceClient, join};
use super::{DiscoveredApp, RouteSource, SourceTag};
use crate::Result;
use crate::settings::SourceSettings;

/// Reads hosts out of Caddy's running HTTP server config
pub struct CaddySource {
    client: SourceClient,
}

impl CaddySource {
    /// New source using the shared client
    #[must_use]
    pub fn new(client: SourceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RouteSource for CaddySource {
    fn tag(&self) -> SourceTag {
        SourceTag::Caddy
    }

    async fn poll(&self, settings: &SourceSettings) -> Result<Vec<DiscoveredApp>> {
        let url = join(&settings.url, "/config/apps/http/servers");
        let servers: Value = self
            .client
            .get_json(&url, Auth::Basic(&settings.username, &settings.password))
            .await?;
        Ok(parse_servers(&servers))
    }
}

/// Collect `match[].host` values across every server's routes, descending
/// into `subroute` handlers.
#[must_use]
pub fn parse_servers(servers: &Value) -> Vec<DiscoveredApp> {
    let mut hosts = Vec::new();
    let Some(servers) = servers.as_object() else {
        return Vec::new();
    };

    for server in servers.values() {
        let tls = server_uses_tls(server);
        let mut found = Vec::new();
        if let Some(routes) = server.get("routes").and_then(Value::as_array) {
            walk_routes(routes, &mut found);
        }
        for host in found {
            if host.contains('*') {
                continue;
            }
            let scheme = if tls { "https" } else { "http" };
            let url = format!("{scheme}://{host}");
            if !hosts.iter().any(|a: &DiscoveredApp| a.url == url) {
                hosts.push(DiscoveredApp::new(host, url));
            }
        }
    }
    hosts
}

fn walk_routes(routes: &[Value], out: &mut Vec<String>) {
    for route in routes {
        if let Some(matchers) = route.get("match").and_then(Value::as_array) {
            for matcher in matchers {
                if let Some(list) = matcher.get("host").and_then(Value::as_array) {
                    out.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
                }
            }
        }

        let Some(handlers) = route.get("handle").and_then(Value::as_array) else {
            continue;
        };
        for handler in handlers {
            if handler.get("handler").and_then(Value::as_str) == Some("subroute") {
                if let Some(inner) = handler.get("routes").and_then(Value::as_array) {
                    walk_routes(inner, out);
                }
            }
        }
    }
}

// Caddy serves HTTPS automatically unless the server only listens on :80 or
// disables automatic HTTPS.
fn server_uses_tls(server: &Value) -> bool {
    let only_plain = server
        .get("listen")
        .and_then(Value::as_array)
        .is_some_and(|l| !l.is_empty() && l.iter().filter_map(Value::as_str).all(|a| a.ends_with(":80")));
    let auto_off = server
        .pointer("/automatic_https/disable")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    !(only_plain || auto_off)
}
