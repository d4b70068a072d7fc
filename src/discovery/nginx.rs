//! nginx configuration directory source
//!
//! Reads `*.conf` files from the configured directory, expands one level of
//! `include`, and reports every `server` block that proxies somewhere under a
//! concrete `server_name`. Included paths must resolve inside the base
//! directory after symlinks are followed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{DiscoveredApp, RouteSource, SourceTag};
use crate::security::{canonical_dir, contained_in};
use crate::settings::SourceSettings;
use crate::{Error, Result};

/// Per-file read cap
const MAX_CONF_BYTES: u64 = 1024 * 1024;

/// Parses nginx server blocks from disk
#[derive(Debug, Default)]
pub struct NginxSource;

impl NginxSource {
    /// New source
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RouteSource for NginxSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Nginx
    }

    async fn poll(&self, settings: &SourceSettings) -> Result<Vec<DiscoveredApp>> {
        let dir = PathBuf::from(settings.url.trim());
        tokio::task::spawn_blocking(move || scan_dir(&dir))
            .await
            .map_err(|e| Error::Internal(format!("nginx scan task failed: {e}")))?
    }
}

/// Scan a configuration directory
pub fn scan_dir(dir: &Path) -> Result<Vec<DiscoveredApp>> {
    let base = canonical_dir(dir)?;
    let mut apps: Vec<DiscoveredApp> = Vec::new();

    let files = WalkDir::new(&base)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "conf"));

    for entry in files {
        let path = match contained_in(&base, entry.path()) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Skipping nginx config");
                continue;
            }
        };
        let Some(text) = read_capped(&path) else {
            continue;
        };
        let directives = expand_includes(parse(&text), &base);
        for app in server_apps(&directives) {
            if !apps.iter().any(|a| a.url == app.url) {
                apps.push(app);
            }
        }
    }
    Ok(apps)
}

fn read_capped(path: &Path) -> Option<String> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > MAX_CONF_BYTES => {
            warn!(path = %path.display(), "nginx config too large, skipped");
            return None;
        }
        Ok(_) => {}
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Cannot stat nginx config");
            return None;
        }
    }
    std::fs::read_to_string(path)
        .map_err(|e| debug!(path = %path.display(), error = %e, "Cannot read nginx config"))
        .ok()
}

/// One parsed directive; `block` is set for `name args { ... }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// Directive name
    pub name: String,
    /// Arguments, quotes removed
    pub args: Vec<String>,
    /// Nested directives of a block
    pub block: Option<Vec<Directive>>,
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars();

    let flush = |current: &mut String, tokens: &mut Vec<String>| {
        if !current.is_empty() {
            tokens.push(std::mem::take(current));
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '#' => {
                flush(&mut current, &mut tokens);
                for n in chars.by_ref() {
                    if n == '\n' {
                        break;
                    }
                }
            }
            '"' | '\'' => {
                for n in chars.by_ref() {
                    if n == c {
                        break;
                    }
                    current.push(n);
                }
            }
            '{' | '}' | ';' => {
                flush(&mut current, &mut tokens);
                tokens.push(c.to_string());
            }
            c if c.is_whitespace() => flush(&mut current, &mut tokens),
            c => current.push(c),
        }
    }
    flush(&mut current, &mut tokens);
    tokens
}

/// Parse nginx configuration text into a directive tree. Unbalanced input
/// yields whatever parsed cleanly.
#[must_use]
pub fn parse(text: &str) -> Vec<Directive> {
    let tokens = tokenize(text);
    let mut pos = 0;
    parse_block(&tokens, &mut pos)
}

fn parse_block(tokens: &[String], pos: &mut usize) -> Vec<Directive> {
    let mut out = Vec::new();
    let mut words: Vec<String> = Vec::new();

    while *pos < tokens.len() {
        let token = &tokens[*pos];
        *pos += 1;
        match token.as_str() {
            ";" => {
                if !words.is_empty() {
                    let name = words.remove(0);
                    out.push(Directive {
                        name,
                        args: std::mem::take(&mut words),
                        block: None,
                    });
                }
            }
            "{" => {
                let children = parse_block(tokens, pos);
                if !words.is_empty() {
                    let name = words.remove(0);
                    out.push(Directive {
                        name,
                        args: std::mem::take(&mut words),
                        block: Some(children),
                    });
                }
            }
            "}" => return out,
            _ => words.push(token.clone()),
        }
    }
    out
}

/// Replace `include` directives with the parsed content of the matching
/// files. Included files are not expanded further.
fn expand_includes(directives: Vec<Directive>, base: &Path) -> Vec<Directive> {
    let mut out = Vec::with_capacity(directives.len());
    for directive in directives {
        if directive.name == "include" && directive.block.is_none() {
            for pattern in &directive.args {
                out.extend(load_include(pattern, base));
            }
            continue;
        }
        let block = directive.block.map(|b| expand_includes(b, base));
        out.push(Directive { block, ..directive });
    }
    out
}

fn load_include(pattern: &str, base: &Path) -> Vec<Directive> {
    let full = if Path::new(pattern).is_absolute() {
        PathBuf::from(pattern)
    } else {
        base.join(pattern)
    };
    let Some(full) = full.to_str() else {
        return Vec::new();
    };
    let paths = match glob::glob(full) {
        Ok(paths) => paths,
        Err(e) => {
            warn!(pattern, error = %e, "Bad nginx include pattern");
            return Vec::new();
        }
    };

    let mut out = Vec::new();
    for path in paths.filter_map(std::result::Result::ok) {
        let path = match contained_in(base, &path) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Rejected nginx include");
                continue;
            }
        };
        if let Some(text) = read_capped(&path) {
            out.extend(parse(&text).into_iter().filter(|d| d.name != "include"));
        }
    }
    out
}

/// Apps for every proxying `server` block in the tree
#[must_use]
pub fn server_apps(directives: &[Directive]) -> Vec<DiscoveredApp> {
    let mut apps = Vec::new();
    for directive in directives {
        let Some(block) = &directive.block else {
            continue;
        };
        if directive.name == "server" {
            if let Some(app) = server_app(block) {
                apps.push(app);
            }
        } else {
            apps.extend(server_apps(block));
        }
    }
    apps
}

fn server_app(block: &[Directive]) -> Option<DiscoveredApp> {
    if !has_proxy_pass(block) {
        return None;
    }
    let host = block
        .iter()
        .filter(|d| d.name == "server_name")
        .flat_map(|d| d.args.iter())
        .find(|name| is_concrete_name(name))?;

    let tls = block.iter().any(|d| match d.name.as_str() {
        "listen" => d.args.iter().any(|a| a == "ssl" || a == "443" || a.ends_with(":443")),
        "ssl" => d.args.first().is_some_and(|a| a == "on"),
        _ => false,
    });
    let scheme = if tls { "https" } else { "http" };
    Some(DiscoveredApp::new(host.clone(), format!("{scheme}://{host}")))
}

fn has_proxy_pass(block: &[Directive]) -> bool {
    block.iter().any(|d| {
        d.name == "proxy_pass" || d.block.as_deref().is_some_and(has_proxy_pass)
    })
}

fn is_concrete_name(name: &str) -> bool {
    !(name.is_empty()
        || name == "_"
        || name == "localhost"
        || name.contains('*')
        || name.starts_with('~')
        || name.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE: &str = r#"
        # grafana
        server {
            listen 443 ssl;
            server_name grafana.lan www.grafana.lan;
            location / {
                proxy_pass http://grafana:3000;
            }
        }
        server {
            listen 80;
            server_name "wiki.lan";
            location / { proxy_pass http://wiki; }
        }
        server {
            listen 80 default_server;
            server_name _;
            location / { proxy_pass http://catchall; }
        }
        server {
            server_name static.lan;
            root /srv/www;
        }
        server {
            server_name *.wild.lan;
            location / { proxy_pass http://wild; }
        }
    "#;

    #[test]
    fn keeps_concrete_proxying_servers() {
        let apps = server_apps(&parse(SITE));
        assert_eq!(
            apps,
            vec![
                DiscoveredApp::new("grafana.lan", "https://grafana.lan"),
                DiscoveredApp::new("wiki.lan", "http://wiki.lan"),
            ]
        );
    }

    #[test]
    fn servers_nested_in_http_blocks_are_found() {
        let apps = server_apps(&parse(
            "http { server { listen 8443 ssl; server_name a.lan; location / { proxy_pass http://a; } } }",
        ));
        assert_eq!(apps, vec![DiscoveredApp::new("a.lan", "https://a.lan")]);
    }

    #[test]
    fn scans_directory_and_expands_one_include_level() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sites")).unwrap();
        std::fs::write(dir.path().join("main.conf"), "include sites/*.inc;").unwrap();
        std::fs::write(
            dir.path().join("sites/app.inc"),
            "server { server_name app.lan; location / { proxy_pass http://app; } }\ninclude deeper.part;",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("sites/deeper.part"),
            "server { server_name deep.lan; location / { proxy_pass http://deep; } }",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "server { server_name txt.lan; proxy_pass x; }")
            .unwrap();

        let apps = scan_dir(dir.path()).unwrap();
        assert_eq!(apps, vec![DiscoveredApp::new("app.lan", "http://app.lan")]);
    }

    #[cfg(unix)]
    #[test]
    fn includes_escaping_the_base_are_rejected() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(
            outside.path().join("evil.conf"),
            "server { server_name evil.lan; location / { proxy_pass http://evil; } }",
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("evil.conf"), dir.path().join("link.inc")).unwrap();
        std::fs::write(dir.path().join("main.conf"), "include link.inc;").unwrap();
        let absolute = format!("include {}/evil.conf;", outside.path().display());
        std::fs::write(dir.path().join("abs.conf"), absolute).unwrap();

        assert!(scan_dir(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn missing_directory_is_an_error() {
        assert!(scan_dir(Path::new("/nonexistent/nginx/conf.d")).is_err());
    }
}
