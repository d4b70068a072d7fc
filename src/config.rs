//! Configuration management
//!
//! Static process configuration: loaded once at startup from an optional YAML
//! file, `DASHGATE_`-prefixed environment variables, and the plain deployment
//! variables (`DB_PATH`, `COOKIE_SECURE`, `TRAEFIK_URL`, ...). Anything an
//! administrator can change at runtime lives in [`crate::settings`] instead.

use std::{collections::HashMap, env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::discovery::SourceTag;
use crate::settings::SourceSettings;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before the plain deployment variables are read.
    pub env_files: Vec<String>,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Embedded database configuration
    pub database: DatabaseConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Locations of the static app files
    pub files: FilesConfig,
    /// Discovery poller configuration
    pub discovery: DiscoveryConfig,
    /// Health probe configuration
    pub health: HealthConfig,
    /// Hex-encoded 32-byte key for secrets at rest (`ENCRYPTION_KEY`)
    #[serde(skip_serializing)]
    pub encryption_key: Option<String>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Maximum request body size for non-safe methods (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(60),
            max_body_size: 1024 * 1024,
        }
    }
}

/// Embedded database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite file
    pub path: PathBuf,
    /// How often expired sessions and stale OIDC states are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/dashgate.db"),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

/// Authentication mode selected at deployment time.
///
/// Seeds the provider toggles in the runtime settings the first time the
/// database is initialised; afterwards the settings are authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Local users only
    #[default]
    Local,
    /// Directory bind (local users still accepted)
    Ldap,
    /// External OpenID Connect provider
    Oidc,
    /// Trusted reverse-proxy headers
    Proxy,
    /// Local + directory + OIDC
    Hybrid,
}

impl std::str::FromStr for AuthMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "ldap" => Ok(Self::Ldap),
            "oidc" => Ok(Self::Oidc),
            "proxy" | "authelia" | "forward-auth" => Ok(Self::Proxy),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(Error::Config(format!("Unknown AUTH_MODE: {other}"))),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Initial provider selection
    pub mode: AuthMode,
    /// Session lifetime in days
    pub session_days: u32,
    /// Mark cookies `Secure`
    pub cookie_secure: bool,
    /// Per-IP login throttling
    pub login_rate_limit: LoginRateLimitConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Local,
            session_days: 7,
            cookie_secure: true,
            login_rate_limit: LoginRateLimitConfig::default(),
        }
    }
}

impl AuthConfig {
    /// Session lifetime as a duration
    #[must_use]
    pub fn session_lifetime(&self) -> Duration {
        Duration::from_secs(u64::from(self.session_days.max(1)) * 24 * 3600)
    }
}

/// Login rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginRateLimitConfig {
    /// Attempts allowed per window
    pub attempts: u32,
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Maximum tracked client addresses
    pub max_tracked: usize,
}

impl Default for LoginRateLimitConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            window: Duration::from_secs(15 * 60),
            max_tracked: 10_000,
        }
    }
}

/// Locations of the static configuration files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Static app catalogue (`config.yaml`)
    pub apps: PathBuf,
    /// URL → groups mappings (`mappings.yaml`)
    pub mappings: PathBuf,
    /// Reload the files when they change on disk
    pub watch: bool,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            apps: PathBuf::from("config/config.yaml"),
            mappings: PathBuf::from("config/mappings.yaml"),
            watch: true,
        }
    }
}

/// Discovery poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Poll cadence for every source
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Per-request timeout against a source
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Hard cap on a decoded response body
    pub max_response_bytes: usize,
    /// Sources pinned by the environment; the admin API may not modify these
    #[serde(skip)]
    pub pinned: HashMap<SourceTag, SourceSettings>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(15),
            max_response_bytes: 10 * 1024 * 1024,
            pinned: HashMap::new(),
        }
    }
}

/// Health probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Enable the background probe
    pub enabled: bool,
    /// Sweep interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Timeout per HEAD / GET attempt
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum concurrent checks
    pub concurrency: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            concurrency: 20,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed,
    /// or if a deployment variable holds an invalid value.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("DASHGATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.apply_env(|key| env::var(key).ok())?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let path = Path::new(path_str);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {path_str}"),
                    Err(e) => tracing::warn!("Failed to load env file {path_str}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {path_str}");
            }
        }
    }

    /// Apply the plain deployment variables on top of the figment result.
    ///
    /// `lookup` abstracts the environment so tests don't mutate process state.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get("DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(key) = get("ENCRYPTION_KEY") {
            self.encryption_key = Some(key.trim().to_string());
        }
        if let Some(value) = get("COOKIE_SECURE") {
            self.auth.cookie_secure = parse_bool(&value)
                .ok_or_else(|| Error::Config(format!("COOKIE_SECURE must be a boolean, got {value}")))?;
        }
        if let Some(mode) = get("AUTH_MODE") {
            self.auth.mode = mode.parse()?;
        }
        if let Some(days) = get("SESSION_DURATION_DAYS") {
            self.auth.session_days = days
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|d| *d > 0)
                .ok_or_else(|| Error::Config(format!("SESSION_DURATION_DAYS must be a positive integer, got {days}")))?;
        }
        if let Some(path) = get("CONFIG_PATH") {
            self.files.apps = PathBuf::from(path);
        }
        if let Some(path) = get("MAPPINGS_PATH") {
            self.files.mappings = PathBuf::from(path);
        }

        for tag in SourceTag::ALL {
            let prefix = tag.env_prefix();
            let enabled = get(&format!("{prefix}_DISCOVERY")).and_then(|v| parse_bool(&v));
            if enabled != Some(true) {
                continue;
            }
            let url = match tag {
                SourceTag::Nginx => get("NGINX_CONFIG_PATH").or_else(|| get("NGINX_URL")),
                _ => get(&format!("{prefix}_URL")),
            };
            let pinned = SourceSettings {
                enabled: true,
                url: url.unwrap_or_else(|| tag.default_url().to_string()),
                username: get(&format!("{prefix}_USERNAME")).unwrap_or_default(),
                password: get(&format!("{prefix}_PASSWORD")).unwrap_or_default(),
            };
            tracing::info!(source = %tag, url = %pinned.url, "Discovery source pinned by environment");
            self.discovery.pinned.insert(tag, pinned);
        }

        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "15m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
