//! DashGate Library
//!
//! Self-hosted application dashboard with a unified authentication and
//! authorization core.
//!
//! # Features
//!
//! - **Identity resolution**: API keys, trusted reverse-proxy headers and session cookies
//! - **Login providers**: local users, LDAP bind, OpenID Connect (PKCE)
//! - **Group-gated visibility**: per-application allow-lists with an admin bypass
//! - **Route discovery**: Docker, Traefik, nginx, Nginx Proxy Manager and Caddy pollers
//! - **Health probe**: periodic reachability classification of every listed app
//! - **Hardening**: CSRF double-submit, per-IP login throttling, SSRF screening,
//!   encrypted settings at rest

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod apps;
pub mod auth;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod health;
pub mod security;
pub mod server;
pub mod settings;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
