//! DashGate - self-hosted application dashboard
//!
//! Group-gated app tiles behind local, LDAP, OIDC or trusted-proxy sign-on.

use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{error, info};

use dashgate::{
    cli::{Cli, Command},
    config::Config,
    crypto::{password::hash_password, secret::resolve_key},
    server::{Server, handlers::MIN_PASSWORD_LEN},
    settings::SettingsHandle,
    setup_tracing,
    store::{NewUser, Store},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::CreateUser {
            username,
            password,
            email,
            display_name,
            groups,
        }) => {
            let user = NewUser {
                display_name: display_name.unwrap_or_else(|| username.clone()),
                username,
                email,
                groups: groups
                    .into_iter()
                    .map(|g| g.trim().to_string())
                    .filter(|g| !g.is_empty())
                    .collect(),
                password_hash: String::new(),
            };
            match create_user(config, user, &password).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Failed to create user: {e:#}");
                    ExitCode::FAILURE
                }
            }
        }
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Create a local account and close first-run setup
async fn create_user(config: Config, mut user: NewUser, password: &str) -> anyhow::Result<()> {
    if user.username.trim().is_empty() {
        bail!("username must not be empty");
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        bail!("password must be at least {MIN_PASSWORD_LEN} characters");
    }
    user.password_hash = hash_password(password)?;

    let store = Store::open(&config.database.path)
        .await
        .with_context(|| format!("opening {}", config.database.path.display()))?;
    let created = store
        .create_user(&user)
        .await
        .with_context(|| format!("creating {}", user.username))?;
    let key = resolve_key(config.encryption_key.as_deref(), &store).await;
    let settings = SettingsHandle::load(store.clone(), key, config.discovery.pinned, config.auth.mode)
        .await
        .context("loading settings")?;
    settings.mark_setup_complete().await?;
    store
        .record_audit("cli", "user_create", &created.username, "")
        .await;
    store.close().await;

    println!("Created user {} (groups: {})", created.username, created.groups.join(", "));
    Ok(())
}

/// Run the dashboard server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        database = %config.database.path.display(),
        "Starting DashGate"
    );

    if let Err(e) = Server::new(config).run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
