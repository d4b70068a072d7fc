//! HTTP server and background tasks

pub mod handlers;
pub mod middleware;
pub mod rate_limit;
pub mod router;

pub use router::{AppState, create_router};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::apps::{AppCatalog, AppsWatcher};
use crate::config::Config;
use crate::store::Store;
use crate::{Error, Result};

const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// DashGate server
pub struct Server {
    config: Config,
}

impl Server {
    /// Server for a loaded configuration
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Open the store, start the background tasks and serve until a shutdown
    /// signal arrives.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let root = CancellationToken::new();
        let store = Store::open(&self.config.database.path).await?;
        let catalog = Arc::new(AppCatalog::open(&self.config.files)?);
        let watch = self.config.files.watch;
        let state = Arc::new(
            AppState::build(self.config, store.clone(), Arc::clone(&catalog), root.clone()).await?,
        );

        let _watcher = if watch {
            match AppsWatcher::start(Arc::clone(&catalog), root.child_token()) {
                Ok(w) => {
                    info!("App catalogue hot-reload enabled");
                    Some(w)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to start catalogue watcher, hot-reload disabled");
                    None
                }
            }
        } else {
            None
        };

        state.discovery.sync().await;
        let tasks = spawn_background(&state, &root);

        let app = create_router(Arc::clone(&state));
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("DASHGATE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %state.config.server.host, port = state.config.server.port, "Listening");
        {
            let settings = state.settings.snapshot();
            info!(
                local = settings.local_auth_enabled,
                ldap = settings.ldap.is_configured(),
                oidc = settings.oidc.is_configured(),
                proxy = settings.proxy.enabled,
                "Authentication providers"
            );
            if !state.config.auth.cookie_secure {
                warn!("COOKIE_SECURE is off; session cookies will be sent over plain HTTP");
            }
        }

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal(root.clone()))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Stopping background tasks...");
        root.cancel();
        state.discovery.shutdown().await;
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        store.close().await;
        Ok(())
    }
}

/// Session sweep, limiter cleanup and the health loop, all stopped by `root`
fn spawn_background(state: &Arc<AppState>, root: &CancellationToken) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    let store = state.store.clone();
    let sweep_every = state.config.database.sweep_interval;
    let shutdown = root.child_token();
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = store.sweep().await {
                        error!(error = %e, "Sweep failed");
                    }
                }
                () = shutdown.cancelled() => break,
            }
        }
    }));

    tasks.push(tokio::spawn(Arc::clone(&state.login_limiter).run_cleanup(
        LIMITER_CLEANUP_INTERVAL,
        root.child_token(),
    )));

    if state.config.health.enabled {
        let state = Arc::clone(state);
        let shutdown = root.child_token();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(state.config.health.interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let mut urls = state.catalog.snapshot().urls();
                        match state.discovery.urls().await {
                            Ok(discovered) => urls.extend(discovered),
                            Err(e) => warn!(error = %e, "Skipping discovered apps in health sweep"),
                        }
                        let probed = state.health.run_once(urls).await;
                        debug!(probed, "Health sweep finished");
                    }
                    () = shutdown.cancelled() => break,
                }
            }
        }));
    }

    tasks
}

/// Resolves on Ctrl+C or SIGTERM, or when `root` is cancelled elsewhere
async fn shutdown_signal(root: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
        () = root.cancelled() => {},
    }

    info!("Shutdown signal received");
    root.cancel();
}
