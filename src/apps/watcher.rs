//! Hot reload of the catalogue files

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::AppCatalog;
use crate::{Error, Result};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches `config.yaml` and `mappings.yaml` and reloads the catalogue
/// after changes settle
pub struct AppsWatcher {
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl AppsWatcher {
    /// Start watching the catalogue's files until `shutdown` fires
    pub fn start(catalog: Arc<AppCatalog>, shutdown: CancellationToken) -> Result<Self> {
        let files = catalog.paths();
        if files.is_empty() {
            return Ok(Self {
                _watcher: Mutex::new(None),
            });
        }

        let (event_tx, event_rx) = mpsc::channel(100);
        let watcher = Self::create_watcher(event_tx, &files)?;
        Self::spawn_reload_task(catalog, event_rx, shutdown);

        Ok(Self {
            _watcher: Mutex::new(Some(watcher)),
        })
    }

    // The parent directories are watched so editors that replace files by
    // rename are still seen.
    fn create_watcher(event_tx: mpsc::Sender<()>, files: &[PathBuf]) -> Result<RecommendedWatcher> {
        let names: HashSet<OsString> = files
            .iter()
            .filter_map(|f| f.file_name().map(ToOwned::to_owned))
            .collect();

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) && event
                        .paths
                        .iter()
                        .any(|p| p.file_name().is_some_and(|n| names.contains(n)));

                    if relevant {
                        debug!(paths = ?event.paths, kind = ?event.kind, "Catalogue file change");
                        let _ = event_tx.try_send(());
                    }
                }
                Err(e) => error!(error = %e, "File watcher error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::Internal(format!("Failed to create file watcher: {e}")))?;

        let dirs: HashSet<&Path> = files
            .iter()
            .map(|f| match f.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            })
            .collect();
        for dir in dirs {
            if !dir.exists() {
                debug!(directory = %dir.display(), "Directory does not exist, skipping watch");
                continue;
            }
            match watcher.watch(dir, RecursiveMode::NonRecursive) {
                Ok(()) => info!(directory = %dir.display(), "Watching catalogue files"),
                Err(e) => warn!(directory = %dir.display(), error = %e, "Failed to watch directory"),
            }
        }

        Ok(watcher)
    }

    fn spawn_reload_task(
        catalog: Arc<AppCatalog>,
        mut event_rx: mpsc::Receiver<()>,
        shutdown: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut last_event: Option<Instant> = None;
            let mut interval = tokio::time::interval(Duration::from_millis(100));

            loop {
                tokio::select! {
                    Some(()) = event_rx.recv() => last_event = Some(Instant::now()),
                    _ = interval.tick() => {
                        if last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                            last_event = None;
                            match catalog.reload() {
                                Ok(count) => info!(apps = count, "Catalogue reloaded"),
                                Err(e) => error!(error = %e, "Catalogue reload failed, keeping previous"),
                            }
                        }
                    }
                    () = shutdown.cancelled() => {
                        debug!("Catalogue watcher shutting down");
                        break;
                    }
                }
            }
        });
    }
}
