//! Cancellable poll loop for one source

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DiscoveredApp, RouteSource, SourceTag};
use crate::settings::SettingsHandle;

#[derive(Default)]
struct WorkerState {
    running: bool,
    stop: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// Runs one [`RouteSource`] on a fixed cadence and caches its last result.
///
/// `start` and `stop` share one mutex over the running flag, the stop token
/// and the join handle, so interleaved calls cannot leave two loops alive.
pub struct SourceWorker {
    source: Arc<dyn RouteSource>,
    settings: Arc<SettingsHandle>,
    interval: Duration,
    cache: Arc<RwLock<Arc<Vec<DiscoveredApp>>>>,
    state: Mutex<WorkerState>,
}

impl SourceWorker {
    /// Worker for `source`, reading its connection settings on every poll
    #[must_use]
    pub fn new(source: Arc<dyn RouteSource>, settings: Arc<SettingsHandle>, interval: Duration) -> Self {
        Self {
            source,
            settings,
            interval,
            cache: Arc::new(RwLock::new(Arc::new(Vec::new()))),
            state: Mutex::new(WorkerState::default()),
        }
    }

    /// Source tag
    #[must_use]
    pub fn tag(&self) -> SourceTag {
        self.source.tag()
    }

    /// Latest cached result
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<DiscoveredApp>> {
        self.cache.read().clone()
    }

    /// Whether the poll loop is alive
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Spawn the poll loop. A no-op while already running.
    pub async fn start(&self, root: &CancellationToken) {
        let mut state = self.state.lock().await;
        if state.running {
            debug!(source = %self.tag(), "Source already running");
            return;
        }

        let stop = root.child_token();
        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.source),
            Arc::clone(&self.settings),
            Arc::clone(&self.cache),
            self.interval,
            stop.clone(),
        ));

        state.running = true;
        state.stop = Some(stop);
        state.handle = Some(handle);
        info!(source = %self.tag(), "Discovery source started");
    }

    /// Cancel the loop, wait for it to exit, then clear the cache
    pub async fn stop(&self) {
        let (stop, handle) = {
            let mut state = self.state.lock().await;
            if !state.running {
                return;
            }
            state.running = false;
            (state.stop.take(), state.handle.take())
        };

        if let Some(stop) = stop {
            stop.cancel();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(source = %self.tag(), error = %e, "Discovery worker ended abnormally");
            }
        }

        *self.cache.write() = Arc::new(Vec::new());
        info!(source = %self.tag(), "Discovery source stopped");
    }
}

async fn poll_loop(
    source: Arc<dyn RouteSource>,
    settings: Arc<SettingsHandle>,
    cache: Arc<RwLock<Arc<Vec<DiscoveredApp>>>>,
    every: Duration,
    stop: CancellationToken,
) {
    let tag = source.tag();
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = interval.tick() => {
                let current = settings.source(tag);
                let outcome = AssertUnwindSafe(source.poll(&current)).catch_unwind().await;
                if stop.is_cancelled() {
                    break;
                }
                match outcome {
                    Ok(Ok(apps)) => {
                        debug!(source = %tag, count = apps.len(), "Discovery poll complete");
                        *cache.write() = Arc::new(apps);
                    }
                    Ok(Err(e)) => warn!(source = %tag, error = %e, "Discovery poll failed"),
                    Err(_) => error!(source = %tag, "Discovery poll panicked"),
                }
            }
        }
    }

    debug!(source = %tag, "Discovery loop exited");
}
