//! Periodic reachability probe
//!
//! Each round checks every known URL with bounded concurrency, collects the
//! results over a channel and then swaps the whole status map at once, so
//! readers never observe a half-finished round.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info};

use crate::config::HealthConfig;
use crate::{Error, Result};

/// Reachability of one URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Answered with 2xx, 3xx, 401 or 403
    Online,
    /// Unreachable or answered with another status
    Offline,
    /// Not probed yet
    Unknown,
}

/// Whether an HTTP status counts as "up"
#[must_use]
pub fn is_up(status: StatusCode) -> bool {
    status.is_success()
        || status.is_redirection()
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
}

/// Shared status map and the client that fills it
pub struct HealthProbe {
    client: Client,
    concurrency: usize,
    statuses: RwLock<Arc<HashMap<String, Status>>>,
}

impl HealthProbe {
    /// Probe with its own client: certificates are not verified and
    /// redirects are not followed
    pub fn new(config: &HealthConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("dashgate-health/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build health client: {e}")))?;
        Ok(Self {
            client,
            concurrency: config.concurrency.max(1),
            statuses: RwLock::new(Arc::new(HashMap::new())),
        })
    }

    /// Status of one URL
    #[must_use]
    pub fn status(&self, url: &str) -> Status {
        self.statuses.read().get(url).copied().unwrap_or(Status::Unknown)
    }

    /// The whole map from the last finished round
    #[must_use]
    pub fn snapshot(&self) -> Arc<HashMap<String, Status>> {
        self.statuses.read().clone()
    }

    /// Probe `urls` and publish the result as the new map
    pub async fn run_once(&self, urls: Vec<String>) -> usize {
        let unique: HashSet<String> = urls.into_iter().filter(|u| !u.trim().is_empty()).collect();
        let total = unique.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (tx, mut rx) = mpsc::channel(self.concurrency * 2);

        for url in unique {
            let client = self.client.clone();
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let status = check(&client, &url).await;
                let _ = tx.send((url, status)).await;
            });
        }
        drop(tx);

        let mut next = HashMap::with_capacity(total);
        while let Some((url, status)) = rx.recv().await {
            next.insert(url, status);
        }

        let online = next.values().filter(|s| **s == Status::Online).count();
        *self.statuses.write() = Arc::new(next);
        debug!(total, online, "Health round complete");
        total
    }
}

/// HEAD first; anything but an "up" answer is retried once with GET
pub async fn check(client: &Client, url: &str) -> Status {
    match client.head(url).send().await {
        Ok(response) if is_up(response.status()) => return Status::Online,
        Ok(response) => debug!(url, status = %response.status(), "HEAD not accepted, retrying with GET"),
        Err(e) => debug!(url, error = %e, "HEAD failed, retrying with GET"),
    }
    match client.get(url).send().await {
        Ok(response) if is_up(response.status()) => Status::Online,
        Ok(_) => Status::Offline,
        Err(e) => {
            info!(url, error = %e, "App unreachable");
            Status::Offline
        }
    }
}
