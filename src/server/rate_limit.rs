//! Per-address login throttling

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    DefaultKeyedRateLimiter, Quota, RateLimiter,
    clock::{Clock, DefaultClock},
};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Error;
use crate::config::LoginRateLimitConfig;

/// Keyed limiter over the transport address of login attempts
pub struct LoginLimiter {
    quota: Quota,
    clock: DefaultClock,
    max_tracked: usize,
    limiter: RwLock<Arc<DefaultKeyedRateLimiter<IpAddr>>>,
}

impl LoginLimiter {
    /// `attempts` per `window`: a full burst, then one more attempt per
    /// elapsed `window`
    #[must_use]
    pub fn new(config: &LoginRateLimitConfig) -> Self {
        let burst = NonZeroU32::new(config.attempts.max(1)).unwrap_or(NonZeroU32::MIN);
        let period = config.window.max(Duration::from_millis(1));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);
        Self {
            quota,
            clock: DefaultClock::default(),
            max_tracked: config.max_tracked,
            limiter: RwLock::new(Arc::new(RateLimiter::keyed(quota))),
        }
    }

    /// Admit one attempt from `ip`, or say how long to wait
    pub fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        let limiter = self.limiter.read().clone();
        limiter
            .check_key(&ip)
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// Number of addresses currently tracked
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.limiter.read().len()
    }

    /// Forget idle addresses; start over when the map is still too large
    pub fn cleanup(&self) {
        let limiter = self.limiter.read().clone();
        limiter.retain_recent();
        limiter.shrink_to_fit();
        let tracked = limiter.len();
        if tracked > self.max_tracked {
            warn!(tracked, max = self.max_tracked, "Login limiter full, resetting");
            *self.limiter.write() = Arc::new(RateLimiter::keyed(self.quota));
        } else {
            debug!(tracked, "Login limiter cleaned");
        }
    }

    /// Run [`Self::cleanup`] every `every` until cancelled
    pub async fn run_cleanup(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => self.cleanup(),
                () = shutdown.cancelled() => break,
            }
        }
    }
}

/// Middleware throttling the routes it wraps by transport address
pub async fn limit_logins(
    State(limiter): State<Arc<LoginLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::from([0, 0, 0, 0]), |ConnectInfo(addr)| addr.ip().to_canonical());

    match limiter.check(ip) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            warn!(%ip, retry_after = retry_after.as_secs(), "Login rate limit exceeded");
            Error::RateLimited { retry_after }.into_response()
        }
    }
}
