//! HTTP router and shared state

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post, put},
};
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use super::handlers::{admin, auth, dashboard};
use super::middleware::{csrf_guard, limit_body, resolve_identity, security_headers};
use super::rate_limit::{LoginLimiter, limit_logins};
use crate::Result;
use crate::apps::AppCatalog;
use crate::auth::{CredentialVerifier, OidcClient, Resolver, SessionManager};
use crate::config::Config;
use crate::crypto::secret::resolve_key;
use crate::discovery::DiscoveryManager;
use crate::health::HealthProbe;
use crate::settings::SettingsHandle;
use crate::store::Store;

/// Shared application state
pub struct AppState {
    /// Static configuration
    pub config: Config,
    /// Credential store
    pub store: Store,
    /// Runtime settings
    pub settings: Arc<SettingsHandle>,
    /// Cookie sessions
    pub sessions: Arc<SessionManager>,
    /// API key → proxy → session identification chain
    pub resolver: Resolver,
    /// Username/password verification
    pub verifier: CredentialVerifier,
    /// OpenID Connect client
    pub oidc: OidcClient,
    /// Static app catalogue
    pub catalog: Arc<AppCatalog>,
    /// Discovery pollers
    pub discovery: Arc<DiscoveryManager>,
    /// Reachability of listed apps
    pub health: Arc<HealthProbe>,
    /// Login throttling
    pub login_limiter: Arc<LoginLimiter>,
}

impl AppState {
    /// Wire every component over an open store. Nothing is started here.
    pub async fn build(
        config: Config,
        store: Store,
        catalog: Arc<AppCatalog>,
        root: CancellationToken,
    ) -> Result<Self> {
        let key = resolve_key(config.encryption_key.as_deref(), &store).await;
        let settings = Arc::new(
            SettingsHandle::load(
                store.clone(),
                key,
                config.discovery.pinned.clone(),
                config.auth.mode,
            )
            .await?,
        );
        let sessions = Arc::new(SessionManager::new(store.clone(), &config.auth));
        let resolver = Resolver::standard(store.clone(), Arc::clone(&settings), Arc::clone(&sessions));
        let verifier = CredentialVerifier::new(store.clone(), Arc::clone(&settings));
        let discovery = Arc::new(DiscoveryManager::new(
            &config.discovery,
            Arc::clone(&settings),
            store.clone(),
            root,
        )?);
        let health = Arc::new(HealthProbe::new(&config.health)?);
        let login_limiter = Arc::new(LoginLimiter::new(&config.auth.login_rate_limit));
        info!(
            pinned = config.discovery.pinned.len(),
            session_days = config.auth.session_days,
            "Application state ready"
        );

        Ok(Self {
            oidc: OidcClient::new()?,
            config,
            store,
            settings,
            sessions,
            resolver,
            verifier,
            catalog,
            discovery,
            health,
            login_limiter,
        })
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let login_limit =
        middleware::from_fn_with_state(Arc::clone(&state.login_limiter), limit_logins);

    let band = Router::new()
        .route("/", get(dashboard::index))
        .route(
            "/login",
            get(auth::login_page).merge(post(auth::login).route_layer(login_limit)),
        )
        .route("/logout", post(auth::logout))
        .route("/auth/oidc", get(auth::oidc_begin))
        .route("/auth/oidc/callback", get(auth::oidc_callback))
        .route("/api/health", get(dashboard::app_health))
        .route("/api/me", get(dashboard::me))
        .route(
            "/api/preferences",
            get(dashboard::get_preferences).put(dashboard::put_preferences),
        )
        .route(
            "/api/admin/local-users",
            get(admin::list_users).post(admin::create_user),
        )
        .route(
            "/api/admin/local-users/{id}",
            put(admin::update_user).delete(admin::delete_user),
        )
        .route("/api/admin/local-users/{id}/password", post(admin::reset_password))
        .route(
            "/api/admin/apikeys",
            get(admin::list_api_keys).post(admin::create_api_key),
        )
        .route("/api/admin/apikeys/{id}", delete(admin::delete_api_key))
        .route(
            "/api/admin/system-config",
            get(admin::get_system_config).put(admin::put_system_config),
        )
        .route(
            "/api/admin/discovered-apps",
            get(admin::list_discovered)
                .put(admin::put_override)
                .delete(admin::delete_override),
        )
        .route(
            "/api/admin/discovery/{source}",
            get(admin::get_source).put(admin::put_source),
        )
        .route("/api/admin/audit", get(admin::list_audit))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), resolve_identity))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), csrf_guard))
        .layer(middleware::from_fn_with_state(
            state.config.server.max_body_size,
            limit_body,
        ))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), security_headers));

    Router::new()
        .route("/health", get(dashboard::liveness))
        .merge(band)
        .layer(DefaultBodyLimit::disable())
        .layer(TimeoutLayer::new(state.config.server.request_timeout))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
