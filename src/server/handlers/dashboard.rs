//! Dashboard, health and per-user endpoints

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Redirect, Response},
};
use serde::Serialize;
use serde_json::{Value, json};

use crate::apps::{AppEntry, Category, filter_for_user};
use crate::auth::AuthUser;
use crate::discovery::merge;
use crate::health::Status;
use crate::server::middleware::{CspNonce, CsrfToken, CurrentUser, RequireUser};
use crate::server::router::AppState;
use crate::{Error, Result};

const MAX_PREFERENCES: usize = 64;
const MAX_PREFERENCE_KEY: usize = 64;
const MAX_PREFERENCE_VALUE: usize = 4096;

/// One tile with its reachability
#[derive(Debug, Serialize)]
pub struct AppView {
    /// The entry
    #[serde(flatten)]
    pub app: AppEntry,
    /// Last probe result
    pub status: Status,
}

/// One category of tiles
#[derive(Debug, Serialize)]
pub struct CategoryView {
    /// Heading
    pub name: String,
    /// Tiles
    pub apps: Vec<AppView>,
}

/// View model of the dashboard
#[derive(Debug, Serialize)]
pub struct DashboardView {
    /// Page title
    pub title: String,
    /// Signed-in identity
    pub user: AuthUser,
    /// Whether admin controls are shown
    pub is_admin: bool,
    /// Visible categories
    pub categories: Vec<CategoryView>,
    /// Token scripts echo in `X-CSRF-Token`
    pub csrf_token: String,
    /// Nonce for inline scripts
    pub nonce: String,
}

/// Static categories followed by discovered ones; a discovered category
/// with the name of a static one is appended to it.
#[must_use]
pub fn combine(static_categories: &[Category], discovered: Vec<Category>) -> Vec<Category> {
    let mut combined = static_categories.to_vec();
    for category in discovered {
        match combined.iter_mut().find(|c| c.name == category.name) {
            Some(existing) => existing.apps.extend(category.apps),
            None => combined.push(category),
        }
    }
    combined
}

/// Everything `user` may see, static and discovered
pub(crate) async fn visible_categories(
    state: &AppState,
    user: &AuthUser,
    is_admin: bool,
) -> Result<Vec<Category>> {
    let catalog = state.catalog.snapshot();
    let discovered = merge(&state.discovery.discovered().await?);
    let combined = combine(&catalog.categories, discovered);
    Ok(filter_for_user(&combined, &user.groups, is_admin))
}

/// GET /health
pub async fn liveness() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// GET /
pub async fn index(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    CsrfToken(csrf_token): CsrfToken,
    CspNonce(nonce): CspNonce,
) -> Result<Response> {
    let settings = state.settings.snapshot();
    if !settings.setup_completed && state.store.count_users().await? == 0 {
        return Ok(Redirect::to("/setup").into_response());
    }
    let Some(user) = user else {
        return match settings.login_redirect() {
            Some(target) => Ok(Redirect::to(target).into_response()),
            None => Err(Error::Unauthenticated),
        };
    };

    let is_admin = user.is_admin(&settings);
    let statuses = state.health.snapshot();
    let categories = visible_categories(&state, &user, is_admin)
        .await?
        .into_iter()
        .map(|category| CategoryView {
            name: category.name,
            apps: category
                .apps
                .into_iter()
                .map(|app| AppView {
                    status: statuses.get(&app.url).copied().unwrap_or(Status::Unknown),
                    app,
                })
                .collect(),
        })
        .collect();

    let title = match state.catalog.snapshot().title.trim() {
        "" => "DashGate".to_string(),
        title => title.to_string(),
    };

    Ok(Json(DashboardView {
        title,
        user,
        is_admin,
        categories,
        csrf_token,
        nonce,
    })
    .into_response())
}

/// GET /api/health: status of every app the caller can see
pub async fn app_health(
    State(state): State<Arc<AppState>>,
    RequireUser(user): RequireUser,
) -> Result<Json<BTreeMap<String, Status>>> {
    let is_admin = user.is_admin(&state.settings.snapshot());
    let statuses: BTreeMap<String, Status> = visible_categories(&state, &user, is_admin)
        .await?
        .into_iter()
        .flat_map(|c| c.apps)
        .map(|app| {
            let status = state.health.status(&app.url);
            (app.url, status)
        })
        .collect();
    Ok(Json(statuses))
}

/// GET /api/me
pub async fn me(State(state): State<Arc<AppState>>, RequireUser(user): RequireUser) -> Json<Value> {
    let is_admin = user.is_admin(&state.settings.snapshot());
    Json(json!({ "user": user, "is_admin": is_admin }))
}

fn preference_owner(user: &AuthUser) -> Result<i64> {
    user.user_id
        .ok_or_else(|| Error::Forbidden("preferences need a user account".into()))
}

/// GET /api/preferences
pub async fn get_preferences(
    State(state): State<Arc<AppState>>,
    RequireUser(user): RequireUser,
) -> Result<Json<BTreeMap<String, String>>> {
    let id = preference_owner(&user)?;
    Ok(Json(state.store.get_preferences(id).await?))
}

/// PUT /api/preferences: upsert the given keys, leave others alone
pub async fn put_preferences(
    State(state): State<Arc<AppState>>,
    RequireUser(user): RequireUser,
    Json(update): Json<BTreeMap<String, String>>,
) -> Result<Json<BTreeMap<String, String>>> {
    let id = preference_owner(&user)?;
    if update.len() > MAX_PREFERENCES {
        return Err(Error::Config(format!("at most {MAX_PREFERENCES} preferences per request")));
    }
    for (key, value) in &update {
        if key.is_empty() || key.len() > MAX_PREFERENCE_KEY || value.len() > MAX_PREFERENCE_VALUE {
            return Err(Error::Config(format!("invalid preference {key:?}")));
        }
    }
    for (key, value) in &update {
        state.store.set_preference(id, key, value).await?;
    }
    Ok(Json(state.store.get_preferences(id).await?))
}
