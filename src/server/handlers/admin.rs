//! Administration API
//!
//! Every handler takes [`RequireAdmin`]; every change is written to the audit
//! log. Changes to a user's identity or credential end that user's sessions.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use super::{clean_groups, hash_password_blocking, hash_secret_blocking};
use crate::auth::AuthSource;
use crate::crypto::token;
use crate::discovery::{DiscoveredEntry, SourceTag};
use crate::server::middleware::{ClientAddr, RequireAdmin};
use crate::server::router::AppState;
use crate::settings::{SourceSettings, SystemSettings};
use crate::store::{ApiKey, AuditEntry, DiscoveredOverride, NewApiKey, NewUser, User, UserUpdate, now_secs};
use crate::{Error, Result};

const DEFAULT_AUDIT_LIMIT: i64 = 100;
const MAX_AUDIT_LIMIT: i64 = 1000;

async fn audit(state: &AppState, admin: &RequireAdmin, client: ClientAddr, action: &str, detail: &str) {
    state
        .store
        .record_audit(&admin.0.username, action, detail, &client.audit_string())
        .await;
}

/// A user row with its provider
#[derive(Debug, Serialize)]
pub struct UserView {
    /// The user
    #[serde(flatten)]
    pub user: User,
    /// Which provider owns the credential
    pub source: AuthSource,
}

impl From<User> for UserView {
    fn from(user: User) -> Self {
        Self {
            source: AuthSource::from_credential_tag(&user.password_hash),
            user,
        }
    }
}

/// GET /api/admin/local-users
pub async fn list_users(State(state): State<Arc<AppState>>, _admin: RequireAdmin) -> Result<Json<Vec<UserView>>> {
    let users = state.store.list_users().await?;
    Ok(Json(users.into_iter().map(UserView::from).collect()))
}

/// New local account
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    /// Login name
    pub username: String,
    /// Initial password
    pub password: String,
    /// Optional email
    #[serde(default)]
    pub email: Option<String>,
    /// Display name (defaults to the username)
    #[serde(default)]
    pub display_name: String,
    /// Groups
    #[serde(default)]
    pub groups: Vec<String>,
}

/// POST /api/admin/local-users
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    admin: RequireAdmin,
    client: ClientAddr,
    Json(request): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserView>)> {
    let username = request.username.trim().to_string();
    if username.is_empty() {
        return Err(Error::Config("username is required".into()));
    }
    let password_hash = hash_password_blocking(request.password).await?;
    let display_name = match request.display_name.trim() {
        "" => username.clone(),
        name => name.to_string(),
    };
    let user = state
        .store
        .create_user(&NewUser {
            username,
            email: request.email,
            display_name,
            groups: clean_groups(&request.groups),
            password_hash,
        })
        .await?;
    audit(&state, &admin, client, "user_create", &user.username).await;
    info!(admin = %admin.0.username, user = %user.username, "Local user created");
    Ok((StatusCode::CREATED, Json(user.into())))
}

/// Editable profile fields
#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    /// Email; absent or blank clears it
    #[serde(default)]
    pub email: Option<String>,
    /// Display name
    #[serde(default)]
    pub display_name: String,
    /// Groups
    #[serde(default)]
    pub groups: Vec<String>,
}

/// PUT /api/admin/local-users/{id}
pub async fn update_user(
    State(state): State<Arc<AppState>>,
    admin: RequireAdmin,
    client: ClientAddr,
    Path(id): Path<i64>,
    Json(request): Json<UpdateUserRequest>,
) -> Result<Json<UserView>> {
    let groups = clean_groups(&request.groups);
    if admin.0.user_id == Some(id) && !state.settings.snapshot().is_admin_groups(&groups) {
        return Err(Error::Forbidden("cannot remove your own admin rights".into()));
    }
    let existing = state
        .store
        .get_user(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
    let display_name = match request.display_name.trim() {
        "" => existing.display_name.clone(),
        name => name.to_string(),
    };

    let user = state
        .store
        .update_user(
            id,
            &UserUpdate {
                email: request.email,
                display_name,
                groups,
            },
        )
        .await?;
    state.sessions.invalidate_user(id).await?;
    audit(&state, &admin, client, "user_update", &user.username).await;
    Ok(Json(user.into()))
}

/// DELETE /api/admin/local-users/{id}
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    admin: RequireAdmin,
    client: ClientAddr,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    if admin.0.user_id == Some(id) {
        return Err(Error::Forbidden("cannot delete your own account".into()));
    }
    let user = state
        .store
        .get_user(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
    state.sessions.invalidate_user(id).await?;
    state.store.delete_user(id).await?;
    audit(&state, &admin, client, "user_delete", &user.username).await;
    Ok(StatusCode::NO_CONTENT)
}

/// New password for a local account
#[derive(Debug, Deserialize)]
pub struct PasswordRequest {
    /// The password
    pub password: String,
}

/// POST /api/admin/local-users/{id}/password
pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    admin: RequireAdmin,
    client: ClientAddr,
    Path(id): Path<i64>,
    Json(request): Json<PasswordRequest>,
) -> Result<StatusCode> {
    let user = state
        .store
        .get_user(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
    if !user.is_local() {
        return Err(Error::Conflict(format!(
            "{} signs in through an external provider",
            user.username
        )));
    }
    let hash = hash_password_blocking(request.password).await?;
    state.store.set_password_hash(id, &hash).await?;
    state.sessions.invalidate_user(id).await?;
    audit(&state, &admin, client, "password_reset", &user.username).await;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/admin/apikeys
pub async fn list_api_keys(State(state): State<Arc<AppState>>, _admin: RequireAdmin) -> Result<Json<Vec<ApiKey>>> {
    Ok(Json(state.store.list_api_keys().await?))
}

/// New API key
#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    /// Label
    pub name: String,
    /// Identity the key acts as (defaults to the caller)
    #[serde(default)]
    pub username: String,
    /// Groups granted
    #[serde(default)]
    pub groups: Vec<String>,
    /// Permission tags
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Lifetime in days; absent means no expiry
    #[serde(default)]
    pub expires_in_days: Option<u32>,
}

/// The one response that carries a key in plaintext
#[derive(Debug, Serialize)]
pub struct CreatedApiKey {
    /// Full key; not retrievable later
    pub key: String,
    /// Stored row
    pub api_key: ApiKey,
}

/// POST /api/admin/apikeys
pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    admin: RequireAdmin,
    client: ClientAddr,
    Json(request): Json<CreateApiKeyRequest>,
) -> Result<(StatusCode, Json<CreatedApiKey>)> {
    let name = request.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::Config("name is required".into()));
    }
    let key = token::api_key();
    let prefix = token::api_key_prefix(&key)
        .ok_or_else(|| Error::Internal("generated key too short".into()))?
        .to_string();
    let key_hash = hash_secret_blocking(key.clone()).await?;
    let username = match request.username.trim() {
        "" => admin.0.username.clone(),
        name => name.to_string(),
    };
    let expires_at = request
        .expires_in_days
        .map(|days| now_secs().saturating_add(i64::from(days) * 24 * 3600));

    let api_key = state
        .store
        .insert_api_key(&NewApiKey {
            name,
            key_hash,
            key_prefix: prefix,
            username,
            groups: clean_groups(&request.groups),
            permissions: clean_groups(&request.permissions),
            expires_at,
        })
        .await?;
    audit(&state, &admin, client, "apikey_create", &api_key.name).await;
    Ok((StatusCode::CREATED, Json(CreatedApiKey { key, api_key })))
}

/// DELETE /api/admin/apikeys/{id}
pub async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    admin: RequireAdmin,
    client: ClientAddr,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    if !state.store.delete_api_key(id).await? {
        return Err(Error::NotFound(format!("api key {id}")));
    }
    audit(&state, &admin, client, "apikey_delete", &id.to_string()).await;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/admin/system-config
pub async fn get_system_config(State(state): State<Arc<AppState>>, _admin: RequireAdmin) -> Json<SystemSettings> {
    Json(state.settings.snapshot().redacted())
}

/// PUT /api/admin/system-config
///
/// Validates against the current snapshot, bootstraps OIDC discovery for a
/// new issuer without holding the settings lock, then publishes.
pub async fn put_system_config(
    State(state): State<Arc<AppState>>,
    admin: RequireAdmin,
    client: ClientAddr,
    Json(mut next): Json<SystemSettings>,
) -> Result<Json<SystemSettings>> {
    let previous = state.settings.snapshot();
    next.keep_redacted_secrets(&previous);

    next.admin_groups = clean_groups(&next.admin_groups);
    if next.admin_groups.is_empty() {
        return Err(Error::Config("at least one admin group is required".into()));
    }
    next.proxy.trusted_proxies = clean_groups(&next.proxy.trusted_proxies);
    for entry in &next.proxy.trusted_proxies {
        IpNetwork::from_str(entry)
            .map_err(|_| Error::Config(format!("invalid trusted proxy {entry:?}")))?;
    }

    if next.local_auth_enabled && !previous.local_auth_enabled {
        let local = state.store.list_users().await?.iter().filter(|u| u.is_local()).count();
        if local == 0 {
            return Err(Error::Conflict(
                "local login cannot be enabled before a local user exists".into(),
            ));
        }
    }

    let issuer_changed = next.oidc.issuer.trim() != previous.oidc.issuer.trim();
    if issuer_changed {
        state.oidc.invalidate();
    }
    if next.oidc.is_configured() && (issuer_changed || !previous.oidc.is_configured()) {
        state
            .oidc
            .discover(next.oidc.issuer.trim())
            .await
            .map_err(|e| Error::Config(format!("OIDC discovery failed: {e}")))?;
    }

    // Sources and the setup flag have their own writers
    state
        .settings
        .update(move |current| {
            current.local_auth_enabled = next.local_auth_enabled;
            current.ldap = next.ldap;
            current.oidc = next.oidc;
            current.proxy = next.proxy;
            current.admin_groups = next.admin_groups;
            Ok(())
        })
        .await?;
    audit(&state, &admin, client, "settings_update", "system").await;
    Ok(Json(state.settings.snapshot().redacted()))
}

/// GET /api/admin/discovered-apps
pub async fn list_discovered(
    State(state): State<Arc<AppState>>,
    _admin: RequireAdmin,
) -> Result<Json<Vec<DiscoveredEntry>>> {
    Ok(Json(state.discovery.discovered().await?))
}

/// PUT /api/admin/discovered-apps: save the override for one URL
pub async fn put_override(
    State(state): State<Arc<AppState>>,
    admin: RequireAdmin,
    client: ClientAddr,
    Json(mut row): Json<DiscoveredOverride>,
) -> Result<Json<DiscoveredOverride>> {
    row.url = row.url.trim().to_string();
    if row.url.is_empty() {
        return Err(Error::Config("url is required".into()));
    }
    row.groups = clean_groups(&row.groups);
    state.store.upsert_override(&row).await?;
    audit(&state, &admin, client, "override_save", &row.url).await;
    let saved = state
        .store
        .get_override(&row.url)
        .await?
        .ok_or_else(|| Error::Internal("saved override vanished".into()))?;
    Ok(Json(saved))
}

/// `?url=` selecting one override
#[derive(Debug, Deserialize)]
pub struct UrlQuery {
    /// Discovered URL
    pub url: String,
}

/// DELETE /api/admin/discovered-apps?url=
pub async fn delete_override(
    State(state): State<Arc<AppState>>,
    admin: RequireAdmin,
    client: ClientAddr,
    Query(query): Query<UrlQuery>,
) -> Result<StatusCode> {
    if !state.store.delete_override(query.url.trim()).await? {
        return Err(Error::NotFound(format!("override for {}", query.url)));
    }
    audit(&state, &admin, client, "override_delete", &query.url).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn source_view(state: &AppState, tag: SourceTag) -> Value {
    let (running, apps) = match state.discovery.worker(tag) {
        Some(worker) => (worker.is_running().await, worker.snapshot()),
        None => (false, Arc::default()),
    };
    json!({
        "source": tag,
        "pinned": state.settings.is_pinned(tag),
        "running": running,
        "settings": state.settings.source(tag).redacted(),
        "apps": apps.as_slice(),
    })
}

/// GET /api/admin/discovery/{source}
pub async fn get_source(
    State(state): State<Arc<AppState>>,
    _admin: RequireAdmin,
    Path(source): Path<String>,
) -> Result<Json<Value>> {
    let tag = SourceTag::from_str(&source)?;
    Ok(Json(source_view(&state, tag).await))
}

/// PUT /api/admin/discovery/{source}: new connection settings, then restart
/// the source. Sources pinned by the environment answer 409.
pub async fn put_source(
    State(state): State<Arc<AppState>>,
    admin: RequireAdmin,
    client: ClientAddr,
    Path(source): Path<String>,
    Json(mut update): Json<SourceSettings>,
) -> Result<Json<Value>> {
    let tag = SourceTag::from_str(&source)?;
    update.url = update.url.trim().to_string();
    if update.enabled && update.url.is_empty() {
        return Err(Error::Config(format!("{tag} needs a URL")));
    }
    if !update.url.is_empty() {
        tag.validate_location(&update.url)?;
    }
    state.settings.update_source(tag, update).await?;
    state.discovery.restart(tag).await;
    audit(&state, &admin, client, "discovery_update", tag.as_str()).await;
    Ok(Json(source_view(&state, tag).await))
}

/// Audit listing parameters
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AuditQuery {
    /// Newest rows to return
    pub limit: Option<i64>,
}

/// GET /api/admin/audit
pub async fn list_audit(
    State(state): State<Arc<AppState>>,
    _admin: RequireAdmin,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>> {
    let limit = query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT).clamp(1, MAX_AUDIT_LIMIT);
    Ok(Json(state.store.list_audit(limit).await?))
}
