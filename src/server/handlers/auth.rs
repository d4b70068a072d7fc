//! Login, logout and the OpenID Connect round trip

use std::sync::Arc;

use axum::{
    Form, Json,
    extract::{FromRequest, Query, Request, State},
    http::{HeaderMap, header},
    response::{IntoResponse, Redirect, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::set_cookie;
use crate::auth::session::cookie_values;
use crate::auth::{SESSION_COOKIE, validate_redirect};
use crate::crypto::{OIDC_USER, token};
use crate::server::middleware::{ClientAddr, CspNonce, CsrfToken, CurrentUser};
use crate::server::router::AppState;
use crate::store::User;
use crate::{Error, Result};

/// Interactive providers offered on the login page
#[derive(Debug, Serialize)]
pub struct Providers {
    /// Username/password against local accounts
    pub local: bool,
    /// Username/password against the directory
    pub ldap: bool,
    /// "Sign in with" button
    pub oidc: bool,
}

/// View model of the login page
#[derive(Debug, Serialize)]
pub struct LoginView {
    /// Enabled providers
    pub providers: Providers,
    /// Token the form echoes in `X-CSRF-Token`
    pub csrf_token: String,
    /// Nonce for inline scripts
    pub nonce: String,
    /// Where to go after a successful login
    pub redirect: String,
}

/// `?redirect=` on login entry points
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RedirectQuery {
    /// Relative path to return to
    pub redirect: String,
}

/// GET /login
pub async fn login_page(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    CsrfToken(csrf_token): CsrfToken,
    CspNonce(nonce): CspNonce,
    Query(query): Query<RedirectQuery>,
) -> Response {
    let redirect = validate_redirect(&query.redirect).to_string();
    if user.is_some() {
        return Redirect::to(&redirect).into_response();
    }
    let settings = state.settings.snapshot();
    Json(LoginView {
        providers: Providers {
            local: settings.local_auth_enabled,
            ldap: settings.ldap.is_configured(),
            oidc: settings.oidc.is_configured(),
        },
        csrf_token,
        nonce,
        redirect,
    })
    .into_response()
}

/// Login form body
#[derive(Debug, Deserialize)]
pub struct LoginForm {
    /// Login name
    pub username: String,
    /// Password
    pub password: String,
    /// Relative path to return to
    #[serde(default)]
    pub redirect: String,
}

/// Credentials posted by a browser form or by a script
#[derive(Debug)]
pub enum LoginRequest {
    /// `application/x-www-form-urlencoded`, answered with a redirect
    Form(LoginForm),
    /// `application/json`, answered with a JSON body
    Json(LoginForm),
}

impl LoginRequest {
    fn credentials(&self) -> &LoginForm {
        match self {
            Self::Form(form) | Self::Json(form) => form,
        }
    }
}

impl<S: Send + Sync> FromRequest<S> for LoginRequest {
    type Rejection = Response;

    async fn from_request(request: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let json = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("application/json"));
        if json {
            let Json(body) = Json::<LoginForm>::from_request(request, state)
                .await
                .map_err(IntoResponse::into_response)?;
            Ok(Self::Json(body))
        } else {
            let Form(body) = Form::<LoginForm>::from_request(request, state)
                .await
                .map_err(IntoResponse::into_response)?;
            Ok(Self::Form(body))
        }
    }
}

/// Answer to a JSON login
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    /// Signed-in user name
    pub username: String,
    /// Anti-forgery token to echo in `X-CSRF-Token` from now on
    pub csrf_token: String,
    /// Validated landing path
    pub redirect: String,
}

/// How a fresh session is handed to the client
enum Landing<'a> {
    Redirect(&'a str),
    Json(&'a str),
}

/// POST /login
pub async fn login(
    State(state): State<Arc<AppState>>,
    client: ClientAddr,
    body: LoginRequest,
) -> Result<Response> {
    let form = body.credentials();
    let user = match state.verifier.verify(&form.username, &form.password).await {
        Ok(user) => user,
        Err(Error::InvalidCredentials) => {
            state
                .store
                .record_audit(form.username.trim(), "login_failed", "", &client.audit_string())
                .await;
            return Err(Error::InvalidCredentials);
        }
        Err(e) => return Err(e),
    };

    let redirect = validate_redirect(&form.redirect);
    let landing = match body {
        LoginRequest::Form(_) => Landing::Redirect(redirect),
        LoginRequest::Json(_) => Landing::Json(redirect),
    };
    let response = start_session(&state, &user, landing).await?;
    state
        .store
        .record_audit(&user.username, "login", "password", &client.audit_string())
        .await;
    Ok(response)
}

/// Replace the user's sessions with a new one and send the client on
async fn start_session(state: &AppState, user: &User, landing: Landing<'_>) -> Result<Response> {
    let session = state.sessions.issue(user.id).await?;
    info!(user = %user.username, "Signed in");
    // Fresh anti-forgery token for the new session
    let csrf_token = token::csrf_token();
    let mut response = match landing {
        Landing::Redirect(to) => Redirect::to(to).into_response(),
        Landing::Json(to) => Json(LoginResponse {
            username: user.username.clone(),
            csrf_token: csrf_token.clone(),
            redirect: to.to_string(),
        })
        .into_response(),
    };
    set_cookie(&mut response, &state.sessions.session_cookie(&session.token));
    set_cookie(&mut response, &state.sessions.csrf_cookie(&csrf_token));
    Ok(response)
}

/// POST /logout
pub async fn logout(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    client: ClientAddr,
    headers: HeaderMap,
) -> Result<Response> {
    for token in cookie_values(&headers, SESSION_COOKIE) {
        state.sessions.revoke(token).await?;
    }
    if let Some(user) = &user {
        state
            .store
            .record_audit(&user.username, "logout", "", &client.audit_string())
            .await;
    }
    let target = state.settings.snapshot().login_redirect().unwrap_or("/");
    let mut response = Redirect::to(target).into_response();
    set_cookie(&mut response, &state.sessions.clear_session_cookie());
    Ok(response)
}

/// GET /auth/oidc
pub async fn oidc_begin(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RedirectQuery>,
) -> Result<Redirect> {
    let settings = state.settings.snapshot();
    let url = state
        .oidc
        .begin(&state.store, &settings.oidc, &query.redirect)
        .await?;
    Ok(Redirect::to(&url))
}

/// Provider callback parameters
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CallbackQuery {
    /// Authorization code
    pub code: String,
    /// State issued by [`oidc_begin`]
    pub state: String,
    /// Provider-reported failure
    pub error: Option<String>,
}

/// GET /auth/oidc/callback
pub async fn oidc_callback(
    State(state): State<Arc<AppState>>,
    client: ClientAddr,
    Query(query): Query<CallbackQuery>,
) -> Result<Response> {
    if let Some(error) = &query.error {
        warn!(%error, "OIDC provider returned an error");
        return Err(Error::InvalidCredentials);
    }
    if query.code.is_empty() || query.state.is_empty() {
        return Err(Error::InvalidCredentials);
    }

    let settings = state.settings.snapshot();
    let (profile, redirect) = state
        .oidc
        .complete(&state.store, &settings.oidc, &query.state, &query.code)
        .await?;

    let user = match state.store.upsert_external_user(&profile, OIDC_USER).await {
        Ok(user) => user,
        Err(Error::Conflict(msg)) => {
            warn!(username = %profile.username, %msg, "OIDC login refused");
            state
                .store
                .record_audit(&profile.username, "login_failed", "oidc", &client.audit_string())
                .await;
            return Err(Error::InvalidCredentials);
        }
        Err(e) => return Err(e),
    };

    let response = start_session(&state, &user, Landing::Redirect(validate_redirect(&redirect))).await?;
    state
        .store
        .record_audit(&user.username, "login", "oidc", &client.audit_string())
        .await;
    Ok(response)
}
