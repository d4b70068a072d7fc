//! Request band: security headers, body cap, anti-forgery check and
//! identity resolution, plus the extractors handlers use to read the result.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts, State},
    http::{HeaderMap, HeaderValue, Method, Request, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tracing::{debug, warn};

use super::router::AppState;
use crate::Error;
use crate::auth::identity::presented_api_key;
use crate::auth::session::cookie_values;
use crate::auth::{AuthUser, CSRF_COOKIE, RequestIdentity};
use crate::crypto::{constant_time_eq, token};

/// Header a script echoes the anti-forgery cookie in
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Per-request script/style nonce
#[derive(Debug, Clone)]
pub struct CspNonce(pub String);

/// Anti-forgery token in effect for this request (existing cookie or a new one)
#[derive(Debug, Clone)]
pub struct CsrfToken(pub String);

/// Identity resolved for this request, if any
#[derive(Debug, Clone, Default)]
pub struct CurrentUser(pub Option<AuthUser>);

/// Transport address of the client, when known
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub Option<IpAddr>);

impl ClientAddr {
    /// Address as stored in the audit log
    #[must_use]
    pub fn audit_string(&self) -> String {
        self.0.map(|ip| ip.to_string()).unwrap_or_default()
    }
}

fn peer_of(extensions: &axum::http::Extensions) -> Option<IpAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_canonical())
}

fn header_str(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Content-Security-Policy for a nonce
#[must_use]
pub fn content_security_policy(nonce: &str) -> String {
    format!(
        "default-src 'self'; script-src 'self' 'nonce-{nonce}'; style-src 'self' 'nonce-{nonce}'; \
         img-src 'self' data: https:; object-src 'none'; base-uri 'self'; frame-ancestors 'none'; \
         form-action 'self'"
    )
}

/// Attach a fresh nonce and set the hardening headers on the way out
pub async fn security_headers(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let nonce = token::csp_nonce();
    request.extensions_mut().insert(CspNonce(nonce.clone()));

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(header::X_XSS_PROTECTION, HeaderValue::from_static("0"));
    if state.config.auth.cookie_secure {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }
    if let Ok(csp) = HeaderValue::from_str(&content_security_policy(&nonce)) {
        headers.insert(header::CONTENT_SECURITY_POLICY, csp);
    }
    response
}

/// Buffer bodies of non-safe requests up to `max` bytes; larger ones get 413
pub async fn limit_body(State(max): State<usize>, request: Request<Body>, next: Next) -> Response {
    if is_safe(request.method()) {
        return next.run(request).await;
    }
    let (parts, body) = request.into_parts();
    let bytes = match Limited::new(body, max).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            debug!(max, path = %parts.uri.path(), "Request body over limit");
            return Error::PayloadTooLarge.into_response();
        }
        Err(e) => {
            debug!(error = %e, "Failed to read request body");
            return Error::Config("unreadable request body".into()).into_response();
        }
    };
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

fn is_safe(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE)
}

/// `host[:port]` of an Origin or Referer value
fn origin_authority(value: &str) -> Option<String> {
    let url = url::Url::parse(value).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn same_host(authority: &str, host: &str) -> bool {
    let strip = |h: &str| {
        h.strip_suffix(":80")
            .or_else(|| h.strip_suffix(":443"))
            .map_or_else(|| h.to_ascii_lowercase(), str::to_ascii_lowercase)
    };
    strip(authority) == strip(host)
}

/// Double-submit check for a state-changing request.
///
/// Requests carrying an API key are exempt: browsers cannot attach those
/// headers cross-site.
pub fn check_csrf(headers: &HeaderMap, host: Option<&str>) -> Result<(), &'static str> {
    if presented_api_key(headers).is_some() {
        return Ok(());
    }

    let Some(presented) = header_str(headers, CSRF_HEADER).filter(|t| !t.is_empty()) else {
        return Err("missing anti-forgery token");
    };
    let mut matched = false;
    for cookie in cookie_values(headers, CSRF_COOKIE) {
        // No early exit: every cookie is compared
        matched |= constant_time_eq(cookie, presented);
    }
    if !matched {
        return Err("anti-forgery token mismatch");
    }

    for name in [header::ORIGIN, header::REFERER] {
        if let Some(value) = header_str(headers, name) {
            let Some(host) = host else {
                return Err("origin check without host");
            };
            match origin_authority(value) {
                Some(authority) if same_host(&authority, host) => {}
                _ => return Err("cross-origin request"),
            }
        }
    }
    Ok(())
}

/// Reject forged state-changing requests; hand out an anti-forgery cookie
/// to clients that do not have one yet.
pub async fn csrf_guard(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if !is_safe(request.method()) {
        let host = header_str(request.headers(), header::HOST)
            .map(ToString::to_string)
            .or_else(|| request.uri().authority().map(ToString::to_string));
        if let Err(reason) = check_csrf(request.headers(), host.as_deref()) {
            warn!(
                path = %request.uri().path(),
                peer = ?peer_of(request.extensions()),
                reason,
                "Anti-forgery check failed"
            );
            return Error::Forbidden(reason.into()).into_response();
        }
    }

    let existing = cookie_values(request.headers(), CSRF_COOKIE)
        .into_iter()
        .find(|v| !v.is_empty())
        .map(ToString::to_string);
    let (csrf, fresh) = match existing {
        Some(token) => (token, false),
        None => (token::csrf_token(), true),
    };
    request.extensions_mut().insert(CsrfToken(csrf.clone()));

    let mut response = next.run(request).await;
    if fresh {
        if let Ok(cookie) = HeaderValue::from_str(&state.sessions.csrf_cookie(&csrf)) {
            response.headers_mut().append(header::SET_COOKIE, cookie);
        }
    }
    response
}

/// Resolve the caller's identity and attach it as [`CurrentUser`]
pub async fn resolve_identity(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let identity = RequestIdentity::new(request.headers().clone(), peer_of(request.extensions()));
    let user = state.resolver.resolve(&identity).await;
    request.extensions_mut().insert(CurrentUser(user));
    next.run(request).await
}

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts.extensions.get::<Self>().cloned().unwrap_or_default())
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(peer_of(&parts.extensions)))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for CspNonce {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<Self>()
            .cloned()
            .unwrap_or_else(|| Self(String::new())))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for CsrfToken {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<Self>()
            .cloned()
            .unwrap_or_else(|| Self(String::new())))
    }
}

/// Any authenticated caller
#[derive(Debug, Clone)]
pub struct RequireUser(pub AuthUser);

impl<S: Send + Sync> FromRequestParts<S> for RequireUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .and_then(|c| c.0.clone())
            .map(Self)
            .ok_or(Error::Unauthenticated)
    }
}

/// An authenticated caller holding an admin group
#[derive(Debug, Clone)]
pub struct RequireAdmin(pub AuthUser);

impl FromRequestParts<Arc<AppState>> for RequireAdmin {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let RequireUser(user) = RequireUser::from_request_parts(parts, state).await?;
        if !user.is_admin(&state.settings.snapshot()) {
            warn!(user = %user.username, path = %parts.uri.path(), "Admin route refused");
            return Err(Error::Forbidden("admin rights required".into()));
        }
        Ok(Self(user))
    }
}
