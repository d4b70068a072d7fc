//! Shared harness: in-memory state driven through the router with `oneshot`

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Method, Request, Response, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use dashgate::apps::{AppCatalog, AppEntry, AppsFile, Category};
use dashgate::auth::{CSRF_COOKIE, SESSION_COOKIE};
use dashgate::config::Config;
use dashgate::crypto::hash_password;
use dashgate::server::{AppState, create_router};
use dashgate::store::{NewUser, Store, User};

pub const CSRF: &str = "test-csrf-token";
pub const PASSWORD: &str = "correct horse battery";
pub const HOST: &str = "dash.example.com";

/// Plain-HTTP test configuration
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.auth.cookie_secure = false;
    config.health.enabled = false;
    config.files.watch = false;
    config.encryption_key = Some("11".repeat(32));
    config
}

/// Catalogue with one admin-only and one `media` app
pub fn catalog() -> AppsFile {
    AppsFile {
        title: "Home".into(),
        categories: vec![Category {
            name: "Media".into(),
            apps: vec![
                AppEntry {
                    name: "Jellyfin".into(),
                    url: "https://jellyfin.lan".into(),
                    groups: vec!["media".into()],
                    ..AppEntry::default()
                },
                AppEntry {
                    name: "Proxmox".into(),
                    url: "https://proxmox.lan".into(),
                    ..AppEntry::default()
                },
            ],
        }],
    }
}

/// State over a fresh in-memory store
pub async fn build_state(config: Config) -> AppState {
    let store = Store::in_memory().await.unwrap();
    AppState::build(
        config,
        store,
        Arc::new(AppCatalog::from_file(catalog())),
        CancellationToken::new(),
    )
    .await
    .unwrap()
}

pub async fn app() -> (Arc<AppState>, Router) {
    app_with(test_config()).await
}

pub async fn app_with(config: Config) -> (Arc<AppState>, Router) {
    let state = Arc::new(build_state(config).await);
    let router = create_router(Arc::clone(&state));
    (state, router)
}

/// Local account with [`PASSWORD`]
pub async fn create_user(state: &AppState, username: &str, groups: &[&str]) -> User {
    state
        .store
        .create_user(&NewUser {
            username: username.into(),
            email: None,
            display_name: username.into(),
            groups: groups.iter().map(|g| (*g).to_string()).collect(),
            password_hash: hash_password(PASSWORD).unwrap(),
        })
        .await
        .unwrap()
}

/// Request from `peer` with host, anti-forgery cookie and header set
pub fn request(method: Method, uri: &str, peer: &str) -> axum::http::request::Builder {
    with_cookies(method, uri, peer, &format!("{CSRF_COOKIE}={CSRF}"))
}

/// Same as [`request`] with a session cookie
pub fn authed(method: Method, uri: &str, session: &str) -> axum::http::request::Builder {
    with_cookies(
        method,
        uri,
        "10.0.0.5:40000",
        &format!("{SESSION_COOKIE}={session}; {CSRF_COOKIE}={CSRF}"),
    )
}

fn with_cookies(method: Method, uri: &str, peer: &str, cookies: &str) -> axum::http::request::Builder {
    let peer: SocketAddr = peer.parse().unwrap();
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::HOST, HOST)
        .header(header::COOKIE, cookies)
        .header("x-csrf-token", CSRF)
        .extension(ConnectInfo(peer))
}

pub fn form(body: &str) -> Body {
    Body::from(body.to_string())
}

pub fn json_body(value: &Value) -> Body {
    Body::from(value.to_string())
}

pub async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router.clone().oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Value of cookie `name` among the response's `Set-Cookie` headers
pub fn set_cookie(response: &Response<Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|c| {
            let (pair, _) = c.split_once(';').unwrap_or((c, ""));
            let (key, value) = pair.split_once('=')?;
            (key.trim() == name).then(|| value.trim().to_string())
        })
}

/// Log in with the form as a user created by [`create_user`]
pub async fn login(router: &Router, username: &str, peer: &str) -> String {
    login_as(router, username, PASSWORD, peer).await
}

/// Form-encoded `username` and `password` (test values carry no `&`, `=` or `%`)
pub fn credentials(username: &str, password: &str) -> String {
    format!("username={username}&password={}", password.replace(' ', "+"))
}

/// Log in with the form and return the session token
pub async fn login_as(router: &Router, username: &str, password: &str, peer: &str) -> String {
    let response = send(
        router,
        request(Method::POST, "/login", peer)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(form(&credentials(username, password)))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    set_cookie(&response, SESSION_COOKIE).expect("session cookie")
}
