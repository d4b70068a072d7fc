//! Administration API tests
//!
//! Covers the admin gate, account management, API keys, system settings
//! and the audit trail.

mod common;

use axum::body::Body;
use axum::http::{Method, StatusCode, header};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use common::*;
use dashgate::settings::REDACTED;

async fn admin_session() -> (std::sync::Arc<dashgate::server::AppState>, axum::Router, String) {
    let (state, router) = app().await;
    create_user(&state, "root", &["admin"]).await;
    let session = login(&router, "root", "10.0.0.5:40000").await;
    (state, router, session)
}

async fn call(router: &axum::Router, method: Method, uri: &str, session: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = authed(method, uri, session);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(json_body(&body))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = send(router, request).await;
    let status = response.status();
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn admin_routes_need_admin_rights() {
    let (state, router) = app().await;
    create_user(&state, "alice", &["media"]).await;
    let session = login(&router, "alice", "10.0.0.5:40000").await;

    for uri in [
        "/api/admin/local-users",
        "/api/admin/apikeys",
        "/api/admin/system-config",
        "/api/admin/discovered-apps",
        "/api/admin/discovery/traefik",
        "/api/admin/audit",
    ] {
        let (status, body) = call(&router, Method::GET, uri, &session, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{uri}");
        assert_eq!(body["error"], "admin rights required");
    }

    let anonymous = send(
        &router,
        request(Method::GET, "/api/admin/local-users", "10.0.0.5:1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_group_match_ignores_case() {
    let (state, router) = app().await;
    create_user(&state, "carol", &["Admin"]).await;
    let session = login(&router, "carol", "10.0.0.5:40000").await;
    let (status, _) = call(&router, Method::GET, "/api/admin/local-users", &session, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn user_lifecycle() {
    let (state, router, session) = admin_session().await;

    let (status, created) = call(
        &router,
        Method::POST,
        "/api/admin/local-users",
        &session,
        Some(json!({ "username": "dave", "password": "long enough pw", "groups": ["media", " media ", ""] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["username"], "dave");
    assert_eq!(created["display_name"], "dave");
    assert_eq!(created["groups"], json!(["media"]));
    assert_eq!(created["source"], "local");
    assert!(created.get("password_hash").is_none());
    let id = created["id"].as_i64().unwrap();

    let (status, _) = call(
        &router,
        Method::POST,
        "/api/admin/local-users",
        &session,
        Some(json!({ "username": "dave", "password": "long enough pw" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(
        &router,
        Method::POST,
        "/api/admin/local-users",
        &session,
        Some(json!({ "username": "erin", "password": "short" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Edits end the user's sessions
    let dave = login_as(&router, "dave", "long enough pw", "10.0.0.7:1").await;
    let (status, _) = call(&router, Method::GET, "/api/me", &dave, None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, updated) = call(
        &router,
        Method::PUT,
        &format!("/api/admin/local-users/{id}"),
        &session,
        Some(json!({ "display_name": "Dave", "groups": ["media", "staff"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["groups"], json!(["media", "staff"]));
    let (status, _) = call(&router, Method::GET, "/api/me", &dave, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // So does a password reset
    let dave = login_as(&router, "dave", "long enough pw", "10.0.0.7:1").await;
    let (status, _) = call(
        &router,
        Method::POST,
        &format!("/api/admin/local-users/{id}/password"),
        &session,
        Some(json!({ "password": "another long one" })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&router, Method::GET, "/api/me", &dave, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let response = send(
        &router,
        request(Method::POST, "/login", "10.0.0.8:1")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(form(&credentials("dave", "long enough pw")))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // And deletion
    let dave = login_as(&router, "dave", "another long one", "10.0.0.9:1").await;
    let (status, _) = call(&router, Method::DELETE, &format!("/api/admin/local-users/{id}"), &session, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&router, Method::GET, "/api/me", &dave, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = call(&router, Method::DELETE, &format!("/api/admin/local-users/{id}"), &session, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let actions: Vec<String> = state
        .store
        .list_audit(20)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    for action in ["user_create", "user_update", "password_reset", "user_delete"] {
        assert!(actions.iter().any(|a| a == action), "{action} missing from {actions:?}");
    }
}

#[tokio::test]
async fn admins_cannot_lock_themselves_out() {
    let (state, router, session) = admin_session().await;
    let root = state.store.list_users().await.unwrap().remove(0);

    let (status, _) = call(&router, Method::DELETE, &format!("/api/admin/local-users/{}", root.id), &session, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(
        &router,
        Method::PUT,
        &format!("/api/admin/local-users/{}", root.id),
        &session,
        Some(json!({ "groups": ["media"] })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "cannot remove your own admin rights");
}

#[tokio::test]
async fn api_key_is_shown_once_and_works_until_deleted() {
    let (_state, router, session) = admin_session().await;

    let (status, created) = call(
        &router,
        Method::POST,
        "/api/admin/apikeys",
        &session,
        Some(json!({ "name": "ci", "groups": ["ops"], "expires_in_days": 30 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let key = created["key"].as_str().unwrap().to_string();
    let id = created["api_key"]["id"].as_i64().unwrap();
    assert_eq!(created["api_key"]["key_prefix"], &key[..8]);
    assert!(created["api_key"].get("key_hash").is_none());

    let (_, listed) = call(&router, Method::GET, "/api/admin/apikeys", &session, None).await;
    assert!(listed.to_string().find(&key).is_none());

    let me = |key: &str| {
        request(Method::GET, "/api/me", "10.0.0.9:1")
            .header("x-api-key", key)
            .body(Body::empty())
            .unwrap()
    };
    let response = send(&router, me(&key)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["user"]["username"], "root");
    assert_eq!(body["user"]["groups"], json!(["ops"]));

    let (status, _) = call(&router, Method::DELETE, &format!("/api/admin/apikeys/{id}"), &session, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(send(&router, me(&key)).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn system_config_redacts_and_keeps_secrets() {
    let (state, router, session) = admin_session().await;

    let mut settings = (*state.settings.snapshot()).clone();
    settings.ldap.bind_password = "hunter22".into();
    state.settings.publish(settings).await.unwrap();

    let (status, config) = call(&router, Method::GET, "/api/admin/system-config", &session, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["ldap"]["bind_password"], REDACTED);

    let mut update = config.clone();
    update["proxy"] = json!({ "enabled": true, "trusted_proxies": ["10.0.0.0/8", "192.168.1.1"] });
    let (status, saved) = call(&router, Method::PUT, "/api/admin/system-config", &session, Some(update)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(saved["ldap"]["bind_password"], REDACTED);
    assert_eq!(state.settings.snapshot().ldap.bind_password, "hunter22");
    assert!(state.settings.snapshot().proxy.enabled);
}

#[tokio::test]
async fn system_config_is_validated() {
    let (_state, router, session) = admin_session().await;
    let (_, config) = call(&router, Method::GET, "/api/admin/system-config", &session, None).await;

    let mut no_admins = config.clone();
    no_admins["admin_groups"] = json!([" "]);
    let (status, _) = call(&router, Method::PUT, "/api/admin/system-config", &session, Some(no_admins)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut bad_proxy = config.clone();
    bad_proxy["proxy"]["trusted_proxies"] = json!(["not-an-address"]);
    let (status, body) = call(&router, Method::PUT, "/api/admin/system-config", &session, Some(bad_proxy)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid trusted proxy \"not-an-address\"");
}

#[tokio::test]
async fn audit_limit_is_clamped() {
    let (state, router, session) = admin_session().await;
    for i in 0..5 {
        state.store.record_audit("root", "test", &i.to_string(), "").await;
    }
    let (status, rows) = call(&router, Method::GET, "/api/admin/audit?limit=2", &session, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rows.as_array().unwrap().len(), 2);
    assert_eq!(rows[0]["detail"], "4");

    let (_, rows) = call(&router, Method::GET, "/api/admin/audit?limit=0", &session, None).await;
    assert_eq!(rows.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_discovery_source_is_not_found() {
    let (_state, router, session) = admin_session().await;
    let (status, _) = call(&router, Method::GET, "/api/admin/discovery/kubernetes", &session, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(
        &router,
        Method::PUT,
        "/api/admin/discovery/traefik",
        &session,
        Some(json!({ "enabled": true, "url": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "traefik needs a URL");
}

#[tokio::test]
async fn malformed_source_locations_are_refused() {
    let (state, router, session) = admin_session().await;

    for (source, url) in [
        ("traefik", "traefik:8080"),
        ("caddy", "caddy admin"),
        ("npm", "ftp://npm.lan"),
        ("nginx", "conf.d"),
        ("docker", "unix://docker.sock"),
    ] {
        let (status, _) = call(
            &router,
            Method::PUT,
            &format!("/api/admin/discovery/{source}"),
            &session,
            Some(json!({ "enabled": true, "url": url })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{source} {url}");
    }
    let settings = state.settings.snapshot();
    assert!(settings.sources.values().all(|s| !s.enabled));

    let (status, _) = call(
        &router,
        Method::PUT,
        "/api/admin/discovery/nginx",
        &session,
        Some(json!({ "enabled": false, "url": "/etc/nginx" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn pinned_sources_refuse_edits() {
    let mut config = test_config();
    config.discovery.pinned.insert(
        dashgate::discovery::SourceTag::Npm,
        dashgate::settings::SourceSettings {
            enabled: false,
            url: "http://npm.lan:81".into(),
            username: "admin@example.com".into(),
            password: "secret".into(),
        },
    );
    let (state, router) = app_with(config).await;
    create_user(&state, "root", &["admin"]).await;
    let session = login(&router, "root", "10.0.0.5:40000").await;

    let (status, view) = call(&router, Method::GET, "/api/admin/discovery/npm", &session, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["pinned"], true);
    assert_eq!(view["settings"]["password"], REDACTED);

    let (status, _) = call(
        &router,
        Method::PUT,
        "/api/admin/discovery/npm",
        &session,
        Some(json!({ "enabled": false, "url": "http://other:81" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn secrets_survive_a_wrong_key() {
    use tokio_util::sync::CancellationToken;

    let store = dashgate::store::Store::in_memory().await.unwrap();
    let build = |key: &str| {
        let mut config = test_config();
        config.encryption_key = Some(key.repeat(32));
        dashgate::server::AppState::build(
            config,
            store.clone(),
            std::sync::Arc::new(dashgate::apps::AppCatalog::from_file(catalog())),
            CancellationToken::new(),
        )
    };

    let first = build("aa").await.unwrap();
    let mut settings = (*first.settings.snapshot()).clone();
    settings.oidc.client_secret = "client-secret".into();
    first.settings.publish(settings).await.unwrap();
    let stored = store.load_settings().await.unwrap()["oidc_client_secret"].clone();
    assert_ne!(stored, "client-secret");

    let wrong = build("bb").await.unwrap();
    assert_eq!(wrong.settings.snapshot().oidc.client_secret, "");
    assert_eq!(store.load_settings().await.unwrap()["oidc_client_secret"], stored);

    let right = build("aa").await.unwrap();
    assert_eq!(right.settings.snapshot().oidc.client_secret, "client-secret");
}
