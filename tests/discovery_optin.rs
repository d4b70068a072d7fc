//! Discovered routes stay admin-only until an override grants groups

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, StatusCode, header};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use common::*;
use dashgate::Result;
use dashgate::discovery::{DiscoveredApp, DiscoveryManager, RouteSource, SourceTag};
use dashgate::server::{AppState, create_router};
use dashgate::settings::SourceSettings;

struct StaticRoutes;

#[async_trait]
impl RouteSource for StaticRoutes {
    fn tag(&self) -> SourceTag {
        SourceTag::Traefik
    }

    async fn poll(&self, settings: &SourceSettings) -> Result<Vec<DiscoveredApp>> {
        assert_eq!(settings.url, "http://traefik:8080");
        Ok(vec![DiscoveredApp::new("grafana", "https://grafana.lan")])
    }
}

async fn discovery_app() -> (Arc<AppState>, Router, String, String) {
    let mut state = build_state(test_config()).await;
    state.discovery = Arc::new(DiscoveryManager::with_sources(
        vec![Arc::new(StaticRoutes)],
        &state.config.discovery,
        Arc::clone(&state.settings),
        state.store.clone(),
        CancellationToken::new(),
    ));
    let state = Arc::new(state);
    let router = create_router(Arc::clone(&state));

    create_user(&state, "root", &["admin"]).await;
    create_user(&state, "alice", &["media"]).await;
    let root = login(&router, "root", "10.0.0.5:1").await;
    let alice = login(&router, "alice", "10.0.0.6:1").await;
    (state, router, root, alice)
}

async fn dashboard(router: &Router, session: &str) -> Value {
    let response = send(router, authed(Method::GET, "/", session).body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

fn categories(view: &Value) -> Vec<(String, Vec<String>)> {
    view["categories"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| {
            let apps = c["apps"]
                .as_array()
                .unwrap()
                .iter()
                .map(|a| a["name"].as_str().unwrap().to_string())
                .collect();
            (c["name"].as_str().unwrap().to_string(), apps)
        })
        .collect()
}

async fn json_call(router: &Router, method: Method, uri: &str, session: &str, body: Value) -> StatusCode {
    send(
        router,
        authed(method, uri, session)
            .header(header::CONTENT_TYPE, "application/json")
            .body(json_body(&body))
            .unwrap(),
    )
    .await
    .status()
}

async fn enable_traefik(state: &AppState, router: &Router, root: &str) {
    let status = json_call(
        router,
        Method::PUT,
        "/api/admin/discovery/traefik",
        root,
        json!({ "enabled": true, "url": "http://traefik:8080", "password": "s3cret" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let worker = state.discovery.worker(SourceTag::Traefik).unwrap();
    for _ in 0..200 {
        if !worker.snapshot().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("discovery never produced routes");
}

#[tokio::test]
async fn discovered_routes_need_an_override() {
    let (state, router, root, alice) = discovery_app().await;
    enable_traefik(&state, &router, &root).await;

    assert_eq!(
        categories(&dashboard(&router, &alice).await),
        vec![("Media".to_string(), vec!["Jellyfin".to_string()])]
    );
    assert_eq!(
        categories(&dashboard(&router, &root).await),
        vec![
            ("Media".to_string(), vec!["Jellyfin".to_string(), "Proxmox".to_string()]),
            ("Discovered".to_string(), vec!["grafana".to_string()]),
        ]
    );

    let status = json_call(
        &router,
        Method::PUT,
        "/api/admin/discovered-apps",
        &root,
        json!({ "url": "https://grafana.lan", "name": "Grafana", "category": "Monitoring", "groups": ["media"] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        categories(&dashboard(&router, &alice).await),
        vec![
            ("Media".to_string(), vec!["Jellyfin".to_string()]),
            ("Monitoring".to_string(), vec!["Grafana".to_string()]),
        ]
    );

    let response = send(
        &router,
        authed(Method::GET, "/api/admin/discovered-apps", &root).body(Body::empty()).unwrap(),
    )
    .await;
    let listed = body_json(response).await;
    assert_eq!(listed[0]["url"], "https://grafana.lan");
    assert_eq!(listed[0]["source"], "traefik");
    assert_eq!(listed[0]["override"]["groups"], json!(["media"]));

    let delete = |session: &str| {
        authed(Method::DELETE, "/api/admin/discovered-apps?url=https%3A%2F%2Fgrafana.lan", session)
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(send(&router, delete(&alice)).await.status(), StatusCode::FORBIDDEN);
    assert_eq!(send(&router, delete(&root)).await.status(), StatusCode::NO_CONTENT);
    assert_eq!(send(&router, delete(&root)).await.status(), StatusCode::NOT_FOUND);

    assert_eq!(
        categories(&dashboard(&router, &alice).await),
        vec![("Media".to_string(), vec!["Jellyfin".to_string()])]
    );
}

#[tokio::test]
async fn hidden_override_leaves_the_route_to_admins() {
    let (state, router, root, alice) = discovery_app().await;
    enable_traefik(&state, &router, &root).await;

    let status = json_call(
        &router,
        Method::PUT,
        "/api/admin/discovered-apps",
        &root,
        json!({ "url": "https://grafana.lan", "groups": ["media"], "hidden": true }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        categories(&dashboard(&router, &alice).await),
        vec![("Media".to_string(), vec!["Jellyfin".to_string()])]
    );
    let view = dashboard(&router, &root).await;
    assert_eq!(
        categories(&view),
        vec![
            ("Media".to_string(), vec!["Jellyfin".to_string(), "Proxmox".to_string()]),
            ("Discovered".to_string(), vec!["grafana".to_string()]),
        ]
    );
    assert_eq!(view["categories"][1]["apps"][0]["hidden"], true);
    assert!(view["categories"][0]["apps"][0].get("hidden").is_none());
}

async fn serve_ok() -> String {
    let app = Router::new().route("/", axum::routing::get(|| async { "up" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

#[tokio::test]
async fn health_follows_the_overridden_url() {
    let (state, router, root, alice) = discovery_app().await;
    enable_traefik(&state, &router, &root).await;

    let target = serve_ok().await;
    let status = json_call(
        &router,
        Method::PUT,
        "/api/admin/discovered-apps",
        &root,
        json!({ "url": "https://grafana.lan", "new_url": target, "groups": ["media"] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let urls = state.discovery.urls().await.unwrap();
    assert_eq!(urls, vec![target.clone()]);
    state.health.run_once(urls).await;

    let view = dashboard(&router, &alice).await;
    let grafana = &view["categories"][1]["apps"][0];
    assert_eq!(grafana["url"], target.as_str());
    assert_eq!(grafana["status"], "online");
}

#[tokio::test]
async fn source_view_redacts_and_disabling_clears_routes() {
    let (state, router, root, _alice) = discovery_app().await;
    enable_traefik(&state, &router, &root).await;

    let response = send(
        &router,
        authed(Method::GET, "/api/admin/discovery/traefik", &root).body(Body::empty()).unwrap(),
    )
    .await;
    let view = body_json(response).await;
    assert_eq!(view["running"], true);
    assert_eq!(view["pinned"], false);
    assert_eq!(view["settings"]["password"], dashgate::settings::REDACTED);
    assert_eq!(view["apps"][0]["url"], "https://grafana.lan");

    let status = json_call(
        &router,
        Method::PUT,
        "/api/admin/discovery/traefik",
        &root,
        json!({ "enabled": false, "url": "http://traefik:8080", "password": dashgate::settings::REDACTED }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state.settings.source(SourceTag::Traefik).password, "s3cret");
    assert!(state.discovery.worker(SourceTag::Traefik).unwrap().snapshot().is_empty());
    assert_eq!(
        categories(&dashboard(&router, &root).await),
        vec![("Media".to_string(), vec!["Jellyfin".to_string(), "Proxmox".to_string()])]
    );
}
