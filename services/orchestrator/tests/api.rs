//! HTTP API integration tests.
//!
//! Exercises the router end to end with a MockRuntime behind the
//! lifecycle manager, asserting response codes and problem+json bodies
//! without binding a socket.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header::CONTENT_TYPE, Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::util::ServiceExt;

use minerd_orchestrator::api;
use minerd_orchestrator::lifecycle::LifecycleManager;
use minerd_orchestrator::ports::PortAllocator;
use minerd_orchestrator::routing::RoutingTable;
use minerd_orchestrator::runtime::MockRuntime;
use minerd_orchestrator::state::AppState;
use minerd_orchestrator::store::StateStore;

fn test_app() -> Router {
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let ports = Arc::new(PortAllocator::new(5000, 5009));
    let runtime = Arc::new(MockRuntime::new());
    let routes = Arc::new(RoutingTable::new());

    let lifecycle = LifecycleManager::new(
        store.clone(),
        ports,
        runtime,
        routes.clone(),
        Duration::from_secs(1),
        2,
    );
    api::create_router(AppState::new(lifecycle, routes, store))
}

fn request(method: Method, uri: &str, tenant: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(tenant) = tenant {
        builder = builder.header("x-tenant-id", tenant);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_healthz() {
    let app = test_app();
    let response = app
        .oneshot(request(Method::GET, "/healthz", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "minerd");
}

#[tokio::test]
async fn test_missing_tenant_header_is_unauthorized() {
    let app = test_app();
    let response = app
        .oneshot(request(
            Method::POST,
            "/v1/workloads/drops-miner/start",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[CONTENT_TYPE],
        "application/problem+json"
    );

    let body = body_json(response).await;
    assert_eq!(body["code"], "missing_tenant");
    assert!(body["request_id"].is_string());
}

#[tokio::test]
async fn test_invalid_tenant_id_rejected() {
    let app = test_app();
    let response = app
        .oneshot(request(
            Method::POST,
            "/v1/workloads/drops-miner/start",
            Some("no spaces allowed"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["code"], "invalid_tenant");
}

#[tokio::test]
async fn test_unknown_workload_rejected() {
    let app = test_app();
    let response = app
        .oneshot(request(
            Method::POST,
            "/v1/workloads/bitcoin-miner/start",
            Some("alice"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["code"], "unknown_workload");
}

#[tokio::test]
async fn test_start_status_route_stop_round_trip() {
    let app = test_app();

    let response = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/v1/workloads/drops-miner/start",
            Some("alice"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["state"], "running");
    assert_eq!(body["workload"], "drops-miner");
    assert_eq!(body["port"], 5000);

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/v1/status", Some("alice")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["tenant"], "alice");
    assert_eq!(body["instances"].as_array().unwrap().len(), 1);
    assert_eq!(body["instances"][0]["state"], "running");
    assert!(body["instances"][0]["since"].is_i64());
    assert!(body["instances"][0].get("updated_at").is_none());

    let response = app
        .clone()
        .oneshot(request(
            Method::GET,
            "/v1/workloads/drops-miner/route",
            Some("alice"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["upstream"], "127.0.0.1:5000");
    assert_eq!(body["artifact"], "web-ui");

    let response = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/v1/workloads/drops-miner/stop",
            Some("alice"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["state"], "stopped");

    // Route is gone once the instance stops.
    let response = app
        .oneshot(request(
            Method::GET,
            "/v1/workloads/drops-miner/route",
            Some("alice"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_double_start_conflicts() {
    let app = test_app();

    let response = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/v1/workloads/drops-miner/start",
            Some("alice"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(request(
            Method::POST,
            "/v1/workloads/drops-miner/start",
            Some("alice"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let body = body_json(response).await;
    assert_eq!(body["code"], "instance_conflict");
    assert_eq!(body["retryable"], true);
}

#[tokio::test]
async fn test_quota_exceeded() {
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let routes = Arc::new(RoutingTable::new());
    let lifecycle = LifecycleManager::new(
        store.clone(),
        Arc::new(PortAllocator::new(5000, 5009)),
        Arc::new(MockRuntime::new()),
        routes.clone(),
        Duration::from_secs(1),
        1,
    );
    let app = api::create_router(AppState::new(lifecycle, routes, store));

    let response = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/v1/workloads/drops-miner/start",
            Some("alice"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(request(
            Method::POST,
            "/v1/workloads/points-miner-v2/start",
            Some("alice"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let body = body_json(response).await;
    assert_eq!(body["code"], "quota_exceeded");
}

#[tokio::test]
async fn test_stop_without_instance_is_not_found() {
    let app = test_app();
    let response = app
        .oneshot(request(
            Method::POST,
            "/v1/workloads/drops-miner/stop",
            Some("alice"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = body_json(response).await;
    assert_eq!(body["code"], "instance_not_found");
}

#[tokio::test]
async fn test_tenants_cannot_see_each_other() {
    let app = test_app();

    app.clone()
        .oneshot(request(
            Method::POST,
            "/v1/workloads/drops-miner/start",
            Some("alice"),
        ))
        .await
        .unwrap();

    // Bob's status is empty and bob cannot resolve alice's route.
    let response = app
        .clone()
        .oneshot(request(Method::GET, "/v1/status", Some("bob")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["instances"].as_array().unwrap().len(), 0);

    let response = app
        .oneshot(request(
            Method::GET,
            "/v1/workloads/drops-miner/route",
            Some("bob"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
