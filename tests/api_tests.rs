mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tower::ServiceExt;

use alphaflow::api::create_router;
use alphaflow::db::{DeploymentRepo, MemoryStore, Store};
use alphaflow::errors::PipelineError;
use alphaflow::models::Venue;
use alphaflow::services::{HealthRegistry, Scheduler, Stage};
use alphaflow::venues::VenueRegistry;
use alphaflow::AppState;

use common::ScriptedVenue;

struct TestApp {
    router: axum::Router,
    store: Arc<MemoryStore>,
    health: HealthRegistry,
}

async fn build_test_app(extra: &[(&str, &str)]) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    common::seed_world(&store, &[Venue::Hyperliquid]).await;
    let venue = Arc::new(ScriptedVenue::new(Venue::Hyperliquid, &["BTC"]));
    let config = common::test_config(extra);
    let pipeline = common::build_pipeline(store.clone(), VenueRegistry::new().with(venue), &config);
    let health = HealthRegistry::new();

    let dyn_store: Arc<dyn Store> = store.clone();
    let state = AppState {
        store: dyn_store,
        pipeline,
        config: Arc::new(config),
        metrics_handle: PrometheusBuilder::new().build_recorder().handle(),
        notifier: None,
        health: health.clone(),
    };

    TestApp {
        router: create_router(state),
        store,
        health,
    }
}

async fn send(router: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn candidate_body(event: &str, side: &str, confidence: f64) -> Value {
    json!({
        "sourceIdentity": "inst:desk-1",
        "sourceKind": "INSTITUTE",
        "externalEventId": event,
        "tokenSymbols": ["BTC"],
        "side": side,
        "confidence": confidence,
    })
}

#[tokio::test]
async fn test_health_check() {
    let app = build_test_app(&[]).await;

    let (status, json) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["store"], "connected");
}

#[tokio::test]
async fn test_health_degrades_after_fatal_cycle() {
    let app = build_test_app(&[]).await;
    let scheduler = Scheduler::new(Stage::Settlement, Duration::from_secs(60), app.health.clone());
    scheduler
        .run_cycle(|| async { Err(PipelineError::Fatal("store gone".into())) })
        .await;

    let (status, json) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["workers"][0]["name"], "settlement");
}

#[tokio::test]
async fn test_candidate_intake_outcomes() {
    let app = build_test_app(&[]).await;

    let (status, json) = send(&app.router, post_json("/api/candidates", &candidate_body("e1", "long", 0.9))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["outcome"], "accepted");
    assert_eq!(json["data"]["signal"]["token_symbol"], "BTC");

    let (status, json) = send(&app.router, post_json("/api/candidates", &candidate_body("e1", "long", 0.9))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["outcome"], "duplicate");

    let (status, json) = send(&app.router, post_json("/api/candidates", &candidate_body("e2", "hold", 0.9))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["success"], false);

    let (status, json) = send(&app.router, get("/api/integrity-rejections")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"].as_array().unwrap().len(), 1);

    let (_, json) = send(&app.router, get("/api/signals")).await;
    assert_eq!(json["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_token_required_when_configured() {
    let app = build_test_app(&[("API_TOKEN", "s3cret")]).await;

    let (status, _) = send(&app.router, get("/api/signals")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/api/signals")
        .header("authorization", "Bearer nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app.router, wrong).await.0, StatusCode::UNAUTHORIZED);

    let right = Request::builder()
        .uri("/api/signals")
        .header("authorization", "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app.router, right).await.0, StatusCode::OK);

    // Health stays public.
    assert_eq!(send(&app.router, get("/health")).await.0, StatusCode::OK);
}

#[tokio::test]
async fn test_intent_state_filter_is_validated() {
    let app = build_test_app(&[]).await;

    let (status, json) = send(&app.router, get("/api/intents?state=open")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["data"].is_array());

    let (status, _) = send(&app.router, get("/api/intents?state=teleported")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_closing_unknown_position_is_404() {
    let app = build_test_app(&[]).await;
    let uri = format!("/api/positions/{}/close", uuid::Uuid::new_v4());

    let (status, _) = send(&app.router, post_json(&uri, &json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app.router, post_json(&uri, &json!({ "exitPrice": "-1" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_reconcile_unknown_intent_is_404() {
    let app = build_test_app(&[]).await;
    let uri = format!("/api/intents/{}/reconcile", uuid::Uuid::new_v4());

    let (status, _) = send(&app.router, post_json(&uri, &json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_wallet_claim_exhaustion_is_conflict() {
    let app = build_test_app(&[]).await;

    let (status, json) = send(
        &app.router,
        post_json(
            "/api/wallets",
            &json!({ "venue": "OSTIUM", "address": "0xabc", "credentialRef": "vault://ostium/1" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["data"]["address"], "0xabc");

    let claim = json!({ "userId": "user-2", "venue": "OSTIUM" });
    let (status, json) = send(&app.router, post_json("/api/wallets/claim", &claim)).await;
    assert_eq!(status, StatusCode::OK);
    let slot_id = json["data"]["id"].as_str().unwrap().to_string();

    // The same user gets the same slot back.
    let (_, again) = send(&app.router, post_json("/api/wallets/claim", &claim)).await;
    assert_eq!(again["data"]["id"], slot_id.as_str());

    let other = json!({ "userId": "user-3", "venue": "OSTIUM" });
    let (status, _) = send(&app.router, post_json("/api/wallets/claim", &other)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, json) = send(
        &app.router,
        post_json(&format!("/api/wallets/{slot_id}/release"), &json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"], true);

    let (status, _) = send(&app.router, post_json("/api/wallets/claim", &other)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_deployment_pnl_requires_known_deployment() {
    let app = build_test_app(&[]).await;

    let (status, json) = send(&app.router, get("/api/deployments")).await;
    assert_eq!(status, StatusCode::OK);
    let id = json["data"][0]["id"].as_str().unwrap().to_string();

    let (status, json) = send(&app.router, get(&format!("/api/deployments/{id}/pnl"))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["data"].as_array().unwrap().is_empty());

    let missing = format!("/api/deployments/{}/pnl", uuid::Uuid::new_v4());
    assert_eq!(send(&app.router, get(&missing)).await.0, StatusCode::NOT_FOUND);
    assert_eq!(app.store.list_deployments().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = build_test_app(&[]).await;

    let resp = app.router.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
