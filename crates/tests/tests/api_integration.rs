use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use haven_api::{build_router, ApiConfig, ApiState, DEFAULT_API_KEY};
use haven_core::{Coordinates, NewService, RegionId, RegionType};
use haven_ml::HavenMlStack;
use haven_storage::{RegionStore, ServiceCatalog, Store};
use serde_json::{json, Value};
use tower::ServiceExt;

struct Fixture {
    app: Router,
    bc: RegionId,
    victoria: RegionId,
}

async fn fixture_with(config: ApiConfig) -> Fixture {
    let state = ApiState::new(Store::memory(), &HavenMlStack::rules_only(), config);
    let store = state.store.clone();

    let ca = store.insert_region("CA", RegionType::Country, None).await.unwrap();
    let bc = store.insert_region("BC", RegionType::Province, Some(ca)).await.unwrap();
    let crd = store.insert_region("CRD", RegionType::County, Some(bc)).await.unwrap();
    let victoria = store
        .insert_region("Victoria", RegionType::City, Some(crd))
        .await
        .unwrap();
    store
        .insert_service(
            NewService::new("ABC Dental", "Family dentistry", victoria, "101 Fort St")
                .with_coordinates(Coordinates::new(48.4243, -123.3626))
                .with_service_type(Some("Dentist".to_string())),
        )
        .await
        .unwrap();
    store
        .insert_service(
            NewService::new("Access Learning", "Tutoring", bc, "5 Elm St")
                .with_service_type(Some("Education".to_string())),
        )
        .await
        .unwrap();

    Fixture {
        app: build_router(state),
        bc,
        victoria,
    }
}

async fn fixture() -> Fixture {
    fixture_with(ApiConfig::default()).await
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-api-key", DEFAULT_API_KEY)
        .body(Body::empty())
        .unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-api-key", DEFAULT_API_KEY)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let Fixture { app, .. } = fixture().await;

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["backend"], "memory");
}

#[tokio::test]
async fn route_requires_api_key() {
    let Fixture { app, .. } = fixture().await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/route")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "text": "hello" }).to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn route_picks_self_harm_support() {
    let Fixture { app, .. } = fixture().await;

    let response = app
        .oneshot(post(
            "/v1/route",
            json!({ "text": "I keep thinking about hurting myself." }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["agent"], "self_harm_support");
    assert_eq!(body["fell_back"], false);
}

#[tokio::test]
async fn trained_router_serves_self_harm_support() {
    let stack = HavenMlStack::from_dataset(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../data/training/agents.jsonl"
    ));
    let app = build_router(ApiState::new(Store::memory(), &stack, ApiConfig::default()));

    let response = app
        .oneshot(post("/v1/route", json!({ "text": "I want to end my life" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["agent"], "self_harm_support");
    assert_eq!(body["model"], "majority-vote");
    assert_eq!(body["fell_back"], false);
}

#[tokio::test]
async fn message_returns_ranked_listings() {
    let Fixture { app, bc, .. } = fixture().await;

    let response = app
        .oneshot(post(
            "/v1/message",
            json!({
                "text": "I need a dentist near me",
                "region_id": bc.0,
                "latitude": 48.4284,
                "longitude": -123.3656,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["routing"]["agent"], "local_services");
    let listings = body["listings"].as_array().unwrap();
    assert_eq!(listings.len(), 2);
    assert_eq!(listings[0]["name"], "ABC Dental");
    assert!(listings[1]["distance_km"].is_null());
    assert!(body["plain_text"].as_str().unwrap().contains("Address: 101 Fort St"));
}

#[tokio::test]
async fn message_rejects_bad_coordinates() {
    let Fixture { app, .. } = fixture().await;

    let response = app
        .oneshot(post(
            "/v1/message",
            json!({ "text": "clinic near me", "latitude": 95.0, "longitude": 0.0 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn region_endpoints() {
    let Fixture { app, bc, victoria } = fixture().await;

    let response = app
        .clone()
        .oneshot(get(&format!("/v1/regions/{}/path", victoria.0)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["names"], json!(["CA", "BC", "CRD", "Victoria"]));

    let direct = json_body(
        app.clone()
            .oneshot(get(&format!("/v1/regions/{}/services", bc.0)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(direct.as_array().unwrap().len(), 1);

    let recursive = json_body(
        app.clone()
            .oneshot(get(&format!("/v1/regions/{}/services?recursive=true", bc.0)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(recursive.as_array().unwrap().len(), 2);

    let regions = json_body(app.clone().oneshot(get("/v1/regions")).await.unwrap()).await;
    assert_eq!(regions.as_array().unwrap().len(), 4);

    let types = json_body(app.clone().oneshot(get("/v1/service_types")).await.unwrap()).await;
    assert_eq!(types, json!(["Dentist", "Education"]));

    let missing = app.oneshot(get("/v1/regions/999/path")).await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rate_limiter_rejects_bursts() {
    let Fixture { app, .. } = fixture_with(ApiConfig {
        rate_limit_max: 2,
        rate_limit_window: Duration::from_secs(60),
        ..ApiConfig::default()
    })
    .await;

    for _ in 0..2 {
        let response = app.clone().oneshot(get("/v1/regions")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let limited = app.clone().oneshot(get("/v1/regions")).await.unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers().contains_key("retry-after"));

    // health stays reachable
    let health = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
}
