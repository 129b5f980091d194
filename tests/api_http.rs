// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.

mod common;

use serde_json::json;
use serde_json::Value as Json;
use shuttle_axum::axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use tower::ServiceExt as _; // for `oneshot`

use category_detector::api;
use common::*;

const BODY_LIMIT: usize = 1024 * 1024;

async fn test_router() -> (Router, Harness) {
    let h = HarnessBuilder::new()
        .similarity(FixedSimilarity::new(&[(PHONES, 0.8)]))
        .build()
        .await;
    (api::router(h.engine.clone()), h)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Json>) -> (StatusCode, Json) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let resp = app
        .clone()
        .oneshot(req.body(body).expect("build request"))
        .await
        .expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body");
    let v = if bytes.is_empty() {
        Json::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Json::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, v)
}

#[tokio::test]
async fn api_health_returns_200_and_ok_body() {
    let (app, _h) = test_router().await;
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Json::String("OK".into()));
}

#[tokio::test]
async fn api_detect_returns_result_contract() {
    let (app, _h) = test_router().await;
    let (status, v) = send(
        &app,
        "POST",
        "/detect",
        Some(json!({ "title": "Apple iPhone 13 smartphone", "language": "en" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{v}");
    assert_eq!(v["category_id"], json!(1));
    assert_eq!(v["category_slug"], json!("mobile-phones"));
    assert_eq!(v["method"], json!("keyword+similarity"));
    assert!(v["confidence"].as_f64().unwrap() > 0.8);
    assert!(v.get("stats_id").is_some(), "missing 'stats_id'");
    assert!(v.get("processing_time_ms").is_some());
}

#[tokio::test]
async fn api_detect_rejects_empty_input() {
    let (app, _h) = test_router().await;
    for uri in ["/detect", "/detect/standard", "/detect/direct"] {
        let (status, v) = send(&app, "POST", uri, Some(json!({ "title": "   " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(v["error"], json!("validation"));
    }
}

#[tokio::test]
async fn api_confirm_round_trip() {
    let (app, _h) = test_router().await;
    let (_, detected) = send(
        &app,
        "POST",
        "/detect/standard",
        Some(json!({ "title": "iphone smartphone" })),
    )
    .await;
    let stats_id = detected["stats_id"].clone();

    let (status, v) = send(
        &app,
        "POST",
        "/detect/confirm",
        Some(json!({ "stats_id": stats_id, "correct_category_id": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{v}");
    assert_eq!(v["outcome"], json!("applied"));

    let (status, v) = send(
        &app,
        "POST",
        "/detect/confirm",
        Some(json!({ "stats_id": stats_id, "confirmed": false, "corrected_category_id": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["outcome"], json!("already_set"));

    let (status, v) = send(
        &app,
        "POST",
        "/detect/confirm",
        Some(json!({ "stats_id": "6a1f7c1e-0000-4000-8000-000000000000", "correct_category_id": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(v["error"], json!("not_found"));
}

#[tokio::test]
async fn api_learning_and_reports() {
    let (app, _h) = test_router().await;
    send(&app, "POST", "/detect", Some(json!({ "title": "iphone" }))).await;

    let (status, v) = send(&app, "POST", "/learning/feedback?days=7", None).await;
    assert_eq!(status, StatusCode::OK, "{v}");
    assert_eq!(v["window_days"], json!(7));

    let (status, v) = send(&app, "GET", "/metrics/accuracy?days=7", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["total_detections"], json!(1));

    let (status, v) = send(&app, "GET", "/keywords/stats?category_id=5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["category"]["category_id"], json!(5));

    let (status, v) = send(&app, "GET", "/keywords/needing?min_keywords=3", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v.as_array().map(Vec::len), Some(1));

    let (status, _) = send(&app, "POST", "/learning/scheduled", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn api_keyword_management() {
    let (app, h) = test_router().await;

    let (status, v) = send(
        &app,
        "POST",
        "/keywords",
        Some(json!([{
            "keyword": "jigsaw",
            "language": "en",
            "category_id": 5,
            "weight": 1.0,
            "keyword_type": "main",
            "source": "manual"
        }])),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{v}");
    assert_eq!(v["inserted"], json!(1));

    use category_detector::store::DetectionStore;
    let id = h
        .store
        .load_keywords()
        .await
        .unwrap()
        .into_iter()
        .find(|k| k.keyword == "jigsaw")
        .unwrap()
        .id;
    let (status, _) = send(&app, "POST", &format!("/keywords/{id}/disable"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, "POST", "/keywords/424242/disable", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // AI is disabled in this harness
    let (status, v) = send(
        &app,
        "POST",
        "/keywords/generate",
        Some(json!({ "category_id": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(v["error"], json!("external_service"));

    let (status, v) = send(
        &app,
        "POST",
        "/keywords/generate-all",
        Some(json!({ "min_keywords": 12 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{v}");
    assert_eq!(v["min_keywords"], json!(12));
    assert_eq!(v["failed"], v["categories_processed"]);
}
