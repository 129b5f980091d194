// src/api.rs
//! Thin HTTP adapter over [`DetectionEngine`]. No business logic lives here.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shuttle_axum::axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::engine::{DetectionEngine, GenerateKeywordsRequest};
use crate::error::DetectionError;
use crate::model::{Category, CategoryId, DetectionInput, KeywordId, NewKeyword, StatsId};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DetectionEngine>,
}

pub fn router(engine: Arc<DetectionEngine>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/detect", post(detect))
        .route("/detect/standard", post(detect_standard))
        .route("/detect/direct", post(detect_direct))
        .route("/detect/confirm", post(confirm))
        .route("/learning/feedback", post(learn_feedback))
        .route("/learning/improve", post(learn_improve))
        .route("/learning/scheduled", post(learn_scheduled))
        .route("/keywords", post(add_keywords))
        .route("/keywords/{id}/disable", post(disable_keyword))
        .route("/keywords/generate", post(generate_keywords))
        .route("/keywords/generate-all", post(generate_all))
        .route("/keywords/stats", get(keyword_stats))
        .route("/keywords/needing", get(needing_keywords))
        .route("/metrics/accuracy", get(accuracy))
        .layer(CorsLayer::very_permissive())
        .with_state(AppState { engine })
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// Maps the domain taxonomy onto HTTP status codes.
struct ApiError(DetectionError);

impl From<DetectionError> for ApiError {
    fn from(e: DetectionError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DetectionError::Validation(_) => StatusCode::BAD_REQUEST,
            DetectionError::NotFound(_) => StatusCode::NOT_FOUND,
            DetectionError::Concurrency(_) => StatusCode::CONFLICT,
            DetectionError::ExternalService(_) => StatusCode::BAD_GATEWAY,
            DetectionError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(target: "api", kind = self.0.kind(), error = %self.0, "request failed");
        }
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn detect(State(state): State<AppState>, Json(input): Json<DetectionInput>) -> Response {
    match state.engine.detect_with_ai_fallback(&input).await {
        Ok(r) => Json(r).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn detect_standard(
    State(state): State<AppState>,
    Json(input): Json<DetectionInput>,
) -> Response {
    match state.engine.detect_category(&input).await {
        Ok(r) => Json(r).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn detect_direct(State(state): State<AppState>, Json(input): Json<DetectionInput>) -> Response {
    match state.engine.select_category_directly(&input).await {
        Ok(r) => Json(r).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

/// Either `{stats_id, correct_category_id}` or
/// `{stats_id, confirmed, corrected_category_id?}`.
#[derive(Deserialize)]
struct ConfirmReq {
    stats_id: StatsId,
    #[serde(default)]
    correct_category_id: Option<CategoryId>,
    #[serde(default)]
    confirmed: Option<bool>,
    #[serde(default)]
    corrected_category_id: Option<CategoryId>,
}

#[derive(Serialize)]
struct ConfirmResp {
    stats_id: StatsId,
    outcome: crate::model::FeedbackOutcome,
}

async fn confirm(State(state): State<AppState>, Json(body): Json<ConfirmReq>) -> ApiResult<ConfirmResp> {
    let outcome = match (body.correct_category_id, body.confirmed) {
        (Some(correct), _) => state.engine.confirm_detection(body.stats_id, correct).await?,
        (None, Some(confirmed)) => {
            state
                .engine
                .confirm_feedback(body.stats_id, confirmed, body.corrected_category_id)
                .await?
        }
        (None, None) => {
            return Err(ApiError(DetectionError::Validation(
                "either correct_category_id or confirmed is required".into(),
            )))
        }
    };
    Ok(Json(ConfirmResp {
        stats_id: body.stats_id,
        outcome,
    }))
}

#[derive(Deserialize, Default)]
struct WindowQuery {
    #[serde(default)]
    days: Option<u32>,
}

async fn learn_feedback(
    State(state): State<AppState>,
    Query(q): Query<WindowQuery>,
) -> ApiResult<crate::learning::FeedbackLearning> {
    Ok(Json(state.engine.learn_from_feedback(q.days).await?))
}

async fn learn_improve(State(state): State<AppState>) -> ApiResult<crate::learning::KeywordImprovement> {
    Ok(Json(state.engine.auto_improve_keywords().await?))
}

#[derive(Serialize)]
struct Accepted {
    status: &'static str,
}

/// Runs in the background; the caller only learns whether it was started.
async fn learn_scheduled(State(state): State<AppState>) -> Response {
    if state.engine.learning().is_running() {
        return ApiError(DetectionError::Concurrency("learning already running".into())).into_response();
    }
    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.scheduled_learning().await {
            tracing::warn!(target: "learning", error = %e, "background learning failed");
        }
    });
    (StatusCode::ACCEPTED, Json(Accepted { status: "started" })).into_response()
}

#[derive(Serialize)]
struct Inserted {
    inserted: usize,
}

async fn add_keywords(
    State(state): State<AppState>,
    Json(rows): Json<Vec<NewKeyword>>,
) -> ApiResult<Inserted> {
    let inserted = state.engine.add_keywords(rows).await?;
    Ok(Json(Inserted { inserted }))
}

async fn disable_keyword(State(state): State<AppState>, Path(id): Path<KeywordId>) -> Response {
    match state.engine.disable_keyword(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn generate_keywords(
    State(state): State<AppState>,
    Json(req): Json<GenerateKeywordsRequest>,
) -> ApiResult<crate::engine::GenerationOutcome> {
    Ok(Json(state.engine.generate_keywords_for_category(req).await?))
}

#[derive(Deserialize, Default)]
struct GenerateAllReq {
    #[serde(default)]
    categories: Option<Vec<Category>>,
    #[serde(default)]
    min_keywords: Option<usize>,
}

async fn generate_all(
    State(state): State<AppState>,
    body: Option<Json<GenerateAllReq>>,
) -> ApiResult<crate::engine::BulkOutcome> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    Ok(Json(
        state
            .engine
            .generate_keywords_for_all_categories(req.categories, req.min_keywords)
            .await?,
    ))
}

#[derive(Deserialize)]
struct StatsQuery {
    #[serde(default)]
    category_id: Option<i64>,
}

async fn keyword_stats(
    State(state): State<AppState>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<crate::introspection::KeywordStats> {
    Ok(Json(
        state
            .engine
            .get_keyword_stats(q.category_id.map(CategoryId))
            .await?,
    ))
}

#[derive(Deserialize)]
struct NeedingQuery {
    #[serde(default)]
    min_keywords: Option<usize>,
}

async fn needing_keywords(
    State(state): State<AppState>,
    Query(q): Query<NeedingQuery>,
) -> ApiResult<Vec<crate::introspection::CategoryCoverage>> {
    let min = q
        .min_keywords
        .unwrap_or(state.engine.config().learning.min_keywords);
    Ok(Json(state.engine.get_categories_needing_keywords(min).await?))
}

async fn accuracy(
    State(state): State<AppState>,
    Query(q): Query<WindowQuery>,
) -> ApiResult<crate::introspection::AccuracyMetrics> {
    let days = q.days.unwrap_or(state.engine.config().learning.window_days);
    Ok(Json(state.engine.get_accuracy_metrics(days).await?))
}
