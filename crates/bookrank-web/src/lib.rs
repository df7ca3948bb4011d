//! Read-only JSON API over ingested rankings.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bookrank_adapters::{RankingSource, SourceError};
use bookrank_core::PeriodType;
use bookrank_storage::{SqliteRepository, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bookrank-web";

pub const DEFAULT_LIMIT: u32 = 10;
pub const MAX_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct AppState {
    pub repo: SqliteRepository,
    /// Live source behind `/api/rakuten/rankings`; that route answers 503 without one.
    pub source: Option<Arc<dyn RankingSource>>,
}

impl AppState {
    pub fn new(repo: SqliteRepository) -> Self {
        Self { repo, source: None }
    }

    pub fn with_source(mut self, source: Arc<dyn RankingSource>) -> Self {
        self.source = Some(source);
        self
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    time: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
struct RankingsQuery {
    period: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LiveRankingQuery {
    period: Option<String>,
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    Upstream(SourceError),
    Internal(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Upstream(err) => {
                warn!(kind = err.kind(), error = %err, "live ranking fetch failed");
                (StatusCode::BAD_GATEWAY, format!("ranking source error: {err}"))
            }
            ApiError::Internal(err) => {
                error!(error = %err, "read api query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid {what} id: {raw}")))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/rankings/{category_id}", get(rankings_handler))
        .route("/api/books/{book_id}", get(book_handler))
        .route("/api/categories", get(categories_handler))
        .route("/api/rakuten/rankings/{genre_id}", get(live_rankings_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "read api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        time: Utc::now(),
    })
}

async fn rankings_handler(
    State(state): State<Arc<AppState>>,
    Path(category_id): Path<String>,
    Query(query): Query<RankingsQuery>,
) -> Result<Response, ApiError> {
    let category_id = parse_id(&category_id, "category")?;
    let period = PeriodType::from_label_or_default(query.period.as_deref().unwrap_or("daily"));
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    match state.repo.top_rankings(category_id, period, limit).await? {
        Some(page) => Ok(Json(page).into_response()),
        None => Err(ApiError::NotFound(format!("category {category_id} not found"))),
    }
}

async fn book_handler(
    State(state): State<Arc<AppState>>,
    Path(book_id): Path<String>,
) -> Result<Response, ApiError> {
    let book_id = parse_id(&book_id, "book")?;
    match state.repo.book(book_id).await? {
        Some(book) => Ok(Json(book).into_response()),
        None => Err(ApiError::NotFound(format!("book {book_id} not found"))),
    }
}

async fn categories_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let categories = state.repo.categories().await?;
    Ok(Json(categories).into_response())
}

async fn live_rankings_handler(
    State(state): State<Arc<AppState>>,
    Path(genre_id): Path<String>,
    Query(query): Query<LiveRankingQuery>,
) -> Result<Response, ApiError> {
    let Some(source) = state.source.as_ref() else {
        return Err(ApiError::Unavailable("no ranking source configured".to_string()));
    };
    let period = PeriodType::from_label_or_default(query.period.as_deref().unwrap_or("daily"));
    let ranking = source
        .fetch(&genre_id, period)
        .await
        .map_err(ApiError::Upstream)?;
    Ok(Json(ranking).into_response())
}
