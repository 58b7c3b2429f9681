//! HTTP API over the core: file acceptance, knowledge search, grounded
//! chat, and health.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/files` | Accept an uploaded file record and enqueue processing |
//! | `GET` | `/files/{id}` | File record with processing status |
//! | `DELETE` | `/files/{id}` | Delete a file, its analysis, and its chunks |
//! | `GET` | `/files/{id}/analysis` | Stored analysis for a file |
//! | `POST` | `/knowledge/search` | Similarity search over the caller's chunks |
//! | `POST` | `/chat` | Streamed grounded answer; sources in `X-Sources` header |
//! | `GET` | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `rate_limited` (429, with `Retry-After`), `internal` (500). Provider
//! error details never reach a response body.
//!
//! # Auth Boundary
//!
//! Authentication happens upstream; the authenticated user id arrives in
//! the `x-user-id` header and is trusted as the tenant scope. Rate
//! limiting is likewise upstream middleware.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::chat::ChatService;
use crate::config::Config;
use crate::error::Error;
use crate::models::{ChatMessage, FileRecord, FileStatus, SearchResult};
use crate::queue::{JobQueue, ProcessJob};
use crate::retriever::{Retriever, SearchOptions};
use crate::store::Store;

/// Upper bound on a single chat message's content.
const MAX_MESSAGE_CHARS: usize = 32_000;
/// Upper bound on a search query.
const MAX_QUERY_CHARS: usize = 1_000;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub retriever: Arc<Retriever>,
    pub chat: Arc<ChatService>,
}

/// Starts the HTTP server on the configured bind address.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let bind_addr = state.config.server.bind.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors);

    info!(bind = %bind_addr, "API server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/files", post(handle_create_file))
        .route("/files/{id}", get(handle_get_file).delete(handle_delete_file))
        .route("/files/{id}/analysis", get(handle_get_analysis))
        .route("/knowledge/search", post(handle_search))
        .route("/chat", post(handle_chat))
        .route("/health", get(handle_health))
        .with_state(state)
}

// ============ Auth extractor ============

/// The authenticated caller, taken from the `x-user-id` header the
/// upstream auth layer injects. Every handler scopes its reads and writes
/// by this id.
pub struct AuthedUser(pub Uuid);

impl<S> FromRequestParts<S> for AuthedUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| unauthorized("missing x-user-id header"))?;

        let user_id = Uuid::parse_str(header)
            .map_err(|_| unauthorized("x-user-id is not a valid identifier"))?;
        Ok(AuthedUser(user_id))
    }
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    retry_after_secs: Option<u64>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
        retry_after_secs: None,
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
        retry_after_secs: None,
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
        retry_after_secs: None,
    }
}

fn internal() -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: "internal server error".to_string(),
        retry_after_secs: None,
    }
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        match e {
            Error::Validation(msg) | Error::UnsupportedMediaType(msg) => bad_request(msg),
            Error::Auth(msg) => unauthorized(msg),
            Error::NotFound(msg) => not_found(msg),
            Error::RateLimited { retry_after_secs } => AppError {
                status: StatusCode::TOO_MANY_REQUESTS,
                code: "rate_limited".to_string(),
                message: "too many requests".to_string(),
                retry_after_secs: Some(retry_after_secs),
            },
            // Provider and persistence details stay server-side.
            other => {
                error!(error = %other, "request failed");
                internal()
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /files ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateFileRequest {
    name: String,
    media_type: String,
    size_bytes: i64,
    storage_path: String,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

/// Accept an uploaded file: insert the `pending` record and enqueue its
/// processing job. The worker's orphan sweep covers a crash between the
/// two writes, so acceptance is durable.
async fn handle_create_file(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Json(req): Json<CreateFileRequest>,
) -> Result<(StatusCode, Json<FileRecord>), AppError> {
    if req.name.trim().is_empty() || req.name.len() > 255 {
        return Err(bad_request("name must be 1-255 characters"));
    }
    if req.media_type.trim().is_empty() {
        return Err(bad_request("mediaType must not be empty"));
    }
    if req.size_bytes <= 0 {
        return Err(bad_request("sizeBytes must be positive"));
    }
    if req.storage_path.trim().is_empty() {
        return Err(bad_request("storagePath must not be empty"));
    }

    let file = FileRecord {
        id: Uuid::new_v4(),
        user_id,
        name: req.name,
        media_type: req.media_type,
        size_bytes: req.size_bytes,
        storage_path: req.storage_path,
        status: FileStatus::Pending,
        error: None,
        metadata: req.metadata.unwrap_or(serde_json::Value::Object(Default::default())),
        created_at: Utc::now(),
    };

    state.store.create_file(&file).await?;
    state
        .queue
        .enqueue(&ProcessJob {
            file_id: file.id,
            user_id,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(file)))
}

// ============ GET /files/{id} ============

async fn handle_get_file(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<FileRecord>, AppError> {
    let file = state
        .store
        .get_file(user_id, id)
        .await?
        .ok_or_else(|| not_found(format!("file {id} not found")))?;
    Ok(Json(file))
}

// ============ DELETE /files/{id} ============

async fn handle_delete_file(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.store.delete_file(user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ GET /files/{id}/analysis ============

async fn handle_get_analysis(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<crate::models::Analysis>, AppError> {
    let analysis = state
        .store
        .get_analysis(user_id, id)
        .await?
        .ok_or_else(|| not_found(format!("no analysis for file {id}")))?;
    Ok(Json(analysis))
}

// ============ POST /knowledge/search ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest {
    query: String,
    #[serde(default)]
    file_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    threshold: Option<f64>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

async fn handle_search(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.chars().count() > MAX_QUERY_CHARS {
        return Err(bad_request(format!(
            "query must be at most {MAX_QUERY_CHARS} characters"
        )));
    }
    if let Some(threshold) = req.threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(bad_request("threshold must be in [0.0, 1.0]"));
        }
    }

    let retrieval = &state.config.retrieval;
    let opts = SearchOptions {
        user_id,
        file_ids: req.file_ids,
        limit: req
            .limit
            .unwrap_or(retrieval.default_limit)
            .min(retrieval.max_limit),
        threshold: req.threshold.unwrap_or(retrieval.default_threshold),
    };

    let results = state.retriever.search(&req.query, &opts).await?;
    Ok(Json(SearchResponse { results }))
}

// ============ POST /chat ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    messages: Vec<ChatMessage>,
    #[serde(default)]
    file_ids: Option<Vec<Uuid>>,
}

async fn handle_chat(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    if req.messages.is_empty() {
        return Err(bad_request("messages must not be empty"));
    }
    for message in &req.messages {
        if message.content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(bad_request(format!(
                "message content must be at most {MAX_MESSAGE_CHARS} characters"
            )));
        }
    }

    let turn = state.chat.answer(user_id, &req.messages, req.file_ids).await?;

    let sources_json =
        serde_json::to_string(&turn.sources).map_err(|_| internal())?;

    let body = Body::from_stream(turn.stream.map(|item| {
        item.map(Bytes::from)
            .map_err(|e| -> axum::BoxError { Box::new(e) })
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; charset=utf-8")
        .header("x-sources", sources_json)
        .body(body)
        .map_err(|_| internal())
}
