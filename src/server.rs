//! HTTP API server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/classify` | Guardrailed classification (`ClassifyRequest` → `ClassifyResponse`) |
//! | `POST` | `/search` | Fused retrieval only (`SearchRequest` → `SearchResponse`) |
//! | `GET`  | `/documents/{doc_id}` | Stored document, chunks and revisions |
//! | `GET`  | `/health` | Health check (version, snapshot size) |
//!
//! Queries and `/health` pick up documents and embeddings written by other
//! processes (`hts ingest`, `hts embed pending`) without a restart.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `version_conflict`
//! (409), `internal` (500). An ABSTAIN is a successful response, not an
//! error.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use hts_harness_core::error::Error as CoreError;

use crate::config::Config;
use crate::engine::{ClassifyRequest, ClassifyResponse, Engine, SearchRequest, SearchResponse};
use crate::get::{get_document, DocumentResponse};

/// Starts the HTTP server on `[server].bind` and runs until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let engine = Arc::new(Engine::open(config.clone()).await?);
    let snap = engine.snapshot();
    tracing::info!(chunks = snap.len(), embedded = snap.embedded_count(), "engine ready");

    let app = router(engine);

    println!("HTS server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Routes over a shared engine.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/classify", post(handle_classify))
        .route("/search", post(handle_search))
        .route("/documents/{doc_id}", get(handle_get_document))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(engine)
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

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

/// Map engine errors onto the error contract. Typed core errors decide
/// the status; anything else is a server fault.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<CoreError>() {
            Some(CoreError::Configuration(_)) | Some(CoreError::InvalidIdentity(_)) => {
                bad_request(format!("{:#}", err))
            }
            Some(CoreError::VersionConflict { .. }) => AppError {
                status: StatusCode::CONFLICT,
                code: "version_conflict",
                message: err.to_string(),
            },
            _ => {
                tracing::error!(error = %format!("{:#}", err), "request failed");
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal",
                    message: err.to_string(),
                }
            }
        }
    }
}

fn require_query(query: &str) -> Result<(), AppError> {
    if query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    Ok(())
}

// ============ Handlers ============

async fn handle_classify(
    State(engine): State<Arc<Engine>>,
    body: Result<Json<ClassifyRequest>, JsonRejection>,
) -> Result<Json<ClassifyResponse>, AppError> {
    let Json(request) = body?;
    require_query(&request.query)?;
    Ok(Json(engine.classify(&request).await?))
}

async fn handle_search(
    State(engine): State<Arc<Engine>>,
    body: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let Json(request) = body?;
    require_query(&request.query)?;
    Ok(Json(engine.search(&request).await?))
}

async fn handle_get_document(
    State(engine): State<Arc<Engine>>,
    Path(doc_id): Path<String>,
) -> Result<Json<DocumentResponse>, AppError> {
    get_document(engine.store().as_ref(), &doc_id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("document not found: {}", doc_id)))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    chunks: usize,
    embedded_chunks: usize,
    snapshot_generation: u64,
}

async fn handle_health(State(engine): State<Arc<Engine>>) -> Json<HealthResponse> {
    let snap = engine.current_snapshot().await;
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        chunks: snap.len(),
        embedded_chunks: snap.embedded_count(),
        snapshot_generation: snap.generation(),
    })
}
