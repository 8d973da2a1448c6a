//! HTTP boundary for ingestion, queries, and administration.
//!
//! This is thin I/O over the engine: a chat-platform adapter (or anything
//! else) POSTs messages and questions as JSON. Chat-protocol handling
//! itself lives outside this crate.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ingest` | Ingest one message |
//! | `POST` | `/ask` | Answer a question for a tenant |
//! | `POST` | `/admin/purge` | Delete a tenant's most recent chunks |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "content must be present" } }
//! ```
//!
//! Codes: `bad_request` (400), `unauthorized` (401), `unavailable` (503),
//! `internal` (500). Query-path answerer failures do not error: the user
//! gets a short try-again reply with a 200.
//!
//! `/admin/purge` requires `Authorization: Bearer <token>` matching
//! `[server].admin_token`; the engine itself only ever sees the
//! already-authorized call.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::answer::{ask, Answerer, TRY_AGAIN_REPLY};
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::EngineError;
use crate::ingest::{ingest, IngestOutcome, IngestState, SkipReason};
use crate::models::RawMessage;
use crate::purge::purge_recent;
use crate::store::ChunkStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn Embedder>,
    answerer: Arc<dyn Answerer>,
    ingest_state: Arc<IngestState>,
}

/// Starts the HTTP server with pre-built engine dependencies.
///
/// Binds to `[server].bind` and runs until the process is terminated.
/// The buffer map lives exactly as long as the server: constructed here,
/// dropped on shutdown.
pub async fn run_server(
    config: &Config,
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn Embedder>,
    answerer: Arc<dyn Answerer>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState {
        config: Arc::new(config.clone()),
        store,
        embedder,
        answerer,
        ingest_state: Arc::new(IngestState::new(config.chunking.chunk_size)),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ingest", post(handle_ingest))
        .route("/ask", post(handle_ask))
        .route("/admin/purge", post(handle_purge))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("recall server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
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

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

fn unavailable(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "unavailable".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Maps engine faults to HTTP responses without leaking internals.
fn classify_engine_error(err: EngineError) -> AppError {
    match &err {
        EngineError::DimensionMismatch { .. } => internal(err.to_string()),
        _ if err.is_transient() => unavailable("temporarily unavailable, retry shortly"),
        _ => internal("internal error"),
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

// ============ POST /ingest ============

#[derive(Serialize)]
struct IngestResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(message): Json<RawMessage>,
) -> Result<Json<IngestResponse>, AppError> {
    if message.channel_id.trim().is_empty() {
        return Err(bad_request("channel_id must be present"));
    }

    let outcome = ingest(
        &state.ingest_state,
        state.store.as_ref(),
        state.embedder.as_ref(),
        message,
    )
    .await
    .map_err(|e| {
        // Buffered messages were requeued; the batch retries on a later
        // flush. The chat side never sees the detail.
        error!(error = %e, "ingestion flush failed");
        classify_engine_error(e)
    })?;

    let response = match outcome {
        IngestOutcome::Buffered => IngestResponse {
            status: "buffered",
            chunk_id: None,
            reason: None,
        },
        IngestOutcome::Flushed(chunk) => IngestResponse {
            status: "flushed",
            chunk_id: Some(chunk.id),
            reason: None,
        },
        IngestOutcome::Skipped(reason) => IngestResponse {
            status: "skipped",
            chunk_id: None,
            reason: Some(match reason {
                SkipReason::EmptyContent => "empty_content",
                SkipReason::Duplicate => "duplicate",
            }),
        },
    };

    Ok(Json(response))
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskRequest {
    tenant_id: i64,
    question: String,
}

#[derive(Serialize)]
struct AskResponse {
    answer: String,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<AskResponse>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let result = ask(
        state.store.as_ref(),
        state.embedder.as_ref(),
        state.answerer.as_ref(),
        &state.config.retrieval,
        req.tenant_id,
        &req.question,
    )
    .await;

    match result {
        Ok(answer) => Ok(Json(AskResponse { answer })),
        Err(EngineError::AnswererFailure { message, .. }) => {
            error!(tenant_id = req.tenant_id, error = %message, "answerer failed");
            Ok(Json(AskResponse {
                answer: TRY_AGAIN_REPLY.to_string(),
            }))
        }
        Err(err) => {
            error!(tenant_id = req.tenant_id, error = %err, "ask failed");
            Err(classify_engine_error(err))
        }
    }
}

// ============ POST /admin/purge ============

#[derive(Deserialize)]
struct PurgeRequest {
    tenant_id: i64,
    count: i64,
}

#[derive(Serialize)]
struct PurgeResponse {
    deleted: u64,
}

fn check_admin(config: &Config, headers: &HeaderMap) -> Result<(), AppError> {
    let token = config.server.admin_token.as_str();
    if token.is_empty() {
        return Err(unauthorized("admin purge is disabled (no admin_token set)"));
    }

    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if presented != token {
        return Err(unauthorized("invalid admin token"));
    }

    Ok(())
}

async fn handle_purge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PurgeRequest>,
) -> Result<Json<PurgeResponse>, AppError> {
    check_admin(&state.config, &headers)?;

    if req.count <= 0 {
        return Err(bad_request("count must be >= 1"));
    }

    let deleted = purge_recent(state.store.as_ref(), req.tenant_id, req.count)
        .await
        .map_err(classify_engine_error)?;

    Ok(Json(PurgeResponse { deleted }))
}
