//! HTTP dispatch API.
//!
//! Every route except `/health` requires the API key when one is configured.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{Stream, StreamExt};
use heidi_core::{redact, RunId, RunStatus, RunSummary};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::engine::{CancelOutcome, EngineError, ErrorKind, LoopRequest, RunEngine, RunRequest};

/// Default and maximum page sizes for `GET /runs`.
pub const DEFAULT_LIST_LIMIT: usize = 10;
pub const MAX_LIST_LIMIT: usize = 1000;

/// Alternate header carrying the API key.
pub const API_KEY_HEADER: &str = "x-heidi-key";

/// Shared state for HTTP handlers.
pub struct AppState {
    pub engine: RunEngine,
    pub api_key: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    // Browser dashboards on other origins call the API directly.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/executors", get(list_executors))
        .route("/run", post(submit_run))
        .route("/loop", post(submit_loop))
        .route("/runs", get(list_runs))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/stream", get(stream_run))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn start_server(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Validate the API key if one is configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.api_key else {
        return Ok(());
    };

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));
    let key = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());

    match bearer.or(key) {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(unauthorized("invalid api key")),
        None => Err(unauthorized("missing api key")),
    }
}

fn unauthorized(message: &str) -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: message.to_string(),
            kind: "unauthorized".to_string(),
        }),
    )
}

fn api_error(err: EngineError) -> ApiError {
    let status = match err.kind() {
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Executor | ErrorKind::Timeout | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        error!(error = %err, "request failed");
    } else {
        warn!(error = %err, "request rejected");
    }
    (
        status,
        Json(ErrorResponse {
            error: redact(&err.to_string()),
            kind: err.kind().as_str().to_string(),
        }),
    )
}

fn bad_payload(rejection: JsonRejection) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: redact(&rejection.body_text()),
            kind: ErrorKind::InvalidArgument.as_str().to_string(),
        }),
    )
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

/// Response for POST /run and POST /loop.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub run_id: RunId,
    pub status: RunStatus,
}

/// Response for GET /executors.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecutorsResponse {
    pub executors: Vec<String>,
}

/// Query params for GET /runs.
#[derive(Debug, Deserialize, Default)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "service": "heidi" }))
}

/// GET /executors - Registered executor names.
async fn list_executors(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    Ok(Json(ExecutorsResponse {
        executors: state.engine.registry().names(),
    }))
}

/// POST /run - Dispatch a single executor invocation.
async fn submit_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let Json(request) = payload.map_err(bad_payload)?;

    let run_id = state.engine.submit_run(request).await.map_err(api_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            run_id,
            status: RunStatus::Running,
        }),
    ))
}

/// POST /loop - Dispatch a bounded-retry loop.
async fn submit_loop(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<LoopRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let Json(request) = payload.map_err(bad_payload)?;

    let run_id = state.engine.submit_loop(request).await.map_err(api_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            run_id,
            status: RunStatus::Running,
        }),
    ))
}

/// GET /runs - Most recently updated runs.
async fn list_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<RunSummary>>, ApiError> {
    check_auth(&state, &headers)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .min(MAX_LIST_LIMIT);

    let runs = state.engine.list_runs(limit).await.map_err(api_error)?;
    Ok(Json(runs))
}

/// GET /runs/{run_id} - Metadata, artifacts and transcript.
async fn get_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let record = state.engine.get_run(&run_id).await.map_err(api_error)?;
    Ok(Json(record))
}

/// POST /runs/{run_id}/cancel - Idempotent cancel.
async fn cancel_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    check_auth(&state, &headers)?;
    match state.engine.cancel_run(&run_id).await.map_err(api_error)? {
        CancelOutcome::Cancelled => info!(run_id = %run_id, "cancel requested"),
        CancelOutcome::AlreadyTerminal(status) => {
            info!(run_id = %run_id, status = %status, "cancel ignored; run already terminal");
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

/// GET /runs/{run_id}/stream - Transcript as server-sent events.
///
/// Replays the transcript from the start, then follows it until the run is
/// terminal. Each `data:` field is one transcript entry.
async fn stream_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    check_auth(&state, &headers)?;
    let events = state.engine.stream_run(&run_id).await.map_err(api_error)?;

    let stream = events.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, Infallible>(SseEvent::default().event(event.event_type.as_str()).data(data))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
