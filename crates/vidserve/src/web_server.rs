//! HTTP API.
//!
//! Routes (all JSON unless noted):
//! - `POST   /api/v1/formats`               - resolve formats for `{url}`
//! - `POST   /api/v1/downloads`             - start a tracked download
//! - `GET    /api/v1/downloads/{id}`        - task snapshot
//! - `GET    /api/v1/downloads/{id}/events` - progress as server-sent events
//! - `GET    /api/v1/downloads/{id}/file`   - completed file (binary)
//! - `DELETE /api/v1/downloads/{id}`        - cancel, or drop a finished task
//! - `GET|POST /api/v1/download`            - one-shot download (binary)
//! - `GET    /health`

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Instant;
use vidcore::download::delivery::{content_disposition, DirectDownload, TrackedFile};
use vidcore::service::Delivery;
use vidcore::{DownloadService, TaskSnapshot, VideoInfo};

use crate::error::ApiResult;

#[derive(Clone)]
pub struct AppState {
    service: Arc<DownloadService>,
    started: Instant,
}

#[derive(Debug, Deserialize)]
pub struct FormatsRequest {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    pub url: String,
    pub format_id: String,
}

pub fn router(service: Arc<DownloadService>) -> Router {
    let state = AppState {
        service,
        started: Instant::now(),
    };

    let api = Router::new()
        .route("/formats", post(formats_handler))
        .route("/downloads", post(start_download_handler))
        .route("/downloads/{id}", get(task_handler).delete(delete_task_handler))
        .route("/downloads/{id}/events", get(events_handler))
        .route("/downloads/{id}/file", get(file_handler))
        .route("/download", get(download_query_handler).post(download_json_handler));

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, service: Arc<DownloadService>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        log::info!("Starting web server on http://{}", addr);
        log::info!("  /api/v1/formats              - Resolve formats");
        log::info!("  /api/v1/downloads            - Tracked downloads");
        log::info!("  /api/v1/downloads/{{id}}/events - Progress (SSE)");
        log::info!("  /api/v1/download             - One-shot download");
        log::info!("  /health                      - Health check");
    }
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
}

/// POST /api/v1/formats
#[tracing::instrument(skip_all)]
async fn formats_handler(State(state): State<AppState>, Json(req): Json<FormatsRequest>) -> ApiResult<Json<VideoInfo>> {
    let info = state.service.resolve_formats(&req.url).await?;
    Ok(Json(VideoInfo::clone(&info)))
}

/// POST /api/v1/downloads
async fn start_download_handler(
    State(state): State<AppState>,
    Json(req): Json<DownloadParams>,
) -> ApiResult<impl IntoResponse> {
    let task_id = state.service.start_download(&req.url, &req.format_id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": task_id }))))
}

/// GET /api/v1/downloads/{id}
async fn task_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<TaskSnapshot>> {
    Ok(Json(state.service.task(&id)?))
}

/// GET /api/v1/downloads/{id}/events
///
/// One `progress` event per state change, starting with the current state.
/// The stream ends after the terminal event. Closing it leaves the task running.
async fn events_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let subscription = state.service.subscribe(&id)?;
    let events = subscription
        .into_stream()
        .map(|snapshot| Event::default().event("progress").json_data(&snapshot));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// GET /api/v1/downloads/{id}/file
async fn file_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let file = state.service.open_result(&id).await?;
    Ok(tracked_response(file))
}

/// DELETE /api/v1/downloads/{id}
///
/// Finished tasks are dropped along with their files (204). Running tasks are
/// cancelled and their final snapshot returned.
async fn delete_task_handler(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    if state.service.acknowledge(&id).await? {
        log::info!("Task {} acknowledged and removed", id);
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    let snapshot = state.service.cancel(&id).await?;
    Ok(Json(snapshot).into_response())
}

/// GET /api/v1/download?url=...&format_id=...
async fn download_query_handler(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> ApiResult<Response> {
    one_shot(&state, params).await
}

/// POST /api/v1/download
async fn download_json_handler(State(state): State<AppState>, Json(params): Json<DownloadParams>) -> ApiResult<Response> {
    one_shot(&state, params).await
}

#[tracing::instrument(skip_all, fields(format_id = %params.format_id))]
async fn one_shot(state: &AppState, params: DownloadParams) -> ApiResult<Response> {
    let response = match state.service.fetch(&params.url, &params.format_id).await? {
        Delivery::Direct(download) => direct_response(download),
        Delivery::Tracked(file) => tracked_response(file),
    };
    Ok(response)
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let cache = state.service.cache_stats().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started.elapsed().as_secs(),
        "tasks": {
            "total": state.service.task_count(),
            "active": state.service.active_task_count(),
        },
        "format_cache": {
            "entries": cache.entries,
            "hits": cache.hits,
            "misses": cache.misses,
        },
    }))
}

fn tracked_response(file: TrackedFile) -> Response {
    (
        [
            (header::CONTENT_TYPE, file.content_type),
            (header::CONTENT_LENGTH, file.size.to_string()),
            (header::CONTENT_DISPOSITION, content_disposition(&file.file_name)),
        ],
        Body::from_stream(file.stream),
    )
        .into_response()
}

/// Length is unknown up front; the body ends when the backend's stdout does.
/// Dropping the body (client gone) kills the backend process.
fn direct_response(download: DirectDownload) -> Response {
    (
        [
            (header::CONTENT_TYPE, download.content_type),
            (header::CONTENT_DISPOSITION, content_disposition(&download.file_name)),
        ],
        Body::from_stream(download.stream),
    )
        .into_response()
}
