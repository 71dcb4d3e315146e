//! Per-node HTTP control surface.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;
use wiggle_types::{ImageFormat, JobItem, JobRequest};

use crate::engine::AcquisitionEngine;
use crate::jobs::JobQueue;
use crate::Error;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AcquisitionEngine>,
    pub jobs: Arc<JobQueue>,
    pub primary: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/camera/stream.mjpg", get(camera_stream))
        .route("/api/camera/still", get(camera_still))
        .route("/api/job/setup", post(job_setup))
        .route("/api/job/trigger", get(job_trigger))
        .route("/api/job/reset", get(job_reset))
        .route("/api/job/list", get(job_list))
        .route("/api/job/results/{id}", get(job_results))
        .route("/api/media/{id}/download", get(media_download))
        .route("/api/system/is_healthy", get(is_healthy))
        .route("/api/system/is_primary", get(is_primary))
        .with_state(state)
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::JobAlreadyActive => StatusCode::TOO_MANY_REQUESTS,
            Error::Camera(wiggle_cam::Error::PreviewNotEnabled) => {
                StatusCode::METHOD_NOT_ALLOWED
            }
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::TriggerNotPrimary => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("request failed: {}", self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

async fn camera_stream(State(state): State<AppState>) -> Result<Response, ApiError> {
    let stream = state.engine.gen_stream()?;

    let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<bytes::Bytes>>(2);
    tokio::task::spawn_blocking(move || {
        for chunk in stream {
            match chunk {
                Ok(bytes) => {
                    if tx.blocking_send(Ok(bytes)).is_err() {
                        debug!("stream consumer disconnected");
                        break;
                    }
                }
                Err(e) => {
                    debug!("stream ended: {e}");
                    break;
                }
            }
        }
    });

    let response = Response::builder()
        .header(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )
        .header(header::CACHE_CONTROL, "no-cache, private")
        .header(header::PRAGMA, "no-cache")
        .header(header::AGE, "0")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .expect("static response parts");
    Ok(response)
}

async fn camera_still(State(state): State<AppState>) -> Result<Response, ApiError> {
    let engine = state.engine.clone();
    let jpeg = tokio::task::spawn_blocking(move || engine.wait_for_hires_image(ImageFormat::Jpeg))
        .await
        .map_err(|e| Error::Internal { msg: e.to_string() })??;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response())
}

async fn job_setup(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> Result<Json<JobItem>, ApiError> {
    Ok(Json(state.jobs.setup_job_request(request)?))
}

async fn job_trigger(State(state): State<AppState>) -> Result<&'static str, ApiError> {
    state.engine.trigger_execute_job()?;
    Ok("ok")
}

async fn job_reset(State(state): State<AppState>) -> &'static str {
    state.jobs.reset_job();
    "ok"
}

async fn job_list(State(state): State<AppState>) -> Json<Vec<JobItem>> {
    Json(state.jobs.list())
}

async fn job_results(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobItem>, ApiError> {
    state.jobs.get(id).map(Json).ok_or(ApiError(Error::NotFound))
}

async fn media_download(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let item = state.jobs.media_item(id).ok_or(Error::NotFound)?;
    let bytes = tokio::fs::read(&item.filepath)
        .await
        .map_err(|_| Error::NotFound)?;
    let filename = item
        .filepath
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{id}.jpg"));
    let response = Response::builder()
        .header(header::CONTENT_TYPE, "image/jpeg")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from(bytes))
        .expect("static response parts");
    Ok(response)
}

async fn is_healthy(State(state): State<AppState>) -> Json<bool> {
    Json(state.engine.is_healthy())
}

async fn is_primary(State(state): State<AppState>) -> Json<bool> {
    Json(state.primary)
}
