//! HTTP control plane.
//!
//! Host commands and aggregator signals for the simulated devices:
//! - POST /v1/devices/{id}/tasks (JSON task and submit mode)
//! - POST /v1/devices/{id}/tasks/raw (packed task record, queued)
//! - POST /v1/devices/{id}/flush
//! - GET /v1/devices/{id}/stats
//! - PUT /v1/readiness/{partition}
//! - DELETE /v1/barrier/{device}
//! - GET /metrics
//! - GET /health

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::device::context::{DeviceContext, DeviceError, DeviceStats, FlushReport, SubmitMode, SubmitOutcome};
use crate::device::simulator::{Simulator, SimulatorError};
use crate::sched::task::{Task, TaskRecord, WireError};

/// Application state shared across handlers.
pub struct AppState {
    pub simulator: Arc<Simulator>,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

/// Build the axum router with all control routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/devices/{id}/tasks", post(submit_task))
        .route("/v1/devices/{id}/tasks/raw", post(submit_raw))
        .route("/v1/devices/{id}/flush", post(flush))
        .route("/v1/devices/{id}/stats", get(stats))
        .route("/v1/readiness/{partition}", put(set_readiness))
        .route("/v1/barrier/{device}", delete(acknowledge_barrier))
        .with_state(state)
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Simulator(#[from] SimulatorError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("Task addressed to device {task} was posted to device {path}")]
    DeviceMismatch { path: u32, task: u32 },

    #[error("Partition {0} out of range")]
    UnknownPartition(u32),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Metrics encoding failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Simulator(SimulatorError::UnknownDevice(_)) | ApiError::UnknownPartition(_) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Wire(_) | ApiError::DeviceMismatch { .. } => StatusCode::BAD_REQUEST,
            ApiError::Device(DeviceError::Cache(_) | DeviceError::Queue(_)) => StatusCode::INSUFFICIENT_STORAGE,
            ApiError::Device(DeviceError::Cancelled(_)) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "Control request failed");
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// Task submission request.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub task: Task,
    #[serde(default = "default_mode")]
    pub mode: SubmitMode,
}

fn default_mode() -> SubmitMode {
    SubmitMode::Async
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub device: u32,
    pub outcome: SubmitOutcome,
}

#[derive(Debug, Deserialize)]
pub struct ReadinessRequest {
    pub ready: bool,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub devices: usize,
    pub ready_partitions: usize,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

fn device(state: &AppState, id: u32) -> Result<Arc<DeviceContext>, ApiError> {
    Ok(state.simulator.device(id)?.clone())
}

async fn submit_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let ctx = device(&state, id)?;
    if req.task.device != id {
        return Err(ApiError::DeviceMismatch { path: id, task: req.task.device });
    }

    info!(
        device = id,
        row = req.task.row,
        col = req.task.col,
        iteration = req.task.iteration,
        mode = ?req.mode,
        "Task submitted"
    );

    // Synchronous processing parks the calling thread on simulated time.
    let outcome = tokio::task::spawn_blocking(move || ctx.submit(req.task, req.mode)).await??;
    Ok(Json(SubmitResponse { device: id, outcome }))
}

async fn submit_raw(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
    body: Bytes,
) -> Result<Json<SubmitResponse>, ApiError> {
    let ctx = device(&state, id)?;
    let task = TaskRecord::decode(&body)?;
    if task.device != id {
        return Err(ApiError::DeviceMismatch { path: id, task: task.device });
    }
    let outcome = ctx.submit(task, SubmitMode::Async)?;
    Ok(Json(SubmitResponse { device: id, outcome }))
}

async fn flush(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
) -> Result<Json<FlushReport>, ApiError> {
    let ctx = device(&state, id)?;
    // Waits for the device's current scheduling pass.
    let report = tokio::task::spawn_blocking(move || ctx.flush()).await?;
    Ok(Json(report))
}

async fn stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
) -> Result<Json<DeviceStats>, ApiError> {
    Ok(Json(device(&state, id)?.stats()))
}

async fn set_readiness(
    State(state): State<Arc<AppState>>,
    Path(partition): Path<u32>,
    Json(req): Json<ReadinessRequest>,
) -> Result<StatusCode, ApiError> {
    if !state.simulator.set_ready(partition, req.ready) {
        return Err(ApiError::UnknownPartition(partition));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn acknowledge_barrier(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<u32>,
) -> Result<StatusCode, ApiError> {
    state.simulator.device(device_id)?;
    state.simulator.acknowledge_barrier(device_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let body = state.simulator.metrics().encode()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let ready_partitions = state
        .simulator
        .shared()
        .readiness
        .partitions()
        .into_iter()
        .filter(|ready| *ready)
        .count();

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        devices: state.simulator.num_devices(),
        ready_partitions,
    })
}
