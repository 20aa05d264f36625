//! HTTP request handlers for the admin API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use njordr_core::{Error, ItemId, WorkItem, WorkerId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::registry::{RegistryStats, WorkerInfo};
use crate::state::BrokerState;

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, (StatusCode, Json<ApiResponse<T>>)>;

/// Map a broker error onto a status code and error envelope
fn reject<T: Serialize>(err: Error) -> (StatusCode, Json<ApiResponse<T>>) {
    let status = match &err {
        Error::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::UnknownItem(_) | Error::UnknownWorker(_) => StatusCode::NOT_FOUND,
        Error::InvalidTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::error(err.to_string())))
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Queue and worker overview
#[derive(Debug, Serialize)]
pub struct Overview {
    #[serde(flatten)]
    pub stats: RegistryStats,
    pub queue_capacity: usize,
    pub retry_limit: u32,
    pub uptime_secs: u64,
}

/// Request body for item submission
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub job: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub item_id: ItemId,
}

// ============ Health & Overview Handlers ============

/// GET /api/health
pub async fn health_check(
    State(state): State<Arc<BrokerState>>,
) -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
    }))
}

/// GET /api/overview
pub async fn get_overview(State(state): State<Arc<BrokerState>>) -> Json<ApiResponse<Overview>> {
    let stats = state.stats().await;
    Json(ApiResponse::success(Overview {
        stats,
        queue_capacity: state.config.queue_capacity,
        retry_limit: state.config.retry_limit,
        uptime_secs: state.uptime_secs(),
    }))
}

// ============ Worker Handlers ============

/// GET /api/workers
pub async fn list_workers(
    State(state): State<Arc<BrokerState>>,
) -> Json<ApiResponse<Vec<WorkerInfo>>> {
    Json(ApiResponse::success(state.workers().await))
}

/// GET /api/workers/:id
pub async fn get_worker(
    State(state): State<Arc<BrokerState>>,
    Path(worker_id): Path<String>,
) -> ApiResult<WorkerInfo> {
    match state.worker(&WorkerId::from(worker_id.clone())).await {
        Some(worker) => Ok(Json(ApiResponse::success(worker))),
        None => Err(reject(Error::UnknownWorker(worker_id))),
    }
}

// ============ Item Handlers ============

/// POST /api/items
pub async fn submit_item(
    State(state): State<Arc<BrokerState>>,
    Json(body): Json<SubmitRequest>,
) -> ApiResult<SubmitResponse> {
    state
        .submit(body.job, body.payload)
        .await
        .map(|item_id| Json(ApiResponse::success(SubmitResponse { item_id })))
        .map_err(reject)
}

/// GET /api/items/:id
pub async fn get_item(
    State(state): State<Arc<BrokerState>>,
    Path(item_id): Path<String>,
) -> ApiResult<WorkItem> {
    match state.item(&ItemId::from(item_id.clone())).await {
        Some(item) => Ok(Json(ApiResponse::success(item))),
        None => Err(reject(Error::UnknownItem(item_id))),
    }
}

/// POST /api/items/:id/abandon
pub async fn abandon_item(
    State(state): State<Arc<BrokerState>>,
    Path(item_id): Path<String>,
) -> ApiResult<WorkItem> {
    let item_id = ItemId::from(item_id);
    state.abandon(&item_id).await.map_err(reject::<WorkItem>)?;

    match state.item(&item_id).await {
        Some(item) => Ok(Json(ApiResponse::success(item))),
        None => Err(reject(Error::UnknownItem(item_id.0))),
    }
}

// ============ Metrics Handler ============

/// GET /api/metrics
pub async fn get_metrics(State(state): State<Arc<BrokerState>>) -> impl IntoResponse {
    match state.metrics().map(|m| m.gather()) {
        Some(Ok(text)) => (StatusCode::OK, text),
        Some(Err(e)) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        None => (StatusCode::NOT_IMPLEMENTED, "Metrics not enabled".to_string()),
    }
}
