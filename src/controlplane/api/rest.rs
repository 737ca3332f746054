//! REST API Handlers
//!
//! Routes for cluster, node, device, volume and brick administration and
//! the queue endpoint that long-running operations are polled through.

use crate::controlplane::{
    DeviceAddRequest, NodeAddRequest, Orchestrator, StateRequest, TaskStatus,
    VolumeCreateRequest, VolumeExpandRequest, VolumeMigrateRequest,
};
use crate::error::Error;
use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Id listing response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdListResponse {
    pub ids: Vec<String>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Header set on queue responses while the task still runs
pub const PENDING_HEADER: &str = "X-Pending";

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<Orchestrator>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
        };

        Router::new()
            .route("/hello", get(hello))
            // Clusters
            .route("/clusters", post(cluster_create).get(cluster_list))
            .route("/clusters/:id", get(cluster_info).delete(cluster_delete))
            // Nodes
            .route("/nodes", post(node_add))
            .route("/nodes/:id", get(node_info).delete(node_delete))
            .route("/nodes/:id/state", post(node_set_state))
            // Devices
            .route("/devices", post(device_add))
            .route("/devices/:id", get(device_info).delete(device_delete))
            .route("/devices/:id/state", post(device_set_state))
            .route("/devices/:id/remove", post(device_remove))
            // Volumes
            .route("/volumes", post(volume_create).get(volume_list))
            .route("/volumes/:id", get(volume_info).delete(volume_delete))
            .route("/volumes/:id/expand", post(volume_expand))
            .route("/volumes/:id/migrate", post(volume_migrate))
            // Bricks
            .route("/bricks/:id/replace", post(brick_replace))
            .route("/bricks/:id/remove", post(brick_remove))
            // Operations
            .route("/operations", get(pending_operations))
            .route("/queue/:id", get(queue_status))
            // Health endpoint
            .route("/health", get(health_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

// =============================================================================
// Response Helpers
// =============================================================================

fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Conflict(_)
        | Error::Busy { .. }
        | Error::NoSpace(_)
        | Error::InsufficientCapacity { .. } => StatusCode::CONFLICT,
        Error::Validation(_) | Error::JsonParse(_) | Error::YamlParse(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: Error) -> Response {
    let status = error_status(&err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        debug!("Request rejected: {}", err);
    }

    let details = match &err {
        Error::Busy { owner, .. } => Some(format!("pending operation {}", owner)),
        _ => None,
    };
    (
        status,
        Json(ApiErrorResponse {
            error: err.code().into(),
            message: err.to_string(),
            details,
        }),
    )
        .into_response()
}

fn json_response<T: Serialize>(status: StatusCode, result: crate::Result<T>) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(e) => error_response(e),
    }
}

/// 202 pointing at the queue entry of a submitted task
fn accepted(result: crate::Result<String>) -> Response {
    match result {
        Ok(task_id) => (
            StatusCode::ACCEPTED,
            [(header::LOCATION, format!("/queue/{}", task_id))],
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

fn no_content(result: crate::Result<()>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn hello() -> impl IntoResponse {
    "Hello from brickd"
}

async fn cluster_create(State(state): State<AppState>) -> impl IntoResponse {
    json_response(StatusCode::CREATED, state.orchestrator.cluster_create())
}

async fn cluster_list(State(state): State<AppState>) -> impl IntoResponse {
    json_response(
        StatusCode::OK,
        state
            .orchestrator
            .cluster_list()
            .map(|ids| IdListResponse { ids }),
    )
}

async fn cluster_info(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    json_response(StatusCode::OK, state.orchestrator.cluster_info(&id))
}

async fn cluster_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    no_content(state.orchestrator.cluster_delete(&id))
}

async fn node_add(
    State(state): State<AppState>,
    Json(request): Json<NodeAddRequest>,
) -> impl IntoResponse {
    json_response(StatusCode::CREATED, state.orchestrator.node_add(request).await)
}

async fn node_info(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    json_response(StatusCode::OK, state.orchestrator.node_info(&id))
}

async fn node_delete(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    no_content(state.orchestrator.node_delete(&id))
}

async fn node_set_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<StateRequest>,
) -> impl IntoResponse {
    json_response(
        StatusCode::OK,
        state.orchestrator.node_set_state(&id, request.state),
    )
}

async fn device_add(
    State(state): State<AppState>,
    Json(request): Json<DeviceAddRequest>,
) -> impl IntoResponse {
    json_response(StatusCode::CREATED, state.orchestrator.device_add(request).await)
}

async fn device_info(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    json_response(StatusCode::OK, state.orchestrator.device_info(&id))
}

async fn device_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    no_content(state.orchestrator.device_delete(&id).await)
}

async fn device_set_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<StateRequest>,
) -> impl IntoResponse {
    json_response(
        StatusCode::OK,
        state.orchestrator.device_set_state(&id, request.state),
    )
}

async fn device_remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    accepted(state.orchestrator.device_remove(&id))
}

async fn volume_create(
    State(state): State<AppState>,
    Json(request): Json<VolumeCreateRequest>,
) -> impl IntoResponse {
    accepted(state.orchestrator.volume_create(request))
}

async fn volume_list(State(state): State<AppState>) -> impl IntoResponse {
    json_response(
        StatusCode::OK,
        state
            .orchestrator
            .volume_list()
            .map(|ids| IdListResponse { ids }),
    )
}

async fn volume_info(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    json_response(StatusCode::OK, state.orchestrator.volume_info(&id))
}

async fn volume_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    accepted(state.orchestrator.volume_delete(&id))
}

async fn volume_expand(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<VolumeExpandRequest>,
) -> impl IntoResponse {
    accepted(state.orchestrator.volume_expand(&id, request))
}

async fn volume_migrate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<VolumeMigrateRequest>,
) -> impl IntoResponse {
    accepted(state.orchestrator.volume_migrate(&id, request))
}

async fn brick_replace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    accepted(state.orchestrator.brick_replace(&id))
}

async fn brick_remove(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    accepted(state.orchestrator.brick_remove(&id))
}

async fn pending_operations(State(state): State<AppState>) -> impl IntoResponse {
    json_response(StatusCode::OK, state.orchestrator.pending_operations())
}

/// Poll a submitted task
///
/// A final status is served once; afterwards the id is unknown.
async fn queue_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.tasks().take_status(&id) {
        Some(TaskStatus::Pending) => (StatusCode::OK, [(PENDING_HEADER, "true")]).into_response(),
        Some(TaskStatus::Completed {
            resource_url: Some(url),
        }) => (StatusCode::SEE_OTHER, [(header::LOCATION, url)]).into_response(),
        Some(TaskStatus::Completed { resource_url: None }) => StatusCode::NO_CONTENT.into_response(),
        Some(TaskStatus::Failed { error }) => {
            (StatusCode::INTERNAL_SERVER_ERROR, error).into_response()
        }
        None => error_response(Error::not_found("task", id)),
    }
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    json_response(StatusCode::OK, state.orchestrator.status())
}
