//! REST API handlers for the journey trigger, operator controls and
//! operational endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use cadence_channels::gateway::MessageGateway;
use cadence_core::error::{CadenceError, StoreError};
use cadence_core::types::Enrollment;
use cadence_journey::{BatchExecutor, BatchReport, EnrollmentControls, JourneyStore};

/// Largest batch a single trigger request may ask for.
pub const MAX_BATCH_LIMIT: usize = 500;

/// Shared application state for REST handlers.
pub struct AppState<S, G> {
    pub store: Arc<S>,
    pub executor: Arc<BatchExecutor<G>>,
    pub controls: Arc<EnrollmentControls>,
    pub default_batch_limit: usize,
    pub node_id: String,
    pub start_time: Instant,
}

impl<S, G> AppState<S, G> {
    pub fn new(
        store: Arc<S>,
        executor: Arc<BatchExecutor<G>>,
        controls: Arc<EnrollmentControls>,
        default_batch_limit: usize,
        node_id: String,
    ) -> Self {
        Self {
            store,
            executor,
            controls,
            default_batch_limit,
            node_id,
            start_time: Instant::now(),
        }
    }
}

impl<S, G> Clone for AppState<S, G> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            executor: self.executor.clone(),
            controls: self.controls.clone(),
            default_batch_limit: self.default_batch_limit,
            node_id: self.node_id.clone(),
            start_time: self.start_time,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub success: bool,
    #[serde(flatten)]
    pub report: BatchReport,
}

#[derive(Debug, Serialize)]
pub struct ExecuteFailure {
    pub success: bool,
    pub error: String,
}

/// GET|POST /v1/journeys/execute — run one batch of due enrollments.
pub async fn execute_journeys<S, G>(
    State(state): State<AppState<S, G>>,
    Query(params): Query<ExecuteParams>,
) -> Result<Json<ExecuteResponse>, (StatusCode, Json<ExecuteFailure>)>
where
    S: JourneyStore + 'static,
    G: MessageGateway + 'static,
{
    let limit = params.limit.unwrap_or(state.default_batch_limit);
    if limit == 0 || limit > MAX_BATCH_LIMIT {
        warn!(limit, "batch limit out of range");
        metrics::counter!("api.validation_errors").increment(1);
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ExecuteFailure {
                success: false,
                error: format!("limit must be between 1 and {MAX_BATCH_LIMIT}"),
            }),
        ));
    }

    match state.executor.execute_batch(state.store.as_ref(), Utc::now(), limit).await {
        Ok(report) => {
            info!(
                processed = report.processed,
                sent = report.sent,
                errors = report.errors,
                "journey execution triggered"
            );
            Ok(Json(ExecuteResponse {
                success: true,
                report,
            }))
        }
        Err(e) => {
            error!(error = %e, "journey execution failed");
            metrics::counter!("api.errors").increment(1);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ExecuteFailure {
                    success: false,
                    error: e.to_string(),
                }),
            ))
        }
    }
}

/// GET /v1/enrollments/:id
pub async fn get_enrollment<S, G>(
    State(state): State<AppState<S, G>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Enrollment>, ErrorResponse>
where
    S: JourneyStore + 'static,
    G: MessageGateway + 'static,
{
    match state.store.get(id).await {
        Ok(Some(enrollment)) => Ok(Json(enrollment)),
        Ok(None) => Err(ErrorResponse::not_found(id)),
        Err(e) => Err(ErrorResponse::from(CadenceError::StoreRead(e))),
    }
}

/// POST /v1/enrollments/:id/pause
pub async fn pause_enrollment<S, G>(
    State(state): State<AppState<S, G>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Enrollment>, ErrorResponse>
where
    S: JourneyStore + 'static,
    G: MessageGateway + 'static,
{
    let enrollment = state
        .controls
        .pause(state.store.as_ref(), id, Utc::now())
        .await?;
    Ok(Json(enrollment))
}

/// POST /v1/enrollments/:id/resume
pub async fn resume_enrollment<S, G>(
    State(state): State<AppState<S, G>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Enrollment>, ErrorResponse>
where
    S: JourneyStore + 'static,
    G: MessageGateway + 'static,
{
    let enrollment = state
        .controls
        .resume(state.store.as_ref(), id, Utc::now())
        .await?;
    Ok(Json(enrollment))
}

/// GET /health — Health check endpoint.
pub async fn health_check<S, G>(State(state): State<AppState<S, G>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready — Readiness probe. The store is in-process, so readiness only
/// needs a successful read.
pub async fn readiness<S, G>(State(state): State<AppState<S, G>>) -> StatusCode
where
    S: JourneyStore + 'static,
{
    match state.store.get(Uuid::nil()).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "store not ready");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// GET /live — Liveness probe.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// An error body together with the status it is served with.
#[derive(Debug)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ErrorResponse {
    fn new(status: StatusCode, error: &str, message: String) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.to_string(),
                message,
            },
        }
    }

    fn not_found(id: Uuid) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", format!("enrollment {id} not found"))
    }
}

impl From<CadenceError> for ErrorResponse {
    fn from(err: CadenceError) -> Self {
        let (status, code) = match &err {
            CadenceError::StoreRead(StoreError::NotFound { .. })
            | CadenceError::StoreWrite(StoreError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            CadenceError::StoreWrite(StoreError::Conflict { .. }) => {
                (StatusCode::CONFLICT, "conflict")
            }
            CadenceError::StoreWrite(StoreError::InvalidTransition(_))
            | CadenceError::StoreWrite(StoreError::DuplicateActive { .. }) => {
                (StatusCode::CONFLICT, "invalid_transition")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "operator request failed");
        }
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}
