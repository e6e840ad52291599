//! Request/response API.
//!
//! Every route sits behind bearer-token authorization; a rejected request
//! never reaches a handler. Errors are rendered as `{"error": "..."}`.

use std::{any::Any, time::Duration};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{FromRequest, Query, Request, State},
    http::{Method, StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use host_agent_core::traits::MutationRequest;
use host_agent_state::{RestoreError, SnapshotError};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::{
    protocol::{
        AppsResponse, CreateSnapshotRequest, CreateSnapshotResponse, DebugLogsRequest,
        DebugLogsResponse, Empty, ErrorBody, ExecuteRequest, ExecuteResponse, FailedCapture,
        InjectRequest, InjectResponse, ModifyAppRequest, ModifyAppResponse, RollbackResponse,
        SnapshotIdRequest, SnapshotResponse, SnapshotsResponse,
    },
    state::AgentState,
    system_info::SystemInfo,
};

/// Request input rejected before any side effect.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing {0}")]
    Missing(&'static str),
    #[error("timeout must be between 1 and {max_ms} ms")]
    Timeout { max_ms: u128 },
}

/// API error rendered as a JSON body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request<E: std::fmt::Display>(e: E) -> Self {
        Self::BadRequest(e.to_string())
    }

    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::bad_request(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

/// Request input: the JSON body, or the query string for GET.
///
/// An empty body reads as `{}` so operations with all-default inputs can
/// be called without one.
pub struct Payload<T>(pub T);

impl<S, T> FromRequest<S> for Payload<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        if req.method() == Method::GET {
            let Query(value) = Query::<T>::try_from_uri(req.uri())
                .map_err(|e| ApiError::BadRequest(e.body_text()))?;
            return Ok(Self(value));
        }
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        let body: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
            b"{}"
        } else {
            &bytes
        };
        serde_json::from_slice(body)
            .map(Self)
            .map_err(|e| ApiError::BadRequest(format!("Invalid request: {e}")))
    }
}

/// Build the API router.
pub fn api_router(state: AgentState) -> Router {
    Router::new()
        .route("/api/execute", post(execute))
        .route("/api/inject", post(inject))
        .route("/api/snapshot", post(create_snapshot))
        .route("/api/rollback", post(rollback))
        .route("/api/system/info", get(system_info).post(system_info))
        .route("/api/debug/logs", get(debug_logs).post(debug_logs))
        .route("/api/apps/list", get(list_apps).post(list_apps))
        .route("/api/apps/modify", post(modify_app))
        .route("/api/snapshots", get(list_snapshots).post(list_snapshots))
        .route("/api/snapshots/get", get(get_snapshot).post(get_snapshot))
        .method_not_allowed_fallback(method_not_allowed)
        .fallback(unknown_endpoint)
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_bearer(State(state): State<AgentState>, request: Request, next: Next) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = state.credentials.authorize_header(header) {
        tracing::warn!(uri = %request.uri(), reason = %e, "rejected request");
        return ApiError::Unauthorized.into_response();
    }
    next.run(request).await
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let message = err
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| err.downcast_ref::<&str>().map(ToString::to_string))
        .unwrap_or_else(|| "handler panicked".to_string());
    ApiError::Internal(message).into_response()
}

async fn unknown_endpoint() -> ApiError {
    ApiError::NotFound("Unknown endpoint".to_string())
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

const fn required(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim_ascii().is_empty() {
        return Err(ValidationError::Missing(field));
    }
    Ok(())
}

async fn execute(
    State(state): State<AgentState>,
    Payload(req): Payload<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    required("command", &req.command)?;
    let timeout = Duration::from_millis(req.timeout);
    if timeout.is_zero() || timeout > state.max_timeout {
        return Err(ValidationError::Timeout {
            max_ms: state.max_timeout.as_millis(),
        }
        .into());
    }

    let execution = state.executor.run(&req.command, timeout).await;
    let error = execution.outcome().err().map(|e| e.to_string());
    Ok(Json(ExecuteResponse {
        timed_out: execution.state == host_agent_executor::ExecutionState::TimedOut,
        output: execution.stdout,
        stderr: execution.stderr,
        exit_code: execution.exit_code,
        error,
        truncated: execution.truncated,
        duration_ms: execution.duration_ms,
    }))
}

async fn inject(
    State(state): State<AgentState>,
    Payload(req): Payload<InjectRequest>,
) -> Result<Json<InjectResponse>, ApiError> {
    required("targetClass", &req.target_class)?;
    required("methodName", &req.method_name)?;
    required("code", &req.code)?;

    let request = MutationRequest {
        target: req.target_class.clone(),
        method: req.method_name.clone(),
        payload: req.code,
        language: req.language,
    };
    let response = match state.orchestrator.apply(&request).await {
        Ok(outcome) => InjectResponse {
            success: true,
            target_class: req.target_class,
            method_name: req.method_name,
            snapshot_id: Some(outcome.snapshot_id),
            error: None,
        },
        Err(failure) => InjectResponse {
            success: false,
            target_class: req.target_class,
            method_name: req.method_name,
            snapshot_id: failure.snapshot_id,
            error: Some(failure.error.to_string()),
        },
    };
    Ok(Json(response))
}

async fn create_snapshot(
    State(state): State<AgentState>,
    Payload(req): Payload<CreateSnapshotRequest>,
) -> Json<CreateSnapshotResponse> {
    Json(match state.snapshots.create(&req.name).await {
        Ok(id) => CreateSnapshotResponse {
            snapshot_id: Some(id),
            success: true,
            error: None,
        },
        Err(e) => {
            tracing::warn!(label = %req.name, error = %e, "snapshot failed");
            CreateSnapshotResponse {
                snapshot_id: None,
                success: false,
                error: Some(e.to_string()),
            }
        }
    })
}

async fn rollback(
    State(state): State<AgentState>,
    Payload(req): Payload<SnapshotIdRequest>,
) -> Result<Json<RollbackResponse>, ApiError> {
    required("snapshotId", &req.snapshot_id)?;
    match state.snapshots.restore(&req.snapshot_id).await {
        Ok(report) => Ok(Json(RollbackResponse {
            success: true,
            snapshot_id: report.snapshot_id,
            restored: report.restored,
            failed: Vec::new(),
        })),
        Err(RestoreError::PartialRestore { restored, failed }) => Ok(Json(RollbackResponse {
            success: false,
            snapshot_id: req.snapshot_id,
            restored,
            failed: failed
                .into_iter()
                .map(|(capture, reason)| FailedCapture { capture, reason })
                .collect(),
        })),
        Err(e @ RestoreError::NotFound(_)) => Err(ApiError::NotFound(e.to_string())),
        Err(e @ RestoreError::Storage(_)) => Err(ApiError::internal(e)),
    }
}

async fn system_info(State(state): State<AgentState>, Payload(_): Payload<Empty>) -> Json<SystemInfo> {
    Json(state.system.collect().await)
}

async fn debug_logs(
    State(state): State<AgentState>,
    Payload(req): Payload<DebugLogsRequest>,
) -> Json<DebugLogsResponse> {
    let logs = state.logs.tail(req.lines, &req.filter);
    Json(DebugLogsResponse {
        count: logs.len(),
        logs,
    })
}

async fn list_apps(
    State(state): State<AgentState>,
    Payload(_): Payload<Empty>,
) -> Result<Json<AppsResponse>, ApiError> {
    let apps = state.catalog.list().await.map_err(ApiError::internal)?;
    Ok(Json(AppsResponse {
        count: apps.len(),
        apps,
    }))
}

async fn modify_app(
    State(state): State<AgentState>,
    Payload(req): Payload<ModifyAppRequest>,
) -> Result<Json<ModifyAppResponse>, ApiError> {
    required("packageName", &req.package_name)?;
    required("modification", &req.modification)?;

    let response = match state
        .orchestrator
        .modify_app(&req.package_name, &req.modification)
        .await
    {
        Ok(done) => ModifyAppResponse {
            success: true,
            message: done.message,
            snapshot_id: Some(done.snapshot_id),
        },
        Err(failure) => ModifyAppResponse {
            success: false,
            message: failure.error.to_string(),
            snapshot_id: failure.snapshot_id,
        },
    };
    Ok(Json(response))
}

async fn list_snapshots(
    State(state): State<AgentState>,
    Payload(_): Payload<Empty>,
) -> Result<Json<SnapshotsResponse>, ApiError> {
    let snapshots = state.snapshots.list().await.map_err(ApiError::internal)?;
    Ok(Json(SnapshotsResponse {
        count: snapshots.len(),
        snapshots,
    }))
}

async fn get_snapshot(
    State(state): State<AgentState>,
    Payload(req): Payload<SnapshotIdRequest>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    required("snapshotId", &req.snapshot_id)?;
    match state.snapshots.get(&req.snapshot_id).await {
        Ok(snapshot) => Ok(Json(SnapshotResponse { snapshot })),
        Err(e @ SnapshotError::NotFound(_)) => Err(ApiError::NotFound(e.to_string())),
        Err(e) => Err(ApiError::internal(e)),
    }
}
