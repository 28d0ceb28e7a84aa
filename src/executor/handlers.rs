use super::protocol::*;
use super::registry::{JobRegistry, RegistryError};
use super::session::{ControlFlags, ExecutorSessionRegistry, SessionError, SessionId};
use super::types::QueueError;
use crate::ops::{JobId, decode_ops};

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::StatusCode,
    routing::{get, post},
};
use std::fmt::Display;
use std::sync::Arc;

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<(StatusCode, Json<T>), ApiError>;

fn api_error(status: StatusCode, error: impl Display) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn session_error(e: SessionError) -> ApiError {
    let status = match &e {
        SessionError::DuplicateSession(_) => StatusCode::CONFLICT,
        SessionError::UnknownSession(_) => StatusCode::NOT_FOUND,
    };
    api_error(status, e)
}

fn registry_error(e: RegistryError) -> ApiError {
    let status = match &e {
        RegistryError::DuplicateJob(_) => StatusCode::CONFLICT,
        RegistryError::UnknownJob(_) => StatusCode::NOT_FOUND,
        RegistryError::InvalidJobId(..) => StatusCode::BAD_REQUEST,
        RegistryError::Queue(QueueError::WrongJob { .. }) => StatusCode::BAD_REQUEST,
        RegistryError::Queue(_) => StatusCode::CONFLICT,
        RegistryError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("{}", e);
    }
    api_error(status, e)
}

/// All server routes over the job and session registries.
pub fn router(jobs: Arc<JobRegistry>, sessions: Arc<ExecutorSessionRegistry>) -> Router {
    Router::new()
        .route(ENDPOINT_EXECUTOR_START, post(handle_executor_start))
        .route(ENDPOINT_EXECUTOR_STOP, post(handle_executor_stop))
        .route(ENDPOINT_EXECUTOR_PING, post(handle_executor_ping))
        .route(ENDPOINT_EXECUTOR_POLL, post(handle_executor_poll))
        .route(ENDPOINT_EXECUTOR_CONTROL, post(handle_executor_control))
        .route(ENDPOINT_EXECUTOR_SESSIONS, get(handle_executor_sessions))
        .route(ENDPOINT_JOB_OPS, post(handle_add_ops))
        .route(ENDPOINT_JOB_STATS, get(handle_job_stats))
        .route(ENDPOINT_JOB_POLLING, post(handle_set_polling))
        .route(ENDPOINT_JOB_RETRY_ERRORS, post(handle_retry_errors))
        .route(ENDPOINT_JOB_PURGE_DONE, post(handle_purge_done))
        .route(ENDPOINT_IO_THROUGHPUT, get(handle_io_throughput))
        .layer(Extension(jobs))
        .layer(Extension(sessions))
}

// --- Executor sessions ---

pub async fn handle_executor_start(
    Extension(sessions): Extension<Arc<ExecutorSessionRegistry>>,
    Json(req): Json<StartSessionRequest>,
) -> ApiResult<ControlResponse> {
    let control = sessions.start(req).map_err(session_error)?;
    Ok((StatusCode::OK, Json(ControlResponse { control })))
}

pub async fn handle_executor_stop(
    Extension(sessions): Extension<Arc<ExecutorSessionRegistry>>,
    Json(req): Json<StopSessionRequest>,
) -> ApiResult<StopSessionResponse> {
    let requeued = sessions
        .stop(&req.session_id, &req.reason)
        .map_err(session_error)?;
    Ok((StatusCode::OK, Json(StopSessionResponse { requeued })))
}

pub async fn handle_executor_ping(
    Extension(sessions): Extension<Arc<ExecutorSessionRegistry>>,
    Json(req): Json<PingAliveRequest>,
) -> ApiResult<ControlResponse> {
    let control = sessions.ping_alive(&req.session_id).map_err(session_error)?;
    Ok((StatusCode::OK, Json(ControlResponse { control })))
}

pub async fn handle_executor_poll(
    Extension(sessions): Extension<Arc<ExecutorSessionRegistry>>,
    Json(req): Json<PollRequest>,
) -> ApiResult<PollResponse> {
    tracing::trace!(
        "Poll from {}: {} results, {} wanted",
        req.session_id,
        req.results.len(),
        req.poll_count
    );
    let outcome = sessions
        .poll_next(&req.session_id, req.results, req.poll_count)
        .map_err(session_error)?;
    Ok((
        StatusCode::OK,
        Json(PollResponse {
            ops: outcome.ops,
            control: outcome.control,
        }),
    ))
}

pub async fn handle_executor_control(
    Extension(sessions): Extension<Arc<ExecutorSessionRegistry>>,
    Path(session_id): Path<String>,
    Json(control): Json<ControlFlags>,
) -> ApiResult<ControlResponse> {
    sessions
        .set_control(&SessionId(session_id), control)
        .map_err(session_error)?;
    Ok((StatusCode::OK, Json(ControlResponse { control })))
}

pub async fn handle_executor_sessions(
    Extension(sessions): Extension<Arc<ExecutorSessionRegistry>>,
) -> (StatusCode, Json<SessionsResponse>) {
    (
        StatusCode::OK,
        Json(SessionsResponse {
            sessions: sessions.sessions(),
        }),
    )
}

// --- Jobs ---

/// Body: operations in the text encoding. Creates the job on first use.
pub async fn handle_add_ops(
    Extension(jobs): Extension<Arc<JobRegistry>>,
    Path(job_id): Path<String>,
    body: String,
) -> ApiResult<AddOpsResponse> {
    let job_id = JobId(job_id);
    let ops = decode_ops(&body, &job_id).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    let added = ops.len();
    let entry = jobs.get_or_create(&job_id).map_err(registry_error)?;
    entry.add_ops(ops).map_err(registry_error)?;
    tracing::info!("Job {}: accepted {} operations", job_id, added);
    Ok((StatusCode::OK, Json(AddOpsResponse { added })))
}

pub async fn handle_job_stats(
    Extension(jobs): Extension<Arc<JobRegistry>>,
    Path(job_id): Path<String>,
) -> ApiResult<JobStatsResponse> {
    let entry = jobs.job(&JobId(job_id)).map_err(registry_error)?;
    Ok((StatusCode::OK, Json(entry.to_stats())))
}

pub async fn handle_set_polling(
    Extension(jobs): Extension<Arc<JobRegistry>>,
    Path(job_id): Path<String>,
    Json(req): Json<SetPollingRequest>,
) -> ApiResult<JobStatsResponse> {
    let entry = jobs.job(&JobId(job_id)).map_err(registry_error)?;
    entry.set_polling_active(req.active);
    Ok((StatusCode::OK, Json(entry.to_stats())))
}

pub async fn handle_retry_errors(
    Extension(jobs): Extension<Arc<JobRegistry>>,
    Path(job_id): Path<String>,
) -> ApiResult<RetryErrorsResponse> {
    let entry = jobs.job(&JobId(job_id)).map_err(registry_error)?;
    let retried = entry.queue().retry_error_ops();
    Ok((StatusCode::OK, Json(RetryErrorsResponse { retried })))
}

pub async fn handle_purge_done(
    Extension(jobs): Extension<Arc<JobRegistry>>,
    Path(job_id): Path<String>,
) -> ApiResult<PurgeDoneResponse> {
    let purged = jobs
        .purge_done_ops(&JobId(job_id))
        .map_err(registry_error)?;
    Ok((
        StatusCode::OK,
        Json(PurgeDoneResponse {
            results: purged.into_iter().map(|done| done.result).collect(),
        }),
    ))
}

pub async fn handle_io_throughput(
    Extension(jobs): Extension<Arc<JobRegistry>>,
) -> (StatusCode, Json<ThroughputResponse>) {
    (
        StatusCode::OK,
        Json(ThroughputResponse {
            storages: jobs.tracker().snapshot(),
        }),
    )
}
