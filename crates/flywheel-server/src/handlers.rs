use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use flywheel_core::ids::{CycleId, JobId, SubscriberId};
use flywheel_engine::{EngineError, JobConfig};
use flywheel_store::StoreError;

use crate::server::AppState;

/// EngineError mapped onto an HTTP response. Control errors are conflicts,
/// validation is a bad request, unknown rows are 404.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::AlreadyRunning(_)
            | EngineError::NotRunning(_)
            | EngineError::InvalidState { .. } => StatusCode::CONFLICT,
            EngineError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            EngineError::Store(_) | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub user_id: String,
    #[serde(flatten)]
    pub config: JobConfig,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub user_id: Option<String>,
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.engine.create_job(&request.user_id, request.config)?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = state.engine.list_jobs(query.user_id.as_deref())?;
    Ok(Json(jobs))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.engine.get_job_with_cycles(&JobId::from_raw(id))?;
    Ok(Json(view))
}

pub async fn get_cycle(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.engine.get_cycle_with_tasks(&CycleId::from_raw(id))?;
    Ok(Json(view))
}

pub async fn start_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.start_job(&JobId::from_raw(id))?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn pause_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.pause_job(&JobId::from_raw(id))?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn resume_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.resume_job(&JobId::from_raw(id))?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.cancel_job(&JobId::from_raw(id)).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Relay the job's broadcast events as Server-Sent Events. The subscription
/// lives as long as the response stream; a disconnecting client drops it
/// and the hub forgets the callback.
pub async fn job_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let job_id = JobId::from_raw(id);
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    let subscription = state.engine.broadcaster().subscribe(
        &job_id,
        SubscriberId::new(),
        Arc::new(move |event| {
            let _ = tx.send(event.clone());
        }),
    );

    let stream = UnboundedReceiverStream::new(rx).map(move |event| {
        let _keep = &subscription;
        let sse = Event::default().event(event.event_type());
        Ok(sse.json_data(&event).unwrap_or_else(|_| Event::default().data("{}")))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
