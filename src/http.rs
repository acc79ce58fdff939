//! HTTP submission endpoint.
//!
//! - `POST /tasks/create`: submit the JSON body as a `task_created` payload
//! - `GET /tasks/status`: producer liveness and broker connectivity

use crate::core::Submitter;
use crate::envelope::TaskId;
use crate::error::AnvilError;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::net::TcpListener;

/// Build the producer router on top of `submitter`.
pub fn router(submitter: Submitter) -> Router {
    Router::new()
        .route("/tasks/create", post(create_task))
        .route("/tasks/status", get(status))
        .with_state(submitter)
}

/// Serve the router until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    submitter: Submitter,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Producer listening on {}", addr);
    }
    axum::serve(listener, router(submitter))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Response body for an accepted submission.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedTask {
    /// Always `"queued"`
    pub status: String,
    /// Id of the new task
    pub id: TaskId,
    /// Human-readable confirmation
    pub message: String,
}

/// Response body for the status probe.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProducerStatus {
    /// Always `"Producer is running"`
    pub status: String,
    /// Whether the broker connection is up
    pub connected: bool,
    /// Work queue tasks are submitted to
    pub queue: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Submission failure mapped to an HTTP status.
#[derive(Debug)]
pub struct ApiError(AnvilError);

impl From<AnvilError> for ApiError {
    fn from(error: AnvilError) -> Self {
        Self(error)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            e if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            AnvilError::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AnvilError::Encode(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Task submission failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn create_task(
    State(submitter): State<Submitter>,
    Json(payload): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<CreatedTask>), ApiError> {
    let id = submitter.submit(&payload).await?;
    tracing::info!("Task {} created and sent to {}", id, submitter.queue_name());

    Ok((
        StatusCode::ACCEPTED,
        Json(CreatedTask {
            status: "queued".to_string(),
            id,
            message: "Task created and sent to the queue".to_string(),
        }),
    ))
}

async fn status(State(submitter): State<Submitter>) -> Json<ProducerStatus> {
    Json(ProducerStatus {
        status: "Producer is running".to_string(),
        connected: submitter.is_connected(),
        queue: submitter.queue_name().to_string(),
    })
}
