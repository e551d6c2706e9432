//! HTTP/SSE surface (spec §6). `axum` router nested under `/api/v1`,
//! state in a single `Arc<ApiState>` — mirrors the teacher's
//! `api/server.rs` (route wiring, `State<Arc<ApiState>>`) and
//! `api/tasks.rs` (per-route handler shape: extract state, look up the
//! owning manager, map domain errors to a status code).

mod auth;
mod batches;
mod channels;
mod cron;
mod health;
mod sse;
mod tasks;
mod webhooks;

use crate::batch::BatchScheduler;
use crate::channel::ChannelSessionStore;
use crate::config::Config;
use crate::cron::CronScheduler;
use crate::error::{Error, ErrorKind};
use crate::tasks::TaskManager;
use crate::webhook::WebhookStore;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

pub struct ApiState {
    pub tasks: Arc<TaskManager>,
    pub batches: Arc<BatchScheduler>,
    pub webhooks: Arc<WebhookStore>,
    pub cron: Arc<CronScheduler>,
    pub channels: Arc<ChannelSessionStore>,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

/// Every response is `{code, message, data}` with `code = 0` on success
/// (spec.md §6); `ok` and the `ApiError` response both go through this.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub code: i32,
    pub message: String,
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self { code: 0, message: "ok".to_string(), data: Some(data) }
    }
}

pub type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyExists | ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::DependencyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::AdapterParseError | ErrorKind::AdapterRuntimeError | ErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Envelope::<()> { code: 1, message: self.0.to_string(), data: None };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let authenticated = Router::new()
        .route("/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/tasks/{id}", get(tasks::get_task))
        .route("/tasks/{id}/cancel", post(tasks::cancel_task))
        .route("/tasks/{id}/events", get(tasks::task_events))
        .route("/batches", get(batches::list_batches).post(batches::create_batch))
        .route("/batches/{id}", get(batches::get_batch))
        .route("/batches/{id}/tasks", get(batches::list_batch_tasks))
        .route("/batches/{id}/events", get(batches::batch_events))
        .route("/batches/{id}/start", post(batches::resume_batch))
        .route("/batches/{id}/pause", post(batches::pause_batch))
        .route("/batches/{id}/cancel", post(batches::cancel_batch))
        .route("/batches/{id}/retry", post(batches::retry_dead))
        .route("/webhooks", get(webhooks::list_webhooks).post(webhooks::create_webhook))
        .route("/webhooks/{id}", get(webhooks::get_webhook).delete(webhooks::delete_webhook))
        .route("/webhooks/{id}/enabled", post(webhooks::set_enabled))
        .route("/cron", get(cron::list_jobs).post(cron::create_job))
        .route("/cron/{id}", get(cron::get_job).delete(cron::delete_job))
        .route("/cron/{id}/enabled", post(cron::set_enabled))
        .route("/cron/{id}/trigger", post(cron::trigger_now))
        .route("/channels/messages", post(channels::submit_message))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), auth::require_auth));

    let public = Router::new().route("/health", get(health::health));

    Router::new().nest("/api/v1", public.merge(authenticated)).layer(cors).with_state(state)
}
