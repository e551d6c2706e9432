use super::sse::event_stream;
use super::{ApiResult, ApiState};
use crate::batch::{Batch, BatchTask, CreateBatchRequest};
use crate::BatchId;
use crate::BatchEvent;
use axum::extract::{Path, State};
use axum::response::sse::Sse;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct CreateBatchBody {
    name: String,
    agent_config_id: crate::AgentConfigId,
    template: String,
    inputs: Vec<String>,
    #[serde(default = "default_concurrency")]
    concurrency: u32,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
}

fn default_concurrency() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    0
}

pub async fn create_batch(State(state): State<Arc<ApiState>>, Json(body): Json<CreateBatchBody>) -> ApiResult<Batch> {
    let batch = state
        .batches
        .create_batch(CreateBatchRequest {
            name: body.name,
            agent_config_id: body.agent_config_id,
            template: body.template,
            inputs: body.inputs,
            concurrency: body.concurrency,
            max_retries: body.max_retries,
        })
        .await?;
    Ok(Json(super::Envelope::ok(batch)))
}

pub async fn get_batch(State(state): State<Arc<ApiState>>, Path(id): Path<BatchId>) -> ApiResult<Batch> {
    let batch = state.batches.get_batch(id).await?;
    Ok(Json(super::Envelope::ok(batch)))
}

pub async fn list_batches(State(state): State<Arc<ApiState>>) -> ApiResult<Vec<Batch>> {
    let batches = state.batches.list_batches(100).await?;
    Ok(Json(super::Envelope::ok(batches)))
}

pub async fn list_batch_tasks(State(state): State<Arc<ApiState>>, Path(id): Path<BatchId>) -> ApiResult<Vec<BatchTask>> {
    let tasks = state.batches.list_batch_tasks(id).await?;
    Ok(Json(super::Envelope::ok(tasks)))
}

pub async fn batch_events(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<BatchId>,
) -> Result<Sse<impl futures::Stream<Item = Result<axum::response::sse::Event, std::convert::Infallible>>>, super::ApiError> {
    // Touches the store first so an unknown batch id 404s instead of
    // opening a stream that will simply sit idle forever.
    state.batches.get_batch(id).await?;
    let rx = state.batches.subscribe(id).await;
    Ok(event_stream(rx, |event: &BatchEvent| (batch_event_name(event).to_string(), matches!(event, BatchEvent::Completed { .. } | BatchEvent::Cancelled { .. }))))
}

fn batch_event_name(event: &BatchEvent) -> &'static str {
    match event {
        BatchEvent::Created { .. } => "batch.created",
        BatchEvent::TaskClaimed { .. } => "batch.task.claimed",
        BatchEvent::TaskCompleted { .. } => "batch.task.completed",
        BatchEvent::TaskFailed { .. } => "batch.task.failed",
        BatchEvent::TaskDeadLettered { .. } => "batch.task.dead_lettered",
        BatchEvent::Paused { .. } => "batch.paused",
        BatchEvent::Resumed { .. } => "batch.resumed",
        BatchEvent::Cancelled { .. } => "batch.cancelled",
        BatchEvent::Completed { .. } => "batch.completed",
        BatchEvent::Progress { .. } => "batch.progress",
    }
}

pub async fn resume_batch(State(state): State<Arc<ApiState>>, Path(id): Path<BatchId>) -> ApiResult<()> {
    state.batches.resume(id).await?;
    Ok(Json(super::Envelope::ok(())))
}

pub async fn pause_batch(State(state): State<Arc<ApiState>>, Path(id): Path<BatchId>) -> ApiResult<()> {
    state.batches.pause(id).await?;
    Ok(Json(super::Envelope::ok(())))
}

pub async fn cancel_batch(State(state): State<Arc<ApiState>>, Path(id): Path<BatchId>) -> ApiResult<()> {
    state.batches.cancel(id).await?;
    Ok(Json(super::Envelope::ok(())))
}

#[derive(serde::Serialize)]
pub struct RetryDeadBody {
    reset: u64,
}

pub async fn retry_dead(State(state): State<Arc<ApiState>>, Path(id): Path<BatchId>) -> ApiResult<RetryDeadBody> {
    let reset = state.batches.retry_dead(id).await?;
    Ok(Json(super::Envelope::ok(RetryDeadBody { reset })))
}
