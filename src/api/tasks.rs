use super::sse::event_stream;
use super::{ApiError, ApiResult, ApiState, Envelope};
use crate::tasks::{CreateTaskRequest as ManagerCreateTaskRequest, Task, TaskStatus};
use crate::{AgentConfigId, TaskId};
use axum::extract::{Path, Query, State};
use axum::response::sse::Sse;
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Deserialize)]
pub struct ListTasksQuery {
    status: Option<TaskStatus>,
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn list_tasks(State(state): State<Arc<ApiState>>, Query(query): Query<ListTasksQuery>) -> ApiResult<Vec<Task>> {
    let tasks = state.tasks.list_tasks(query.status, query.limit).await?;
    Ok(Json(Envelope::ok(tasks)))
}

/// `task_id` present means append a turn to an existing task;
/// `agent_config_id` present means start a new one — spec.md §6's
/// `POST /api/v1/tasks` dual-purpose endpoint.
#[derive(Deserialize)]
pub struct CreateTaskBody {
    task_id: Option<TaskId>,
    agent_config_id: Option<AgentConfigId>,
    prompt: String,
    #[serde(default)]
    attachments: Vec<String>,
    #[serde(default)]
    webhook_url: Option<String>,
    #[serde(default)]
    wall_timeout_secs: Option<u64>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

pub async fn create_task(State(state): State<Arc<ApiState>>, Json(body): Json<CreateTaskBody>) -> ApiResult<Task> {
    let task = state
        .tasks
        .create_task(ManagerCreateTaskRequest {
            task_id: body.task_id,
            agent_config_id: body.agent_config_id,
            prompt: body.prompt,
            attachments: body.attachments,
            webhook_url: body.webhook_url,
            wall_timeout: body.wall_timeout_secs.map(Duration::from_secs),
            metadata: body.metadata,
        })
        .await?;
    Ok(Json(Envelope::ok(task)))
}

pub async fn get_task(State(state): State<Arc<ApiState>>, Path(id): Path<TaskId>) -> ApiResult<Task> {
    let task = state.tasks.get_task(id).await?;
    Ok(Json(Envelope::ok(task)))
}

pub async fn cancel_task(State(state): State<Arc<ApiState>>, Path(id): Path<TaskId>) -> ApiResult<()> {
    state.tasks.cancel_task(id).await?;
    Ok(Json(Envelope::ok(())))
}

pub async fn task_events(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<TaskId>,
) -> Result<Sse<impl futures::Stream<Item = Result<axum::response::sse::Event, std::convert::Infallible>>>, ApiError> {
    // Touches the store first so an unknown task id 404s instead of
    // opening a stream that will simply sit idle forever.
    state.tasks.get_task(id).await?;
    let rx = state.tasks.subscribe(id).await;
    Ok(event_stream(rx, |event: &crate::TaskEvent| {
        (event.event_name().to_string(), matches!(event, crate::TaskEvent::Completed { .. } | crate::TaskEvent::Failed { .. } | crate::TaskEvent::Cancelled { .. }))
    }))
}
