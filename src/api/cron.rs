use super::{ApiResult, ApiState};
use crate::cron::{CronEntry, NewCronEntryInput};
use crate::{AgentConfigId, CronJobId};
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct CreateJobBody {
    name: String,
    agent_config_id: AgentConfigId,
    expression: String,
    prompt: String,
}

pub async fn create_job(State(state): State<Arc<ApiState>>, Json(body): Json<CreateJobBody>) -> ApiResult<CronEntry> {
    let entry = state
        .cron
        .create(NewCronEntryInput {
            name: body.name,
            agent_config_id: body.agent_config_id,
            expression: body.expression,
            prompt: body.prompt,
        })
        .await?;
    Ok(Json(super::Envelope::ok(entry)))
}

pub async fn get_job(State(state): State<Arc<ApiState>>, Path(id): Path<CronJobId>) -> ApiResult<CronEntry> {
    let entry = state.cron.get(id).await?;
    Ok(Json(super::Envelope::ok(entry)))
}

pub async fn list_jobs(State(state): State<Arc<ApiState>>) -> ApiResult<Vec<CronEntry>> {
    let entries = state.cron.list().await?;
    Ok(Json(super::Envelope::ok(entries)))
}

pub async fn delete_job(State(state): State<Arc<ApiState>>, Path(id): Path<CronJobId>) -> ApiResult<()> {
    state.cron.delete(id).await?;
    Ok(Json(super::Envelope::ok(())))
}

#[derive(Deserialize)]
pub struct SetEnabledBody {
    enabled: bool,
}

pub async fn set_enabled(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<CronJobId>,
    Json(body): Json<SetEnabledBody>,
) -> ApiResult<()> {
    state.cron.set_enabled(id, body.enabled).await?;
    Ok(Json(super::Envelope::ok(())))
}

pub async fn trigger_now(State(state): State<Arc<ApiState>>, Path(id): Path<CronJobId>) -> ApiResult<()> {
    state.cron.trigger_now(id).await?;
    Ok(Json(super::Envelope::ok(())))
}
