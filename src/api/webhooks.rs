use super::{ApiResult, ApiState};
use crate::webhook::{NewWebhookInput, WebhookSubscription};
use crate::{AgentConfigId, WebhookId};
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct CreateWebhookBody {
    agent_config_id: Option<AgentConfigId>,
    target_url: String,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    secret: Option<String>,
}

pub async fn create_webhook(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<CreateWebhookBody>,
) -> ApiResult<WebhookSubscription> {
    let sub = state
        .webhooks
        .create(NewWebhookInput {
            agent_config_id: body.agent_config_id,
            target_url: body.target_url,
            events: body.events,
            secret: body.secret,
        })
        .await?;
    Ok(Json(super::Envelope::ok(sub)))
}

pub async fn get_webhook(State(state): State<Arc<ApiState>>, Path(id): Path<WebhookId>) -> ApiResult<WebhookSubscription> {
    let sub = state.webhooks.get(id).await?;
    Ok(Json(super::Envelope::ok(sub)))
}

pub async fn list_webhooks(State(state): State<Arc<ApiState>>) -> ApiResult<Vec<WebhookSubscription>> {
    let subs = state.webhooks.list().await?;
    Ok(Json(super::Envelope::ok(subs)))
}

pub async fn delete_webhook(State(state): State<Arc<ApiState>>, Path(id): Path<WebhookId>) -> ApiResult<()> {
    state.webhooks.delete(id).await?;
    Ok(Json(super::Envelope::ok(())))
}

#[derive(Deserialize)]
pub struct SetEnabledBody {
    enabled: bool,
}

pub async fn set_enabled(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<WebhookId>,
    Json(body): Json<SetEnabledBody>,
) -> ApiResult<()> {
    state.webhooks.set_enabled(id, body.enabled).await?;
    Ok(Json(super::Envelope::ok(())))
}
