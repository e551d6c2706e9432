use super::{ApiResult, ApiState};
use crate::channel::InboundMessage;
use crate::tasks::Task;
use crate::AgentConfigId;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct SubmitMessageBody {
    channel: String,
    chat: String,
    #[serde(default)]
    user: Option<String>,
    agent_config_id: AgentConfigId,
    prompt: String,
}

pub async fn submit_message(State(state): State<Arc<ApiState>>, Json(body): Json<SubmitMessageBody>) -> ApiResult<Task> {
    let task = state
        .channels
        .submit(InboundMessage {
            channel: body.channel,
            chat: body.chat,
            user: body.user,
            agent_config_id: body.agent_config_id,
            prompt: body.prompt,
        })
        .await?;
    Ok(Json(super::Envelope::ok(task)))
}
