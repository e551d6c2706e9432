use super::{ApiState, Envelope};
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct HealthBody {
    status: &'static str,
    uptime_secs: u64,
}

pub async fn health(State(state): State<Arc<ApiState>>) -> Json<Envelope<HealthBody>> {
    Json(Envelope::ok(HealthBody { status: "ok", uptime_secs: state.started_at.elapsed().as_secs() }))
}
