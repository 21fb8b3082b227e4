use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    Json,
};
use db::models::SignalRow;
use engine::{CompensationView, RunSummary, RunView};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SignalDto {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct SignalResponse {
    pub handled: bool,
}

pub async fn get(Path(id): Path<Uuid>, State(state): State<AppState>) -> ApiResult<Json<RunView>> {
    Ok(Json(state.orchestrator.get_run(id).await?))
}

pub async fn cancel(Path(id): Path<Uuid>, State(state): State<AppState>) -> ApiResult<Json<RunSummary>> {
    Ok(Json(state.orchestrator.cancel_run(id).await?))
}

pub async fn signal(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<SignalDto>,
) -> ApiResult<Json<SignalResponse>> {
    let handled = state
        .orchestrator
        .send_signal(id, &payload.name, payload.payload)
        .await?;
    Ok(Json(SignalResponse { handled }))
}

pub async fn signals(Path(id): Path<Uuid>, State(state): State<AppState>) -> ApiResult<Json<Vec<SignalRow>>> {
    state.orchestrator.get_run(id).await?;
    Ok(Json(state.orchestrator.signals(id).await?))
}

pub async fn vars(Path(id): Path<Uuid>, State(state): State<AppState>) -> ApiResult<Json<BTreeMap<String, Value>>> {
    // Distinguish an unknown run from one without variables.
    state.orchestrator.get_run(id).await?;
    Ok(Json(state.orchestrator.run_vars(id).await?))
}

pub async fn compensations(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<CompensationView>>> {
    state.orchestrator.get_run(id).await?;
    Ok(Json(state.orchestrator.compensations(id).await?))
}
