use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use engine::{NewRun, NewWorkflow, RegisteredWorkflow, RunSummary, WorkflowView};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct WorkflowFilter {
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PlanDto {
    pub definition_text: String,
}

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub dag: engine::Dag,
    pub order: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRunDto {
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub caller: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<NewWorkflow>,
) -> ApiResult<(StatusCode, Json<RegisteredWorkflow>)> {
    let workflow = state.orchestrator.register_workflow(payload).await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<WorkflowFilter>,
) -> ApiResult<Json<Vec<WorkflowView>>> {
    let workflows = state
        .orchestrator
        .list_workflows(filter.name.as_deref(), filter.version.as_deref())
        .await?;
    Ok(Json(workflows))
}

pub async fn get(Path(id): Path<Uuid>, State(state): State<AppState>) -> ApiResult<Json<WorkflowView>> {
    Ok(Json(state.orchestrator.get_workflow(id).await?))
}

/// Compile a definition without storing it.
pub async fn plan(State(state): State<AppState>, Json(payload): Json<PlanDto>) -> ApiResult<Json<PlanResponse>> {
    let dag = state.orchestrator.plan(&payload.definition_text)?;
    let order = dag.topological_order().into_iter().map(str::to_owned).collect();
    Ok(Json(PlanResponse { dag, order }))
}

pub async fn start_run(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<StartRunDto>,
) -> ApiResult<(StatusCode, Json<RunSummary>)> {
    let summary = state
        .orchestrator
        .start_run(NewRun {
            workflow_id: id,
            inputs: payload.inputs,
            tenant: payload.tenant,
            caller: payload.caller,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(summary)))
}

pub async fn list_runs(Path(id): Path<Uuid>, State(state): State<AppState>) -> ApiResult<Json<Vec<RunSummary>>> {
    Ok(Json(state.orchestrator.list_runs(id).await?))
}
