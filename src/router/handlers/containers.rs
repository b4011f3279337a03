//! Container RPC handlers

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::container::ContainerId;
use crate::error::Result;

use super::super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateContainerRequest {
    /// Dynamic options document, a JSON array of option objects
    #[serde(default = "default_options")]
    pub options: String,
}

fn default_options() -> String {
    "[]".to_string()
}

#[derive(Debug, Serialize)]
pub struct CreateContainerResponse {
    pub id: ContainerId,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub command: String,

    #[serde(default)]
    pub working_dir: String,

    #[serde(default)]
    pub output_file: String,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub pid: i32,
}

#[derive(Debug, Deserialize)]
pub struct BindMountRequest {
    pub host_path: String,
    pub container_path: String,

    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetCapabilitiesRequest {
    pub capabilities: Vec<String>,
}

pub async fn list_containers(State(state): State<AppState>) -> Json<Vec<ContainerId>> {
    let agent = state.agent.lock().await;
    Json(agent.list_containers())
}

pub async fn list_capabilities(State(state): State<AppState>) -> Json<Vec<String>> {
    let agent = state.agent.lock().await;
    Json(agent.list_capabilities())
}

pub async fn create_container(
    State(state): State<AppState>,
    Json(request): Json<CreateContainerRequest>,
) -> Result<(StatusCode, Json<CreateContainerResponse>)> {
    let mut agent = state.agent.lock().await;
    let id = agent.create_container(&request.options).await?;
    Ok((StatusCode::CREATED, Json(CreateContainerResponse { id })))
}

pub async fn destroy_container(
    State(state): State<AppState>,
    Path(container_id): Path<i64>,
) -> Result<StatusCode> {
    let mut agent = state.agent.lock().await;
    agent.shutdown_container(container_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Spawn a command inside the container. The process exit is announced
/// asynchronously on the event stream.
pub async fn execute(
    State(state): State<AppState>,
    Path(container_id): Path<i64>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>> {
    let mut agent = state.agent.lock().await;

    // The agent already publishes ProcessStateChanged through the bus; no
    // per-call listener is needed here
    let pid = agent
        .execute(
            container_id,
            &request.command,
            &request.working_dir,
            &request.output_file,
            request.env,
            |_, _| {},
        )
        .await?;

    Ok(Json(ExecuteResponse { pid }))
}

pub async fn suspend_container(
    State(state): State<AppState>,
    Path(container_id): Path<i64>,
) -> Result<StatusCode> {
    let mut agent = state.agent.lock().await;
    agent.suspend_container(container_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn resume_container(
    State(state): State<AppState>,
    Path(container_id): Path<i64>,
) -> Result<StatusCode> {
    let mut agent = state.agent.lock().await;
    agent.resume_container(container_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn bind_mount(
    State(state): State<AppState>,
    Path(container_id): Path<i64>,
    Json(request): Json<BindMountRequest>,
) -> Result<StatusCode> {
    let mut agent = state.agent.lock().await;
    agent
        .bind_mount(
            container_id,
            &request.host_path,
            &request.container_path,
            request.read_only,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_capabilities(
    State(state): State<AppState>,
    Path(container_id): Path<i64>,
    Json(request): Json<SetCapabilitiesRequest>,
) -> Result<StatusCode> {
    let mut agent = state.agent.lock().await;
    agent
        .set_capabilities(container_id, &request.capabilities)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
