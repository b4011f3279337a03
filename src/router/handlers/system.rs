//! System information handlers

use axum::{extract::State, Json};
use serde::Serialize;

use super::super::AppState;

/// System information response
#[derive(Debug, Serialize)]
pub struct SystemInfo {
    /// Daemon version
    pub version: String,

    /// Architecture
    pub architecture: String,

    /// Operating system
    pub os: String,

    /// Number of live containers
    pub container_count: usize,
}

/// Get system information
pub async fn system_info(State(state): State<AppState>) -> Json<SystemInfo> {
    let agent = state.agent.lock().await;

    Json(SystemInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        architecture: std::env::consts::ARCH.to_string(),
        os: std::env::consts::OS.to_string(),
        container_count: agent.list_containers().len(),
    })
}
