use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::jobs::JobError;
use crate::runtime::RuntimeError;

/// Errors surfaced to RPC clients.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid container id: {0}")]
    InvalidContainerId(i64),

    #[error("No container matching id {0}")]
    NoSuchContainer(i64),

    #[error("Operation invalid in container state {state}: {operation}")]
    InvalidContainerState { operation: String, state: String },

    #[error("Container {0} is in an invalid state and can no longer be used")]
    InvalidContainer(i64),

    #[error("Gateway configuration rejected: {0}")]
    GatewayConfig(String),

    #[error("Gateway activation failed: {0}")]
    GatewayActivation(String),

    #[error("Gateway teardown failed: {0}")]
    GatewayTeardown(String),

    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<GatewayError> for AgentError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Config(msg) => AgentError::GatewayConfig(msg),
            GatewayError::Activation(msg) => AgentError::GatewayActivation(msg),
            GatewayError::Teardown(msg) => AgentError::GatewayTeardown(msg),
            GatewayError::NotAttached => {
                AgentError::GatewayActivation("gateway has no attached container".into())
            }
        }
    }
}

impl From<JobError> for AgentError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Runtime(e) => AgentError::Runtime(e),
            other => AgentError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AgentError::InvalidContainerId(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AgentError::NoSuchContainer(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AgentError::InvalidContainerState { .. } => (StatusCode::CONFLICT, self.to_string()),
            AgentError::InvalidContainer(_) => (StatusCode::CONFLICT, self.to_string()),
            AgentError::GatewayConfig(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AgentError::GatewayActivation(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AgentError::GatewayTeardown(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AgentError::Runtime(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            AgentError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": true,
            "message": message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_conversion() {
        let err: AgentError = GatewayError::Config("bad shape".into()).into();
        assert!(matches!(err, AgentError::GatewayConfig(_)));

        let err: AgentError = GatewayError::NotAttached.into();
        assert!(matches!(err, AgentError::GatewayActivation(_)));
    }
}
