//! Wayland display gateway
//!
//! Whitelisting gateway for the compositor socket: once enabled it stays
//! enabled, and repeated activations are no-ops since the socket is already
//! the most permissive state.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;

use crate::runtime::ContainerRuntime;

use super::{GatewayError, GatewayResult};

const ENABLED_FIELD: &str = "enabled";
const SOCKET_FILE_NAME: &str = "wayland-0";
const RUNTIME_DIR_VARIABLE: &str = "XDG_RUNTIME_DIR";

#[derive(Default)]
pub struct WaylandGateway {
    enabled: bool,
    activated_once: bool,
}

impl WaylandGateway {
    pub const ID: &'static str = "wayland";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_config_element(&mut self, element: &Map<String, Value>) -> GatewayResult<()> {
        let value = element
            .get(ENABLED_FIELD)
            .and_then(Value::as_bool)
            .ok_or_else(|| {
                GatewayError::Config(format!("key '{}' missing or not a boolean", ENABLED_FIELD))
            })?;

        // Whitelisting: enabled latches, a later restrictive entry is ignored
        if !self.enabled {
            self.enabled = value;
        }

        Ok(())
    }

    pub async fn activate(&mut self, runtime: &Arc<dyn ContainerRuntime>) -> GatewayResult<()> {
        if !self.enabled {
            info!("Wayland gateway disabled");
            return Ok(());
        }

        if self.activated_once {
            info!("Ignoring redundant wayland activation");
            return Ok(());
        }

        let host_dir = std::env::var(RUNTIME_DIR_VARIABLE).map_err(|_| {
            GatewayError::Activation(format!(
                "wayland requested but {} is not set on the host",
                RUNTIME_DIR_VARIABLE
            ))
        })?;

        let host_socket = Path::new(&host_dir).join(SOCKET_FILE_NAME);
        let container_socket = format!("/gateways/{}", SOCKET_FILE_NAME);

        info!("Enabling wayland gateway, socket dir {}", host_dir);
        let mounted = runtime
            .bind_mount(&host_socket, &container_socket, false)
            .await
            .map_err(|e| {
                GatewayError::Activation(format!("could not mount wayland socket: {}", e))
            })?;

        let socket_dir = mounted
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/gateways".to_string());
        runtime
            .set_environment_variable(RUNTIME_DIR_VARIABLE, &socket_dir)
            .await
            .map_err(|e| GatewayError::Activation(e.to_string()))?;

        self.activated_once = true;
        Ok(())
    }
}
