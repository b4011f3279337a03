//! PulseAudio gateway
//!
//! Bind-mounts the host pulse socket into the container and points
//! `PULSE_SERVER` at it.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::runtime::ContainerRuntime;

use super::{GatewayError, GatewayResult};

const AUDIO_FIELD: &str = "audio";
const SOCKET_FILE_NAME: &str = "pulse-socket";
const PULSE_SERVER_VARIABLE: &str = "PULSE_SERVER";

#[derive(Default)]
pub struct PulseGateway {
    enable_audio: bool,
}

impl PulseGateway {
    pub const ID: &'static str = "pulse";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_config_element(&mut self, element: &Map<String, Value>) -> GatewayResult<()> {
        let value = element
            .get(AUDIO_FIELD)
            .and_then(Value::as_bool)
            .ok_or_else(|| {
                GatewayError::Config(format!("key '{}' missing or not a boolean", AUDIO_FIELD))
            })?;

        if !self.enable_audio {
            self.enable_audio = value;
        }

        Ok(())
    }

    pub async fn activate(&mut self, runtime: &Arc<dyn ContainerRuntime>) -> GatewayResult<()> {
        if !self.enable_audio {
            debug!("Audio will be disabled");
            return Ok(());
        }

        let host_socket = std::env::var(PULSE_SERVER_VARIABLE).map_err(|_| {
            GatewayError::Activation(format!(
                "audio requested but {} is not set on the host",
                PULSE_SERVER_VARIABLE
            ))
        })?;

        info!("Enabling pulseaudio gateway, socket {}", host_socket);
        let container_socket = format!("/gateways/{}", SOCKET_FILE_NAME);

        let mounted = runtime
            .bind_mount(Path::new(&host_socket), &container_socket, false)
            .await
            .map_err(|e| {
                GatewayError::Activation(format!("could not mount pulse socket: {}", e))
            })?;

        let value = format!("unix:{}", mounted.display());
        runtime
            .set_environment_variable(PULSE_SERVER_VARIABLE, &value)
            .await
            .map_err(|e| GatewayError::Activation(e.to_string()))?;

        Ok(())
    }
}
