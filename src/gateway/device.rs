//! Device node gateway
//!
//! Exposes host device nodes inside the container. Dynamic: new devices can
//! be added while the container runs. Reconfiguring a known device widens
//! its mode bits; permissions never narrow for the lifetime of the
//! container.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::runtime::ContainerRuntime;

use super::{GatewayError, GatewayResult};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Device {
    name: String,
    mode: u32,
}

#[derive(Default)]
pub struct DeviceNodeGateway {
    devices: Vec<Device>,
}

impl DeviceNodeGateway {
    pub const ID: &'static str = "device";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_config_element(&mut self, element: &Map<String, Value>) -> GatewayResult<()> {
        let name = element
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::Config("missing 'name' for device entry".into()))?;

        let mode = element
            .get("mode")
            .and_then(Value::as_u64)
            .map(|m| m as u32)
            .ok_or_else(|| GatewayError::Config("missing or invalid 'mode' for device entry".into()))?;

        match self.devices.iter_mut().find(|d| d.name == name) {
            Some(device) => {
                // Permissions are monotonic: only widen, never narrow
                let widened = device.mode | mode;
                if widened != device.mode {
                    debug!(
                        "Widening mode of {} from {:o} to {:o}",
                        name, device.mode, widened
                    );
                    device.mode = widened;
                }
            }
            None => self.devices.push(Device {
                name: name.to_string(),
                mode,
            }),
        }

        Ok(())
    }

    pub async fn activate(&mut self, runtime: &Arc<dyn ContainerRuntime>) -> GatewayResult<()> {
        if self.devices.is_empty() {
            return Err(GatewayError::Activation("no devices configured".into()));
        }

        for device in &self.devices {
            runtime
                .mount_device(&device.name, device.mode)
                .await
                .map_err(|e| {
                    GatewayError::Activation(format!("device {}: {}", device.name, e))
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;
    use serde_json::json;

    fn element(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_parse_device_entry() {
        let mut gw = DeviceNodeGateway::new();
        gw.read_config_element(&element(json!({"name": "/dev/fb0", "mode": 0o644})))
            .unwrap();
        assert_eq!(gw.devices.len(), 1);
        assert_eq!(gw.devices[0].mode, 0o644);
    }

    #[test]
    fn test_missing_fields_rejected() {
        let mut gw = DeviceNodeGateway::new();
        assert!(gw
            .read_config_element(&element(json!({"mode": 0o644})))
            .is_err());
        assert!(gw
            .read_config_element(&element(json!({"name": "/dev/fb0"})))
            .is_err());
        assert!(gw
            .read_config_element(&element(json!({"name": "/dev/fb0", "mode": "rw"})))
            .is_err());
    }

    #[test]
    fn test_mode_only_widens() {
        let mut gw = DeviceNodeGateway::new();
        gw.read_config_element(&element(json!({"name": "/dev/fb0", "mode": 0o600})))
            .unwrap();
        gw.read_config_element(&element(json!({"name": "/dev/fb0", "mode": 0o044})))
            .unwrap();
        assert_eq!(gw.devices.len(), 1);
        assert_eq!(gw.devices[0].mode, 0o644);

        // A narrower mode leaves the wider one in place
        gw.read_config_element(&element(json!({"name": "/dev/fb0", "mode": 0o600})))
            .unwrap();
        assert_eq!(gw.devices[0].mode, 0o644);
    }

    #[tokio::test]
    async fn test_activation_mounts_devices() {
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let runtime: Arc<dyn ContainerRuntime> = mock.clone();

        let mut gw = DeviceNodeGateway::new();
        gw.read_config_element(&element(json!({"name": "/dev/null", "mode": 0o666})))
            .unwrap();
        gw.read_config_element(&element(json!({"name": "/dev/fb0", "mode": 0o644})))
            .unwrap();

        gw.activate(&runtime).await.unwrap();

        assert_eq!(
            mock.devices(),
            vec![
                ("/dev/null".to_string(), 0o666),
                ("/dev/fb0".to_string(), 0o644),
            ]
        );
    }

    #[tokio::test]
    async fn test_activation_without_devices_fails() {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(MockRuntime::new("SC-0"));
        let mut gw = DeviceNodeGateway::new();
        assert!(gw.activate(&runtime).await.is_err());
    }
}
