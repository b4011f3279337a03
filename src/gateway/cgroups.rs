//! Cgroups gateway
//!
//! Applies cgroup settings verbatim to the container. Application is
//! one-shot: items are applied in configuration order and the first failing
//! item aborts activation without rolling back the items already applied.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;

use crate::runtime::ContainerRuntime;

use super::{GatewayError, GatewayResult};

#[derive(Default)]
pub struct CgroupsGateway {
    settings: Vec<(String, String)>,
}

impl CgroupsGateway {
    pub const ID: &'static str = "cgroups";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_config_element(&mut self, element: &Map<String, Value>) -> GatewayResult<()> {
        let setting = element
            .get("setting")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Config("'setting' is missing or not a string".into()))?;

        let value = element
            .get("value")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Config("'value' is missing or not a string".into()))?;

        if let Some(existing) = self.settings.iter_mut().find(|(s, _)| s == setting) {
            warn!(
                "Cgroup setting '{}' given more than once, overriding '{}' with '{}'",
                setting, existing.1, value
            );
            existing.1 = value.to_string();
        } else {
            self.settings.push((setting.to_string(), value.to_string()));
        }

        Ok(())
    }

    pub async fn activate(&mut self, runtime: &Arc<dyn ContainerRuntime>) -> GatewayResult<()> {
        for (setting, value) in &self.settings {
            runtime
                .set_cgroup_item(setting, value)
                .await
                .map_err(|e| {
                    GatewayError::Activation(format!(
                        "could not set cgroup item {} = {}: {}",
                        setting, value, e
                    ))
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
    fn test_parse_setting() {
        let mut gw = CgroupsGateway::new();
        gw.read_config_element(&element(
            json!({"setting": "memory.max", "value": "268435456"}),
        ))
        .unwrap();
        assert_eq!(gw.settings.len(), 1);
    }

    #[test]
    fn test_non_string_fields_rejected() {
        let mut gw = CgroupsGateway::new();
        assert!(gw
            .read_config_element(&element(json!({"setting": "memory.max", "value": 42})))
            .is_err());
        assert!(gw
            .read_config_element(&element(json!({"value": "42"})))
            .is_err());
    }

    #[test]
    fn test_duplicate_setting_last_write_wins() {
        let mut gw = CgroupsGateway::new();
        gw.read_config_element(&element(json!({"setting": "memory.max", "value": "100"})))
            .unwrap();
        gw.read_config_element(&element(json!({"setting": "memory.max", "value": "200"})))
            .unwrap();

        assert_eq!(gw.settings, vec![("memory.max".to_string(), "200".to_string())]);
    }

    #[tokio::test]
    async fn test_activation_applies_in_order() {
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let runtime: Arc<dyn ContainerRuntime> = mock.clone();

        let mut gw = CgroupsGateway::new();
        gw.read_config_element(&element(json!({"setting": "memory.max", "value": "100"})))
            .unwrap();
        gw.read_config_element(&element(json!({"setting": "pids.max", "value": "64"})))
            .unwrap();

        gw.activate(&runtime).await.unwrap();

        assert_eq!(
            mock.cgroup_items(),
            vec![
                ("memory.max".to_string(), "100".to_string()),
                ("pids.max".to_string(), "64".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_first_failure_aborts_without_rollback() {
        let mock = Arc::new(MockRuntime::new("SC-0"));
        let runtime: Arc<dyn ContainerRuntime> = mock.clone();
        mock.fail_on("cgroup:bogus.setting");

        let mut gw = CgroupsGateway::new();
        gw.read_config_element(&element(json!({"setting": "memory.max", "value": "100"})))
            .unwrap();
        gw.read_config_element(&element(json!({"setting": "bogus.setting", "value": "1"})))
            .unwrap();
        gw.read_config_element(&element(json!({"setting": "pids.max", "value": "64"})))
            .unwrap();

        let err = gw.activate(&runtime).await.unwrap_err();
        assert!(matches!(err, GatewayError::Activation(_)));

        // The item before the failure stays applied, the one after is never
        // attempted
        assert_eq!(
            mock.cgroup_items(),
            vec![("memory.max".to_string(), "100".to_string())]
        );
    }
}
