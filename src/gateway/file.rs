//! File gateway
//!
//! Exposes individual host paths inside the container via bind mounts,
//! optionally writable, optionally exporting the resulting in-container
//! path through an environment variable.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::runtime::ContainerRuntime;

use super::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Default)]
struct FileSetting {
    path_host: String,
    path_container: String,
    read_only: bool,
    create_symlink: bool,
    env_var_name: String,
    env_var_prefix: String,
    env_var_suffix: String,
}

#[derive(Default)]
pub struct FileGateway {
    settings: Vec<FileSetting>,
}

impl FileGateway {
    pub const ID: &'static str = "file";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_config_element(&mut self, element: &Map<String, Value>) -> GatewayResult<()> {
        let mut setting = FileSetting {
            read_only: true,
            ..Default::default()
        };

        let string_fields: [(&str, &mut String); 5] = [
            ("path-host", &mut setting.path_host),
            ("path-container", &mut setting.path_container),
            ("env-var-name", &mut setting.env_var_name),
            ("env-var-prefix", &mut setting.env_var_prefix),
            ("env-var-suffix", &mut setting.env_var_suffix),
        ];

        for (key, slot) in string_fields {
            if let Some(value) = element.get(key) {
                *slot = value
                    .as_str()
                    .ok_or_else(|| {
                        GatewayError::Config(format!("value for '{}' is not a string", key))
                    })?
                    .to_string();
            }
        }

        let bool_fields: [(&str, &mut bool); 2] = [
            ("read-only", &mut setting.read_only),
            ("create-symlink", &mut setting.create_symlink),
        ];

        for (key, slot) in bool_fields {
            if let Some(value) = element.get(key) {
                *slot = value.as_bool().ok_or_else(|| {
                    GatewayError::Config(format!("value for '{}' is not a boolean", key))
                })?;
            }
        }

        if setting.path_host.is_empty() {
            return Err(GatewayError::Config("'path-host' setting is missing".into()));
        }
        if setting.path_container.is_empty() {
            return Err(GatewayError::Config(
                "'path-container' setting is missing".into(),
            ));
        }

        if self
            .settings
            .iter()
            .any(|s| s.path_container == setting.path_container)
        {
            return Err(GatewayError::Config(format!(
                "container path {} is configured more than once",
                setting.path_container
            )));
        }

        self.settings.push(setting);
        Ok(())
    }

    pub async fn activate(&mut self, runtime: &Arc<dyn ContainerRuntime>) -> GatewayResult<()> {
        if self.settings.is_empty() {
            return Err(GatewayError::Activation("no file settings configured".into()));
        }

        for setting in &self.settings {
            let host_path = Path::new(&setting.path_host);
            if !host_path.exists() {
                return Err(GatewayError::Activation(format!(
                    "host path {} does not exist",
                    setting.path_host
                )));
            }

            let mounted = runtime
                .bind_mount(host_path, &setting.path_container, setting.read_only)
                .await
                .map_err(|e| {
                    GatewayError::Activation(format!(
                        "could not mount {} at {}: {}",
                        setting.path_host, setting.path_container, e
                    ))
                })?;

            if !setting.env_var_name.is_empty() {
                let value = format!(
                    "{}{}{}",
                    setting.env_var_prefix,
                    mounted.display(),
                    setting.env_var_suffix
                );
                runtime
                    .set_environment_variable(&setting.env_var_name, &value)
                    .await
                    .map_err(|e| GatewayError::Activation(e.to_string()))?;
            }

            if setting.create_symlink {
                runtime
                    .create_symlink(&mounted, &setting.path_host)
                    .await
                    .map_err(|e| {
                        GatewayError::Activation(format!(
                            "could not create symlink for {}: {}",
                            setting.path_host, e
                        ))
                    })?;
            }
        }

        Ok(())
    }
}
