//! Environment variable gateway
//!
//! Exposes environment variables inside the container. An entry either
//! defines a new variable or, with `append`, concatenates its value onto a
//! previously defined one. Redefining a variable without `append` is a
//! configuration error.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::runtime::ContainerRuntime;

use super::{GatewayError, GatewayResult};

#[derive(Default)]
pub struct EnvironmentGateway {
    variables: BTreeMap<String, String>,
}

impl EnvironmentGateway {
    pub const ID: &'static str = "env";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_config_element(&mut self, element: &Map<String, Value>) -> GatewayResult<()> {
        let name = element
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::Config("missing 'name' for environment entry".into()))?;

        let value = element
            .get("value")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::Config("missing 'value' for environment entry".into()))?;

        let append = element
            .get("append")
            .map(|v| {
                v.as_bool()
                    .ok_or_else(|| GatewayError::Config("'append' is not a boolean".into()))
            })
            .transpose()?
            .unwrap_or(false);

        match self.variables.get_mut(name) {
            None => {
                self.variables.insert(name.to_string(), value.to_string());
            }
            Some(existing) if append => {
                existing.push_str(value);
            }
            Some(existing) => {
                return Err(GatewayError::Config(format!(
                    "variable {} already defined with value {}",
                    name, existing
                )));
            }
        }

        Ok(())
    }

    pub async fn activate(&mut self, runtime: &Arc<dyn ContainerRuntime>) -> GatewayResult<()> {
        if self.variables.is_empty() {
            return Err(GatewayError::Activation(
                "no environment variables configured".into(),
            ));
        }

        for (name, value) in &self.variables {
            runtime
                .set_environment_variable(name, value)
                .await
                .map_err(|e| GatewayError::Activation(format!("{}={}: {}", name, value, e)))?;
        }

        Ok(())
    }
}
