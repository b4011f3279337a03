//! Per-gateway configuration bundles
//!
//! A [`GatewayConfiguration`] maps gateway ids to JSON entry arrays. The
//! capability store produces these; merging bundles concatenates the entry
//! arrays per id, preserving insertion order.

use std::collections::BTreeMap;

use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfiguration {
    configs: BTreeMap<String, Vec<Value>>,
}

impl GatewayConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append entries for a gateway id
    pub fn add(&mut self, id: &str, entries: Vec<Value>) {
        self.configs.entry(id.to_string()).or_default().extend(entries);
    }

    /// Merge another bundle into this one
    pub fn append(&mut self, other: GatewayConfiguration) {
        for (id, entries) in other.configs {
            self.configs.entry(id).or_default().extend(entries);
        }
    }

    /// Gateway ids present in this bundle
    pub fn ids(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    /// The entry array for a gateway id, as a JSON array value
    pub fn config(&self, id: &str) -> Option<Value> {
        self.configs.get(id).map(|entries| Value::Array(entries.clone()))
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_and_lookup() {
        let mut config = GatewayConfiguration::new();
        config.add("env", vec![json!({"name": "A", "value": "1"})]);

        assert_eq!(config.ids(), vec!["env".to_string()]);
        let entries = config.config("env").unwrap();
        assert_eq!(entries.as_array().unwrap().len(), 1);
        assert!(config.config("file").is_none());
    }

    #[test]
    fn test_append_concatenates_per_id() {
        let mut a = GatewayConfiguration::new();
        a.add("env", vec![json!({"name": "A", "value": "1"})]);

        let mut b = GatewayConfiguration::new();
        b.add("env", vec![json!({"name": "B", "value": "2"})]);
        b.add("file", vec![json!({"path-host": "/x", "path-container": "/y"})]);

        a.append(b);

        assert_eq!(a.ids(), vec!["env".to_string(), "file".to_string()]);
        assert_eq!(a.config("env").unwrap().as_array().unwrap().len(), 2);
    }
}
