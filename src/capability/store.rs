//! Service-manifest capability store
//!
//! Loads `*.json` manifest files from a directory at startup. A manifest
//! declares capabilities, each mapping gateway ids to configuration entry
//! arrays. The same capability may be declared in several manifests; their
//! fragments are concatenated.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use crate::gateway::GatewayConfiguration;

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("manifest {path} is malformed: {message}")]
    Malformed { path: String, message: String },

    #[error("capability '{0}' not found")]
    UnknownCapability(String),
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    capabilities: Vec<ManifestCapability>,
}

#[derive(Debug, Deserialize)]
struct ManifestCapability {
    name: String,
    gateways: Vec<ManifestGateway>,
}

#[derive(Debug, Deserialize)]
struct ManifestGateway {
    id: String,
    config: Vec<serde_json::Value>,
}

/// Lookup of capability names to gateway configuration bundles.
#[derive(Debug, Default)]
pub struct CapabilityStore {
    capabilities: BTreeMap<String, GatewayConfiguration>,
}

impl CapabilityStore {
    /// A store with no capabilities
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load every `*.json` manifest in a directory. A missing directory
    /// yields an empty store.
    pub fn from_dir(dir: &Path) -> Result<Self, CapabilityError> {
        let mut store = Self::default();

        if !dir.is_dir() {
            debug!("Manifest directory {} does not exist", dir.display());
            return Ok(store);
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| CapabilityError::Io {
                path: dir.display().to_string(),
                source: e,
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            store.load_manifest(&path)?;
        }

        info!(
            "Loaded {} capabilities from {}",
            store.capabilities.len(),
            dir.display()
        );
        Ok(store)
    }

    fn load_manifest(&mut self, path: &Path) -> Result<(), CapabilityError> {
        let content = std::fs::read_to_string(path).map_err(|e| CapabilityError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let manifest: ManifestFile =
            serde_json::from_str(&content).map_err(|e| CapabilityError::Malformed {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        for capability in manifest.capabilities {
            let bundle = self.capabilities.entry(capability.name).or_default();
            for gateway in capability.gateways {
                bundle.add(&gateway.id, gateway.config);
            }
        }

        Ok(())
    }

    /// Names of all known capabilities
    pub fn ids(&self) -> Vec<String> {
        self.capabilities.keys().cloned().collect()
    }

    /// Merge the bundles of the named capabilities, in the given order.
    /// Any unknown name fails the lookup.
    pub fn configs_by_id(&self, names: &[String]) -> Result<GatewayConfiguration, CapabilityError> {
        let mut merged = GatewayConfiguration::new();

        for name in names {
            let bundle = self
                .capabilities
                .get(name)
                .ok_or_else(|| CapabilityError::UnknownCapability(name.clone()))?;
            merged.append(bundle.clone());
        }

        Ok(merged)
    }

    /// Union of every capability in the store; used for the default
    /// capabilities applied to unconfigured containers.
    pub fn configs(&self) -> GatewayConfiguration {
        let mut merged = GatewayConfiguration::new();
        for bundle in self.capabilities.values() {
            merged.append(bundle.clone());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"{
        "capabilities": [
            {
                "name": "com.example.audio",
                "gateways": [
                    {"id": "pulse", "config": [{"audio": true}]}
                ]
            },
            {
                "name": "com.example.display",
                "gateways": [
                    {"id": "wayland", "config": [{"enabled": true}]}
                ]
            }
        ]
    }"#;

    fn store_with_manifest() -> CapabilityStore {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("manifest.json"), MANIFEST).unwrap();
        CapabilityStore::from_dir(temp.path()).unwrap()
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let store = CapabilityStore::from_dir(Path::new("/no/such/dir")).unwrap();
        assert!(store.ids().is_empty());
    }

    #[test]
    fn test_load_and_list() {
        let store = store_with_manifest();
        assert_eq!(
            store.ids(),
            vec![
                "com.example.audio".to_string(),
                "com.example.display".to_string(),
            ]
        );
    }

    #[test]
    fn test_configs_by_id() {
        let store = store_with_manifest();
        let bundle = store
            .configs_by_id(&["com.example.audio".to_string()])
            .unwrap();

        assert_eq!(bundle.ids(), vec!["pulse".to_string()]);
    }

    #[test]
    fn test_unknown_capability_fails() {
        let store = store_with_manifest();
        let err = store
            .configs_by_id(&["com.example.nope".to_string()])
            .unwrap_err();
        assert!(matches!(err, CapabilityError::UnknownCapability(_)));
    }

    #[test]
    fn test_fragments_concatenate_across_manifests() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.json"), MANIFEST).unwrap();
        std::fs::write(
            temp.path().join("b.json"),
            r#"{"capabilities": [
                {"name": "com.example.audio",
                 "gateways": [{"id": "env", "config": [{"name": "AUDIO", "value": "1"}]}]}
            ]}"#,
        )
        .unwrap();

        let store = CapabilityStore::from_dir(temp.path()).unwrap();
        let bundle = store
            .configs_by_id(&["com.example.audio".to_string()])
            .unwrap();

        assert_eq!(bundle.ids(), vec!["env".to_string(), "pulse".to_string()]);
    }

    #[test]
    fn test_malformed_manifest_rejected() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("bad.json"), "{").unwrap();

        let err = CapabilityStore::from_dir(temp.path()).unwrap_err();
        assert!(matches!(err, CapabilityError::Malformed { .. }));
    }

    #[test]
    fn test_default_configs_union() {
        let store = store_with_manifest();
        let bundle = store.configs();
        assert_eq!(
            bundle.ids(),
            vec!["pulse".to_string(), "wayland".to_string()]
        );
    }
}
