//! Dynamic per-container options
//!
//! Clients pass a JSON array of option objects to `CreateContainer`; the
//! recognized keys override the daemon-wide defaults for that container
//! only. Unknown keys are ignored.

use serde_json::Value;

use super::config::CapsuleConfig;

const WRITE_BUFFER_KEY: &str = "writeBufferEnabled";
const TMPFS_ENABLED_KEY: &str = "temporaryFileSystemWriteBufferEnabled";
const TMPFS_SIZE_KEY: &str = "temporaryFileSystemSize";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicContainerOptions {
    pub write_buffer_enabled: Option<bool>,
    pub tmpfs_write_buffer_enabled: Option<bool>,
    pub tmpfs_size: Option<usize>,
}

impl DynamicContainerOptions {
    /// Parse the dynamic options document.
    pub fn parse(json: &str) -> Result<Self, String> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| format!("options are not valid JSON: {}", e))?;

        let entries = value
            .as_array()
            .ok_or_else(|| "options root element is not an array".to_string())?;

        let mut options = Self::default();

        for entry in entries {
            let object = entry
                .as_object()
                .ok_or_else(|| "options entry is not an object".to_string())?;

            if let Some(value) = object.get(WRITE_BUFFER_KEY) {
                options.write_buffer_enabled = Some(value.as_bool().ok_or_else(|| {
                    format!("'{}' is not a boolean", WRITE_BUFFER_KEY)
                })?);
            }

            if let Some(value) = object.get(TMPFS_ENABLED_KEY) {
                options.tmpfs_write_buffer_enabled = Some(value.as_bool().ok_or_else(|| {
                    format!("'{}' is not a boolean", TMPFS_ENABLED_KEY)
                })?);
            }

            if let Some(value) = object.get(TMPFS_SIZE_KEY) {
                options.tmpfs_size = Some(
                    value
                        .as_u64()
                        .ok_or_else(|| format!("'{}' is not an integer", TMPFS_SIZE_KEY))?
                        as usize,
                );
            }
        }

        Ok(options)
    }

    /// Apply these options on top of the daemon defaults.
    pub fn to_config(&self, defaults: &CapsuleConfig) -> CapsuleConfig {
        let mut config = defaults.clone();

        if let Some(enabled) = self.write_buffer_enabled {
            config.write_buffer_enabled = enabled;
        }
        if let Some(enabled) = self.tmpfs_write_buffer_enabled {
            config.tmpfs_write_buffer_enabled = enabled;
        }
        if let Some(size) = self.tmpfs_size {
            config.tmpfs_size = size;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn defaults() -> CapsuleConfig {
        CapsuleConfig::new(
            PathBuf::from("/etc/capsule/runtime.conf"),
            PathBuf::from("/srv/capsule"),
            Duration::from_secs(2),
            None,
        )
    }

    #[test]
    fn test_empty_object_array() {
        let options = DynamicContainerOptions::parse("[{}]").unwrap();
        assert_eq!(options, DynamicContainerOptions::default());
    }

    #[test]
    fn test_parse_all_keys() {
        let options = DynamicContainerOptions::parse(
            r#"[{"writeBufferEnabled": true,
                 "temporaryFileSystemWriteBufferEnabled": true,
                 "temporaryFileSystemSize": 4096}]"#,
        )
        .unwrap();

        assert_eq!(options.write_buffer_enabled, Some(true));
        assert_eq!(options.tmpfs_write_buffer_enabled, Some(true));
        assert_eq!(options.tmpfs_size, Some(4096));
    }

    #[test]
    fn test_malformed_documents_rejected() {
        assert!(DynamicContainerOptions::parse("not json").is_err());
        assert!(DynamicContainerOptions::parse("{}").is_err());
        assert!(DynamicContainerOptions::parse("[1, 2]").is_err());
        assert!(DynamicContainerOptions::parse(r#"[{"writeBufferEnabled": "yes"}]"#).is_err());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let options =
            DynamicContainerOptions::parse(r#"[{"somethingElse": 1}]"#).unwrap();
        assert_eq!(options, DynamicContainerOptions::default());
    }

    #[test]
    fn test_overrides_apply_on_top_of_defaults() {
        let options = DynamicContainerOptions::parse(
            r#"[{"writeBufferEnabled": true, "temporaryFileSystemSize": 8192}]"#,
        )
        .unwrap();

        let config = options.to_config(&defaults());
        assert!(config.write_buffer_enabled);
        assert!(!config.tmpfs_write_buffer_enabled);
        assert_eq!(config.tmpfs_size, 8192);
    }
}
