//! Safe resolution of container-side paths against a rootfs

use std::path::{Component, Path, PathBuf};

use crate::runtime::RuntimeError;

/// A container-side path validated against a capsule rootfs.
///
/// The path is normalized lexically; a `..` component that would climb out
/// of the rootfs rejects the whole path before any filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPath {
    /// The rootfs the path was resolved against
    rootfs: PathBuf,
    /// The path relative to the rootfs
    relative: PathBuf,
}

impl ContainerPath {
    /// Resolve a path as seen from inside the container.
    ///
    /// Accepts absolute (`/gateways/foo`) and relative (`gateways/foo`)
    /// spellings; both resolve against the rootfs.
    pub fn resolve(rootfs: &Path, path_in_container: &str) -> Result<Self, RuntimeError> {
        if path_in_container.trim().is_empty() {
            return Err(RuntimeError::InvalidPath(
                "container path is empty".to_string(),
            ));
        }

        let mut relative = PathBuf::new();
        for component in Path::new(path_in_container).components() {
            match component {
                Component::Normal(c) => relative.push(c),
                Component::ParentDir => {
                    // Climbing above the rootfs is an escape attempt
                    if !relative.pop() {
                        return Err(RuntimeError::InvalidPath(format!(
                            "path {} escapes the container root",
                            path_in_container
                        )));
                    }
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }

        if relative.as_os_str().is_empty() {
            return Err(RuntimeError::InvalidPath(format!(
                "path {} resolves to the container root itself",
                path_in_container
            )));
        }

        Ok(Self {
            rootfs: rootfs.to_path_buf(),
            relative,
        })
    }

    /// The host-visible location of this path under the rootfs
    pub fn on_host(&self) -> PathBuf {
        self.rootfs.join(&self.relative)
    }

    /// The absolute path as seen from inside the container
    pub fn in_container(&self) -> PathBuf {
        Path::new("/").join(&self.relative)
    }

    /// The path relative to the rootfs
    pub fn relative(&self) -> &Path {
        &self.relative
    }
}
