//! Undo stack for scoped filesystem resources
//!
//! Every successful mount, directory or file creation performed on behalf of
//! a container is recorded here. Teardown releases the entries in reverse
//! order of acquisition; a failing release is logged and the walk continues.

use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::mount::unmount;

/// A single recorded resource to release on teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    /// Unmount a mount point
    Unmount(PathBuf),

    /// Remove an empty directory
    RemoveDir(PathBuf),

    /// Remove a file
    RemoveFile(PathBuf),
}

impl CleanupAction {
    fn release(&self) -> std::io::Result<()> {
        let result = match self {
            CleanupAction::Unmount(path) => unmount(path),
            CleanupAction::RemoveDir(path) => std::fs::remove_dir(path),
            CleanupAction::RemoveFile(path) => std::fs::remove_file(path),
        };

        // A resource that is already gone counts as released
        match result {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn describe(&self) -> String {
        match self {
            CleanupAction::Unmount(path) => format!("unmount {}", path.display()),
            CleanupAction::RemoveDir(path) => format!("rmdir {}", path.display()),
            CleanupAction::RemoveFile(path) => format!("unlink {}", path.display()),
        }
    }
}

/// LIFO stack of cleanup actions owned by a container
#[derive(Debug, Default)]
pub struct CleanupStack {
    actions: Mutex<Vec<CleanupAction>>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resource for release on teardown
    pub fn push(&self, action: CleanupAction) {
        self.actions.lock().push(action);
    }

    /// True if a mount is already recorded for this exact mount point
    pub fn is_mounted(&self, path: &PathBuf) -> bool {
        self.actions
            .lock()
            .iter()
            .any(|a| matches!(a, CleanupAction::Unmount(p) if p == path))
    }

    pub fn len(&self) -> usize {
        self.actions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.lock().is_empty()
    }

    /// Release all recorded resources in reverse order of acquisition.
    ///
    /// Best-effort: each failure is logged and the walk continues. Returns
    /// the number of actions that failed to release.
    pub fn release_all(&self) -> usize {
        let actions = std::mem::take(&mut *self.actions.lock());
        let mut failures = 0;

        for action in actions.iter().rev() {
            debug!("Releasing: {}", action.describe());
            if let Err(e) = action.release() {
                warn!("Could not release resource ({}): {}", action.describe(), e);
                failures += 1;
            }
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_release_in_reverse_order() {
        let temp = TempDir::new().unwrap();
        let outer = temp.path().join("outer");
        let inner = outer.join("inner");
        std::fs::create_dir_all(&inner).unwrap();

        let stack = CleanupStack::new();
        // Recorded in creation order: outer first, inner second
        stack.push(CleanupAction::RemoveDir(outer.clone()));
        stack.push(CleanupAction::RemoveDir(inner.clone()));

        // Reverse release removes inner before outer, so both succeed
        assert_eq!(stack.release_all(), 0);
        assert!(!outer.exists());
        assert!(stack.is_empty());
    }

    #[test]
    fn test_release_continues_after_failure() {
        let temp = TempDir::new().unwrap();
        let occupied = temp.path().join("occupied");
        std::fs::create_dir(&occupied).unwrap();
        std::fs::write(occupied.join("blocker"), b"x").unwrap();

        let file = temp.path().join("present");
        std::fs::write(&file, b"x").unwrap();

        let stack = CleanupStack::new();
        stack.push(CleanupAction::RemoveFile(file.clone()));
        stack.push(CleanupAction::RemoveDir(occupied.clone()));

        // The non-empty dir fails, but the file is still released
        assert_eq!(stack.release_all(), 1);
        assert!(!file.exists());
        assert!(occupied.exists());
    }

    #[test]
    fn test_already_released_resource_is_not_a_failure() {
        let temp = TempDir::new().unwrap();
        let stack = CleanupStack::new();
        stack.push(CleanupAction::RemoveFile(temp.path().join("never-created")));

        assert_eq!(stack.release_all(), 0);
    }

    #[test]
    fn test_is_mounted_tracks_mount_points() {
        let stack = CleanupStack::new();
        let target = PathBuf::from("/srv/SC-0/rootfs/data");

        assert!(!stack.is_mounted(&target));
        stack.push(CleanupAction::Unmount(target.clone()));
        assert!(stack.is_mounted(&target));
    }

    #[test]
    fn test_release_all_empties_the_stack() {
        let stack = CleanupStack::new();
        stack.push(CleanupAction::Unmount(PathBuf::from("/nonexistent")));
        assert_eq!(stack.len(), 1);

        stack.release_all();
        assert!(stack.is_empty());

        // Second walk is a no-op
        assert_eq!(stack.release_all(), 0);
    }
}
