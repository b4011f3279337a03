//! Filesystem helpers: container path resolution, mount operations and the
//! cleanup stack that guarantees reverse teardown.

mod cleanup;
mod mount;
mod path;

pub use cleanup::{CleanupAction, CleanupStack};
pub use mount::{bind_mount, make_device_node, tmpfs_mount, unmount};
pub use path::ContainerPath;
