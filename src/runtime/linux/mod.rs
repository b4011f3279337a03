//! Linux implementation of the container runtime
//!
//! Isolation is realized with namespaces: the init process is spawned with
//! fresh mount/UTS/IPC (and optionally network) namespaces, and jobs join
//! those namespaces before being confined to the container rootfs.

mod namespaces;
mod runtime;

pub use runtime::LinuxRuntime;
