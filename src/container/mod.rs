//! Container lifecycle management

mod capsule;
mod config;
mod options;
mod state;

pub use capsule::Capsule;
pub use config::CapsuleConfig;
pub use options::DynamicContainerOptions;
pub use state::ContainerState;

/// Container ids are non-negative 32-bit integers; `-1` marks an invalid id.
pub type ContainerId = i32;

/// Sentinel for an invalid container id
pub const INVALID_CONTAINER_ID: ContainerId = -1;
