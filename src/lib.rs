//! Capsule Daemon Library
//!
//! Core functionality of the container supervisor: the agent registry,
//! container lifecycle management, the gateway framework enforcing sandbox
//! policy, and the RPC surface.

pub mod agent;
pub mod capability;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod filesystem;
pub mod gateway;
pub mod jobs;
pub mod process;
pub mod router;
pub mod runtime;

// Re-export commonly used types
pub use agent::Agent;
pub use config::Configuration;
pub use container::{Capsule, ContainerId, ContainerState};
pub use error::AgentError;
pub use events::EventBus;
