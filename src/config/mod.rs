//! Daemon configuration

mod config;

pub use config::{AgentConfiguration, ApiConfiguration, Configuration, NetworkConfiguration};
