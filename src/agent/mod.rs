//! The agent: container registry and RPC-facing operations

mod agent;
mod id_pool;

pub use agent::{Agent, RuntimeFactory};
pub use id_pool::IdPool;
