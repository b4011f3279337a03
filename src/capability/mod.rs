//! Capability resolution
//!
//! Capabilities are named bundles of gateway configuration fragments,
//! declared in service-manifest files.

mod store;

pub use store::{CapabilityError, CapabilityStore};
