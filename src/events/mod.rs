//! Event broadcasting

mod bus;

pub use bus::{Event, EventBus};
