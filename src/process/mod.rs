//! Child process supervision

mod reaper;

pub use reaper::{ExitNotifier, SIGNAL_EXIT_BASE, UNKNOWN_EXIT_CODE};
