//! Daemon subcommands

pub mod diagnostics;
pub mod root;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Check host prerequisites and print the resolved configuration
    Diagnostics,
}
