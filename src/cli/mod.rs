//! CLI module for the DCS server deployment tool.
//!
//! This module provides the command-line interface for managing the
//! Azure stack that hosts the server.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
