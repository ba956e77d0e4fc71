//! devgraph CLI library
//!
//! Demo graphs, commands and output rendering behind the `devgraph` binary,
//! exposed for testing.

pub mod commands;
pub mod demo;
pub mod exit;
pub mod output;
