//! dockwatch CLI library.
//!
//! The `dockwatch` binary is a thin wrapper over these modules; they are
//! exposed for integration tests.

pub mod cli;
pub mod commands;
pub mod error;
pub mod output;
