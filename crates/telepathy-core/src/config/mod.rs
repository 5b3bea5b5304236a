//! Configuration module wiring.
//!
//! Keeps config types and I/O in separate files.

mod config_io;
mod config_types;

pub use config_io::ConfigError;
pub use config_types::*;
