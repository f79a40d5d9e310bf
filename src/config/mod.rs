//! Configuration management module
//!
//! Provides TOML-based configuration for the containerizer.

mod config;

pub use config::*;
