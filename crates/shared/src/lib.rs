//! Shared library for the anime cross-reference population utility.
//!
//! This crate provides common functionality used across the workspace:
//! - Configuration management (TOML file plus environment overrides)
//! - Logging infrastructure

pub mod config;
pub mod logging;

// Re-export commonly used types
pub use config::{Config, GovernorConfig, PolicyConfig, PolicyOverride};
pub use logging::LogConfig;

/// Common result type using anyhow::Error
pub type Result<T> = anyhow::Result<T>;
