//! # Arcana Queue Config
//!
//! Configuration management for the Arcana job queue.
//! Supports layered configuration from TOML files and environment variables,
//! with validation and runtime refresh.

mod app_config;
mod error;
mod loader;
mod validation;

pub use app_config::*;
pub use error::ConfigError;
pub use loader::*;
pub use validation::{ConfigValidationError, ConfigValidator};
