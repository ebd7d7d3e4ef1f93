//! Configuration loading, validation, and CLI plumbing for the HSM action
//! shipper daemon.
//!
//! Mirrors the teacher workspace's `ferrex-config` crate: a typed [`Config`]
//! assembled from compiled-in defaults, an optional TOML file, and
//! environment variables, with CLI flags (`shipper::cli`) applied on top.

pub mod cli;
pub mod error;
pub mod loader;
pub mod models;

pub use cli::Args;
pub use error::{ConfigLoadError, Result};
pub use loader::load;
pub use models::{Config, RedisConfig, RedisPassword};
