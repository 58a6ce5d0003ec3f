//! Configuration loading.
//!
//! Hierarchical configuration using figment: programmatic defaults, then
//! `.foreman/config.yaml`, then `.foreman/local.yaml`, then `FOREMAN_*`
//! environment variables.

mod loader;

pub use loader::{ConfigLoadError, ConfigLoader};
