//! Infrastructure layer: configuration loading, logging setup and the
//! on-disk state store.

pub mod config;
pub mod logging;
pub mod persistence;
