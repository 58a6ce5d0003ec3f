//! Domain layer for the Foreman orchestration engine.
//!
//! Pure types and state machines; no I/O. Services and adapters depend on
//! this layer, never the other way round.

pub mod errors;
pub mod machines;
pub mod models;
pub mod ports;

pub use errors::{EngineError, EngineResult};
