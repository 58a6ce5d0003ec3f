//! Agent executor adapters.

pub mod mock;
pub mod process;

pub use mock::{MockAgentExecutor, ScriptedOutcome};
pub use process::{ProcessAgentConfig, ProcessAgentExecutor};
