//! Adapters implementing the domain ports.

pub mod agents;
pub mod test_runners;

pub use agents::{MockAgentExecutor, ProcessAgentConfig, ProcessAgentExecutor, ScriptedOutcome};
pub use test_runners::{CommandTestRunner, CommandTestRunnerConfig, MockTestRunner};
