//! Domain ports (interfaces) to external collaborators.

pub mod agent_executor;
pub mod state_store;
pub mod test_runner;

pub use agent_executor::{AgentExecutor, AgentInvocation, AgentOutcome};
pub use state_store::{SchedulerDoc, StateStore};
pub use test_runner::TestRunner;
