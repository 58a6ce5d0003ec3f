//! Test runner adapters.

pub mod mock;
pub mod process;

pub use mock::MockTestRunner;
pub use process::{CommandTestRunner, CommandTestRunnerConfig};
