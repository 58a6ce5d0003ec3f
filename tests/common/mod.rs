//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use foreman::adapters::{MockAgentExecutor, MockTestRunner};
use foreman::domain::models::command::{Command, CommandAck, CommandEnvelope, Principal};
use foreman::domain::models::config::EngineConfig;
use foreman::domain::models::event::EngineEvent;
use foreman::infrastructure::persistence::FileStateStore;
use foreman::services::{EventStream, GlobalOrchestrator};

/// A running engine rooted in a temp directory, with scriptable adapters.
pub struct Engine {
    pub orchestrator: Arc<GlobalOrchestrator>,
    pub agents: Arc<MockAgentExecutor>,
    pub tests: Arc<MockTestRunner>,
    pub store: Arc<FileStateStore>,
    pub dir: TempDir,
}

/// Engine tuning fast enough for tests: 1s heartbeats, short deadlines.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.supervision.heartbeat_interval_secs = 1;
    config.supervision.agent_deadline_secs = 2;
    config.supervision.snapshot_interval_secs = 1;
    config.scheduler.rebalance_interval_secs = 1;
    config
}

impl Engine {
    pub async fn start() -> Self {
        Self::start_with(fast_config()).await
    }

    pub async fn start_with(mut config: EngineConfig) -> Self {
        let dir = TempDir::new().expect("temp dir");
        config.global_root = Some(dir.path().to_path_buf());

        let store = Arc::new(FileStateStore::with_defaults(dir.path()));
        let agents = MockAgentExecutor::new();
        let tests = MockTestRunner::new();
        let orchestrator =
            GlobalOrchestrator::new(config, store.clone(), agents.clone(), tests.clone());
        orchestrator.start().await.expect("engine start");

        Self { orchestrator, agents, tests, store, dir }
    }

    /// A fresh project directory under the temp root.
    pub fn project_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Submit as an operator principal.
    pub async fn submit(&self, command: Command) -> CommandAck {
        self.orchestrator
            .submit(CommandEnvelope::new(Principal::operator("itest"), command))
            .await
    }

    /// Submit as an admin principal.
    pub async fn submit_admin(&self, command: Command) -> CommandAck {
        self.orchestrator
            .submit(CommandEnvelope::new(Principal::admin("itest-admin"), command))
            .await
    }
}

/// Wait for the next event matching the predicate, failing after `secs`.
pub async fn expect_event(
    stream: &mut EventStream,
    secs: u64,
    mut predicate: impl FnMut(&EngineEvent) -> bool,
) -> EngineEvent {
    let deadline = Duration::from_secs(secs);
    tokio::time::timeout(deadline, async {
        loop {
            let event = stream.recv().await.expect("bus closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Assert no matching event arrives within `millis`.
pub async fn expect_no_event(
    stream: &mut EventStream,
    millis: u64,
    mut predicate: impl FnMut(&EngineEvent) -> bool,
) {
    let result = tokio::time::timeout(Duration::from_millis(millis), async {
        loop {
            let event = stream.recv().await.expect("bus closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await;
    assert!(result.is_err(), "unexpected event: {:?}", result.ok());
}
