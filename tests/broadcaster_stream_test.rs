//! External event stream behaviour across an engine restart: the replay
//! ring is rebuilt from the persisted log and reconnects resume in order.

mod common;

use common::{fast_config, Engine};
use foreman::adapters::{MockAgentExecutor, MockTestRunner};
use foreman::domain::models::project::ProjectPriority;
use foreman::infrastructure::persistence::FileStateStore;
use foreman::services::{AttachOutcome, GlobalOrchestrator};
use std::sync::Arc;

#[tokio::test]
async fn test_attach_replays_after_restart() {
    let engine = Engine::start().await;
    engine
        .orchestrator
        .register_project("alpha", engine.project_path("alpha"), ProjectPriority::Normal)
        .await
        .unwrap();

    // Let some events land in the persisted ring.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let AttachOutcome::Attached { replay: _, live: _ } =
        engine.orchestrator.broadcaster().attach(None).await
    else {
        panic!("expected attach");
    };
    let last_seen = engine.orchestrator.bus().current_sequence().saturating_sub(1);
    assert!(last_seen > 0, "engine produced events");
    engine.orchestrator.shutdown().await;

    // A fresh engine on the same root rebuilds the ring from events.log.
    let mut config = fast_config();
    config.global_root = Some(engine.dir.path().to_path_buf());
    let store = Arc::new(FileStateStore::with_defaults(engine.dir.path()));
    let restarted = GlobalOrchestrator::new(
        config,
        store,
        MockAgentExecutor::new(),
        MockTestRunner::new(),
    );
    restarted.start().await.unwrap();

    // A subscriber two events behind gets exactly the gap, in order.
    match restarted.broadcaster().attach(Some(last_seen.saturating_sub(2))).await {
        AttachOutcome::Attached { replay, .. } => {
            let seqs: Vec<u64> = replay.iter().map(|e| e.seq).collect();
            assert!(seqs.windows(2).all(|w| w[0] < w[1]), "replay out of order: {seqs:?}");
            assert!(seqs.contains(&last_seen), "replay misses the newest persisted event");
        }
        AttachOutcome::ResyncRequired { .. } => panic!("gap fits the ring"),
    }

    // Sequence numbering continues above the persisted history.
    assert!(restarted.bus().current_sequence() > last_seen);
    restarted.shutdown().await;
}
