//! On-disk state store.
//!
//! Layout per project root:
//!
//! ```text
//! <project>/.orch-state/
//!   project.json        # identity, priority, status, caps
//!   backlog.json        # stories and ordering
//!   sprints/<id>.json
//!   tdd/<id>.json       # phase, attempt counters, artifact refs
//!   snapshot.bin        # versioned binary snapshot of the whole arena
//!   events.log          # append-only ring, bounded in size
//! ```
//!
//! and one global root:
//!
//! ```text
//! <root>/.orch-global/
//!   registry.json
//!   scheduler.json
//!   heartbeats.bin
//!   events.log
//! ```

mod store;

pub use store::{FileStateStore, FileStoreConfig, GLOBAL_DIR, SNAPSHOT_SCHEMA_VERSION, STATE_DIR};
