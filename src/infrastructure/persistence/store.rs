//! File-backed [`StateStore`] implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::event::EngineEvent;
use crate::domain::models::ids::ProjectId;
use crate::domain::models::project::Project;
use crate::domain::models::state::ProjectState;
use crate::domain::ports::state_store::{SchedulerDoc, StateStore};

/// Per-project state directory name.
pub const STATE_DIR: &str = ".orch-state";
/// Global state directory name.
pub const GLOBAL_DIR: &str = ".orch-global";
/// Schema tag written at the head of `snapshot.bin`.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Store tuning.
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Size bound of each `events.log` before compaction.
    pub events_log_max_bytes: u64,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self { events_log_max_bytes: 8 * 1024 * 1024 }
    }
}

/// File-backed store rooted at one global directory.
pub struct FileStateStore {
    global_root: PathBuf,
    config: FileStoreConfig,
}

impl FileStateStore {
    pub fn new(global_root: impl Into<PathBuf>, config: FileStoreConfig) -> Self {
        Self { global_root: global_root.into(), config }
    }

    pub fn with_defaults(global_root: impl Into<PathBuf>) -> Self {
        Self::new(global_root, FileStoreConfig::default())
    }

    fn global_dir(&self) -> PathBuf {
        self.global_root.join(GLOBAL_DIR)
    }

    fn state_dir(project_root: &Path) -> PathBuf {
        project_root.join(STATE_DIR)
    }

    async fn ensure_dir(path: &Path) -> EngineResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| EngineError::storage(path, &e))
    }

    /// Write atomically: temp file in the same directory, then rename.
    async fn write_atomic(path: &Path, bytes: &[u8]) -> EngineResult<()> {
        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| EngineError::storage(&tmp, &e))?;
        file.write_all(bytes).await.map_err(|e| EngineError::storage(&tmp, &e))?;
        file.sync_all().await.map_err(|e| EngineError::storage(&tmp, &e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| EngineError::storage(path, &e))
    }

    async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> EngineResult<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| EngineError::Serialization { detail: e.to_string() })?;
        Self::write_atomic(path, &bytes).await
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> EngineResult<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| EngineError::Serialization { detail: e.to_string() }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::storage(path, &e)),
        }
    }

    /// Append one JSON line, compacting the file once it outgrows its bound.
    async fn append_event_line(&self, path: &Path, event: &EngineEvent) -> EngineResult<()> {
        let mut line = serde_json::to_vec(event)
            .map_err(|e| EngineError::Serialization { detail: e.to_string() })?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| EngineError::storage(path, &e))?;
        file.write_all(&line).await.map_err(|e| EngineError::storage(path, &e))?;
        drop(file);

        let len = tokio::fs::metadata(path)
            .await
            .map_err(|e| EngineError::storage(path, &e))?
            .len();
        if len > self.config.events_log_max_bytes {
            self.compact_event_log(path).await?;
        }
        Ok(())
    }

    /// Keep the newer half of the log; the ring stays bounded while the
    /// replay window survives.
    async fn compact_event_log(&self, path: &Path) -> EngineResult<()> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| EngineError::storage(path, &e))?;
        let lines: Vec<&str> = content.lines().collect();
        let keep_from = lines.len() / 2;
        let mut kept = lines[keep_from..].join("\n");
        kept.push('\n');
        Self::write_atomic(path, kept.as_bytes()).await?;
        tracing::debug!(path = %path.display(), dropped = keep_from, "compacted event log");
        Ok(())
    }

    async fn read_event_lines(&self, path: &Path, after: u64) -> EngineResult<Vec<EngineEvent>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::storage(path, &e)),
        };
        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let event: EngineEvent = serde_json::from_str(line)
                .map_err(|e| EngineError::Serialization { detail: e.to_string() })?;
            if event.seq > after {
                events.push(event);
            }
        }
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    fn encode_snapshot(state: &ProjectState) -> EngineResult<Vec<u8>> {
        let mut bytes = SNAPSHOT_SCHEMA_VERSION.to_le_bytes().to_vec();
        let body = bincode::serialize(state)
            .map_err(|e| EngineError::Serialization { detail: e.to_string() })?;
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    fn decode_snapshot(path: &Path, bytes: &[u8]) -> EngineResult<ProjectState> {
        if bytes.len() < 4 {
            return Err(EngineError::SnapshotCorrupt {
                path: path.to_path_buf(),
                detail: "snapshot shorter than its schema tag".to_string(),
            });
        }
        let tag = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if tag != SNAPSHOT_SCHEMA_VERSION {
            return Err(EngineError::SchemaIncompatible {
                found: tag,
                supported: SNAPSHOT_SCHEMA_VERSION,
            });
        }
        bincode::deserialize(&bytes[4..]).map_err(|e| EngineError::SnapshotCorrupt {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save_project(&self, state: &ProjectState) -> EngineResult<u64> {
        let dir = Self::state_dir(&state.project.path);
        Self::ensure_dir(&dir).await?;
        Self::ensure_dir(&dir.join("sprints")).await?;
        Self::ensure_dir(&dir.join("tdd")).await?;

        Self::write_json(&dir.join("project.json"), &state.project).await?;

        let stories: Vec<_> = state.stories.values().collect();
        Self::write_json(&dir.join("backlog.json"), &stories).await?;

        for sprint in state.sprints.values() {
            Self::write_json(&dir.join("sprints").join(format!("{}.json", sprint.id)), sprint)
                .await?;
        }
        for cycle in state.cycles.values() {
            Self::write_json(&dir.join("tdd").join(format!("{}.json", cycle.id)), cycle).await?;
        }

        let snapshot = Self::encode_snapshot(state)?;
        Self::write_atomic(&dir.join("snapshot.bin"), &snapshot).await?;
        Ok(state.last_snapshot_seq)
    }

    async fn load_project(&self, project_root: &Path) -> EngineResult<Option<ProjectState>> {
        let path = Self::state_dir(project_root).join("snapshot.bin");
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::storage(&path, &e)),
        };
        let state = Self::decode_snapshot(&path, &bytes)?;
        state.check_invariants()?;
        Ok(Some(state))
    }

    async fn append_project_event(
        &self,
        project_root: &Path,
        event: &EngineEvent,
    ) -> EngineResult<()> {
        let dir = Self::state_dir(project_root);
        Self::ensure_dir(&dir).await?;
        self.append_event_line(&dir.join("events.log"), event).await
    }

    async fn save_registry(&self, projects: &[Project]) -> EngineResult<()> {
        let dir = self.global_dir();
        Self::ensure_dir(&dir).await?;
        Self::write_json(&dir.join("registry.json"), &projects).await
    }

    async fn load_registry(&self) -> EngineResult<Vec<Project>> {
        Ok(Self::read_json(&self.global_dir().join("registry.json")).await?.unwrap_or_default())
    }

    async fn save_scheduler(&self, doc: &SchedulerDoc) -> EngineResult<()> {
        let dir = self.global_dir();
        Self::ensure_dir(&dir).await?;
        Self::write_json(&dir.join("scheduler.json"), doc).await
    }

    async fn load_scheduler(&self) -> EngineResult<Option<SchedulerDoc>> {
        Self::read_json(&self.global_dir().join("scheduler.json")).await
    }

    async fn save_heartbeats(
        &self,
        beats: &HashMap<ProjectId, DateTime<Utc>>,
    ) -> EngineResult<()> {
        let dir = self.global_dir();
        Self::ensure_dir(&dir).await?;
        let entries: Vec<(ProjectId, DateTime<Utc>)> =
            beats.iter().map(|(id, ts)| (*id, *ts)).collect();
        let bytes = bincode::serialize(&entries)
            .map_err(|e| EngineError::Serialization { detail: e.to_string() })?;
        Self::write_atomic(&dir.join("heartbeats.bin"), &bytes).await
    }

    async fn load_heartbeats(&self) -> EngineResult<HashMap<ProjectId, DateTime<Utc>>> {
        let path = self.global_dir().join("heartbeats.bin");
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let entries: Vec<(ProjectId, DateTime<Utc>)> = bincode::deserialize(&bytes)
                    .map_err(|e| EngineError::Serialization { detail: e.to_string() })?;
                Ok(entries.into_iter().collect())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(EngineError::storage(&path, &e)),
        }
    }

    async fn append_global_event(&self, event: &EngineEvent) -> EngineResult<()> {
        let dir = self.global_dir();
        Self::ensure_dir(&dir).await?;
        self.append_event_line(&dir.join("events.log"), event).await
    }

    async fn read_global_events_after(&self, after: u64) -> EngineResult<Vec<EngineEvent>> {
        self.read_event_lines(&self.global_dir().join("events.log"), after).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::event::{Component, EventPayload};
    use crate::domain::models::project::{Project, ProjectPriority};
    use crate::domain::models::story::Story;
    use tempfile::TempDir;

    fn state_in(dir: &TempDir) -> ProjectState {
        let project =
            Project::new("alpha", dir.path().join("alpha"), ProjectPriority::Normal);
        let mut state = ProjectState::new(project);
        let story = Story::new(state.project.id, "S1");
        let story_id = story.id;
        state.stories.insert(story_id, story);
        state.admit_cycle(story_id).unwrap();
        state
    }

    fn event(seq_hint: u64) -> EngineEvent {
        let mut event = EngineEvent::unstamped(
            Component::GlobalOrchestrator,
            EventPayload::Error {
                kind: "AgentTimeout".to_string(),
                message: "deadline".to_string(),
                project_id: None,
                cycle_id: None,
            },
        );
        event.seq = seq_hint;
        event
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::with_defaults(dir.path());
        let state = state_in(&dir);

        store.save_project(&state).await.unwrap();
        let restored = store.load_project(&state.project.path).await.unwrap().unwrap();
        assert_eq!(state, restored);
    }

    #[tokio::test]
    async fn test_load_missing_project_is_cold_start() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::with_defaults(dir.path());
        let loaded = store.load_project(&dir.path().join("nope")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_unknown_schema_tag_refused() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::with_defaults(dir.path());
        let state = state_in(&dir);
        store.save_project(&state).await.unwrap();

        let path = state.project.path.join(STATE_DIR).join("snapshot.bin");
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        bytes[0..4].copy_from_slice(&99u32.to_le_bytes());
        tokio::fs::write(&path, &bytes).await.unwrap();

        let err = store.load_project(&state.project.path).await.unwrap_err();
        assert_eq!(err, EngineError::SchemaIncompatible { found: 99, supported: 1 });
    }

    #[tokio::test]
    async fn test_truncated_snapshot_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::with_defaults(dir.path());
        let state = state_in(&dir);
        store.save_project(&state).await.unwrap();

        let path = state.project.path.join(STATE_DIR).join("snapshot.bin");
        let bytes = tokio::fs::read(&path).await.unwrap();
        tokio::fs::write(&path, &bytes[..8]).await.unwrap();

        let err = store.load_project(&state.project.path).await.unwrap_err();
        assert!(matches!(err, EngineError::SnapshotCorrupt { .. }));
    }

    #[tokio::test]
    async fn test_registry_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::with_defaults(dir.path());
        assert!(store.load_registry().await.unwrap().is_empty());

        let projects =
            vec![Project::new("alpha", "/tmp/alpha", ProjectPriority::High)];
        store.save_registry(&projects).await.unwrap();
        assert_eq!(store.load_registry().await.unwrap(), projects);
    }

    #[tokio::test]
    async fn test_global_event_ring_and_replay() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::with_defaults(dir.path());
        for seq in 0..10 {
            store.append_global_event(&event(seq)).await.unwrap();
        }
        let all = store.read_global_events_after(0).await.unwrap();
        assert_eq!(all.len(), 9, "seq 0 is excluded by the after bound");
        let tail = store.read_global_events_after(6).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn test_event_log_compaction_bounds_size() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path(), FileStoreConfig { events_log_max_bytes: 2048 });
        for seq in 0..100 {
            store.append_global_event(&event(seq)).await.unwrap();
        }
        let len = tokio::fs::metadata(dir.path().join(GLOBAL_DIR).join("events.log"))
            .await
            .unwrap()
            .len();
        assert!(len < 4096, "log should stay near its bound, got {len}");
        // The newest events survive compaction.
        let tail = store.read_global_events_after(95).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![96, 97, 98, 99]);
    }

    #[tokio::test]
    async fn test_heartbeats_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::with_defaults(dir.path());
        let mut beats = HashMap::new();
        beats.insert(ProjectId::new(), Utc::now());
        beats.insert(ProjectId::new(), Utc::now());
        store.save_heartbeats(&beats).await.unwrap();
        let loaded = store.load_heartbeats().await.unwrap();
        assert_eq!(loaded.len(), 2);
        for (id, ts) in beats {
            assert_eq!(loaded.get(&id), Some(&ts));
        }
    }

    #[tokio::test]
    async fn test_scheduler_doc_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::with_defaults(dir.path());
        assert!(store.load_scheduler().await.unwrap().is_none());
        let doc = SchedulerDoc::default();
        store.save_scheduler(&doc).await.unwrap();
        assert_eq!(store.load_scheduler().await.unwrap(), Some(doc));
    }
}
