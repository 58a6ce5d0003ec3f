//! Project registry - source of truth for project identity and status.
//!
//! Registration enforces the engine invariants: absolute non-overlapping
//! paths (unless a dependency edge is declared), cpu weight in range, a
//! resolvable work-window timezone, and the status lifecycle table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::ids::ProjectId;
use crate::domain::models::project::{
    Project, ProjectPriority, ProjectStatus, ResourceLimits,
};
use crate::domain::ports::StateStore;
use crate::services::shared_resources::paths_conflict;

/// A directory that looks like an orchestratable project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectCandidate {
    pub path: PathBuf,
    /// Directory name, proposed as the project name.
    pub name: String,
    /// Whether a previous engine left state under the directory.
    pub has_state: bool,
}

/// Pure admission filter over scanned directories: deduplicates and drops
/// candidates nested inside other candidates. Registration still applies
/// the full registry invariants afterwards.
pub fn candidates_from(mut dirs: Vec<ProjectCandidate>) -> Vec<ProjectCandidate> {
    dirs.sort_by(|a, b| a.path.cmp(&b.path));
    dirs.dedup_by(|a, b| a.path == b.path);
    let paths: Vec<PathBuf> = dirs.iter().map(|c| c.path.clone()).collect();
    dirs.into_iter()
        .filter(|candidate| {
            !paths
                .iter()
                .any(|other| *other != candidate.path && candidate.path.starts_with(other))
        })
        .collect()
}

/// Registry of all known projects.
pub struct ProjectRegistry {
    store: Arc<dyn StateStore>,
    projects: RwLock<HashMap<ProjectId, Project>>,
    /// Synchronously readable mirror of the active projects, kept current
    /// on every mutation. The scheduler's input source reads it without
    /// awaiting.
    active_cache: std::sync::RwLock<Vec<Project>>,
}

impl ProjectRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            projects: RwLock::new(HashMap::new()),
            active_cache: std::sync::RwLock::new(Vec::new()),
        }
    }

    fn refresh_cache(&self, map: &HashMap<ProjectId, Project>) {
        let mut active: Vec<Project> =
            map.values().filter(|p| p.status == ProjectStatus::Active).cloned().collect();
        active.sort_by_key(|p| p.created_at);
        if let Ok(mut cache) = self.active_cache.write() {
            *cache = active;
        }
    }

    /// Load the persisted registry.
    pub async fn load(&self) -> EngineResult<usize> {
        let projects = self.store.load_registry().await?;
        let count = projects.len();
        let mut map = self.projects.write().await;
        *map = projects.into_iter().map(|p| (p.id, p)).collect();
        self.refresh_cache(&map);
        Ok(count)
    }

    async fn persist(&self) -> EngineResult<()> {
        let map = self.projects.read().await;
        let mut projects: Vec<Project> = map.values().cloned().collect();
        projects.sort_by_key(|p| p.created_at);
        self.store.save_registry(&projects).await
    }

    /// Register a new project.
    pub async fn register(
        &self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        priority: ProjectPriority,
        limits: Option<ResourceLimits>,
        dependencies: Vec<ProjectId>,
    ) -> EngineResult<Project> {
        let name = name.into();
        let path = path.into();

        if !path.is_absolute() {
            return Err(EngineError::PreconditionFailed {
                reason: format!("project path must be absolute: {}", path.display()),
            });
        }

        let mut project = Project::new(name, path, priority)
            .with_dependencies(dependencies);
        if let Some(limits) = limits {
            project = project.with_limits(limits);
        }
        if !project.limits.cpu_weight_valid() {
            return Err(EngineError::PreconditionFailed {
                reason: format!(
                    "cpu_weight {} outside [0.1, 2.0]",
                    project.limits.cpu_weight
                ),
            });
        }
        if !project.work_window.timezone_valid() {
            return Err(EngineError::PreconditionFailed {
                reason: format!("unknown timezone {}", project.work_window.timezone),
            });
        }

        {
            let mut map = self.projects.write().await;
            for existing in map.values() {
                if paths_conflict(&existing.path, &project.path)
                    && !existing.depends_on(project.id)
                    && !project.depends_on(existing.id)
                {
                    return Err(EngineError::PathConflict {
                        first: existing.path.clone(),
                        second: project.path.clone(),
                    });
                }
            }
            map.insert(project.id, project.clone());
            self.refresh_cache(&map);
        }
        self.persist().await?;
        tracing::info!(project = %project.id, name = %project.name, "project registered");
        Ok(project)
    }

    /// Change a project's lifecycle status.
    pub async fn set_status(
        &self,
        project_id: ProjectId,
        status: ProjectStatus,
    ) -> EngineResult<Project> {
        let updated = {
            let mut map = self.projects.write().await;
            let project = map.get_mut(&project_id).ok_or(EngineError::NotFound {
                entity: "project",
                id: project_id.to_string(),
            })?;
            if !project.status.can_transition_to(status) {
                return Err(EngineError::InvalidTransition {
                    current: project.status.as_str().to_string(),
                    attempted: status.as_str().to_string(),
                    allowed: project
                        .status
                        .valid_transitions()
                        .iter()
                        .map(|s| s.as_str().to_string())
                        .collect(),
                });
            }
            project.status = status;
            project.updated_at = Utc::now();
            let updated = project.clone();
            self.refresh_cache(&map);
            updated
        };
        self.persist().await?;
        tracing::info!(project = %project_id, status = status.as_str(), "project status changed");
        Ok(updated)
    }

    /// Change a project's scheduling priority.
    pub async fn set_priority(
        &self,
        project_id: ProjectId,
        priority: ProjectPriority,
    ) -> EngineResult<Project> {
        let updated = {
            let mut map = self.projects.write().await;
            let project = map.get_mut(&project_id).ok_or(EngineError::NotFound {
                entity: "project",
                id: project_id.to_string(),
            })?;
            project.priority = priority;
            project.updated_at = Utc::now();
            let updated = project.clone();
            self.refresh_cache(&map);
            updated
        };
        self.persist().await?;
        Ok(updated)
    }

    pub async fn get(&self, project_id: ProjectId) -> EngineResult<Project> {
        self.projects.read().await.get(&project_id).cloned().ok_or(EngineError::NotFound {
            entity: "project",
            id: project_id.to_string(),
        })
    }

    /// All projects, in registration order.
    pub async fn list(&self) -> Vec<Project> {
        let map = self.projects.read().await;
        let mut projects: Vec<Project> = map.values().cloned().collect();
        projects.sort_by_key(|p| p.created_at);
        projects
    }

    /// Projects currently in `Active` status.
    pub async fn active(&self) -> Vec<Project> {
        self.list().await.into_iter().filter(|p| p.status == ProjectStatus::Active).collect()
    }

    /// Synchronous snapshot of the active projects, for the scheduler's
    /// input source.
    pub fn active_snapshot(&self) -> Vec<Project> {
        self.active_cache.read().map(|cache| cache.clone()).unwrap_or_default()
    }

    /// Scan roots for project-shaped directories. Admission is separate:
    /// candidates still go through [`register`](Self::register).
    pub async fn scan_roots(roots: &[PathBuf]) -> EngineResult<Vec<ProjectCandidate>> {
        let mut found = Vec::new();
        for root in roots {
            let mut dir = match tokio::fs::read_dir(root).await {
                Ok(dir) => dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(EngineError::storage(root, &e)),
            };
            while let Some(entry) =
                dir.next_entry().await.map_err(|e| EngineError::storage(root, &e))?
            {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let has_state = path.join(crate::infrastructure::persistence::STATE_DIR).is_dir();
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                found.push(ProjectCandidate { path, name, has_state });
            }
        }
        Ok(candidates_from(found))
    }
}

/// Check a project path against a registry-independent set of paths.
/// Used by tests and by admission dry runs.
pub fn path_admissible(candidate: &Path, existing: &[PathBuf]) -> bool {
    !existing.iter().any(|path| paths_conflict(path, candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::FileStateStore;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> ProjectRegistry {
        ProjectRegistry::new(Arc::new(FileStateStore::with_defaults(dir.path())))
    }

    #[tokio::test]
    async fn test_register_and_reload() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let project = registry
            .register("alpha", "/tmp/alpha", ProjectPriority::High, None, vec![])
            .await
            .unwrap();
        assert_eq!(project.status, ProjectStatus::Initializing);

        let fresh = ProjectRegistry::new(Arc::new(FileStateStore::with_defaults(dir.path())));
        assert_eq!(fresh.load().await.unwrap(), 1);
        assert_eq!(fresh.get(project.id).await.unwrap().name, "alpha");
    }

    #[tokio::test]
    async fn test_relative_path_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let err = registry
            .register("alpha", "relative/path", ProjectPriority::Normal, None, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_overlapping_paths_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.register("alpha", "/tmp/x", ProjectPriority::Normal, None, vec![]).await.unwrap();
        let err = registry
            .register("beta", "/tmp/x/sub", ProjectPriority::Normal, None, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PathConflict { .. }));
    }

    #[tokio::test]
    async fn test_overlap_allowed_with_dependency_edge() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let alpha = registry
            .register("alpha", "/tmp/x", ProjectPriority::Normal, None, vec![])
            .await
            .unwrap();
        registry
            .register("beta", "/tmp/x/sub", ProjectPriority::Normal, None, vec![alpha.id])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_cpu_weight_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let limits = ResourceLimits { cpu_weight: 5.0, ..ResourceLimits::default() };
        let err = registry
            .register("alpha", "/tmp/alpha", ProjectPriority::Normal, Some(limits), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_status_lifecycle_enforced() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let project = registry
            .register("alpha", "/tmp/alpha", ProjectPriority::Normal, None, vec![])
            .await
            .unwrap();

        // Initializing → Paused is not in the lifecycle table.
        let err = registry.set_status(project.id, ProjectStatus::Paused).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        registry.set_status(project.id, ProjectStatus::Active).await.unwrap();
        registry.set_status(project.id, ProjectStatus::Paused).await.unwrap();
        let current = registry.get(project.id).await.unwrap();
        assert_eq!(current.status, ProjectStatus::Paused);
    }

    #[tokio::test]
    async fn test_active_listing() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let a = registry
            .register("alpha", "/tmp/alpha", ProjectPriority::Normal, None, vec![])
            .await
            .unwrap();
        registry.register("beta", "/tmp/beta", ProjectPriority::Normal, None, vec![]).await.unwrap();
        registry.set_status(a.id, ProjectStatus::Active).await.unwrap();
        let active = registry.active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
    }

    #[test]
    fn test_candidates_filter_nested_and_duplicates() {
        let make = |p: &str| ProjectCandidate {
            path: PathBuf::from(p),
            name: p.rsplit('/').next().unwrap_or_default().to_string(),
            has_state: false,
        };
        let candidates = candidates_from(vec![
            make("/work/alpha"),
            make("/work/alpha"),
            make("/work/alpha/nested"),
            make("/work/beta"),
        ]);
        let paths: Vec<&str> =
            candidates.iter().map(|c| c.path.to_str().unwrap()).collect();
        assert_eq!(paths, vec!["/work/alpha", "/work/beta"]);
    }

    #[test]
    fn test_path_admissible() {
        let existing = vec![PathBuf::from("/tmp/x")];
        assert!(!path_admissible(Path::new("/tmp/x/sub"), &existing));
        assert!(path_admissible(Path::new("/tmp/y"), &existing));
    }
}
