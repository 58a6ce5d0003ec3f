//! Project domain model.
//!
//! A project is the unit of ownership in the engine: one registered
//! repository with its own backlog, sprints, resource caps and work window.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::ids::ProjectId;

/// Scheduling priority of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Default for ProjectPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl ProjectPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Allocation weight used by the weighted scheduling strategy.
    pub const fn weight(&self) -> f64 {
        match self {
            Self::Critical => 8.0,
            Self::High => 4.0,
            Self::Normal => 2.0,
            Self::Low => 1.0,
        }
    }
}

/// Lifecycle status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Registered, state directory being prepared.
    Initializing,
    /// Orchestrated: commands accepted, cycles scheduled.
    Active,
    /// Registered but not running; resumable.
    Paused,
    /// Registered, human-only changes; the orchestrator stays down.
    Maintenance,
    /// Terminal. Removed only by an explicit archive-and-purge.
    Archived,
}

impl Default for ProjectStatus {
    fn default() -> Self {
        Self::Initializing
    }
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Maintenance => "maintenance",
            Self::Archived => "archived",
        }
    }

    /// Valid lifecycle transitions from this status.
    pub fn valid_transitions(&self) -> &'static [ProjectStatus] {
        match self {
            Self::Initializing => &[Self::Active, Self::Archived],
            Self::Active => &[Self::Paused, Self::Maintenance, Self::Archived],
            Self::Paused => &[Self::Active, Self::Maintenance, Self::Archived],
            Self::Maintenance => &[Self::Active, Self::Archived],
            Self::Archived => &[],
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// Per-project declared resource caps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_parallel_agents: u32,
    pub max_parallel_cycles: u32,
    pub memory_cap_bytes: u64,
    pub disk_cap_bytes: u64,
    /// Relative CPU weight, clamped to [0.1, 2.0] at registration.
    pub cpu_weight: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_parallel_agents: 4,
            max_parallel_cycles: 2,
            memory_cap_bytes: 4 * 1024 * 1024 * 1024,
            disk_cap_bytes: 16 * 1024 * 1024 * 1024,
            cpu_weight: 1.0,
        }
    }
}

impl ResourceLimits {
    /// Range check for the cpu weight.
    pub fn cpu_weight_valid(&self) -> bool {
        (0.1..=2.0).contains(&self.cpu_weight)
    }
}

/// Hour range within one day, `[start_hour, end_hour)` in local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourRange {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl HourRange {
    pub fn contains(&self, hour: u8) -> bool {
        hour >= self.start_hour && hour < self.end_hour
    }
}

/// Weekly work schedule evaluated in the project's timezone.
///
/// New cycle admissions are deferred outside the window; in-flight cycles
/// run to completion regardless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkWindow {
    /// IANA timezone name, e.g. `Europe/Berlin`.
    pub timezone: String,
    /// Open ranges per weekday. An absent weekday is closed.
    #[serde(default)]
    pub schedule: Vec<(Weekday, HourRange)>,
    /// When true the schedule is ignored and the window is always open.
    #[serde(default = "WorkWindow::default_always_open")]
    pub always_open: bool,
}

impl Default for WorkWindow {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            schedule: Vec::new(),
            always_open: true,
        }
    }
}

impl WorkWindow {
    fn default_always_open() -> bool {
        true
    }

    /// Whether the timezone name resolves in the tz database.
    pub fn timezone_valid(&self) -> bool {
        self.timezone.parse::<Tz>().is_ok()
    }

    /// Whether the window is open at the given instant.
    pub fn is_open_at(&self, at: DateTime<Utc>) -> bool {
        if self.always_open {
            return true;
        }
        let Ok(tz) = self.timezone.parse::<Tz>() else {
            return true;
        };
        let local = at.with_timezone(&tz);
        let weekday = local.weekday();
        let hour = u8::try_from(local.hour()).unwrap_or(0);
        self.schedule
            .iter()
            .any(|(day, range)| *day == weekday && range.contains(hour))
    }
}

/// A registered project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Absolute path to the project root. Exclusively owned by this
    /// project's orchestrator.
    pub path: PathBuf,
    pub priority: ProjectPriority,
    pub status: ProjectStatus,
    pub limits: ResourceLimits,
    pub work_window: WorkWindow,
    /// Projects this one is allowed to overlap or depend on.
    pub dependencies: BTreeSet<ProjectId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, priority: ProjectPriority) -> Self {
        let now = Utc::now();
        Self {
            id: ProjectId::new(),
            name: name.into(),
            path: path.into(),
            priority,
            status: ProjectStatus::Initializing,
            limits: ResourceLimits::default(),
            work_window: WorkWindow::default(),
            dependencies: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = ProjectId>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }

    /// Whether this project declares a dependency edge to `other`.
    pub fn depends_on(&self, other: ProjectId) -> bool {
        self.dependencies.contains(&other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_priority_weights() {
        assert!((ProjectPriority::Critical.weight() - 8.0).abs() < f64::EPSILON);
        assert!((ProjectPriority::High.weight() - 4.0).abs() < f64::EPSILON);
        assert!((ProjectPriority::Normal.weight() - 2.0).abs() < f64::EPSILON);
        assert!((ProjectPriority::Low.weight() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(ProjectPriority::Critical > ProjectPriority::High);
        assert!(ProjectPriority::High > ProjectPriority::Normal);
        assert!(ProjectPriority::Normal > ProjectPriority::Low);
    }

    #[test]
    fn test_status_lifecycle() {
        assert!(ProjectStatus::Initializing.can_transition_to(ProjectStatus::Active));
        assert!(ProjectStatus::Active.can_transition_to(ProjectStatus::Paused));
        assert!(ProjectStatus::Paused.can_transition_to(ProjectStatus::Active));
        assert!(ProjectStatus::Maintenance.can_transition_to(ProjectStatus::Active));
        assert!(!ProjectStatus::Archived.can_transition_to(ProjectStatus::Active));
        assert!(!ProjectStatus::Initializing.can_transition_to(ProjectStatus::Paused));
    }

    #[test]
    fn test_cpu_weight_range() {
        let mut limits = ResourceLimits::default();
        assert!(limits.cpu_weight_valid());
        limits.cpu_weight = 0.05;
        assert!(!limits.cpu_weight_valid());
        limits.cpu_weight = 2.5;
        assert!(!limits.cpu_weight_valid());
        limits.cpu_weight = 2.0;
        assert!(limits.cpu_weight_valid());
    }

    #[test]
    fn test_work_window_always_open() {
        let window = WorkWindow::default();
        assert!(window.is_open_at(Utc::now()));
    }

    #[test]
    fn test_work_window_schedule() {
        let window = WorkWindow {
            timezone: "UTC".to_string(),
            schedule: vec![(Weekday::Mon, HourRange { start_hour: 9, end_hour: 17 })],
            always_open: false,
        };
        // 2026-01-05 is a Monday.
        let monday_noon = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        let monday_night = Utc.with_ymd_and_hms(2026, 1, 5, 22, 0, 0).unwrap();
        let tuesday_noon = Utc.with_ymd_and_hms(2026, 1, 6, 12, 0, 0).unwrap();
        assert!(window.is_open_at(monday_noon));
        assert!(!window.is_open_at(monday_night));
        assert!(!window.is_open_at(tuesday_noon));
    }

    #[test]
    fn test_work_window_timezone_validation() {
        let mut window = WorkWindow::default();
        window.timezone = "Europe/Berlin".to_string();
        assert!(window.timezone_valid());
        window.timezone = "Mars/Olympus".to_string();
        assert!(!window.timezone_valid());
    }

    #[test]
    fn test_project_serde_roundtrip() {
        let project = Project::new("alpha", "/tmp/alpha", ProjectPriority::High);
        let json = serde_json::to_string(&project).unwrap();
        let back: Project = serde_json::from_str(&json).unwrap();
        assert_eq!(project, back);
    }
}
