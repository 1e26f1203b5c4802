use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `Running -> Pending` covers a task handed back after a restart.
    /// Completed tasks are immutable.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

/// Where a task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    Decomposition,
    Improvement,
}

// ---------------------------------------------------------------------------
// Change sets
// ---------------------------------------------------------------------------

/// Reference to a submitted change set on the VCS host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetRef {
    pub url: String,
    pub number: u64,
}

impl fmt::Display for ChangeSetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.url)
    }
}

/// A reviewable bundle of file modifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub reference: ChangeSetRef,
    /// Path -> full file content.
    pub files: BTreeMap<String, String>,
    pub summary: String,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub status: TaskStatus,
    pub change_set: Option<ChangeSetRef>,
    /// Agent currently holding the task, if any.
    pub assigned_to: Option<String>,
    pub origin: TaskOrigin,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        project_id: Uuid,
        description: impl Into<String>,
        acceptance_criteria: Vec<String>,
        origin: TaskOrigin,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            description: description.into(),
            acceptance_criteria,
            status: TaskStatus::Pending,
            change_set: None,
            assigned_to: None,
            origin,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectPhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPhase {
    Decomposing,
    Implementing,
    /// Transient, entered while a single change set is under review.
    Reviewing,
    Improving,
    Completed,
    Stopped,
}

impl ProjectPhase {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `Stopped` is reachable from every non-terminal phase. Nothing returns
    /// to `Decomposing`. The at-most-once rule for `Improving` lives on
    /// [`ProjectState`](crate::lifecycle) because it needs the project history.
    pub fn can_transition_to(&self, target: &ProjectPhase) -> bool {
        if *target == ProjectPhase::Stopped {
            return !self.is_terminal();
        }
        matches!(
            (self, target),
            (ProjectPhase::Decomposing, ProjectPhase::Implementing)
                | (ProjectPhase::Implementing, ProjectPhase::Reviewing)
                | (ProjectPhase::Implementing, ProjectPhase::Improving)
                | (ProjectPhase::Implementing, ProjectPhase::Completed)
                | (ProjectPhase::Reviewing, ProjectPhase::Implementing)
                | (ProjectPhase::Improving, ProjectPhase::Completed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectPhase::Completed | ProjectPhase::Stopped)
    }
}

impl fmt::Display for ProjectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProjectPhase::Decomposing => "decomposing",
            ProjectPhase::Implementing => "implementing",
            ProjectPhase::Reviewing => "reviewing",
            ProjectPhase::Improving => "improving",
            ProjectPhase::Completed => "completed",
            ProjectPhase::Stopped => "stopped",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// ProjectState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub id: Uuid,
    pub requirement: String,
    /// Target identifier (repository / workspace namespace).
    pub target: String,
    pub tasks: Vec<Task>,
    pub phase: ProjectPhase,
    /// Every phase entered, in order, starting with `Decomposing`.
    pub phase_history: Vec<ProjectPhase>,
    pub stop_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Review
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewCategory {
    CodeQuality,
    Testing,
    Documentation,
    Criteria,
}

impl fmt::Display for ReviewCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReviewCategory::CodeQuality => "code_quality",
            ReviewCategory::Testing => "testing",
            ReviewCategory::Documentation => "documentation",
            ReviewCategory::Criteria => "criteria",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSeverity {
    Info,
    Minor,
    Major,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackItem {
    pub category: ReviewCategory,
    pub severity: FeedbackSeverity,
    pub description: String,
    pub location: Option<String>,
    pub suggested_fix: Option<String>,
}

/// Points earned in one review category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryScore {
    pub category: ReviewCategory,
    pub earned: u32,
    pub possible: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub change_set: ChangeSetRef,
    pub passed: bool,
    /// 0..=100
    pub score: u32,
    pub breakdown: Vec<CategoryScore>,
    pub feedback: Vec<FeedbackItem>,
    pub blocking_issues: Vec<String>,
    /// 1-based review pass for this task.
    pub iteration: u32,
    /// Set when this failing pass used the last allowed iteration.
    pub exhausted: bool,
}

// ---------------------------------------------------------------------------
// Improvement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementCategory {
    Testing,
    Documentation,
    ErrorHandling,
    Performance,
    Architecture,
}

impl ImprovementCategory {
    pub const ALL: [ImprovementCategory; 5] = [
        ImprovementCategory::Testing,
        ImprovementCategory::Documentation,
        ImprovementCategory::ErrorHandling,
        ImprovementCategory::Performance,
        ImprovementCategory::Architecture,
    ];
}

impl fmt::Display for ImprovementCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ImprovementCategory::Testing => "testing",
            ImprovementCategory::Documentation => "documentation",
            ImprovementCategory::ErrorHandling => "error_handling",
            ImprovementCategory::Performance => "performance",
            ImprovementCategory::Architecture => "architecture",
        };
        write!(f, "{}", label)
    }
}

/// Qualitative level used for both effort and impact tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Low,
    Medium,
    High,
}

impl Level {
    /// Normalised weight in `(0, 1]`.
    pub fn weight(&self) -> f64 {
        match self {
            Level::Low => 1.0 / 3.0,
            Level::Medium => 2.0 / 3.0,
            Level::High => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    pub category: ImprovementCategory,
    pub description: String,
    pub priority: f64,
    pub effort: Level,
    pub impact: Level,
    pub location: String,
}

// ---------------------------------------------------------------------------
// Metrics and alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub context: Option<serde_json::Value>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp: Utc::now(),
            context: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub project_id: Uuid,
    pub metric: String,
    pub threshold: f64,
    pub observed: f64,
    pub severity: AlertSeverity,
    pub message: String,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }
}
