//! Project/task lifecycle state machine.
//!
//! A project moves `decomposing -> implementing -> (reviewing -> implementing)*
//! -> improving? -> completed`, or ends early in `stopped`. Tasks move
//! `pending -> running -> completed | failed` and are frozen once completed.

use chrono::Utc;
use uuid::Uuid;

use crate::types::{ChangeSetRef, ProjectPhase, ProjectState, Task, TaskOrigin, TaskStatus};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("invalid phase transition: {from} -> {to}")]
    InvalidPhase {
        from: ProjectPhase,
        to: ProjectPhase,
    },

    #[error("improvement cycle already ran for project {0}")]
    ImprovementAlreadyRan(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("invalid task transition for {task_id}: {from} -> {to}")]
    InvalidTaskStatus {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {task_id} is held by {holder}, not {requester}")]
    NotAssignee {
        task_id: Uuid,
        holder: String,
        requester: String,
    },

    #[error("task {0} belongs to another project")]
    ForeignTask(Uuid),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

// ---------------------------------------------------------------------------
// ProjectState behaviour
// ---------------------------------------------------------------------------

impl ProjectState {
    /// Create a project in `Decomposing`.
    pub fn new(requirement: impl Into<String>, target: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            requirement: requirement.into(),
            target: target.into(),
            tasks: Vec::new(),
            phase: ProjectPhase::Decomposing,
            phase_history: vec![ProjectPhase::Decomposing],
            stop_reason: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Whether the improvement cycle has already been entered.
    pub fn improvement_ran(&self) -> bool {
        self.phase_history.contains(&ProjectPhase::Improving)
    }

    /// Move to `next`, recording it in the phase history.
    pub fn transition(&mut self, next: ProjectPhase) -> Result<ProjectPhase> {
        if !self.phase.can_transition_to(&next) {
            return Err(LifecycleError::InvalidPhase {
                from: self.phase,
                to: next,
            });
        }
        if next == ProjectPhase::Improving && self.improvement_ran() {
            return Err(LifecycleError::ImprovementAlreadyRan(self.id));
        }

        let from = self.phase;
        self.phase = next;
        self.phase_history.push(next);
        self.touch();
        tracing::debug!(project_id = %self.id, from = %from, to = %next, "project phase transition");
        Ok(next)
    }

    /// Terminate the project in `Stopped` with a reason.
    pub fn stop(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(ProjectPhase::Stopped)?;
        self.stop_reason = Some(reason.into());
        Ok(())
    }

    /// Append tasks produced by decomposition or the improvement cycle.
    pub fn add_tasks(&mut self, tasks: impl IntoIterator<Item = Task>) -> Result<()> {
        for task in tasks {
            if task.project_id != self.id {
                return Err(LifecycleError::ForeignTask(task.id));
            }
            self.tasks.push(task);
        }
        self.touch();
        Ok(())
    }

    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// First task still waiting to be picked up, in insertion order.
    pub fn next_pending(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| t.status == TaskStatus::Pending)
    }

    /// Tasks left in `Running` (e.g. by a crash), in insertion order.
    pub fn running_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Running)
    }

    pub fn original_tasks_terminal(&self) -> bool {
        self.tasks
            .iter()
            .filter(|t| t.origin == TaskOrigin::Decomposition)
            .all(|t| t.status.is_terminal())
    }

    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    pub fn failed_task_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count()
    }

    /// Hand a pending task to `agent` and mark it running.
    pub fn assign_task(&mut self, task_id: Uuid, agent: &str) -> Result<Task> {
        let task = self.task_mut(task_id)?;
        if let Some(holder) = task.assigned_to.as_deref() {
            if holder != agent && task.status == TaskStatus::Running {
                return Err(LifecycleError::NotAssignee {
                    task_id,
                    holder: holder.to_string(),
                    requester: agent.to_string(),
                });
            }
        }
        apply_status(task, TaskStatus::Running)?;
        task.assigned_to = Some(agent.to_string());
        let assigned = task.clone();
        self.touch();
        Ok(assigned)
    }

    /// Record the change-set reference produced for a running task.
    pub fn attach_change_set(&mut self, task_id: Uuid, change_set: ChangeSetRef) -> Result<()> {
        let task = self.task_mut(task_id)?;
        if task.status != TaskStatus::Running {
            return Err(LifecycleError::InvalidTaskStatus {
                task_id,
                from: task.status,
                to: TaskStatus::Running,
            });
        }
        task.change_set = Some(change_set);
        task.updated_at = Utc::now();
        self.touch();
        Ok(())
    }

    /// Move a task to a terminal status and release its assignee.
    pub fn finish_task(&mut self, task_id: Uuid, status: TaskStatus) -> Result<()> {
        let task = self.task_mut(task_id)?;
        apply_status(task, status)?;
        if status.is_terminal() {
            task.assigned_to = None;
        }
        self.touch();
        Ok(())
    }

    fn task_mut(&mut self, id: Uuid) -> Result<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(LifecycleError::TaskNotFound(id))
    }

    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

fn apply_status(task: &mut Task, next: TaskStatus) -> Result<()> {
    if !task.status.can_transition_to(&next) {
        return Err(LifecycleError::InvalidTaskStatus {
            task_id: task.id,
            from: task.status,
            to: next,
        });
    }
    task.status = next;
    task.updated_at = Utc::now();
    Ok(())
}

/// Collapse a phase history to its major phases: drop the transient
/// `Reviewing` entries and merge consecutive repeats.
pub fn major_phases(history: &[ProjectPhase]) -> Vec<ProjectPhase> {
    let mut out: Vec<ProjectPhase> = Vec::new();
    for phase in history {
        if *phase == ProjectPhase::Reviewing {
            continue;
        }
        if out.last() != Some(phase) {
            out.push(*phase);
        }
    }
    out
}
