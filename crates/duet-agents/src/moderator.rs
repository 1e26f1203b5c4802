//! The Moderator owns a project's lifecycle: it decomposes the requirement,
//! hands tasks to the TechLead one at a time, reviews every submission
//! synchronously and runs the improvement cycle once at the end.
//!
//! All mutation happens under the project lock and every phase or task
//! change is persisted before the next message goes out, so a restart can
//! pick up from the store with [`Moderator::resume`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use duet_core::config::{AgentsConfig, Config};
use duet_core::lifecycle::LifecycleError;
use duet_core::message::{AgentMessage, MessagePayload};
use duet_core::store::LearningStore;
use duet_core::types::{
    Alert, AlertSeverity, ChangeSet, ChangeSetRef, ProjectPhase, ProjectState, ReviewResult, Task,
    TaskOrigin, TaskStatus,
};
use duet_telemetry::metrics;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::improvement::{self, ImprovementCycle, ProjectSnapshot};
use crate::planner::{HeuristicPlanner, Planner};
use crate::review::{ReviewLedger, Reviewer};
use crate::runtime::{Agent, AgentContext, AgentKind, TaskOutcome};
use crate::state_machine::{AgentEvent, AgentState, AgentStateMachine};

const CHANGESET_KEY: &str = "changeset:";

pub struct Moderator {
    ctx: AgentContext,
    tech_lead: String,
    project: tokio::sync::Mutex<ProjectState>,
    planner: Box<dyn Planner>,
    reviewer: Reviewer,
    ledger: Mutex<ReviewLedger>,
    improvement: ImprovementCycle,
    learning: Option<Arc<dyn LearningStore>>,
    machine: Mutex<AgentStateMachine>,
    policy: AgentsConfig,
    phase_tx: watch::Sender<ProjectPhase>,
}

impl Moderator {
    /// A moderator with the default planner, review checks and analyzers.
    /// The store doubles as the learning store.
    pub fn new(ctx: AgentContext, project: ProjectState, config: &Config, tech_lead: impl Into<String>) -> Self {
        let learning: Arc<dyn LearningStore> = Arc::new(ctx.store().clone());
        let (phase_tx, _) = watch::channel(project.phase);
        Self {
            tech_lead: tech_lead.into(),
            project: tokio::sync::Mutex::new(project),
            planner: Box::new(HeuristicPlanner),
            reviewer: Reviewer::with_default_checks(config.review.clone()),
            ledger: Mutex::new(ReviewLedger::new(config.review.max_iterations)),
            improvement: ImprovementCycle::new(
                config.improvement.clone(),
                improvement::default_analyzers(),
                Some(Arc::clone(&learning)),
            ),
            learning: Some(learning),
            machine: Mutex::new(AgentStateMachine::new()),
            policy: config.agents.clone(),
            phase_tx,
            ctx,
        }
    }

    pub fn with_planner(mut self, planner: Box<dyn Planner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_reviewer(mut self, reviewer: Reviewer) -> Self {
        self.ledger = Mutex::new(ReviewLedger::new(reviewer.config().max_iterations));
        self.reviewer = reviewer;
        self
    }

    pub fn with_improvement(mut self, cycle: ImprovementCycle) -> Self {
        self.improvement = cycle;
        self
    }

    /// Replace the learning store used for recording improvement outcomes.
    /// `None` runs without outcome history.
    pub fn with_learning(mut self, learning: Option<Arc<dyn LearningStore>>) -> Self {
        self.learning = learning;
        self
    }

    pub async fn project(&self) -> ProjectState {
        self.project.lock().await.clone()
    }

    /// Follows the persisted phase.
    pub fn watch_phase(&self) -> watch::Receiver<ProjectPhase> {
        self.phase_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Decompose the requirement and assign the first task.
    pub async fn kickoff(&self) -> Result<()> {
        let mut project = self.project.lock().await;
        if project.phase != ProjectPhase::Decomposing {
            debug!(project_id = %project.id, phase = %project.phase, "kickoff skipped");
            return Ok(());
        }
        self.save(&project).await?;

        let tasks = match self.planner.decompose(project.id, &project.requirement) {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(project_id = %project.id, error = %e, "decomposition failed");
                project.stop(e.to_string())?;
                self.save(&project).await?;
                return Err(e.into());
            }
        };
        info!(project_id = %project.id, tasks = tasks.len(), "requirement decomposed");
        project.add_tasks(tasks)?;
        project.transition(ProjectPhase::Implementing)?;
        self.save(&project).await?;
        self.dispatch_next(&mut project).await
    }

    /// Continue a project loaded from the store.
    ///
    /// Tasks left running are handed back to pending and review counts are
    /// rebuilt from the audit log so the iteration cap survives a restart.
    pub async fn resume(&self) -> Result<()> {
        let mut project = self.project.lock().await;
        if project.phase == ProjectPhase::Decomposing {
            drop(project);
            return self.kickoff().await;
        }
        if project.phase.is_terminal() {
            return Ok(());
        }

        let interrupted: Vec<Uuid> = project.running_tasks().map(|t| t.id).collect();
        for id in &interrupted {
            project.finish_task(*id, TaskStatus::Pending)?;
        }
        let open: Vec<Uuid> = project
            .tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id)
            .collect();
        for id in open {
            let attempts = self.ctx.store().review_attempts(project.id, id).await?;
            self.lock_ledger().restore(id, attempts.len() as u32);
        }
        if project.phase == ProjectPhase::Reviewing {
            project.transition(ProjectPhase::Implementing)?;
        }
        info!(
            project_id = %project.id,
            phase = %project.phase,
            interrupted = interrupted.len(),
            "project resumed"
        );
        self.save(&project).await?;
        self.dispatch_next(&mut project).await
    }

    /// Stop the project with a reason. Terminal projects are left alone.
    pub async fn stop(&self, reason: &str) -> Result<()> {
        let mut project = self.project.lock().await;
        if project.phase.is_terminal() {
            return Ok(());
        }
        project.stop(reason)?;
        warn!(project_id = %project.id, reason, "project stopped");
        self.save(&project).await
    }

    // -----------------------------------------------------------------------
    // Review
    // -----------------------------------------------------------------------

    async fn review_submission(
        &self,
        msg: &AgentMessage,
        task_id: Uuid,
        change_set: ChangeSet,
    ) -> Result<AgentMessage> {
        let mut project = self.project.lock().await;
        if project.phase.is_terminal() {
            return Err(AgentError::Blocked {
                task_id,
                reasons: vec![format!("project is {}", project.phase)],
            });
        }
        let task = project
            .task(task_id)
            .cloned()
            .ok_or(LifecycleError::TaskNotFound(task_id))?;
        check_holder(&task, &msg.sender)?;

        let iteration = self.lock_ledger().next_iteration(task_id)?;

        self.mark(AgentEvent::Assign)?;
        // Improvement tasks are reviewed without leaving `Improving`.
        let enter_review = project.phase == ProjectPhase::Implementing;
        if enter_review {
            project.transition(ProjectPhase::Reviewing)?;
            if let Err(e) = self.save(&project).await {
                project.transition(ProjectPhase::Implementing)?;
                self.mark(AgentEvent::Release)?;
                return Err(e);
            }
        }
        let outcome = self
            .score_and_record(&mut project, &task, change_set, iteration)
            .await;
        self.mark(AgentEvent::Release)?;
        if enter_review {
            project.transition(ProjectPhase::Implementing)?;
        }
        self.save(&project).await?;
        let result = outcome?;

        Ok(msg.reply(MessagePayload::ReviewFeedback { task_id, result }))
    }

    async fn score_and_record(
        &self,
        project: &mut ProjectState,
        task: &Task,
        change_set: ChangeSet,
        iteration: u32,
    ) -> Result<ReviewResult> {
        let result = self.reviewer.review(task, &change_set, iteration);
        self.ctx
            .store()
            .record_review(project.id, task.id, &result)
            .await?;

        let breakdown: Vec<String> = result
            .breakdown
            .iter()
            .map(|s| format!("{}={}/{}", s.category, s.earned, s.possible))
            .collect();
        info!(
            project_id = %project.id,
            task_id = %task.id,
            iteration,
            score = result.score,
            passed = result.passed,
            breakdown = %breakdown.join(" "),
            blocking = ?result.blocking_issues,
            "review recorded"
        );
        let project_label = project.id.to_string();
        self.ctx.bus().metrics().increment_counter(
            metrics::REVIEWS,
            &[
                ("project", project_label.as_str()),
                ("outcome", if result.passed { "passed" } else { "rejected" }),
            ],
        );

        project.attach_change_set(task.id, change_set.reference.clone())?;
        if result.passed {
            self.ctx
                .remember(&format!("{}{}", CHANGESET_KEY, task.id), &change_set.files)
                .await?;
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Completion and dispatch
    // -----------------------------------------------------------------------

    async fn complete_task(
        &self,
        sender: &str,
        task_id: Uuid,
        status: TaskStatus,
        change_set: Option<ChangeSetRef>,
        reasons: Vec<String>,
    ) -> Result<()> {
        let mut project = self.project.lock().await;
        let task = project
            .task(task_id)
            .cloned()
            .ok_or(LifecycleError::TaskNotFound(task_id))?;
        if task.status.is_terminal() {
            warn!(project_id = %project.id, %task_id, "completion for a finished task ignored");
            return Ok(());
        }
        if !status.is_terminal() {
            return Err(LifecycleError::InvalidTaskStatus {
                task_id,
                from: task.status,
                to: status,
            }
            .into());
        }
        check_holder(&task, sender)?;

        if let (TaskStatus::Completed, Some(reference)) = (status, change_set) {
            project.attach_change_set(task_id, reference)?;
        }
        project.finish_task(task_id, status)?;
        match status {
            TaskStatus::Completed => info!(project_id = %project.id, %task_id, "task completed"),
            _ => error!(project_id = %project.id, %task_id, reasons = ?reasons, "task failed"),
        }
        let project_label = project.id.to_string();
        let status_label = status.to_string();
        self.ctx.bus().metrics().increment_counter(
            metrics::TASKS_FINISHED,
            &[("project", project_label.as_str()), ("status", status_label.as_str())],
        );

        if task.origin == TaskOrigin::Improvement {
            self.record_outcome(&task, status == TaskStatus::Completed).await;
        }
        self.save(&project).await?;

        let failed = project.failed_task_count();
        if self.policy.max_failed_tasks > 0 && failed >= self.policy.max_failed_tasks {
            project.stop(format!("{} tasks failed", failed))?;
            warn!(project_id = %project.id, failed, "failure limit reached, project stopped");
            return self.save(&project).await;
        }
        self.dispatch_next(&mut project).await
    }

    async fn record_outcome(&self, task: &Task, accepted: bool) {
        let (Some(learning), Some(category)) = (&self.learning, improvement::category_of(task)) else {
            return;
        };
        if let Err(e) = learning.record_outcome(category, accepted).await {
            warn!(task_id = %task.id, error = %e, "could not record improvement outcome");
        }
    }

    /// Assign the next pending task, or move the project forward when
    /// nothing is left: improvement once, then completed.
    async fn dispatch_next(&self, project: &mut ProjectState) -> Result<()> {
        loop {
            if project.phase.is_terminal() || project.running_tasks().next().is_some() {
                return Ok(());
            }

            if let Some(next) = project.next_pending().map(|t| t.id) {
                let task = project.assign_task(next, &self.tech_lead)?;
                self.save(project).await?;
                info!(
                    project_id = %project.id,
                    task_id = %task.id,
                    agent = %self.tech_lead,
                    "task assigned"
                );
                return self
                    .ctx
                    .send(&self.tech_lead, MessagePayload::Assignment { task })
                    .await;
            }

            if project.phase == ProjectPhase::Implementing && self.should_improve(project) {
                let tasks = self.improvement_tasks(project).await?;
                if !tasks.is_empty() {
                    project.transition(ProjectPhase::Improving)?;
                    info!(project_id = %project.id, tasks = tasks.len(), "improvement cycle scheduled");
                    project.add_tasks(tasks)?;
                    self.save(project).await?;
                    continue;
                }
            }

            if project.all_tasks_terminal() {
                project.transition(ProjectPhase::Completed)?;
                info!(
                    project_id = %project.id,
                    tasks = project.tasks.len(),
                    failed = project.failed_task_count(),
                    "project completed"
                );
                self.save(project).await?;
            }
            return Ok(());
        }
    }

    fn should_improve(&self, project: &ProjectState) -> bool {
        self.improvement.max_tasks() > 0
            && !project.improvement_ran()
            && project.original_tasks_terminal()
            && project
                .tasks
                .iter()
                .any(|t| t.origin == TaskOrigin::Decomposition && t.status == TaskStatus::Completed)
    }

    async fn improvement_tasks(&self, project: &ProjectState) -> Result<Vec<Task>> {
        let mut approved: HashMap<String, BTreeMap<String, String>> = self
            .ctx
            .recall_prefix(CHANGESET_KEY)
            .await?
            .into_iter()
            .collect();
        // Later tasks win when they touch the same path.
        let mut files = BTreeMap::new();
        for task in project.tasks.iter().filter(|t| t.status == TaskStatus::Completed) {
            if let Some(set) = approved.remove(&format!("{}{}", CHANGESET_KEY, task.id)) {
                files.extend(set);
            }
        }
        let snapshot = ProjectSnapshot {
            project_id: project.id,
            files,
        };
        let selected = self.improvement.propose(&snapshot).await;
        Ok(ImprovementCycle::to_tasks(project.id, &selected))
    }

    async fn on_alert(&self, alert: Alert) -> Result<()> {
        warn!(
            project_id = %alert.project_id,
            metric = %alert.metric,
            severity = %alert.severity,
            observed = alert.observed,
            threshold = alert.threshold,
            "health alert received"
        );
        if alert.severity == AlertSeverity::Critical && self.policy.stop_on_critical_alert {
            self.stop(&format!("critical alert on {}: {}", alert.metric, alert.message))
                .await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn save(&self, project: &ProjectState) -> Result<()> {
        self.ctx.store().save_project(project).await?;
        self.phase_tx.send_replace(project.phase);
        Ok(())
    }

    fn lock_ledger(&self) -> std::sync::MutexGuard<'_, ReviewLedger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark(&self, event: AgentEvent) -> Result<()> {
        let mut machine = self.machine.lock().unwrap_or_else(|p| p.into_inner());
        machine.transition(event)?;
        Ok(())
    }
}

fn check_holder(task: &Task, sender: &str) -> Result<()> {
    if task.status != TaskStatus::Running {
        return Err(LifecycleError::InvalidTaskStatus {
            task_id: task.id,
            from: task.status,
            to: TaskStatus::Running,
        }
        .into());
    }
    match task.assigned_to.as_deref() {
        Some(holder) if holder == sender => Ok(()),
        holder => Err(LifecycleError::NotAssignee {
            task_id: task.id,
            holder: holder.unwrap_or("nobody").to_string(),
            requester: sender.to_string(),
        }
        .into()),
    }
}

#[async_trait]
impl Agent for Moderator {
    fn id(&self) -> &str {
        self.ctx.agent_id()
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Moderator
    }

    fn state(&self) -> AgentState {
        self.machine.lock().map(|m| m.state()).unwrap_or(AgentState::Error)
    }

    async fn receive(&self, msg: AgentMessage) -> Result<Option<AgentMessage>> {
        match msg.payload.clone() {
            MessagePayload::ChangeSetSubmitted { task_id, change_set } => {
                self.review_submission(&msg, task_id, change_set).await.map(Some)
            }
            MessagePayload::Completion {
                task_id,
                status,
                change_set,
                reasons,
            } => {
                self.complete_task(&msg.sender, task_id, status, change_set, reasons)
                    .await?;
                Ok(None)
            }
            MessagePayload::HealthAlert { alert } => {
                self.on_alert(alert).await?;
                Ok(None)
            }
            MessagePayload::Status { state, detail } => {
                debug!(from = %msg.sender, %state, %detail, "status received");
                if !msg.requires_response {
                    return Ok(None);
                }
                let project = self.project.lock().await;
                let done = project.tasks.iter().filter(|t| t.status.is_terminal()).count();
                Ok(Some(msg.reply(MessagePayload::Status {
                    state: project.phase.to_string(),
                    detail: format!("{} of {} tasks finished", done, project.tasks.len()),
                })))
            }
            other => Err(AgentError::UnexpectedMessage {
                agent: self.id().to_string(),
                kind: other.kind(),
            }),
        }
    }

    /// Queue an externally supplied task behind the current work.
    async fn run(&self, task: Task) -> Result<TaskOutcome> {
        let mut project = self.project.lock().await;
        let task_id = task.id;
        if project.task(task_id).is_none() {
            project.add_tasks([task])?;
            self.save(&project).await?;
        }
        self.dispatch_next(&mut project).await?;
        let current = project
            .task(task_id)
            .cloned()
            .ok_or(LifecycleError::TaskNotFound(task_id))?;
        Ok(TaskOutcome {
            task_id,
            status: current.status,
            change_set: current.change_set,
            reasons: Vec::new(),
            iterations: self.lock_ledger().iterations(task_id),
        })
    }
}
