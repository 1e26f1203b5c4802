use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use duet_core::message::{AgentMessage, MessagePayload};
use duet_core::types::{ChangeSet, ChangeSetRef, FeedbackItem, ReviewResult, Task};
use duet_harness::retry::{retry_transient, RetryPolicy};
use tracing::{debug, error, info, warn};

use crate::backend::{CodeGenerator, GenerationRequest, VcsService};
use crate::error::{AgentError, ErrorClass, Result};
use crate::runtime::{Agent, AgentContext, AgentKind, TaskOutcome};
use crate::state_machine::{AgentEvent, AgentState, AgentStateMachine};

/// Implements assigned tasks: generate, commit, submit for review and
/// revise until the Moderator approves or the iteration cap is hit.
pub struct TechLead {
    ctx: AgentContext,
    moderator: String,
    generator: Arc<dyn CodeGenerator>,
    vcs: Arc<dyn VcsService>,
    retry: RetryPolicy,
    max_iterations: u32,
    workspace: PathBuf,
    machine: Mutex<AgentStateMachine>,
}

impl TechLead {
    pub fn new(
        ctx: AgentContext,
        moderator: impl Into<String>,
        generator: Arc<dyn CodeGenerator>,
        vcs: Arc<dyn VcsService>,
    ) -> Self {
        Self {
            ctx,
            moderator: moderator.into(),
            generator,
            vcs,
            retry: RetryPolicy::default(),
            max_iterations: 3,
            workspace: PathBuf::from("."),
            machine: Mutex::new(AgentStateMachine::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Local bound on submissions per task. The Moderator's own cap is the
    /// authoritative one; this only stops a runaway loop.
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Root under which each task's output location is derived.
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Operator intervention after an unhandled failure.
    pub fn recover(&self) -> Result<AgentState> {
        Ok(self.machine().transition(AgentEvent::Recover)?)
    }

    fn machine(&self) -> std::sync::MutexGuard<'_, AgentStateMachine> {
        self.machine.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn mark(&self, event: AgentEvent) -> Result<()> {
        self.machine().transition(event)?;
        Ok(())
    }

    /// Back to idle after work that ended without approval.
    fn release(&self) {
        let mut machine = self.machine();
        if machine.can_transition(AgentEvent::Release) {
            let _ = machine.transition(AgentEvent::Release);
        }
    }

    fn output_location(&self, task: &Task) -> String {
        self.workspace
            .join(task.project_id.to_string())
            .join(task.id.simple().to_string())
            .display()
            .to_string()
    }

    async fn generate(&self, task: &Task, feedback: &[FeedbackItem], attempt: u32) -> Result<ChangeSet> {
        let request = GenerationRequest {
            project_id: task.project_id,
            task_id: task.id,
            description: task.description.clone(),
            acceptance_criteria: task.acceptance_criteria.clone(),
            output_location: self.output_location(task),
            feedback: feedback.to_vec(),
            attempt,
        };
        let files = retry_transient(self.retry, "generate", |_| self.generator.generate(&request)).await?;
        self.vcs.commit(task, &files).await?;
        debug!(task_id = %task.id, attempt, files = files.len(), "changes committed");
        Ok(ChangeSet {
            reference: ChangeSetRef {
                url: String::new(),
                number: 0,
            },
            summary: format!("{} (attempt {})", task.description, attempt),
            files,
        })
    }

    async fn submit(&self, task: &Task, change_set: ChangeSet) -> Result<ReviewResult> {
        self.mark(AgentEvent::Submit)?;
        let response = self
            .ctx
            .request(
                &self.moderator,
                MessagePayload::ChangeSetSubmitted {
                    task_id: task.id,
                    change_set,
                },
            )
            .await?;
        match response.payload {
            MessagePayload::ReviewFeedback { result, .. } => Ok(result),
            other => Err(AgentError::UnexpectedMessage {
                agent: self.id().to_string(),
                kind: other.kind(),
            }),
        }
    }

    async fn report(&self, outcome: TaskOutcome) -> Result<()> {
        self.ctx.send(&self.moderator, outcome.into_payload()).await
    }
}

#[async_trait]
impl Agent for TechLead {
    fn id(&self) -> &str {
        self.ctx.agent_id()
    }

    fn kind(&self) -> AgentKind {
        AgentKind::TechLead
    }

    fn state(&self) -> AgentState {
        self.machine().state()
    }

    async fn receive(&self, msg: AgentMessage) -> Result<Option<AgentMessage>> {
        match msg.payload {
            MessagePayload::Assignment { task } => {
                let task_id = task.id;
                match self.run(task).await {
                    Ok(outcome) => self.report(outcome).await?,
                    Err(e) if e.class() == ErrorClass::Fatal => {
                        error!(%task_id, error = %e, "task aborted by fatal error");
                        let _ = self.mark(AgentEvent::Fail);
                        return Err(e);
                    }
                    Err(e) => {
                        let class = e.class();
                        if class == ErrorClass::Blocking {
                            error!(%task_id, ?class, reasons = ?e.reasons(), "task blocked");
                        } else {
                            warn!(%task_id, ?class, error = %e, "task failed");
                        }
                        self.release();
                        self.report(TaskOutcome::failed(task_id, e.reasons(), 0)).await?;
                    }
                }
                Ok(None)
            }
            MessagePayload::Status { ref state, .. } => {
                debug!(from = %msg.sender, %state, "status received");
                if msg.requires_response {
                    return Ok(Some(msg.reply(MessagePayload::Status {
                        state: self.state().to_string(),
                        detail: String::new(),
                    })));
                }
                Ok(None)
            }
            other => Err(AgentError::UnexpectedMessage {
                agent: self.id().to_string(),
                kind: other.kind(),
            }),
        }
    }

    async fn run(&self, task: Task) -> Result<TaskOutcome> {
        self.mark(AgentEvent::Assign)?;
        let branch = self.vcs.create_branch(&task).await?;
        info!(task_id = %task.id, %branch, "task started");

        let mut feedback: Vec<FeedbackItem> = Vec::new();
        let mut pr: Option<ChangeSetRef> = None;

        for attempt in 1..=self.max_iterations {
            let mut change_set = self.generate(&task, &feedback, attempt).await?;
            let reference = match &pr {
                Some(existing) => existing.clone(),
                None => {
                    let created = self.vcs.create_pr(&task).await?;
                    info!(task_id = %task.id, change_set = %created, "change set opened");
                    pr = Some(created.clone());
                    created
                }
            };
            change_set.reference = reference;

            let result = self.submit(&task, change_set).await?;
            if result.passed {
                self.mark(AgentEvent::Approve)?;
                info!(task_id = %task.id, iteration = result.iteration, score = result.score, "change set approved");
                return Ok(TaskOutcome::completed(task.id, result.change_set, result.iteration));
            }
            if result.exhausted {
                self.mark(AgentEvent::Release)?;
                error!(
                    task_id = %task.id,
                    iteration = result.iteration,
                    blocking = ?result.blocking_issues,
                    "review iteration limit reached"
                );
                return Ok(TaskOutcome::failed(task.id, result.blocking_issues, result.iteration));
            }

            self.mark(AgentEvent::Reject)?;
            info!(
                task_id = %task.id,
                iteration = result.iteration,
                score = result.score,
                blocking = ?result.blocking_issues,
                "change set rejected, revising"
            );
            feedback = result.feedback;
        }

        Err(AgentError::Blocked {
            task_id: task.id,
            reasons: vec![format!("no approval after {} submissions", self.max_iterations)],
        })
    }
}
