//! Control surface over concurrently running projects.
//!
//! Each project gets its own bus, supervisor and agent trio. They share
//! only the [`Context`]: one store, one metrics collector, one generator.
//! Isolation between projects comes from every store query and bus route
//! being keyed by project id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use duet_agents::backend::{BackendError, LocalVcs, VcsService};
use duet_agents::runtime::{AgentContext, AgentKind};
use duet_agents::{AgentError, Moderator, Supervisor, TechLead};
use duet_bridge::MessageBus;
use duet_core::store::StoreError;
use duet_core::types::{Alert, Metric, ProjectPhase, ProjectState};
use duet_harness::shutdown::ShutdownSignal;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::anomaly::AnomalyDetector;
use crate::context::Context;
use crate::monitor::{HealthScore, Monitor, PipelineMetricSource};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("project not found: {0}")]
    NotFound(Uuid),

    #[error("project {0} is not running in this process")]
    NotRunning(Uuid),

    #[error("invalid target: {0}")]
    InvalidTarget(#[source] BackendError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("timed out waiting for project {0}")]
    Timeout(Uuid),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// ProjectHandle
// ---------------------------------------------------------------------------

/// Returned by [`Orchestrator::start_project`]; follows the project's phase.
#[derive(Debug, Clone)]
pub struct ProjectHandle {
    pub project_id: Uuid,
    phase: watch::Receiver<ProjectPhase>,
}

impl ProjectHandle {
    pub fn phase(&self) -> ProjectPhase {
        *self.phase.borrow()
    }

    /// Wait until the project completes or stops.
    pub async fn wait_until_terminal(&mut self, timeout: Duration) -> Result<ProjectPhase> {
        let project_id = self.project_id;
        let phase = &mut self.phase;
        tokio::time::timeout(timeout, async move {
            loop {
                let current = *phase.borrow_and_update();
                if current.is_terminal() {
                    return current;
                }
                if phase.changed().await.is_err() {
                    return *phase.borrow();
                }
            }
        })
        .await
        .map_err(|_| OrchestratorError::Timeout(project_id))
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct ProjectRuntime {
    moderator: Arc<Moderator>,
    monitor: Arc<Monitor>,
    supervisor: Arc<Supervisor>,
    reaper: JoinHandle<()>,
}

type Runtimes = Arc<Mutex<HashMap<Uuid, Arc<ProjectRuntime>>>>;

/// Projects stay in the runtime map only while their workers run; the
/// reaper removes them once they reach a terminal phase.
pub struct Orchestrator {
    ctx: Context,
    runtimes: Runtimes,
}

impl Orchestrator {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            runtimes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Validate the target, persist a new project and start its agents.
    pub async fn start_project(&self, requirement: &str, target: &str) -> Result<ProjectHandle> {
        let vcs = LocalVcs::new(&self.ctx.workspace_root, target);
        vcs.validate_target(target)
            .await
            .map_err(OrchestratorError::InvalidTarget)?;

        let project = ProjectState::new(requirement, target);
        let project_id = project.id;
        info!(%project_id, target, "starting project");
        self.launch(project, vcs, false).await
    }

    /// Restart the agents of a persisted project in this process.
    pub async fn resume_project(&self, project_id: Uuid) -> Result<ProjectHandle> {
        if let Some(runtime) = self.runtime(project_id).await {
            return Ok(ProjectHandle {
                project_id,
                phase: runtime.moderator.watch_phase(),
            });
        }
        let project = self
            .ctx
            .store
            .load_project(project_id)
            .await?
            .ok_or(OrchestratorError::NotFound(project_id))?;
        let vcs = LocalVcs::new(&self.ctx.workspace_root, project.target.clone());
        info!(%project_id, phase = %project.phase, "resuming project");
        self.launch(project, vcs, true).await
    }

    async fn launch(&self, project: ProjectState, vcs: LocalVcs, resume: bool) -> Result<ProjectHandle> {
        let project_id = project.id;
        let config = &self.ctx.config;
        let store = self.ctx.store.clone();
        let bus = MessageBus::new(project_id, store.clone(), self.ctx.metrics.clone());

        let moderator_id = AgentKind::Moderator.default_id();
        let tech_lead_id = AgentKind::TechLead.default_id();

        let tech_lead = Arc::new(
            TechLead::new(
                AgentContext::new(tech_lead_id, bus.clone(), store.clone()),
                moderator_id,
                self.ctx.generator.clone(),
                Arc::new(vcs),
            )
            .with_retry(self.ctx.retry_policy())
            .with_max_iterations(config.review.max_iterations)
            .with_workspace(self.ctx.workspace_root.join(&project.target)),
        );
        let moderator = Arc::new(Moderator::new(
            AgentContext::new(moderator_id, bus.clone(), store.clone()),
            project,
            config,
            tech_lead_id,
        ));
        let monitor = Arc::new(self.monitor(project_id, &bus).await);

        let supervisor = Arc::new(Supervisor::new(
            ShutdownSignal::new(),
            Duration::from_millis(config.agents.poll_interval_ms),
        ));
        let grace = Duration::from_secs(config.agents.shutdown_grace_secs);

        if let Err(e) = start_agents(&supervisor, &bus, tech_lead, &moderator, &monitor, resume).await {
            error!(%project_id, error = %e, "project failed to start");
            supervisor.shutdown(grace).await;
            return Err(e.into());
        }

        let handle = ProjectHandle {
            project_id,
            phase: moderator.watch_phase(),
        };
        // Held across the spawn so the reaper cannot remove the entry
        // before it is inserted.
        let mut runtimes = self.runtimes.lock().await;
        let reaper = tokio::spawn(reap(
            project_id,
            moderator.clone(),
            supervisor.clone(),
            grace,
            self.runtimes.clone(),
        ));
        runtimes.insert(
            project_id,
            Arc::new(ProjectRuntime {
                moderator,
                monitor,
                supervisor,
                reaper,
            }),
        );
        Ok(handle)
    }

    /// A Monitor over the configured thresholds, with suppression windows
    /// carried over from alerts already on record.
    async fn monitor(&self, project_id: Uuid, bus: &MessageBus) -> Monitor {
        let store = self.ctx.store.clone();
        let monitor_cfg = &self.ctx.config.monitor;
        let mut detector = AnomalyDetector::new(project_id, store.clone(), &monitor_cfg.thresholds);
        if let Err(e) = detector.restore().await {
            warn!(%project_id, error = %e, "alert history not restored");
        }
        Monitor::new(
            AgentContext::new(AgentKind::Monitor.default_id(), bus.clone(), store.clone()),
            AgentKind::Moderator.default_id(),
            Arc::new(PipelineMetricSource::new(project_id, store, self.ctx.metrics.clone())),
            detector,
            Duration::from_secs(monitor_cfg.interval_secs),
        )
    }

    async fn runtime(&self, project_id: Uuid) -> Option<Arc<ProjectRuntime>> {
        self.runtimes.lock().await.get(&project_id).cloned()
    }

    async fn ensure_known(&self, project_id: Uuid) -> Result<()> {
        if self.runtime(project_id).await.is_some() {
            return Ok(());
        }
        match self.ctx.store.load_project(project_id).await? {
            Some(_) => Ok(()),
            None => Err(OrchestratorError::NotFound(project_id)),
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Current phase and task list. Live state when the project runs here,
    /// the persisted record otherwise.
    pub async fn project_status(&self, project_id: Uuid) -> Result<ProjectState> {
        if let Some(runtime) = self.runtime(project_id).await {
            return Ok(runtime.moderator.project().await);
        }
        self.ctx
            .store
            .load_project(project_id)
            .await?
            .ok_or(OrchestratorError::NotFound(project_id))
    }

    pub async fn list_projects(&self) -> Result<Vec<(Uuid, String, ProjectPhase)>> {
        Ok(self.ctx.store.list_projects().await?)
    }

    /// Projects whose workers are running in this process.
    pub async fn running_projects(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.runtimes.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn health_score(&self, project_id: Uuid) -> Result<HealthScore> {
        self.ensure_known(project_id).await?;
        let alerts = self.ctx.store.active_alerts(project_id).await?;
        Ok(HealthScore::from_alerts(&alerts))
    }

    pub async fn metric_history(&self, project_id: Uuid, name: &str, since: DateTime<Utc>) -> Result<Vec<Metric>> {
        self.ensure_known(project_id).await?;
        Ok(self.ctx.store.metric_history(project_id, name, since).await?)
    }

    pub async fn active_alerts(&self, project_id: Uuid) -> Result<Vec<Alert>> {
        self.ensure_known(project_id).await?;
        Ok(self.ctx.store.active_alerts(project_id).await?)
    }

    pub async fn alert_history(&self, project_id: Uuid) -> Result<Vec<Alert>> {
        self.ensure_known(project_id).await?;
        Ok(self.ctx.store.alert_history(project_id).await?)
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    pub async fn acknowledge_alert(&self, project_id: Uuid, alert_id: Uuid, actor: &str) -> Result<Alert> {
        let alert = self.ctx.store.acknowledge_alert(project_id, alert_id, actor).await?;
        info!(%project_id, %alert_id, actor, "alert acknowledged");
        Ok(alert)
    }

    /// Take a monitoring sample now instead of waiting for the next tick.
    /// Projects that are not running get a one-off pass whose alerts are
    /// stored without being forwarded.
    pub async fn sample_now(&self, project_id: Uuid) -> Result<Vec<Alert>> {
        if let Some(runtime) = self.runtime(project_id).await {
            return Ok(runtime.monitor.sample_once().await?);
        }
        self.ensure_known(project_id).await?;
        let bus = MessageBus::new(project_id, self.ctx.store.clone(), self.ctx.metrics.clone());
        Ok(self.monitor(project_id, &bus).await.sample_once().await?)
    }

    /// Stop a running project. Its workers drain in the background.
    pub async fn stop_project(&self, project_id: Uuid, reason: &str) -> Result<()> {
        let runtime = self
            .runtime(project_id)
            .await
            .ok_or(OrchestratorError::NotRunning(project_id))?;
        runtime.moderator.stop(reason).await?;
        Ok(())
    }

    /// Drain every project's workers. Projects keep their last persisted
    /// phase so they can be resumed later.
    pub async fn shutdown(&self) {
        let runtimes: Vec<(Uuid, Arc<ProjectRuntime>)> = self.runtimes.lock().await.drain().collect();
        let grace = Duration::from_secs(self.ctx.config.agents.shutdown_grace_secs);
        for (project_id, runtime) in runtimes {
            let drained = runtime.supervisor.shutdown(grace).await;
            if !drained.is_complete() {
                warn!(%project_id, ?drained, "workers did not drain in time");
            }
            runtime.reaper.abort();
        }
        info!("orchestrator shut down");
    }
}

async fn start_agents(
    supervisor: &Supervisor,
    bus: &MessageBus,
    tech_lead: Arc<TechLead>,
    moderator: &Arc<Moderator>,
    monitor: &Arc<Monitor>,
    resume: bool,
) -> std::result::Result<(), AgentError> {
    supervisor.spawn_worker(tech_lead, bus).await?;
    supervisor.spawn_worker(moderator.clone(), bus).await?;
    supervisor.spawn_worker(monitor.clone(), bus).await?;
    if resume {
        moderator.resume().await
    } else {
        moderator.kickoff().await
    }
}

/// Shut a project's workers down once it reaches a terminal phase, or stop
/// the project when a worker hit a fatal error. Drops the project from
/// `runtimes` when done.
async fn reap(
    project_id: Uuid,
    moderator: Arc<Moderator>,
    supervisor: Arc<Supervisor>,
    grace: Duration,
    runtimes: Runtimes,
) {
    let mut phase = moderator.watch_phase();
    let mut stop = supervisor.shutdown_signal().subscribe();

    loop {
        if phase.borrow_and_update().is_terminal() || supervisor.shutdown_signal().is_shutting_down() {
            break;
        }
        tokio::select! {
            changed = phase.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = stop.recv() => break,
        }
    }

    if let Some(reason) = supervisor.fatal_error() {
        error!(%project_id, %reason, "fatal error, stopping project");
        if let Err(e) = moderator.stop(&format!("fatal: {}", reason)).await {
            warn!(%project_id, error = %e, "could not persist stop");
        }
    }
    let drained = supervisor.shutdown(grace).await;
    runtimes.lock().await.remove(&project_id);
    let last = *phase.borrow();
    info!(%project_id, phase = %last, drained = drained.is_complete(), "project workers stopped");
}
