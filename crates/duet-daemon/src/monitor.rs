//! Periodic health sampling for one project.
//!
//! The [`Monitor`] agent runs on the same supervisor as the Moderator and
//! TechLead. Each tick it pulls a batch of samples from its
//! [`MetricSource`], persists them, feeds them to the [`AnomalyDetector`]
//! and forwards every raised alert to the Moderator over the bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duet_agents::runtime::{Agent, AgentContext, AgentKind, TaskOutcome};
use duet_agents::state_machine::AgentState;
use duet_agents::AgentError;
use duet_core::message::{AgentMessage, MessagePayload};
use duet_core::store::{Store, StoreError};
use duet_core::types::{Alert, AlertSeverity, Metric, Task, TaskStatus};
use duet_telemetry::metrics::{MetricsCollector, ALERTS_RAISED, MESSAGES_ROUTED};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::anomaly::AnomalyDetector;

pub const ERROR_RATE: &str = "error_rate";
pub const REVIEW_REJECTION_RATE: &str = "review_rejection_rate";
pub const PENDING_TASKS: &str = "pending_tasks";
pub const MESSAGES: &str = "messages_routed";

// ---------------------------------------------------------------------------
// MetricSource
// ---------------------------------------------------------------------------

/// Produces the samples for one monitoring pass.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn sample(&self) -> Result<Vec<Metric>, StoreError>;
}

/// Derives project health metrics from persisted state and bus counters.
pub struct PipelineMetricSource {
    project_id: Uuid,
    store: Store,
    metrics: Arc<MetricsCollector>,
}

impl PipelineMetricSource {
    pub fn new(project_id: Uuid, store: Store, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            project_id,
            store,
            metrics,
        }
    }
}

#[async_trait]
impl MetricSource for PipelineMetricSource {
    async fn sample(&self) -> Result<Vec<Metric>, StoreError> {
        let mut samples = Vec::with_capacity(4);

        if let Some(project) = self.store.load_project(self.project_id).await? {
            let finished = project.tasks.iter().filter(|t| t.status.is_terminal()).count();
            let failed = project.failed_task_count();
            samples.push(Metric::new(ERROR_RATE, ratio(failed as u64, finished as u64)));
            let pending = project
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Pending)
                .count();
            samples.push(Metric::new(PENDING_TASKS, pending as f64));
        }

        let (reviews, rejected) = self.store.review_counts(self.project_id).await?;
        samples.push(Metric::new(REVIEW_REJECTION_RATE, ratio(rejected, reviews)));

        let project = self.project_id.to_string();
        let routed = self
            .metrics
            .sum_counter(MESSAGES_ROUTED, &[("project", project.as_str())]);
        samples.push(Metric::new(MESSAGES, routed as f64));

        Ok(samples)
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

// ---------------------------------------------------------------------------
// HealthScore
// ---------------------------------------------------------------------------

/// 0-100 summary of a project's unacknowledged alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct HealthScore {
    pub score: u8,
    pub critical: usize,
    pub warning: usize,
}

impl HealthScore {
    pub fn from_alerts(alerts: &[Alert]) -> Self {
        let active = alerts.iter().filter(|a| !a.is_acknowledged());
        let (mut critical, mut warning) = (0usize, 0usize);
        for alert in active {
            match alert.severity {
                AlertSeverity::Critical => critical += 1,
                AlertSeverity::Warning => warning += 1,
            }
        }
        let penalty = critical.saturating_mul(25).saturating_add(warning.saturating_mul(10));
        Self {
            score: 100usize.saturating_sub(penalty) as u8,
            critical,
            warning,
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct Monitor {
    ctx: AgentContext,
    moderator: String,
    source: Arc<dyn MetricSource>,
    detector: Mutex<AnomalyDetector>,
    interval: Duration,
    sampling: AtomicBool,
}

impl Monitor {
    pub fn new(
        ctx: AgentContext,
        moderator: impl Into<String>,
        source: Arc<dyn MetricSource>,
        detector: AnomalyDetector,
        interval: Duration,
    ) -> Self {
        Self {
            ctx,
            moderator: moderator.into(),
            source,
            detector: Mutex::new(detector),
            interval,
            sampling: AtomicBool::new(false),
        }
    }

    /// Run one sampling pass and return the alerts it raised.
    ///
    /// Failures on individual samples are logged and skipped so one bad
    /// metric never hides the others.
    pub async fn sample_once(&self) -> Result<Vec<Alert>, AgentError> {
        let samples = self.source.sample().await?;
        let project_id = self.ctx.project_id();
        let store = self.ctx.store();

        // Serialise passes so streaks see samples in order.
        let mut detector = self.detector.lock().await;
        self.sampling.store(true, Ordering::Relaxed);

        let mut raised = Vec::new();
        for sample in &samples {
            if let Err(e) = store.record_metric(project_id, sample).await {
                warn!(%project_id, metric = %sample.name, error = %e, "metric not persisted");
            }
            match detector.observe(sample).await {
                Ok(Some(alert)) => raised.push(alert),
                Ok(None) => {}
                Err(e) => warn!(%project_id, metric = %sample.name, error = %e, "sample skipped"),
            }
        }
        drop(detector);
        self.sampling.store(false, Ordering::Relaxed);

        let project = project_id.to_string();
        for alert in &raised {
            let severity = alert.severity.to_string();
            self.ctx.bus().metrics().increment_counter(
                ALERTS_RAISED,
                &[("project", project.as_str()), ("severity", severity.as_str())],
            );
            // Finished projects have no moderator left to notify.
            if !self.ctx.bus().is_registered(&self.moderator) {
                debug!(%project_id, alert_id = %alert.id, "no moderator registered, alert stored only");
                continue;
            }
            let payload = MessagePayload::HealthAlert { alert: alert.clone() };
            if let Err(e) = self.ctx.send(&self.moderator, payload).await {
                warn!(%project_id, alert_id = %alert.id, error = %e, "alert not delivered");
            }
        }
        debug!(%project_id, samples = samples.len(), alerts = raised.len(), "monitor pass done");
        Ok(raised)
    }
}

#[async_trait]
impl Agent for Monitor {
    fn id(&self) -> &str {
        self.ctx.agent_id()
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Monitor
    }

    fn state(&self) -> AgentState {
        if self.sampling.load(Ordering::Relaxed) {
            AgentState::Processing
        } else {
            AgentState::Idle
        }
    }

    async fn receive(&self, msg: AgentMessage) -> Result<Option<AgentMessage>, AgentError> {
        match msg.payload {
            MessagePayload::Status { .. } if msg.requires_response => {
                let health = HealthScore::from_alerts(&self.ctx.store().active_alerts(self.ctx.project_id()).await?);
                Ok(Some(msg.reply(MessagePayload::Status {
                    state: self.state().to_string(),
                    detail: format!("health {}", health.score),
                })))
            }
            MessagePayload::Status { .. } => Ok(None),
            other => Err(AgentError::UnexpectedMessage {
                agent: self.id().to_string(),
                kind: other.kind(),
            }),
        }
    }

    async fn run(&self, _task: Task) -> Result<TaskOutcome, AgentError> {
        Err(AgentError::Unsupported {
            agent: self.id().to_string(),
            operation: "run",
        })
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    async fn tick(&self) -> Result<(), AgentError> {
        self.sample_once().await.map(|_| ())
    }
}
