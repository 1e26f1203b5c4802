use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use duet_agents::backend::{BackendError, CodeGenerator, GeneratedFiles, GenerationRequest, ScriptedGenerator};
use duet_core::config::{Config, ThresholdConfig};
use duet_core::lifecycle::major_phases;
use duet_core::store::{Store, StoreError};
use duet_core::types::{AlertSeverity, ProjectPhase, ProjectState, Task, TaskOrigin, TaskStatus};
use duet_daemon::{Context, Orchestrator, OrchestratorError};

const TESTED: [(&str, &str); 2] = [
    (
        "src/calculator.rs",
        "//! Calculator.\npub fn add(a: i64, b: i64) -> i64 { a + b }\n",
    ),
    (
        "tests/calculator_test.rs",
        "#[test]\nfn adds() {\n    assert_eq!(calc::add(2, 2), 4);\n}\n",
    ),
];

const WAIT: Duration = Duration::from_secs(10);

fn config() -> Config {
    let mut config = Config::default();
    config.improvement.max_tasks = 0;
    config.agents.poll_interval_ms = 10;
    config.agents.shutdown_grace_secs = 2;
    config.backend.retry_backoff_ms = 1;
    // Sampling is driven by the tests through `sample_now`.
    config.monitor.interval_secs = 3600;
    let mut chatty = ThresholdConfig::max("messages_routed", 0.0, AlertSeverity::Warning);
    chatty.sustained = 1;
    config.monitor.thresholds.push(chatty);
    config
}

async fn orchestrator(dir: &tempfile::TempDir) -> (Orchestrator, Store) {
    let store = Store::open(dir.path().join("duet.db")).await.unwrap();
    let ctx = Context::new(config(), store.clone())
        .with_workspace_root(dir.path().join("workspaces"))
        .with_generator(Arc::new(ScriptedGenerator::new().push_files(TESTED)));
    (Orchestrator::new(ctx), store)
}

#[tokio::test]
async fn scenario_c_concurrent_projects_stay_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, store) = orchestrator(&dir).await;

    let mut handles = Vec::new();
    for target in ["alpha", "beta", "gamma"] {
        handles.push(
            orch.start_project("build a calculator with add", target)
                .await
                .unwrap(),
        );
    }
    for handle in &mut handles {
        assert_eq!(handle.wait_until_terminal(WAIT).await.unwrap(), ProjectPhase::Completed);
    }

    let ids: Vec<_> = handles.iter().map(|h| h.project_id).collect();
    for id in &ids {
        let alerts = orch.sample_now(*id).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, "messages_routed");
    }

    let mut targets = HashSet::new();
    for id in &ids {
        let project = orch.project_status(*id).await.unwrap();
        targets.insert(project.target.clone());
        assert!(project.tasks.iter().all(|t| t.project_id == *id));

        let history = store.message_history(*id).await.unwrap();
        assert!(!history.is_empty());
        assert!(history.iter().all(|m| m.project_id == *id));

        let alerts = orch.alert_history(*id).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(alerts.iter().all(|a| a.project_id == *id));
    }
    assert_eq!(targets.len(), 3);
    assert_eq!(orch.list_projects().await.unwrap().len(), 3);

    // An alert is only reachable through the project that owns it.
    let alpha_alert = orch.active_alerts(ids[0]).await.unwrap()[0].id;
    let err = orch.acknowledge_alert(ids[1], alpha_alert, "ops").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Store(StoreError::AlertNotFound(_))));

    orch.shutdown().await;
}

#[tokio::test]
async fn acknowledging_clears_active_alert_and_restores_health() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, _store) = orchestrator(&dir).await;
    let mut handle = orch.start_project("build a calculator with add", "calc").await.unwrap();
    handle.wait_until_terminal(WAIT).await.unwrap();

    let raised = orch.sample_now(handle.project_id).await.unwrap();
    assert_eq!(raised.len(), 1);
    assert_eq!(orch.health_score(handle.project_id).await.unwrap().score, 90);

    let acked = orch
        .acknowledge_alert(handle.project_id, raised[0].id, "ops")
        .await
        .unwrap();
    assert_eq!(acked.acknowledged_by.as_deref(), Some("ops"));
    assert!(orch.active_alerts(handle.project_id).await.unwrap().is_empty());
    assert_eq!(orch.alert_history(handle.project_id).await.unwrap().len(), 1);
    assert_eq!(orch.health_score(handle.project_id).await.unwrap().score, 100);

    let again = orch.acknowledge_alert(handle.project_id, raised[0].id, "ops").await;
    assert!(matches!(
        again,
        Err(OrchestratorError::Store(StoreError::AlreadyAcknowledged { .. }))
    ));

    let samples = orch
        .metric_history(handle.project_id, "error_rate", Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].value, 0.0);

    orch.shutdown().await;
}

#[tokio::test]
async fn finished_projects_leave_the_runtime_map() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, _store) = orchestrator(&dir).await;
    let mut handle = orch.start_project("build a calculator with add", "calc").await.unwrap();
    assert_eq!(handle.wait_until_terminal(WAIT).await.unwrap(), ProjectPhase::Completed);

    tokio::time::timeout(WAIT, async {
        while !orch.running_projects().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reaper did not release the project");

    // Still answerable from the store.
    let project = orch.project_status(handle.project_id).await.unwrap();
    assert_eq!(project.phase, ProjectPhase::Completed);
    let raised = orch.sample_now(handle.project_id).await.unwrap();
    assert_eq!(raised.len(), 1);
    // The suppression window carries over to the next one-off pass.
    assert!(orch.sample_now(handle.project_id).await.unwrap().is_empty());
    assert!(matches!(
        orch.stop_project(handle.project_id, "late").await,
        Err(OrchestratorError::NotRunning(_))
    ));
    orch.shutdown().await;
}

#[tokio::test]
async fn invalid_target_is_rejected_before_anything_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, store) = orchestrator(&dir).await;

    let err = orch.start_project("build a calculator", "../escape").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidTarget(_)));
    assert!(store.list_projects().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_project_queries_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, _store) = orchestrator(&dir).await;
    let ghost = uuid::Uuid::new_v4();

    assert!(matches!(orch.project_status(ghost).await, Err(OrchestratorError::NotFound(_))));
    assert!(matches!(orch.health_score(ghost).await, Err(OrchestratorError::NotFound(_))));
    assert!(matches!(orch.active_alerts(ghost).await, Err(OrchestratorError::NotFound(_))));
    assert!(matches!(orch.sample_now(ghost).await, Err(OrchestratorError::NotFound(_))));
    assert!(matches!(orch.stop_project(ghost, "x").await, Err(OrchestratorError::NotRunning(_))));
    assert!(matches!(orch.resume_project(ghost).await, Err(OrchestratorError::NotFound(_))));
}

#[tokio::test]
async fn interrupted_project_resumes_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, store) = orchestrator(&dir).await;

    // Persist the state a crash mid-task would leave behind.
    let mut project = ProjectState::new("build a calculator with add", "calc");
    let task = Task::new(
        project.id,
        "build a calculator with add",
        vec!["implements calculator".into(), "includes tests".into()],
        TaskOrigin::Decomposition,
    );
    let task_id = task.id;
    project.add_tasks([task]).unwrap();
    project.transition(ProjectPhase::Implementing).unwrap();
    project.assign_task(task_id, "tech_lead").unwrap();
    store.save_project(&project).await.unwrap();

    let mut handle = orch.resume_project(project.id).await.unwrap();
    assert_eq!(handle.wait_until_terminal(WAIT).await.unwrap(), ProjectPhase::Completed);

    let finished = store.load_project(project.id).await.unwrap().unwrap();
    assert_eq!(finished.tasks[0].status, TaskStatus::Completed);
    orch.shutdown().await;
}

/// Never answers, so the project sits in `Implementing` until stopped.
struct Stalled;

#[async_trait::async_trait]
impl CodeGenerator for Stalled {
    async fn generate(&self, _request: &GenerationRequest) -> Result<GeneratedFiles, BackendError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn stop_project_ends_in_stopped_with_reason() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("duet.db")).await.unwrap();
    let ctx = Context::new(config(), store.clone())
        .with_workspace_root(dir.path().join("workspaces"))
        .with_generator(Arc::new(Stalled));
    let orch = Orchestrator::new(ctx);

    let mut handle = orch.start_project("build a calculator with add", "calc").await.unwrap();
    assert_eq!(handle.phase(), ProjectPhase::Implementing);
    orch.stop_project(handle.project_id, "operator request").await.unwrap();
    assert_eq!(handle.wait_until_terminal(WAIT).await.unwrap(), ProjectPhase::Stopped);

    let project = orch.project_status(handle.project_id).await.unwrap();
    assert_eq!(project.stop_reason.as_deref(), Some("operator request"));
    // The interrupted task keeps its last durable status.
    assert_eq!(project.tasks[0].status, TaskStatus::Running);
    orch.shutdown().await;
}

#[tokio::test]
async fn phase_sequence_is_a_valid_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, _store) = orchestrator(&dir).await;
    let mut handle = orch
        .start_project("parse the input. print the totals", "totals")
        .await
        .unwrap();
    handle.wait_until_terminal(WAIT).await.unwrap();

    let project = orch.project_status(handle.project_id).await.unwrap();
    let phases = major_phases(&project.phase_history);
    assert_eq!(phases.first(), Some(&ProjectPhase::Decomposing));
    assert!(phases.iter().filter(|p| **p == ProjectPhase::Decomposing).count() == 1);
    assert!(phases.iter().filter(|p| **p == ProjectPhase::Improving).count() <= 1);
    let terminal = phases.iter().filter(|p| p.is_terminal()).count();
    assert_eq!(terminal, 1);
    assert!(phases.last().is_some_and(|p| p.is_terminal()));
    orch.shutdown().await;
}
