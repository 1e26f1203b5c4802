use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use duet_agents::backend::{LocalVcs, ScriptedGenerator};
use duet_agents::review::{
    CheckOutcome, CodeQualityCheck, CriteriaCheck, DocumentationCheck, ReviewCheck, Reviewer, TestPresenceCheck,
};
use duet_agents::{AgentContext, Moderator, Supervisor, TechLead};
use duet_bridge::MessageBus;
use duet_core::config::Config;
use duet_core::lifecycle::major_phases;
use duet_core::message::{MessageKind, MessagePayload};
use duet_core::store::{LearningStore, Store};
use duet_core::types::{
    ChangeSet, ImprovementCategory, ProjectPhase, ProjectState, ReviewCategory, Task, TaskOrigin, TaskStatus,
};
use duet_harness::retry::RetryPolicy;
use duet_harness::shutdown::ShutdownSignal;
use duet_telemetry::metrics::MetricsCollector;

const UNTESTED: [(&str, &str); 1] = [(
    "src/calculator.rs",
    "//! Calculator.\npub fn add(a: i64, b: i64) -> i64 { a + b }\n",
)];

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

struct Rig {
    store: Store,
    bus: MessageBus,
    supervisor: Supervisor,
    moderator: Arc<Moderator>,
    generator: Arc<ScriptedGenerator>,
    _workspace: tempfile::TempDir,
}

impl Rig {
    async fn start(requirement: &str, generator: ScriptedGenerator, config: Config, retry: RetryPolicy) -> Rig {
        let reviewer = Reviewer::with_default_checks(config.review.clone());
        Self::start_reviewed(requirement, generator, config, retry, reviewer, |_| {}).await
    }

    /// `before_kickoff` sees the Moderator before any work is dispatched.
    async fn start_reviewed(
        requirement: &str,
        generator: ScriptedGenerator,
        config: Config,
        retry: RetryPolicy,
        reviewer: Reviewer,
        before_kickoff: impl FnOnce(&Moderator),
    ) -> Rig {
        let workspace = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let project = ProjectState::new(requirement, "calc");
        let bus = MessageBus::new(project.id, store.clone(), Arc::new(MetricsCollector::new()));
        let generator = Arc::new(generator);

        let tech_lead = Arc::new(
            TechLead::new(
                AgentContext::new("tech_lead", bus.clone(), store.clone()),
                "moderator",
                generator.clone(),
                Arc::new(LocalVcs::new(workspace.path(), "calc")),
            )
            .with_retry(retry)
            .with_max_iterations(config.review.max_iterations),
        );
        let moderator = Arc::new(Moderator::new(
            AgentContext::new("moderator", bus.clone(), store.clone()),
            project,
            &config,
            "tech_lead",
        )
        .with_reviewer(reviewer));
        before_kickoff(moderator.as_ref());

        let supervisor = Supervisor::new(ShutdownSignal::new(), Duration::from_millis(10));
        supervisor.spawn_worker(tech_lead, &bus).await.unwrap();
        supervisor.spawn_worker(moderator.clone(), &bus).await.unwrap();
        moderator.kickoff().await.unwrap();

        Rig {
            store,
            bus,
            supervisor,
            moderator,
            generator,
            _workspace: workspace,
        }
    }

    async fn finish(&self) -> ProjectState {
        let mut phase = self.moderator.watch_phase();
        tokio::time::timeout(Duration::from_secs(10), async {
            while !phase.borrow_and_update().is_terminal() {
                phase.changed().await.unwrap();
            }
        })
        .await
        .expect("project did not finish in time");
        assert!(self.supervisor.shutdown(Duration::from_secs(3)).await.is_complete());
        self.moderator.project().await
    }
}

fn no_improvement() -> Config {
    let mut config = Config::default();
    config.improvement.max_tasks = 0;
    config
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(1))
}

#[tokio::test]
async fn scenario_a_missing_tests_then_approved() {
    let generator = ScriptedGenerator::new().push_files(UNTESTED).push_files(TESTED);
    let rig = Rig::start("build a calculator with add", generator, no_improvement(), fast_retry()).await;
    let project = rig.finish().await;

    assert_eq!(project.phase, ProjectPhase::Completed);
    assert!(!project.tasks.is_empty());
    let task = &project.tasks[0];
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.change_set.is_some());

    let attempts = rig.store.review_attempts(project.id, task.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    let first = &attempts[0].result;
    assert!(!first.passed);
    assert!(first.blocking_issues.iter().any(|b| b == "missing tests"));
    let second = &attempts[1].result;
    assert!(second.passed);
    assert!(second.score >= 80);

    // The revision was generated with the first pass's feedback.
    let requests = rig.generator.requests();
    assert!(requests[1].feedback.iter().any(|f| f.description.contains("test")));
}

#[tokio::test]
async fn iteration_cap_fails_task_with_reasons() {
    let generator = ScriptedGenerator::new().push_files(UNTESTED);
    let rig = Rig::start("build a calculator with add", generator, no_improvement(), fast_retry()).await;
    let project = rig.finish().await;

    let task = &project.tasks[0];
    assert_eq!(task.status, TaskStatus::Failed);
    let attempts = rig.store.review_attempts(project.id, task.id).await.unwrap();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| !a.result.passed));
    assert!(attempts[2].result.exhausted);

    let history = rig.bus.history().await.unwrap();
    let reasons = history
        .iter()
        .find_map(|m| match &m.payload {
            MessagePayload::Completion { task_id, reasons, .. } if *task_id == task.id => Some(reasons.clone()),
            _ => None,
        })
        .unwrap();
    assert!(reasons.iter().any(|r| r == "missing tests"));
    assert!(reasons.iter().any(|r| r.starts_with("review iteration limit reached")));
}

#[tokio::test]
async fn every_request_has_exactly_one_response() {
    let generator = ScriptedGenerator::new().push_files(UNTESTED).push_files(TESTED);
    let rig = Rig::start("build a calculator with add", generator, no_improvement(), fast_retry()).await;
    let project = rig.finish().await;

    let history = rig.bus.history().await.unwrap();
    let requests: Vec<_> = history.iter().filter(|m| m.requires_response).collect();
    assert_eq!(requests.len(), 2);
    for request in requests {
        assert_eq!(request.kind(), MessageKind::ChangeSetSubmitted);
        let responses: Vec<_> = history
            .iter()
            .filter(|m| !m.requires_response && m.correlation_id == Some(request.id))
            .collect();
        assert_eq!(responses.len(), 1, "request {} answered once", request.id);
        assert_eq!(responses[0].kind(), MessageKind::ReviewFeedback);
        assert_eq!(responses[0].project_id, project.id);
    }
}

#[tokio::test]
async fn transient_backend_outage_is_retried() {
    let generator = ScriptedGenerator::new().push_outage("503 from backend").push_files(TESTED);
    let rig = Rig::start("build a calculator with add", generator, no_improvement(), fast_retry()).await;
    let project = rig.finish().await;

    assert_eq!(project.tasks[0].status, TaskStatus::Completed);
    assert_eq!(rig.generator.requests().len(), 2);
}

#[tokio::test]
async fn failure_limit_stops_the_project() {
    let rig = Rig::start(
        "parse the input file. print the totals. write a summary report",
        ScriptedGenerator::new(),
        no_improvement(),
        RetryPolicy::none(),
    )
    .await;
    let project = rig.finish().await;

    assert_eq!(project.tasks.len(), 3);
    assert_eq!(project.phase, ProjectPhase::Stopped);
    assert_eq!(project.failed_task_count(), 3);
    assert_eq!(project.stop_reason.as_deref(), Some("3 tasks failed"));
}

#[tokio::test]
async fn improvement_runs_once_and_feeds_the_learning_store() {
    let files = [
        (
            "src/calculator.rs",
            "//! Calculator.\npub fn add(a: &str, b: &str) -> i64 {\n    a.parse::<i64>().unwrap() + b.parse::<i64>().unwrap()\n}\n",
        ),
        ("tests/calculator_test.rs", "#[test]\nfn adds() {}\n"),
        ("README.md", "# calculator\n"),
    ];
    let generator = ScriptedGenerator::new().push_files(files);
    let rig = Rig::start("build a calculator with add", generator, Config::default(), fast_retry()).await;
    let project = rig.finish().await;

    assert_eq!(project.phase, ProjectPhase::Completed);
    assert_eq!(
        major_phases(&project.phase_history),
        vec![
            ProjectPhase::Decomposing,
            ProjectPhase::Implementing,
            ProjectPhase::Improving,
            ProjectPhase::Completed,
        ]
    );
    let improvements: Vec<_> = project
        .tasks
        .iter()
        .filter(|t| t.origin == TaskOrigin::Improvement)
        .collect();
    assert_eq!(improvements.len(), 1);
    assert!(improvements[0].description.starts_with("[error_handling]"));
    assert_eq!(improvements[0].status, TaskStatus::Completed);

    let rate = rig
        .store
        .acceptance_rate(ImprovementCategory::ErrorHandling)
        .await
        .unwrap();
    assert_eq!(rate, Some(1.0));
}

#[tokio::test]
async fn persisted_state_matches_live_state() {
    let generator = ScriptedGenerator::new().push_files(TESTED);
    let rig = Rig::start("build a calculator with add", generator, no_improvement(), fast_retry()).await;
    let project = rig.finish().await;

    let stored = rig.store.load_project(project.id).await.unwrap().unwrap();
    assert_eq!(stored.phase, project.phase);
    assert_eq!(stored.tasks, project.tasks);
}

/// Scores testing like the default check and notes the phase each review
/// runs under.
#[derive(Clone, Default)]
struct PhaseSpy {
    phase: Arc<OnceLock<tokio::sync::watch::Receiver<ProjectPhase>>>,
    seen: Arc<Mutex<Vec<ProjectPhase>>>,
}

impl ReviewCheck for PhaseSpy {
    fn category(&self) -> ReviewCategory {
        ReviewCategory::Testing
    }

    fn evaluate(&self, task: &Task, change_set: &ChangeSet, possible: u32) -> CheckOutcome {
        if let Some(phase) = self.phase.get() {
            self.seen.lock().unwrap().push(*phase.borrow());
        }
        TestPresenceCheck.evaluate(task, change_set, possible)
    }
}

#[tokio::test]
async fn reviewing_phase_is_published_while_scoring() {
    let config = no_improvement();
    let spy = PhaseSpy::default();
    let reviewer = Reviewer::new(
        config.review.clone(),
        vec![
            Box::new(CodeQualityCheck::default()),
            Box::new(spy.clone()),
            Box::new(DocumentationCheck),
            Box::new(CriteriaCheck),
        ],
    );
    let generator = ScriptedGenerator::new().push_files(UNTESTED).push_files(TESTED);
    let rig = Rig::start_reviewed(
        "build a calculator with add",
        generator,
        config,
        fast_retry(),
        reviewer,
        |moderator| {
            let _ = spy.phase.set(moderator.watch_phase());
        },
    )
    .await;
    let project = rig.finish().await;

    assert_eq!(project.phase, ProjectPhase::Completed);
    assert_eq!(*spy.seen.lock().unwrap(), vec![ProjectPhase::Reviewing; 2]);
}
