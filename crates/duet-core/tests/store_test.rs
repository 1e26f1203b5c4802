use chrono::{Duration, Utc};
use duet_core::message::{AgentMessage, MessagePayload};
use duet_core::store::Store;
use duet_core::types::{
    ChangeSetRef, Metric, ProjectPhase, ProjectState, ReviewResult, Task, TaskOrigin, TaskStatus,
};

fn review(iteration: u32, passed: bool) -> ReviewResult {
    ReviewResult {
        change_set: ChangeSetRef {
            url: "local://calc/1".into(),
            number: 1,
        },
        passed,
        score: if passed { 90 } else { 40 },
        breakdown: vec![],
        feedback: vec![],
        blocking_issues: if passed {
            vec![]
        } else {
            vec!["missing tests".into()]
        },
        iteration,
        exhausted: false,
    }
}

#[tokio::test]
async fn projects_sharing_a_store_are_isolated() {
    let store = Store::open_in_memory().await.unwrap();

    let mut a = ProjectState::new("build a calculator", "calc");
    let mut b = ProjectState::new("build a todo list", "todo");
    a.add_tasks([Task::new(a.id, "calc", vec![], TaskOrigin::Decomposition)])
        .unwrap();
    b.add_tasks([Task::new(b.id, "todo", vec![], TaskOrigin::Decomposition)])
        .unwrap();
    store.save_project(&a).await.unwrap();
    store.save_project(&b).await.unwrap();

    for project in [&a, &b] {
        let msg = AgentMessage::notify(
            project.id,
            "moderator",
            "tech_lead",
            MessagePayload::Assignment {
                task: project.tasks[0].clone(),
            },
        );
        store.append_message(&msg).await.unwrap();
    }

    let loaded_a = store.load_project(a.id).await.unwrap().unwrap();
    assert_eq!(loaded_a.tasks.len(), 1);
    assert_eq!(loaded_a.tasks[0].project_id, a.id);

    let history_a = store.message_history(a.id).await.unwrap();
    assert_eq!(history_a.len(), 1);
    assert!(history_a.iter().all(|m| m.project_id == a.id));

    assert_eq!(store.list_projects().await.unwrap().len(), 2);
}

#[tokio::test]
async fn saving_again_updates_status_without_duplicating_tasks() {
    let store = Store::open_in_memory().await.unwrap();
    let mut project = ProjectState::new("req", "target");
    let task = Task::new(project.id, "work", vec![], TaskOrigin::Decomposition);
    let task_id = task.id;
    project.add_tasks([task]).unwrap();
    store.save_project(&project).await.unwrap();

    project.transition(ProjectPhase::Implementing).unwrap();
    project.assign_task(task_id, "tech_lead").unwrap();
    project.finish_task(task_id, TaskStatus::Completed).unwrap();
    store.save_project(&project).await.unwrap();

    let loaded = store.load_project(project.id).await.unwrap().unwrap();
    assert_eq!(loaded.tasks.len(), 1);
    assert_eq!(loaded.tasks[0].status, TaskStatus::Completed);
    assert_eq!(loaded.phase, ProjectPhase::Implementing);
}

#[tokio::test]
async fn review_attempts_are_ordered_and_counted() {
    let store = Store::open_in_memory().await.unwrap();
    let project = uuid::Uuid::new_v4();
    let task = uuid::Uuid::new_v4();

    store.record_review(project, task, &review(2, true)).await.unwrap();
    store.record_review(project, task, &review(1, false)).await.unwrap();

    let attempts = store.review_attempts(project, task).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].result.iteration, 1);
    assert!(!attempts[0].result.passed);
    assert_eq!(attempts[1].result.iteration, 2);

    assert_eq!(store.review_counts(project).await.unwrap(), (2, 1));
    assert_eq!(
        store.review_counts(uuid::Uuid::new_v4()).await.unwrap(),
        (0, 0)
    );
}

#[tokio::test]
async fn metric_history_respects_window() {
    let store = Store::open_in_memory().await.unwrap();
    let project = uuid::Uuid::new_v4();
    let now = Utc::now();

    store
        .record_metric(project, &Metric::new("error_rate", 0.1).at(now - Duration::hours(2)))
        .await
        .unwrap();
    store
        .record_metric(project, &Metric::new("error_rate", 0.2).at(now))
        .await
        .unwrap();
    store
        .record_metric(project, &Metric::new("other", 1.0).at(now))
        .await
        .unwrap();

    let recent = store
        .metric_history(project, "error_rate", now - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);
    assert!((recent[0].value - 0.2).abs() < f64::EPSILON);

    let all = store
        .metric_history(project, "error_rate", now - Duration::days(1))
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
}
