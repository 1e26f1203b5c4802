//! The one-shot improvement cycle run after the original tasks finish.
//!
//! Every category analyzer inspects the files of the approved change sets
//! and proposes candidates. Candidates are ranked by
//! `impact_w * impact + effort_w * inverse_effort + acceptance_w * rate`,
//! where `rate` is the category's historical acceptance rate. Without a
//! rate the first two terms are renormalised, so all priorities share the
//! 0..=1 scale.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use duet_core::config::ImprovementConfig;
use duet_core::store::LearningStore;
use duet_core::types::{Improvement, ImprovementCategory, Level, Task, TaskOrigin};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The finished project as the analyzers see it.
#[derive(Debug, Clone, Default)]
pub struct ProjectSnapshot {
    pub project_id: Uuid,
    /// Path -> content of every approved file, later change sets winning.
    pub files: BTreeMap<String, String>,
}

impl ProjectSnapshot {
    fn sources(&self) -> impl Iterator<Item = (&String, &String)> {
        self.files
            .iter()
            .filter(|(p, _)| !is_test_file(p, "") && !p.ends_with(".md"))
    }
}

fn is_test_file(path: &str, content: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.contains("test") || content.contains("#[test]") || content.contains("#[tokio::test]")
}

#[derive(Debug, thiserror::Error)]
#[error("{category} analysis failed: {reason}")]
pub struct AnalyzerError {
    pub category: ImprovementCategory,
    pub reason: String,
}

/// Proposes improvements for one category. `priority` on the returned
/// candidates is ignored; the cycle computes it.
pub trait Analyzer: Send + Sync {
    fn category(&self) -> ImprovementCategory;

    fn analyze(&self, snapshot: &ProjectSnapshot) -> Result<Vec<Improvement>, AnalyzerError>;
}

fn candidate(
    category: ImprovementCategory,
    description: impl Into<String>,
    effort: Level,
    impact: Level,
    location: impl Into<String>,
) -> Improvement {
    Improvement {
        category,
        description: description.into(),
        priority: 0.0,
        effort,
        impact,
        location: location.into(),
    }
}

// ---------------------------------------------------------------------------
// Default analyzers
// ---------------------------------------------------------------------------

/// Fewer than one test file per two source files.
#[derive(Debug, Default)]
pub struct TestCoverageAnalyzer;

impl Analyzer for TestCoverageAnalyzer {
    fn category(&self) -> ImprovementCategory {
        ImprovementCategory::Testing
    }

    fn analyze(&self, snapshot: &ProjectSnapshot) -> Result<Vec<Improvement>, AnalyzerError> {
        let tests = snapshot
            .files
            .iter()
            .filter(|(p, c)| is_test_file(p, c))
            .count();
        let sources = snapshot.sources().count();
        if sources == 0 || tests * 2 >= sources {
            return Ok(Vec::new());
        }
        Ok(vec![candidate(
            self.category(),
            format!("raise test coverage: {} test files for {} source files", tests, sources),
            Level::Medium,
            Level::High,
            "tests/",
        )])
    }
}

#[derive(Debug, Default)]
pub struct DocumentationAnalyzer;

impl Analyzer for DocumentationAnalyzer {
    fn category(&self) -> ImprovementCategory {
        ImprovementCategory::Documentation
    }

    fn analyze(&self, snapshot: &ProjectSnapshot) -> Result<Vec<Improvement>, AnalyzerError> {
        let mut out = Vec::new();
        if !snapshot
            .files
            .keys()
            .any(|p| p.to_ascii_lowercase().ends_with("readme.md"))
        {
            out.push(candidate(
                self.category(),
                "add a README describing usage",
                Level::Low,
                Level::Medium,
                "README.md",
            ));
        }
        for (path, content) in snapshot.sources() {
            if !content.contains("///") && !content.contains("//!") {
                out.push(candidate(
                    self.category(),
                    format!("document the public items in {}", path),
                    Level::Low,
                    Level::Low,
                    path.clone(),
                ));
            }
        }
        Ok(out)
    }
}

/// Panicking shortcuts in non-test code.
#[derive(Debug, Default)]
pub struct ErrorHandlingAnalyzer;

impl Analyzer for ErrorHandlingAnalyzer {
    fn category(&self) -> ImprovementCategory {
        ImprovementCategory::ErrorHandling
    }

    fn analyze(&self, snapshot: &ProjectSnapshot) -> Result<Vec<Improvement>, AnalyzerError> {
        let mut out = Vec::new();
        for (path, content) in snapshot.sources() {
            let hits = [".unwrap()", ".expect(", "panic!("]
                .iter()
                .map(|m| content.matches(m).count())
                .sum::<usize>();
            if hits > 0 {
                out.push(candidate(
                    self.category(),
                    format!("replace {} panicking call(s) with error propagation in {}", hits, path),
                    if hits > 5 { Level::Medium } else { Level::Low },
                    Level::High,
                    path.clone(),
                ));
            }
        }
        Ok(out)
    }
}

/// Blocking sleeps and heavy cloning inside loops.
#[derive(Debug, Default)]
pub struct PerformanceAnalyzer;

impl Analyzer for PerformanceAnalyzer {
    fn category(&self) -> ImprovementCategory {
        ImprovementCategory::Performance
    }

    fn analyze(&self, snapshot: &ProjectSnapshot) -> Result<Vec<Improvement>, AnalyzerError> {
        let mut out = Vec::new();
        for (path, content) in snapshot.sources() {
            if content.contains("std::thread::sleep") || content.contains("time.sleep(") {
                out.push(candidate(
                    self.category(),
                    format!("remove blocking sleep from {}", path),
                    Level::Low,
                    Level::Medium,
                    path.clone(),
                ));
            }
            let clones = content.matches(".clone()").count();
            if clones > 10 {
                out.push(candidate(
                    self.category(),
                    format!("reduce {} clones in {}", clones, path),
                    Level::Medium,
                    Level::Low,
                    path.clone(),
                ));
            }
        }
        Ok(out)
    }
}

const LARGE_FILE_LINES: usize = 300;

#[derive(Debug, Default)]
pub struct ArchitectureAnalyzer;

impl Analyzer for ArchitectureAnalyzer {
    fn category(&self) -> ImprovementCategory {
        ImprovementCategory::Architecture
    }

    fn analyze(&self, snapshot: &ProjectSnapshot) -> Result<Vec<Improvement>, AnalyzerError> {
        Ok(snapshot
            .sources()
            .filter(|(_, c)| c.lines().count() > LARGE_FILE_LINES)
            .map(|(path, c)| {
                candidate(
                    self.category(),
                    format!("split {} ({} lines) into smaller modules", path, c.lines().count()),
                    Level::High,
                    Level::Medium,
                    path.clone(),
                )
            })
            .collect())
    }
}

pub fn default_analyzers() -> Vec<Box<dyn Analyzer>> {
    vec![
        Box::new(TestCoverageAnalyzer),
        Box::new(DocumentationAnalyzer),
        Box::new(ErrorHandlingAnalyzer),
        Box::new(PerformanceAnalyzer),
        Box::new(ArchitectureAnalyzer),
    ]
}

// ---------------------------------------------------------------------------
// ImprovementCycle
// ---------------------------------------------------------------------------

pub struct ImprovementCycle {
    analyzers: Vec<Box<dyn Analyzer>>,
    learning: Option<Arc<dyn LearningStore>>,
    config: ImprovementConfig,
}

/// `High` effort scores lowest.
fn inverse_effort(effort: Level) -> f64 {
    1.0 + Level::Low.weight() - effort.weight()
}

impl ImprovementCycle {
    pub fn new(
        config: ImprovementConfig,
        analyzers: Vec<Box<dyn Analyzer>>,
        learning: Option<Arc<dyn LearningStore>>,
    ) -> Self {
        Self {
            analyzers,
            learning,
            config,
        }
    }

    pub fn max_tasks(&self) -> usize {
        self.config.max_tasks
    }

    pub fn priority(&self, improvement: &Improvement, acceptance_rate: Option<f64>) -> f64 {
        let impact = improvement.impact.weight();
        let effort = inverse_effort(improvement.effort);
        let c = &self.config;
        match acceptance_rate {
            Some(rate) => {
                let total = c.impact_weight + c.effort_weight + c.acceptance_weight;
                if total <= 0.0 {
                    return (impact + effort + rate) / 3.0;
                }
                (c.impact_weight * impact + c.effort_weight * effort + c.acceptance_weight * rate)
                    / total
            }
            None => {
                let total = c.impact_weight + c.effort_weight;
                if total <= 0.0 {
                    return (impact + effort) / 2.0;
                }
                (c.impact_weight * impact + c.effort_weight * effort) / total
            }
        }
    }

    async fn acceptance_rate(&self, category: ImprovementCategory) -> Option<f64> {
        let store = self.learning.as_ref()?;
        match store.acceptance_rate(category).await {
            Ok(rate) => rate,
            Err(e) => {
                warn!(%category, error = %e, "learning store unavailable, using unweighted priority");
                None
            }
        }
    }

    /// Analyse, rank and keep the top `max_tasks` improvements.
    pub async fn propose(&self, snapshot: &ProjectSnapshot) -> Vec<Improvement> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for analyzer in &self.analyzers {
            match analyzer.analyze(snapshot) {
                Ok(found) => {
                    debug!(category = %analyzer.category(), found = found.len(), "analyzer finished");
                    for c in found {
                        if seen.insert((c.category, c.location.clone(), c.description.clone())) {
                            candidates.push(c);
                        }
                    }
                }
                Err(e) => {
                    warn!(project_id = %snapshot.project_id, error = %e, "analyzer failed, skipping category");
                }
            }
        }

        let mut rates = HashMap::new();
        for category in ImprovementCategory::ALL {
            if candidates.iter().any(|c| c.category == category) {
                rates.insert(category, self.acceptance_rate(category).await);
            }
        }
        for c in &mut candidates {
            let rate = rates.get(&c.category).copied().flatten();
            c.priority = self.priority(c, rate);
        }

        candidates.sort_by(|a, b| {
            b.priority
                .total_cmp(&a.priority)
                .then_with(|| a.location.cmp(&b.location))
                .then_with(|| a.description.cmp(&b.description))
        });
        candidates.truncate(self.config.max_tasks);
        info!(
            project_id = %snapshot.project_id,
            selected = candidates.len(),
            "improvement candidates selected"
        );
        candidates
    }

    /// Turn selected improvements into ordinary pending tasks.
    pub fn to_tasks(project_id: Uuid, improvements: &[Improvement]) -> Vec<Task> {
        improvements
            .iter()
            .map(|imp| {
                Task::new(
                    project_id,
                    format!("[{}] {}", imp.category, imp.description),
                    vec![format!("addresses {}", imp.location), "includes tests".to_string()],
                    TaskOrigin::Improvement,
                )
            })
            .collect()
    }
}

/// Category encoded in an improvement task's description.
pub fn category_of(task: &Task) -> Option<ImprovementCategory> {
    let tag = task.description.strip_prefix('[')?.split(']').next()?;
    ImprovementCategory::ALL
        .into_iter()
        .find(|c| c.to_string() == tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use duet_core::store::{Result as StoreResult, Store, StoreError};

    struct Broken;

    impl Analyzer for Broken {
        fn category(&self) -> ImprovementCategory {
            ImprovementCategory::Performance
        }

        fn analyze(&self, _: &ProjectSnapshot) -> Result<Vec<Improvement>, AnalyzerError> {
            Err(AnalyzerError {
                category: self.category(),
                reason: "tool crashed".into(),
            })
        }
    }

    struct Unavailable;

    #[async_trait]
    impl LearningStore for Unavailable {
        async fn acceptance_rate(&self, _: ImprovementCategory) -> StoreResult<Option<f64>> {
            Err(StoreError::Corrupt("offline".into()))
        }

        async fn record_outcome(&self, _: ImprovementCategory, _: bool) -> StoreResult<()> {
            Ok(())
        }
    }

    fn snapshot() -> ProjectSnapshot {
        let mut files = BTreeMap::new();
        files.insert("src/a.rs".to_string(), "pub fn a() { x.unwrap(); }".to_string());
        files.insert("src/b.rs".to_string(), "/// b\npub fn b() {}".to_string());
        files.insert("src/c.rs".to_string(), "pub fn c() {}".to_string());
        ProjectSnapshot {
            project_id: Uuid::new_v4(),
            files,
        }
    }

    #[tokio::test]
    async fn failing_analyzer_does_not_abort_cycle() {
        let analyzers: Vec<Box<dyn Analyzer>> = vec![Box::new(Broken), Box::new(ErrorHandlingAnalyzer)];
        let cycle = ImprovementCycle::new(ImprovementConfig::default(), analyzers, None);
        let picked = cycle.propose(&snapshot()).await;
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].category, ImprovementCategory::ErrorHandling);
    }

    #[tokio::test]
    async fn keeps_top_three_by_priority() {
        let cycle = ImprovementCycle::new(ImprovementConfig::default(), default_analyzers(), None);
        let picked = cycle.propose(&snapshot()).await;
        assert_eq!(picked.len(), 3);
        assert!(picked.windows(2).all(|w| w[0].priority >= w[1].priority));
        // High impact, low effort ranks first.
        assert_eq!(picked[0].category, ImprovementCategory::ErrorHandling);
    }

    #[tokio::test]
    async fn unavailable_learning_store_degrades() {
        let store: Arc<dyn LearningStore> = Arc::new(Unavailable);
        let degraded = ImprovementCycle::new(ImprovementConfig::default(), default_analyzers(), Some(store));
        let plain = ImprovementCycle::new(ImprovementConfig::default(), default_analyzers(), None);
        let a = degraded.propose(&snapshot()).await;
        let b = plain.propose(&snapshot()).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn acceptance_history_reorders_candidates() {
        let store = Store::open_in_memory().await.unwrap();
        for _ in 0..4 {
            store.record_outcome(ImprovementCategory::Documentation, true).await.unwrap();
            store.record_outcome(ImprovementCategory::ErrorHandling, false).await.unwrap();
        }
        let cycle = ImprovementCycle::new(
            ImprovementConfig::default(),
            vec![Box::new(ErrorHandlingAnalyzer), Box::new(DocumentationAnalyzer)],
            Some(Arc::new(store)),
        );
        let low_effort_docs = candidate(
            ImprovementCategory::Documentation,
            "d",
            Level::Low,
            Level::Medium,
            "README.md",
        );
        let fixes = candidate(ImprovementCategory::ErrorHandling, "e", Level::Low, Level::High, "x");
        assert!(cycle.priority(&fixes, Some(0.0)) < cycle.priority(&low_effort_docs, Some(1.0)));

        let picked = cycle.propose(&snapshot()).await;
        assert_eq!(picked[0].category, ImprovementCategory::Documentation);
    }

    #[test]
    fn zero_candidates_zero_tasks() {
        assert!(ImprovementCycle::to_tasks(Uuid::new_v4(), &[]).is_empty());
    }

    #[test]
    fn tasks_carry_their_category() {
        let imp = candidate(ImprovementCategory::Testing, "raise coverage", Level::Low, Level::High, "tests/");
        let tasks = ImprovementCycle::to_tasks(Uuid::new_v4(), &[imp]);
        assert_eq!(tasks[0].origin, TaskOrigin::Improvement);
        assert_eq!(category_of(&tasks[0]), Some(ImprovementCategory::Testing));
    }
}
