//! Change-set review: weighted category scores, blocking predicates and the
//! per-task iteration cap.
//!
//! Each category is scored by a [`ReviewCheck`]. The checks shipped here are
//! text heuristics; swap them for tool-backed ones by handing the
//! [`Reviewer`] a different list.

use std::collections::{BTreeSet, HashMap};

use duet_core::config::ReviewConfig;
use duet_core::types::{
    CategoryScore, ChangeSet, FeedbackItem, FeedbackSeverity, ReviewCategory, ReviewResult, Task,
};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("task {task_id} already used all {max} review iterations")]
    IterationCapExceeded { task_id: Uuid, max: u32 },
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// What one check found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub category: ReviewCategory,
    pub earned: u32,
    pub possible: u32,
    /// Blocking-issue descriptions; any entry fails the review outright.
    pub blocking: Vec<String>,
    pub feedback: Vec<FeedbackItem>,
}

impl CheckOutcome {
    fn full(category: ReviewCategory, possible: u32) -> Self {
        Self {
            category,
            earned: possible,
            possible,
            blocking: Vec::new(),
            feedback: Vec::new(),
        }
    }
}

/// A pluggable predicate scoring one review category.
pub trait ReviewCheck: Send + Sync {
    fn category(&self) -> ReviewCategory;

    fn evaluate(&self, task: &Task, change_set: &ChangeSet, possible: u32) -> CheckOutcome;
}

fn feedback(
    category: ReviewCategory,
    severity: FeedbackSeverity,
    description: impl Into<String>,
    location: Option<String>,
    suggested_fix: Option<&str>,
) -> FeedbackItem {
    FeedbackItem {
        category,
        severity,
        description: description.into(),
        location,
        suggested_fix: suggested_fix.map(str::to_string),
    }
}

fn scaled(possible: u32, fraction: f64) -> u32 {
    (possible as f64 * fraction.clamp(0.0, 1.0)).round() as u32
}

fn is_test_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower
        .split(['/', '\\', '.', '_', '-'])
        .any(|seg| seg == "test" || seg == "tests" || seg == "spec")
}

fn is_doc_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".md") || lower.ends_with(".rst") || lower.starts_with("docs/")
}

// -- Code quality -----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintFinding {
    pub line: usize,
    pub severity: FeedbackSeverity,
    pub message: String,
}

/// Static-analysis adapter.
pub trait Linter: Send + Sync {
    fn lint(&self, path: &str, content: &str) -> Vec<LintFinding>;
}

/// Flags leftover work markers. `TODO`/`FIXME` are minor; placeholder
/// bodies (`todo!()`, `unimplemented!()`) are lint errors.
#[derive(Debug, Default, Clone)]
pub struct MarkerLinter;

impl Linter for MarkerLinter {
    fn lint(&self, _path: &str, content: &str) -> Vec<LintFinding> {
        let mut out = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.contains("unimplemented!") || line.contains("todo!(") {
                out.push(LintFinding {
                    line: idx + 1,
                    severity: FeedbackSeverity::Major,
                    message: "placeholder body left in code".into(),
                });
            } else if line.contains("TODO") || line.contains("FIXME") {
                out.push(LintFinding {
                    line: idx + 1,
                    severity: FeedbackSeverity::Minor,
                    message: "unresolved work marker".into(),
                });
            }
        }
        out
    }
}

pub struct CodeQualityCheck {
    linter: Box<dyn Linter>,
}

impl CodeQualityCheck {
    pub fn new(linter: Box<dyn Linter>) -> Self {
        Self { linter }
    }
}

impl Default for CodeQualityCheck {
    fn default() -> Self {
        Self::new(Box::new(MarkerLinter))
    }
}

impl ReviewCheck for CodeQualityCheck {
    fn category(&self) -> ReviewCategory {
        ReviewCategory::CodeQuality
    }

    fn evaluate(&self, _task: &Task, change_set: &ChangeSet, possible: u32) -> CheckOutcome {
        let mut outcome = CheckOutcome::full(self.category(), possible);
        let mut penalty = 0.0;
        let mut errors = 0;

        for (path, content) in &change_set.files {
            for finding in self.linter.lint(path, content) {
                penalty += match finding.severity {
                    FeedbackSeverity::Info => 0.0,
                    FeedbackSeverity::Minor => 0.1,
                    FeedbackSeverity::Major => 0.34,
                    FeedbackSeverity::Critical => 1.0,
                };
                if finding.severity >= FeedbackSeverity::Major {
                    errors += 1;
                }
                outcome.feedback.push(feedback(
                    self.category(),
                    finding.severity,
                    finding.message,
                    Some(format!("{}:{}", path, finding.line)),
                    None,
                ));
            }
        }

        if errors > 0 {
            outcome.blocking.push(format!("lint errors: {}", errors));
        }
        outcome.earned = scaled(possible, 1.0 - penalty);
        outcome
    }
}

// -- Testing ----------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct TestPresenceCheck;

impl TestPresenceCheck {
    fn has_tests(change_set: &ChangeSet) -> bool {
        change_set.files.iter().any(|(path, content)| {
            is_test_path(path)
                || content.contains("#[test]")
                || content.contains("#[tokio::test]")
                || content.contains("def test_")
        })
    }
}

impl ReviewCheck for TestPresenceCheck {
    fn category(&self) -> ReviewCategory {
        ReviewCategory::Testing
    }

    fn evaluate(&self, _task: &Task, change_set: &ChangeSet, possible: u32) -> CheckOutcome {
        let mut outcome = CheckOutcome::full(self.category(), possible);
        if !Self::has_tests(change_set) {
            outcome.earned = 0;
            outcome.blocking.push("missing tests".into());
            outcome.feedback.push(feedback(
                self.category(),
                FeedbackSeverity::Critical,
                "change set contains no tests",
                None,
                Some("add unit or integration tests covering the new behaviour"),
            ));
        }
        outcome
    }
}

// -- Documentation ----------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct DocumentationCheck;

fn is_documented(content: &str) -> bool {
    content.contains("///") || content.contains("//!") || content.contains("\"\"\"")
}

impl ReviewCheck for DocumentationCheck {
    fn category(&self) -> ReviewCategory {
        ReviewCategory::Documentation
    }

    fn evaluate(&self, _task: &Task, change_set: &ChangeSet, possible: u32) -> CheckOutcome {
        let mut outcome = CheckOutcome::full(self.category(), possible);
        if change_set.files.keys().any(|p| is_doc_path(p)) {
            return outcome;
        }

        let sources: Vec<(&String, &String)> = change_set
            .files
            .iter()
            .filter(|(p, _)| !is_test_path(p))
            .collect();
        let documented = sources.iter().filter(|(_, c)| is_documented(c)).count();
        if sources.is_empty() || documented == sources.len() {
            return outcome;
        }

        outcome.earned = scaled(possible, documented as f64 / sources.len() as f64);
        for (path, _) in sources.iter().filter(|(_, c)| !is_documented(c)) {
            outcome.feedback.push(feedback(
                self.category(),
                FeedbackSeverity::Minor,
                "source file has no documentation",
                Some(path.to_string()),
                Some("add module and item doc comments or a README"),
            ));
        }
        outcome
    }
}

// -- Acceptance criteria ----------------------------------------------------

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "of", "to", "in", "on", "for", "with", "by", "it", "is", "be",
    "that", "this", "build", "create", "implement", "implements", "make", "write", "add", "adds",
    "include", "includes", "support", "supports", "should", "must", "can", "address",
    "addresses", "fix", "fixes",
];

/// Keywords of a criterion that must appear in the change set.
fn keywords(criterion: &str) -> BTreeSet<String> {
    criterion
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.len() > 1 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

fn stem(word: &str) -> &str {
    word.strip_suffix('s').filter(|s| s.len() > 2).unwrap_or(word)
}

/// A criterion is met when every keyword (or its singular form) appears in
/// some file path or content of the change set.
#[derive(Debug, Default, Clone)]
pub struct CriteriaCheck;

impl CriteriaCheck {
    fn met(criterion: &str, haystack: &str) -> bool {
        let words = keywords(criterion);
        if words.is_empty() {
            // Only filler words: the criterion names the verb itself ("adds").
            return criterion
                .split_whitespace()
                .any(|w| haystack.contains(stem(&w.to_lowercase())));
        }
        words.iter().all(|w| haystack.contains(stem(w)))
    }
}

impl ReviewCheck for CriteriaCheck {
    fn category(&self) -> ReviewCategory {
        ReviewCategory::Criteria
    }

    fn evaluate(&self, task: &Task, change_set: &ChangeSet, possible: u32) -> CheckOutcome {
        let mut outcome = CheckOutcome::full(self.category(), possible);
        if task.acceptance_criteria.is_empty() {
            return outcome;
        }

        let haystack: String = change_set
            .files
            .iter()
            .flat_map(|(p, c)| [p.as_str(), "\n", c.as_str(), "\n"])
            .collect::<String>()
            .to_lowercase();

        let unmet: Vec<&String> = task
            .acceptance_criteria
            .iter()
            .filter(|c| !Self::met(c, &haystack))
            .collect();
        let total = task.acceptance_criteria.len();
        outcome.earned = scaled(possible, (total - unmet.len()) as f64 / total as f64);
        for criterion in unmet {
            outcome
                .blocking
                .push(format!("acceptance criteria not met: {}", criterion));
            outcome.feedback.push(feedback(
                self.category(),
                FeedbackSeverity::Major,
                format!("acceptance criterion not satisfied: {}", criterion),
                None,
                None,
            ));
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Reviewer
// ---------------------------------------------------------------------------

/// Runs every check, totals the score and decides pass/fail.
pub struct Reviewer {
    checks: Vec<Box<dyn ReviewCheck>>,
    config: ReviewConfig,
}

impl Reviewer {
    pub fn new(config: ReviewConfig, checks: Vec<Box<dyn ReviewCheck>>) -> Self {
        Self { checks, config }
    }

    pub fn with_default_checks(config: ReviewConfig) -> Self {
        Self::new(
            config,
            vec![
                Box::new(CodeQualityCheck::default()),
                Box::new(TestPresenceCheck),
                Box::new(DocumentationCheck),
                Box::new(CriteriaCheck),
            ],
        )
    }

    pub fn config(&self) -> &ReviewConfig {
        &self.config
    }

    fn weight(&self, category: ReviewCategory) -> u32 {
        let w = &self.config.weights;
        match category {
            ReviewCategory::CodeQuality => w.quality,
            ReviewCategory::Testing => w.testing,
            ReviewCategory::Documentation => w.documentation,
            ReviewCategory::Criteria => w.criteria,
        }
    }

    /// Score one submission. `iteration` is the 1-based pass for the task.
    pub fn review(&self, task: &Task, change_set: &ChangeSet, iteration: u32) -> ReviewResult {
        let mut breakdown = Vec::new();
        let mut feedback_items = Vec::new();
        let mut blocking = Vec::new();

        if change_set.is_empty() {
            blocking.push("empty change set".to_string());
            feedback_items.push(feedback(
                ReviewCategory::CodeQuality,
                FeedbackSeverity::Critical,
                "change set contains no files",
                None,
                Some("submit the implementation files"),
            ));
            for check in &self.checks {
                breakdown.push(CategoryScore {
                    category: check.category(),
                    earned: 0,
                    possible: self.weight(check.category()),
                });
            }
        } else {
            for check in &self.checks {
                let outcome = check.evaluate(task, change_set, self.weight(check.category()));
                breakdown.push(CategoryScore {
                    category: outcome.category,
                    earned: outcome.earned.min(outcome.possible),
                    possible: outcome.possible,
                });
                blocking.extend(outcome.blocking);
                feedback_items.extend(outcome.feedback);
            }
        }

        let score = breakdown.iter().map(|s| s.earned).sum::<u32>().min(100);
        let passed = blocking.is_empty() && score >= self.config.approval_threshold;
        let exhausted = !passed && iteration >= self.config.max_iterations;
        if exhausted {
            blocking.push(format!(
                "review iteration limit reached ({} of {})",
                iteration, self.config.max_iterations
            ));
        }
        feedback_items.sort_by(|a, b| b.severity.cmp(&a.severity));

        ReviewResult {
            change_set: change_set.reference.clone(),
            passed,
            score,
            breakdown,
            feedback: feedback_items,
            blocking_issues: blocking,
            iteration,
            exhausted,
        }
    }
}

// ---------------------------------------------------------------------------
// ReviewLedger
// ---------------------------------------------------------------------------

/// Counts review passes per task and refuses passes beyond the cap.
#[derive(Debug, Clone)]
pub struct ReviewLedger {
    max_iterations: u32,
    counts: HashMap<Uuid, u32>,
}

impl ReviewLedger {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            counts: HashMap::new(),
        }
    }

    /// Seed a count recovered from the audit log.
    pub fn restore(&mut self, task_id: Uuid, iterations: u32) {
        self.counts.insert(task_id, iterations);
    }

    pub fn iterations(&self, task_id: Uuid) -> u32 {
        self.counts.get(&task_id).copied().unwrap_or(0)
    }

    /// Reserve the next iteration number for `task_id`.
    pub fn next_iteration(&mut self, task_id: Uuid) -> Result<u32, ReviewError> {
        let count = self.counts.entry(task_id).or_insert(0);
        if *count >= self.max_iterations {
            return Err(ReviewError::IterationCapExceeded {
                task_id,
                max: self.max_iterations,
            });
        }
        *count += 1;
        Ok(*count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_core::types::{ChangeSetRef, TaskOrigin};
    use std::collections::BTreeMap;

    fn task() -> Task {
        Task::new(
            Uuid::new_v4(),
            "build a calculator with add",
            vec![
                "implements build a calculator with add".into(),
                "includes tests".into(),
            ],
            TaskOrigin::Decomposition,
        )
    }

    fn change_set(files: &[(&str, &str)]) -> ChangeSet {
        ChangeSet {
            reference: ChangeSetRef {
                url: "local://calc/1".into(),
                number: 1,
            },
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect::<BTreeMap<_, _>>(),
            summary: String::new(),
        }
    }

    const CALC: &str = "pub struct Calculator;\nimpl Calculator {\n    pub fn add(a: i64, b: i64) -> i64 { a + b }\n}\n";
    const CALC_TESTS: &str = "#[test]\nfn add_works() { assert_eq!(Calculator::add(1, 2), 3); }\n";

    #[test]
    fn missing_tests_blocks() {
        let reviewer = Reviewer::with_default_checks(ReviewConfig::default());
        let result = reviewer.review(&task(), &change_set(&[("src/calculator.rs", CALC)]), 1);
        assert!(!result.passed);
        assert!(result.blocking_issues.contains(&"missing tests".to_string()));
        assert!(result
            .blocking_issues
            .contains(&"acceptance criteria not met: includes tests".to_string()));
        assert!(!result.exhausted);
    }

    #[test]
    fn tests_without_docs_pass_at_threshold() {
        let reviewer = Reviewer::with_default_checks(ReviewConfig::default());
        let result = reviewer.review(
            &task(),
            &change_set(&[("src/calculator.rs", CALC), ("tests/calculator_test.rs", CALC_TESTS)]),
            2,
        );
        assert!(result.blocking_issues.is_empty(), "{:?}", result.blocking_issues);
        assert_eq!(result.score, 80);
        assert!(result.passed);
    }

    #[test]
    fn documented_submission_scores_full() {
        let reviewer = Reviewer::with_default_checks(ReviewConfig::default());
        let documented = format!("//! Calculator.\n{}", CALC);
        let result = reviewer.review(
            &task(),
            &change_set(&[("src/calculator.rs", &documented), ("tests/calculator_test.rs", CALC_TESTS)]),
            1,
        );
        assert_eq!(result.score, 100);
        assert_eq!(result.breakdown.len(), 4);
    }

    #[test]
    fn empty_change_set_is_blocking() {
        let reviewer = Reviewer::with_default_checks(ReviewConfig::default());
        let result = reviewer.review(&task(), &change_set(&[]), 1);
        assert!(!result.passed);
        assert_eq!(result.score, 0);
        assert!(result.blocking_issues.contains(&"empty change set".to_string()));
    }

    #[test]
    fn placeholder_bodies_are_lint_errors() {
        let reviewer = Reviewer::with_default_checks(ReviewConfig::default());
        let stub = "pub fn add() -> i64 { unimplemented!() }\n";
        let result = reviewer.review(
            &task(),
            &change_set(&[("src/calculator.rs", stub), ("tests/calculator_test.rs", CALC_TESTS)]),
            1,
        );
        assert!(result.blocking_issues.iter().any(|b| b.starts_with("lint errors")));
        assert!(!result.passed);
    }

    #[test]
    fn last_failing_iteration_is_exhausted() {
        let reviewer = Reviewer::with_default_checks(ReviewConfig::default());
        let result = reviewer.review(&task(), &change_set(&[("src/calculator.rs", CALC)]), 3);
        assert!(result.exhausted);
        assert!(!result.passed);
    }

    #[test]
    fn ledger_caps_iterations() {
        let mut ledger = ReviewLedger::new(3);
        let id = Uuid::new_v4();
        assert_eq!(ledger.next_iteration(id).unwrap(), 1);
        assert_eq!(ledger.next_iteration(id).unwrap(), 2);
        assert_eq!(ledger.next_iteration(id).unwrap(), 3);
        assert!(matches!(
            ledger.next_iteration(id),
            Err(ReviewError::IterationCapExceeded { max: 3, .. })
        ));
        assert_eq!(ledger.iterations(id), 3);

        let other = Uuid::new_v4();
        ledger.restore(other, 2);
        assert_eq!(ledger.next_iteration(other).unwrap(), 3);
    }

    #[test]
    fn criteria_keywords_drop_filler() {
        let words = keywords("implements build a calculator with add");
        assert_eq!(words.into_iter().collect::<Vec<_>>(), vec!["calculator"]);
    }
}
