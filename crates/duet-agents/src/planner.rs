//! Requirement decomposition.

use duet_core::types::{Task, TaskOrigin};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("requirement is empty")]
    EmptyRequirement,
}

/// Splits a requirement into ordered tasks with acceptance criteria.
pub trait Planner: Send + Sync {
    fn decompose(&self, project_id: Uuid, requirement: &str) -> Result<Vec<Task>, PlanError>;
}

/// One task per clause of the requirement.
///
/// Clauses are separated by sentence ends, semicolons, newlines and list
/// bullets. A clause joined with "and" is split further only when both
/// halves are at least three words long, so "add and subtract" stays whole.
#[derive(Debug, Default, Clone)]
pub struct HeuristicPlanner;

const MIN_SPLIT_WORDS: usize = 3;

impl HeuristicPlanner {
    fn clauses(requirement: &str) -> Vec<String> {
        let mut out = Vec::new();
        for raw in requirement.split(['.', ';', '\n', '!', '?']) {
            let clause = raw
                .trim()
                .trim_start_matches(['-', '*', '•'])
                .trim();
            if clause.is_empty() {
                continue;
            }
            out.extend(Self::split_on_and(clause));
        }
        out
    }

    fn split_on_and(clause: &str) -> Vec<String> {
        let words: Vec<&str> = clause.split_whitespace().collect();
        for (i, w) in words.iter().enumerate() {
            if w.eq_ignore_ascii_case("and") && i >= MIN_SPLIT_WORDS && words.len() - i - 1 >= MIN_SPLIT_WORDS {
                let (head, tail) = (&words[..i], &words[i + 1..]);
                let mut parts = vec![head.join(" ").trim_end_matches(',').to_string()];
                parts.extend(Self::split_on_and(&tail.join(" ")));
                return parts;
            }
        }
        vec![words.join(" ")]
    }
}

impl Planner for HeuristicPlanner {
    fn decompose(&self, project_id: Uuid, requirement: &str) -> Result<Vec<Task>, PlanError> {
        let clauses = Self::clauses(requirement);
        if clauses.is_empty() {
            return Err(PlanError::EmptyRequirement);
        }
        let tasks: Vec<Task> = clauses
            .into_iter()
            .map(|clause| {
                let criteria = vec![format!("implements {}", clause), "includes tests".to_string()];
                Task::new(project_id, clause, criteria, TaskOrigin::Decomposition)
            })
            .collect();
        tracing::debug!(%project_id, tasks = tasks.len(), "requirement decomposed");
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_clause_yields_one_task() {
        let tasks = HeuristicPlanner
            .decompose(Uuid::new_v4(), "build a calculator with add")
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, "build a calculator with add");
        assert_eq!(
            tasks[0].acceptance_criteria,
            vec!["implements build a calculator with add", "includes tests"]
        );
    }

    #[test]
    fn sentences_and_long_conjunctions_split() {
        let tasks = HeuristicPlanner
            .decompose(
                Uuid::new_v4(),
                "Build a calculator with add and subtract. Write a command line parser and add a help screen",
            )
            .unwrap();
        let descriptions: Vec<_> = tasks.iter().map(|t| t.description.as_str()).collect();
        assert_eq!(
            descriptions,
            vec![
                "Build a calculator with add and subtract",
                "Write a command line parser",
                "add a help screen",
            ]
        );
    }

    #[test]
    fn bullets_are_clauses() {
        let tasks = HeuristicPlanner
            .decompose(Uuid::new_v4(), "- parse input\n- print totals\n")
            .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].description, "print totals");
    }

    #[test]
    fn empty_requirement_is_rejected() {
        assert!(matches!(
            HeuristicPlanner.decompose(Uuid::new_v4(), "  . ;\n"),
            Err(PlanError::EmptyRequirement)
        ));
    }
}
