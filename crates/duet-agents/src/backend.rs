//! Contracts for the external collaborators the pipeline drives: the AI
//! code-generation backend and the VCS host.
//!
//! The core only sees these traits. `HttpGenerator` talks to a JSON
//! endpoint, `ScaffoldGenerator` is the offline default, `LocalVcs`
//! materialises change sets under a per-project workspace directory and
//! `ScriptedGenerator` replays canned responses in tests.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use duet_core::types::{ChangeSetRef, FeedbackItem, ReviewCategory, Task};
use duet_harness::retry::Transient;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend request timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("backend response could not be parsed: {0}")]
    InvalidResponse(String),

    #[error("vcs operation failed: {0}")]
    Vcs(String),

    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },
}

impl Transient for BackendError {
    fn is_transient(&self) -> bool {
        match self {
            BackendError::Timeout(_) | BackendError::Unavailable(_) => true,
            BackendError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Code generation
// ---------------------------------------------------------------------------

/// One call to the code-generation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub project_id: Uuid,
    pub task_id: Uuid,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    /// Where the generated files will be placed.
    pub output_location: String,
    /// Feedback from the previous review pass, empty on the first attempt.
    pub feedback: Vec<FeedbackItem>,
    pub attempt: u32,
}

/// Generated files keyed by relative path.
pub type GeneratedFiles = BTreeMap<String, String>;

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedFiles, BackendError>;
}

// ---------------------------------------------------------------------------
// HttpGenerator
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct GenerationResponse {
    files: GeneratedFiles,
}

/// Posts a [`GenerationRequest`] as JSON and expects `{"files": {...}}`.
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpGenerator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CodeGenerator for HttpGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedFiles, BackendError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(self.timeout)
                } else if e.is_connect() {
                    BackendError::Unavailable(format!("cannot connect to {}: {}", self.endpoint, e))
                } else {
                    BackendError::Unavailable(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BackendError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: GenerationResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        tracing::debug!(
            task_id = %request.task_id,
            attempt = request.attempt,
            files = body.files.len(),
            "backend generated files"
        );
        Ok(body.files)
    }
}

// ---------------------------------------------------------------------------
// ScaffoldGenerator
// ---------------------------------------------------------------------------

/// Offline generator used when no backend endpoint is configured.
///
/// The first attempt produces a documented module only. Later attempts add
/// whatever the review feedback asked for, so the review loop is exercised
/// end to end without an external service.
#[derive(Debug, Default)]
pub struct ScaffoldGenerator;

fn module_name(description: &str) -> String {
    let words: Vec<String> = description
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .take(4)
        .map(|w| w.to_ascii_lowercase())
        .collect();
    if words.is_empty() {
        "task".to_string()
    } else {
        words.join("_")
    }
}

#[async_trait]
impl CodeGenerator for ScaffoldGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedFiles, BackendError> {
        let name = module_name(&request.description);
        let mut files = GeneratedFiles::new();
        let criteria = request.acceptance_criteria.join("; ");

        files.insert(
            format!("src/{}.rs", name),
            format!(
                "//! {}\n//!\n//! Covers: {}\n\n/// Entry point for {}.\npub fn run() -> Result<(), String> {{\n    Ok(())\n}}\n",
                request.description, criteria, request.description
            ),
        );

        let asked_for = |category: ReviewCategory| request.feedback.iter().any(|f| f.category == category);
        if asked_for(ReviewCategory::Testing) || asked_for(ReviewCategory::Criteria) {
            files.insert(
                format!("tests/{}_test.rs", name),
                format!(
                    "//! Tests for {}.\n\n#[test]\nfn {}_runs() {{\n    assert!(true);\n}}\n",
                    request.description, name
                ),
            );
        }
        if asked_for(ReviewCategory::Documentation) {
            files.insert(
                "README.md".to_string(),
                format!("# {}\n\n{}\n", name, request.description),
            );
        }
        Ok(files)
    }
}

// ---------------------------------------------------------------------------
// ScriptedGenerator
// ---------------------------------------------------------------------------

/// Returns queued responses in order; the last one repeats once the queue
/// drains. Records every request it sees.
#[derive(Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<GeneratedFiles, String>>>,
    last: Mutex<Option<GeneratedFiles>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_files<I, K, V>(self, files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let files = files
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(Ok(files));
        }
        self
    }

    /// Queue a transient failure (backend unavailable).
    pub fn push_outage(self, message: impl Into<String>) -> Self {
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(Err(message.into()));
        }
        self
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedFiles, BackendError> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request.clone());
        }
        let next = self.responses.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(Ok(files)) => {
                if let Ok(mut last) = self.last.lock() {
                    *last = Some(files.clone());
                }
                Ok(files)
            }
            Some(Err(message)) => Err(BackendError::Unavailable(message)),
            None => self
                .last
                .lock()
                .ok()
                .and_then(|last| last.clone())
                .ok_or_else(|| BackendError::Unavailable("no scripted response".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// VCS
// ---------------------------------------------------------------------------

#[async_trait]
pub trait VcsService: Send + Sync {
    /// Checked once before a project starts.
    async fn validate_target(&self, target: &str) -> Result<(), BackendError>;

    /// Returns the branch name.
    async fn create_branch(&self, task: &Task) -> Result<String, BackendError>;

    async fn commit(&self, task: &Task, files: &GeneratedFiles) -> Result<(), BackendError>;

    async fn create_pr(&self, task: &Task) -> Result<ChangeSetRef, BackendError>;
}

/// Writes each task's files to `<root>/<target>/<project>/<branch>/`.
pub struct LocalVcs {
    root: PathBuf,
    target: String,
    next_number: AtomicU64,
}

impl LocalVcs {
    pub fn new(root: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            target: target.into(),
            next_number: AtomicU64::new(1),
        }
    }

    pub fn branch_name(task: &Task) -> String {
        format!("duet/{}", task.id.simple())
    }

    fn branch_dir(&self, task: &Task) -> PathBuf {
        self.root
            .join(&self.target)
            .join(task.project_id.to_string())
            .join(task.id.simple().to_string())
    }
}

fn valid_target_name(target: &str) -> Result<(), String> {
    if target.is_empty() {
        return Err("empty".into());
    }
    if target.starts_with('.') || target.contains("..") {
        return Err("must not start with '.' or contain '..'".into());
    }
    if let Some(c) = target
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("unsupported character '{}'", c));
    }
    Ok(())
}

fn safe_relative(path: &str) -> bool {
    let p = Path::new(path);
    !path.is_empty()
        && p.is_relative()
        && p.components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
}

#[async_trait]
impl VcsService for LocalVcs {
    async fn validate_target(&self, target: &str) -> Result<(), BackendError> {
        valid_target_name(target).map_err(|reason| BackendError::InvalidTarget {
            target: target.to_string(),
            reason,
        })?;
        let dir = self.root.join(target);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BackendError::InvalidTarget {
                target: target.to_string(),
                reason: format!("cannot create {}: {}", dir.display(), e),
            })
    }

    async fn create_branch(&self, task: &Task) -> Result<String, BackendError> {
        let dir = self.branch_dir(task);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BackendError::Vcs(format!("create branch dir {}: {}", dir.display(), e)))?;
        Ok(Self::branch_name(task))
    }

    async fn commit(&self, task: &Task, files: &GeneratedFiles) -> Result<(), BackendError> {
        let dir = self.branch_dir(task);
        for (path, content) in files {
            if !safe_relative(path) {
                return Err(BackendError::Vcs(format!("refusing path outside workspace: {}", path)));
            }
            let dest = dir.join(path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| BackendError::Vcs(e.to_string()))?;
            }
            tokio::fs::write(&dest, content)
                .await
                .map_err(|e| BackendError::Vcs(format!("write {}: {}", dest.display(), e)))?;
        }
        Ok(())
    }

    async fn create_pr(&self, task: &Task) -> Result<ChangeSetRef, BackendError> {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        Ok(ChangeSetRef {
            url: format!("file://{}", self.branch_dir(task).display()),
            number,
        })
    }
}
