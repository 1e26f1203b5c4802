//! SQLite-backed persistence for projects, messages, reviews, agent memory,
//! metrics and alerts.
//!
//! Every row carries a `project_id` and every read filters on it, so
//! concurrent projects sharing one database never see each other's records.
//! All writes funnel through the single `tokio_rusqlite` connection thread;
//! multi-row writes run inside one transaction.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::message::AgentMessage;
use crate::types::{
    Alert, ImprovementCategory, Metric, ProjectPhase, ProjectState, ReviewResult, Task,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(tokio_rusqlite::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("alert not found: {0}")]
    AlertNotFound(Uuid),
    #[error("alert {id} already acknowledged by {by}")]
    AlreadyAcknowledged { id: Uuid, by: String },
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(rusqlite::Error::FromSqlConversionFailure(
                idx,
                _,
                cause,
            )) => StoreError::Corrupt(format!("column {}: {}", idx, cause)),
            other => StoreError::Database(other),
        }
    }
}

impl StoreError {
    /// A persisted row could not be decoded. The run cannot continue.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corrupt(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Learning store contract
// ---------------------------------------------------------------------------

/// Historical outcome data for improvement proposals.
#[async_trait::async_trait]
pub trait LearningStore: Send + Sync {
    /// Fraction of past proposals in `category` that were accepted, or
    /// `None` when there is no history.
    async fn acceptance_rate(&self, category: ImprovementCategory) -> Result<Option<f64>>;

    async fn record_outcome(&self, category: ImprovementCategory, accepted: bool) -> Result<()>;
}

// ---------------------------------------------------------------------------
// helpers – enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> Result<String> {
    let s = serde_json::to_string(val)?;
    Ok(s.trim_matches('"').to_string())
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).map_err(|e| conversion(idx, e))
}

fn json_from_sql<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| conversion(idx, e))
}

fn uuid_from_sql(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| conversion(idx, e))
}

/// Fixed-width UTC timestamps so text comparison orders them correctly.
fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn ts_from_sql(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

fn conversion<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

/// Review attempt as written to the audit table.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewAttempt {
    pub task_id: Uuid,
    pub result: ReviewResult,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Async SQLite-backed store shared by every agent worker.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?;
            }
        }
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS projects (
                        id               TEXT PRIMARY KEY,
                        requirement      TEXT NOT NULL,
                        target           TEXT NOT NULL,
                        phase            TEXT NOT NULL,
                        phase_history    TEXT NOT NULL,
                        stop_reason      TEXT,
                        created_at       TEXT NOT NULL,
                        last_activity_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS tasks (
                        id                  TEXT PRIMARY KEY,
                        project_id          TEXT NOT NULL REFERENCES projects(id),
                        position            INTEGER NOT NULL,
                        description         TEXT NOT NULL,
                        acceptance_criteria TEXT NOT NULL,
                        status              TEXT NOT NULL,
                        change_set          TEXT,
                        assigned_to         TEXT,
                        origin              TEXT NOT NULL,
                        created_at          TEXT NOT NULL,
                        updated_at          TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id, position);

                    CREATE TABLE IF NOT EXISTS messages (
                        seq               INTEGER PRIMARY KEY AUTOINCREMENT,
                        id                TEXT NOT NULL UNIQUE,
                        project_id        TEXT NOT NULL,
                        sender            TEXT NOT NULL,
                        recipient         TEXT NOT NULL,
                        kind              TEXT NOT NULL,
                        body              TEXT NOT NULL,
                        requires_response INTEGER NOT NULL,
                        correlation_id    TEXT,
                        timestamp         TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_messages_project ON messages(project_id, seq);
                    CREATE INDEX IF NOT EXISTS idx_messages_corr    ON messages(correlation_id);

                    CREATE TABLE IF NOT EXISTS reviews (
                        seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                        project_id  TEXT NOT NULL,
                        task_id     TEXT NOT NULL,
                        iteration   INTEGER NOT NULL,
                        passed      INTEGER NOT NULL,
                        score       INTEGER NOT NULL,
                        result      TEXT NOT NULL,
                        recorded_at TEXT NOT NULL,
                        UNIQUE(project_id, task_id, iteration)
                    );

                    CREATE TABLE IF NOT EXISTS agent_memory (
                        project_id TEXT NOT NULL,
                        agent      TEXT NOT NULL,
                        key        TEXT NOT NULL,
                        value      TEXT NOT NULL,
                        updated_at TEXT NOT NULL,
                        PRIMARY KEY (project_id, agent, key)
                    );

                    CREATE TABLE IF NOT EXISTS metrics (
                        seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                        project_id TEXT NOT NULL,
                        name       TEXT NOT NULL,
                        value      REAL NOT NULL,
                        context    TEXT,
                        timestamp  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_metrics_project ON metrics(project_id, name, timestamp);

                    CREATE TABLE IF NOT EXISTS alerts (
                        id              TEXT PRIMARY KEY,
                        project_id      TEXT NOT NULL,
                        metric          TEXT NOT NULL,
                        threshold       REAL NOT NULL,
                        observed        REAL NOT NULL,
                        severity        TEXT NOT NULL,
                        message         TEXT NOT NULL,
                        acknowledged_by TEXT,
                        acknowledged_at TEXT,
                        created_at      TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_alerts_project ON alerts(project_id, created_at);

                    CREATE TABLE IF NOT EXISTS proposal_outcomes (
                        seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                        category    TEXT NOT NULL,
                        accepted    INTEGER NOT NULL,
                        recorded_at TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    /// Persist the project row and every task in one transaction.
    pub async fn save_project(&self, project: &ProjectState) -> Result<()> {
        let id = project.id.to_string();
        let requirement = project.requirement.clone();
        let target = project.target.clone();
        let phase = enum_to_sql(&project.phase)?;
        let history = serde_json::to_string(&project.phase_history)?;
        let stop_reason = project.stop_reason.clone();
        let created_at = ts_to_sql(&project.created_at);
        let last_activity_at = ts_to_sql(&project.last_activity_at);

        let mut task_rows = Vec::with_capacity(project.tasks.len());
        for (position, task) in project.tasks.iter().enumerate() {
            task_rows.push(TaskRow::from_task(task, position as i64)?);
        }

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO projects (id, requirement, target, phase, phase_history,
                        stop_reason, created_at, last_activity_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                     ON CONFLICT(id) DO UPDATE SET
                        phase=excluded.phase, phase_history=excluded.phase_history,
                        stop_reason=excluded.stop_reason,
                        last_activity_at=excluded.last_activity_at",
                    rusqlite::params![
                        id, requirement, target, phase, history, stop_reason, created_at,
                        last_activity_at,
                    ],
                )?;
                for row in task_rows {
                    tx.execute(
                        "INSERT INTO tasks (id, project_id, position, description,
                            acceptance_criteria, status, change_set, assigned_to, origin,
                            created_at, updated_at)
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                         ON CONFLICT(id) DO UPDATE SET
                            position=excluded.position, status=excluded.status,
                            change_set=excluded.change_set, assigned_to=excluded.assigned_to,
                            updated_at=excluded.updated_at",
                        rusqlite::params![
                            row.id,
                            row.project_id,
                            row.position,
                            row.description,
                            row.acceptance_criteria,
                            row.status,
                            row.change_set,
                            row.assigned_to,
                            row.origin,
                            row.created_at,
                            row.updated_at,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn load_project(&self, id: Uuid) -> Result<Option<ProjectState>> {
        let id_str = id.to_string();
        let project = self
            .conn
            .call(move |conn| {
                let project = conn
                    .query_row(
                        "SELECT id, requirement, target, phase, phase_history, stop_reason,
                                created_at, last_activity_at
                         FROM projects WHERE id = ?1",
                        rusqlite::params![id_str],
                        row_to_project,
                    )
                    .optional()?;
                let Some(mut project) = project else {
                    return Ok(None);
                };

                let mut stmt = conn.prepare(
                    "SELECT id, project_id, description, acceptance_criteria, status,
                            change_set, assigned_to, origin, created_at, updated_at
                     FROM tasks WHERE project_id = ?1 ORDER BY position ASC",
                )?;
                let tasks = stmt
                    .query_map(rusqlite::params![id_str], row_to_task)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                project.tasks = tasks;
                Ok(Some(project))
            })
            .await?;
        Ok(project)
    }

    /// Project ids with their phase, most recently active first.
    pub async fn list_projects(&self) -> Result<Vec<(Uuid, String, ProjectPhase)>> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, target, phase FROM projects ORDER BY last_activity_at DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        let id: String = row.get(0)?;
                        let phase: String = row.get(2)?;
                        Ok((
                            uuid_from_sql(0, &id)?,
                            row.get::<_, String>(1)?,
                            enum_from_sql(2, &phase)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Message log
    // -----------------------------------------------------------------------

    /// Append a message to the durable, append-only log.
    pub async fn append_message(&self, msg: &AgentMessage) -> Result<()> {
        let id = msg.id.to_string();
        let project_id = msg.project_id.to_string();
        let sender = msg.sender.clone();
        let recipient = msg.recipient.clone();
        let kind = enum_to_sql(&msg.kind())?;
        let body = serde_json::to_string(msg)?;
        let requires_response = msg.requires_response;
        let correlation_id = msg.correlation_id.map(|c| c.to_string());
        let timestamp = ts_to_sql(&msg.timestamp);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO messages (id, project_id, sender, recipient, kind, body,
                        requires_response, correlation_id, timestamp)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![
                        id, project_id, sender, recipient, kind, body, requires_response,
                        correlation_id, timestamp,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Full message history of a project in append order.
    pub async fn message_history(&self, project_id: Uuid) -> Result<Vec<AgentMessage>> {
        self.query_messages(
            "SELECT body FROM messages WHERE project_id = ?1 ORDER BY seq ASC",
            vec![project_id.to_string()],
        )
        .await
    }

    /// Request and response sharing a correlation id, in append order.
    pub async fn messages_by_correlation(
        &self,
        project_id: Uuid,
        correlation_id: Uuid,
    ) -> Result<Vec<AgentMessage>> {
        self.query_messages(
            "SELECT body FROM messages WHERE project_id = ?1 AND correlation_id = ?2
             ORDER BY seq ASC",
            vec![project_id.to_string(), correlation_id.to_string()],
        )
        .await
    }

    async fn query_messages(&self, sql: &'static str, args: Vec<String>) -> Result<Vec<AgentMessage>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                        let body: String = row.get(0)?;
                        json_from_sql::<AgentMessage>(0, &body)
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Review audit log
    // -----------------------------------------------------------------------

    pub async fn record_review(
        &self,
        project_id: Uuid,
        task_id: Uuid,
        result: &ReviewResult,
    ) -> Result<()> {
        let project_id = project_id.to_string();
        let task_id = task_id.to_string();
        let iteration = result.iteration;
        let passed = result.passed;
        let score = result.score;
        let body = serde_json::to_string(result)?;
        let recorded_at = ts_to_sql(&Utc::now());

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO reviews (project_id, task_id, iteration, passed, score,
                        result, recorded_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    rusqlite::params![
                        project_id, task_id, iteration, passed, score, body, recorded_at,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Every recorded review pass for a task, oldest first.
    pub async fn review_attempts(&self, project_id: Uuid, task_id: Uuid) -> Result<Vec<ReviewAttempt>> {
        let project_id = project_id.to_string();
        let task_id_str = task_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT result, recorded_at FROM reviews
                     WHERE project_id = ?1 AND task_id = ?2 ORDER BY iteration ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![project_id, task_id_str], |row| {
                        let body: String = row.get(0)?;
                        let recorded_at: String = row.get(1)?;
                        Ok(ReviewAttempt {
                            task_id,
                            result: json_from_sql(0, &body)?,
                            recorded_at: ts_from_sql(1, &recorded_at)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Review pass counts for a project: (total, rejected).
    pub async fn review_counts(&self, project_id: Uuid) -> Result<(u64, u64)> {
        let project_id = project_id.to_string();
        let counts = self
            .conn
            .call(move |conn| {
                let counts = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(CASE WHEN passed = 0 THEN 1 ELSE 0 END), 0)
                     FROM reviews WHERE project_id = ?1",
                    rusqlite::params![project_id],
                    |r| Ok((r.get::<_, i64>(0)? as u64, r.get::<_, i64>(1)? as u64)),
                )?;
                Ok(counts)
            })
            .await?;
        Ok(counts)
    }

    // -----------------------------------------------------------------------
    // Agent memory
    // -----------------------------------------------------------------------

    pub async fn remember(
        &self,
        project_id: Uuid,
        agent: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let project_id = project_id.to_string();
        let agent = agent.to_string();
        let key = key.to_string();
        let value = value.to_string();
        let updated_at = ts_to_sql(&Utc::now());

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agent_memory (project_id, agent, key, value, updated_at)
                     VALUES (?1,?2,?3,?4,?5)
                     ON CONFLICT(project_id, agent, key) DO UPDATE SET
                        value=excluded.value, updated_at=excluded.updated_at",
                    rusqlite::params![project_id, agent, key, value, updated_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn recall(
        &self,
        project_id: Uuid,
        agent: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        let project_id = project_id.to_string();
        let agent = agent.to_string();
        let key = key.to_string();
        let value = self
            .conn
            .call(move |conn| {
                let raw: Option<String> = conn
                    .query_row(
                        "SELECT value FROM agent_memory
                         WHERE project_id = ?1 AND agent = ?2 AND key = ?3",
                        rusqlite::params![project_id, agent, key],
                        |r| r.get(0),
                    )
                    .optional()?;
                raw.map(|s| json_from_sql(0, &s))
                    .transpose()
                    .map_err(tokio_rusqlite::Error::from)
            })
            .await?;
        Ok(value)
    }

    /// All memory entries of an agent whose key starts with `prefix`.
    pub async fn recall_prefix(
        &self,
        project_id: Uuid,
        agent: &str,
        prefix: &str,
    ) -> Result<Vec<(String, serde_json::Value)>> {
        let project_id = project_id.to_string();
        let agent = agent.to_string();
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, value FROM agent_memory
                     WHERE project_id = ?1 AND agent = ?2 AND key LIKE ?3 ESCAPE '\\'
                     ORDER BY key ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![project_id, agent, pattern], |row| {
                        let value: String = row.get(1)?;
                        Ok((row.get::<_, String>(0)?, json_from_sql(1, &value)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    pub async fn record_metric(&self, project_id: Uuid, metric: &Metric) -> Result<()> {
        let project_id = project_id.to_string();
        let name = metric.name.clone();
        let value = metric.value;
        let context = metric.context.as_ref().map(|v| v.to_string());
        let timestamp = ts_to_sql(&metric.timestamp);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO metrics (project_id, name, value, context, timestamp)
                     VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![project_id, name, value, context, timestamp],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Samples of one metric at or after `since`, oldest first.
    pub async fn metric_history(
        &self,
        project_id: Uuid,
        name: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Metric>> {
        let project_id = project_id.to_string();
        let name = name.to_string();
        let since = ts_to_sql(&since);
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT name, value, context, timestamp FROM metrics
                     WHERE project_id = ?1 AND name = ?2 AND timestamp >= ?3
                     ORDER BY timestamp ASC, seq ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![project_id, name, since], row_to_metric)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Most recent sample of every metric recorded for the project.
    pub async fn latest_metrics(&self, project_id: Uuid) -> Result<Vec<Metric>> {
        let project_id = project_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT m.name, m.value, m.context, m.timestamp FROM metrics m
                     WHERE m.project_id = ?1
                       AND m.seq = (SELECT MAX(seq) FROM metrics
                                    WHERE project_id = m.project_id AND name = m.name)
                     ORDER BY m.name ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![project_id], row_to_metric)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    pub async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        let id = alert.id.to_string();
        let project_id = alert.project_id.to_string();
        let metric = alert.metric.clone();
        let threshold = alert.threshold;
        let observed = alert.observed;
        let severity = enum_to_sql(&alert.severity)?;
        let message = alert.message.clone();
        let acknowledged_by = alert.acknowledged_by.clone();
        let acknowledged_at = alert.acknowledged_at.map(|d| ts_to_sql(&d));
        let created_at = ts_to_sql(&alert.created_at);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO alerts (id, project_id, metric, threshold, observed, severity,
                        message, acknowledged_by, acknowledged_at, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                    rusqlite::params![
                        id, project_id, metric, threshold, observed, severity, message,
                        acknowledged_by, acknowledged_at, created_at,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Unacknowledged alerts, newest first.
    pub async fn active_alerts(&self, project_id: Uuid) -> Result<Vec<Alert>> {
        self.query_alerts(
            "SELECT id, project_id, metric, threshold, observed, severity, message,
                    acknowledged_by, acknowledged_at, created_at
             FROM alerts WHERE project_id = ?1 AND acknowledged_at IS NULL
             ORDER BY created_at DESC",
            project_id,
        )
        .await
    }

    /// Every alert ever raised for the project, newest first.
    pub async fn alert_history(&self, project_id: Uuid) -> Result<Vec<Alert>> {
        self.query_alerts(
            "SELECT id, project_id, metric, threshold, observed, severity, message,
                    acknowledged_by, acknowledged_at, created_at
             FROM alerts WHERE project_id = ?1
             ORDER BY created_at DESC",
            project_id,
        )
        .await
    }

    async fn query_alerts(&self, sql: &'static str, project_id: Uuid) -> Result<Vec<Alert>> {
        let project_id = project_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![project_id], row_to_alert)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Set the acknowledgement fields of an alert. They can be set once.
    pub async fn acknowledge_alert(&self, project_id: Uuid, alert_id: Uuid, actor: &str) -> Result<Alert> {
        let project_str = project_id.to_string();
        let id_str = alert_id.to_string();
        let actor = actor.to_string();
        let now = ts_to_sql(&Utc::now());

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE alerts SET acknowledged_by = ?1, acknowledged_at = ?2
                     WHERE id = ?3 AND project_id = ?4 AND acknowledged_at IS NULL",
                    rusqlite::params![actor, now, id_str, project_str],
                )?;
                let alert = tx
                    .query_row(
                        "SELECT id, project_id, metric, threshold, observed, severity, message,
                                acknowledged_by, acknowledged_at, created_at
                         FROM alerts WHERE id = ?1 AND project_id = ?2",
                        rusqlite::params![id_str, project_str],
                        row_to_alert,
                    )
                    .optional()?;
                tx.commit()?;
                Ok((changed, alert))
            })
            .await?;

        match outcome {
            (_, None) => Err(StoreError::AlertNotFound(alert_id)),
            (0, Some(existing)) => Err(StoreError::AlreadyAcknowledged {
                id: alert_id,
                by: existing.acknowledged_by.unwrap_or_default(),
            }),
            (_, Some(alert)) => Ok(alert),
        }
    }
}

// ---------------------------------------------------------------------------
// Learning store backed by the proposal_outcomes table
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl LearningStore for Store {
    async fn acceptance_rate(&self, category: ImprovementCategory) -> Result<Option<f64>> {
        let category = enum_to_sql(&category)?;
        let rate = self
            .conn
            .call(move |conn| {
                let (total, accepted): (i64, i64) = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(accepted), 0)
                     FROM proposal_outcomes WHERE category = ?1",
                    rusqlite::params![category],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?;
                Ok((total > 0).then(|| accepted as f64 / total as f64))
            })
            .await?;
        Ok(rate)
    }

    async fn record_outcome(&self, category: ImprovementCategory, accepted: bool) -> Result<()> {
        let category = enum_to_sql(&category)?;
        let recorded_at = ts_to_sql(&Utc::now());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO proposal_outcomes (category, accepted, recorded_at)
                     VALUES (?1,?2,?3)",
                    rusqlite::params![category, accepted, recorded_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

struct TaskRow {
    id: String,
    project_id: String,
    position: i64,
    description: String,
    acceptance_criteria: String,
    status: String,
    change_set: Option<String>,
    assigned_to: Option<String>,
    origin: String,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn from_task(task: &Task, position: i64) -> Result<Self> {
        Ok(Self {
            id: task.id.to_string(),
            project_id: task.project_id.to_string(),
            position,
            description: task.description.clone(),
            acceptance_criteria: serde_json::to_string(&task.acceptance_criteria)?,
            status: enum_to_sql(&task.status)?,
            change_set: task
                .change_set
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            assigned_to: task.assigned_to.clone(),
            origin: enum_to_sql(&task.origin)?,
            created_at: ts_to_sql(&task.created_at),
            updated_at: ts_to_sql(&task.updated_at),
        })
    }
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectState> {
    let id: String = row.get(0)?;
    let phase: String = row.get(3)?;
    let history: String = row.get(4)?;
    let created_at: String = row.get(6)?;
    let last_activity_at: String = row.get(7)?;

    Ok(ProjectState {
        id: uuid_from_sql(0, &id)?,
        requirement: row.get(1)?,
        target: row.get(2)?,
        tasks: Vec::new(),
        phase: enum_from_sql(3, &phase)?,
        phase_history: json_from_sql(4, &history)?,
        stop_reason: row.get(5)?,
        created_at: ts_from_sql(6, &created_at)?,
        last_activity_at: ts_from_sql(7, &last_activity_at)?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let project_id: String = row.get(1)?;
    let criteria: String = row.get(3)?;
    let status: String = row.get(4)?;
    let change_set: Option<String> = row.get(5)?;
    let origin: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(Task {
        id: uuid_from_sql(0, &id)?,
        project_id: uuid_from_sql(1, &project_id)?,
        description: row.get(2)?,
        acceptance_criteria: json_from_sql(3, &criteria)?,
        status: enum_from_sql(4, &status)?,
        change_set: change_set.map(|s| json_from_sql(5, &s)).transpose()?,
        assigned_to: row.get(6)?,
        origin: enum_from_sql(7, &origin)?,
        created_at: ts_from_sql(8, &created_at)?,
        updated_at: ts_from_sql(9, &updated_at)?,
    })
}

fn row_to_metric(row: &rusqlite::Row<'_>) -> rusqlite::Result<Metric> {
    let context: Option<String> = row.get(2)?;
    let timestamp: String = row.get(3)?;
    Ok(Metric {
        name: row.get(0)?,
        value: row.get(1)?,
        context: context.map(|s| json_from_sql(2, &s)).transpose()?,
        timestamp: ts_from_sql(3, &timestamp)?,
    })
}

fn row_to_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alert> {
    let id: String = row.get(0)?;
    let project_id: String = row.get(1)?;
    let severity: String = row.get(5)?;
    let acknowledged_at: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;

    Ok(Alert {
        id: uuid_from_sql(0, &id)?,
        project_id: uuid_from_sql(1, &project_id)?,
        metric: row.get(2)?,
        threshold: row.get(3)?,
        observed: row.get(4)?,
        severity: enum_from_sql(5, &severity)?,
        message: row.get(6)?,
        acknowledged_by: row.get(7)?,
        acknowledged_at: acknowledged_at.map(|s| ts_from_sql(8, &s)).transpose()?,
        created_at: ts_from_sql(9, &created_at)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
