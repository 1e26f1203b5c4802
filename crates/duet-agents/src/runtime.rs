//! The contract every agent implements and the plumbing it shares.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duet_bridge::{HandlerError, MessageBus, MessageHandler};
use duet_core::message::{AgentMessage, MessagePayload};
use duet_core::store::Store;
use duet_core::types::{ChangeSetRef, Task, TaskStatus};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::state_machine::AgentState;

// ---------------------------------------------------------------------------
// AgentKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Moderator,
    TechLead,
    Monitor,
}

impl AgentKind {
    /// Bus id used when a project runs one agent of this kind.
    pub fn default_id(&self) -> &'static str {
        match self {
            AgentKind::Moderator => "moderator",
            AgentKind::TechLead => "tech_lead",
            AgentKind::Monitor => "monitor",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.default_id())
    }
}

// ---------------------------------------------------------------------------
// TaskOutcome
// ---------------------------------------------------------------------------

/// What came of one `Agent::run`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub change_set: Option<ChangeSetRef>,
    /// Blocking reasons and unmet criteria when the task failed.
    pub reasons: Vec<String>,
    pub iterations: u32,
}

impl TaskOutcome {
    pub fn completed(task_id: Uuid, change_set: ChangeSetRef, iterations: u32) -> Self {
        Self {
            task_id,
            status: TaskStatus::Completed,
            change_set: Some(change_set),
            reasons: Vec::new(),
            iterations,
        }
    }

    pub fn failed(task_id: Uuid, reasons: Vec<String>, iterations: u32) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failed,
            change_set: None,
            reasons,
            iterations,
        }
    }

    /// The async `Completion` payload reporting this outcome.
    pub fn into_payload(self) -> MessagePayload {
        MessagePayload::Completion {
            task_id: self.task_id,
            status: self.status,
            change_set: self.change_set,
            reasons: self.reasons,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// An autonomous unit that talks to the rest of the system only through
/// the message bus.
///
/// `receive` is called by the agent's own worker for queued messages and
/// inline by the bus for synchronous requests, possibly at the same time.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> AgentKind;

    fn state(&self) -> AgentState;

    async fn receive(&self, msg: AgentMessage) -> Result<Option<AgentMessage>>;

    async fn run(&self, task: Task) -> Result<TaskOutcome>;

    /// Period for [`Agent::tick`]. `None` means the agent is purely
    /// message driven.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    async fn tick(&self) -> Result<()> {
        Ok(())
    }

    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Registers an [`Agent`] with the bus.
pub struct AgentHandler(pub Arc<dyn Agent>);

#[async_trait]
impl MessageHandler for AgentHandler {
    fn id(&self) -> &str {
        self.0.id()
    }

    async fn handle(&self, msg: AgentMessage) -> std::result::Result<Option<AgentMessage>, HandlerError> {
        self.0
            .receive(msg)
            .await
            .map_err(|e| Box::new(e) as HandlerError)
    }
}

// ---------------------------------------------------------------------------
// AgentContext
// ---------------------------------------------------------------------------

/// Per-agent handles: bus, store and the agent's identity.
#[derive(Clone)]
pub struct AgentContext {
    agent_id: String,
    bus: MessageBus,
    store: Store,
}

impl AgentContext {
    pub fn new(agent_id: impl Into<String>, bus: MessageBus, store: Store) -> Self {
        Self {
            agent_id: agent_id.into(),
            bus,
            store,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn project_id(&self) -> Uuid {
        self.bus.project_id()
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Fire-and-forget.
    pub async fn send(&self, recipient: &str, payload: MessagePayload) -> Result<()> {
        let msg = AgentMessage::notify(self.project_id(), self.agent_id.as_str(), recipient, payload);
        self.bus.send(msg).await?;
        Ok(())
    }

    /// Block until `recipient` answers.
    pub async fn request(&self, recipient: &str, payload: MessagePayload) -> Result<AgentMessage> {
        let msg = AgentMessage::request(self.project_id(), self.agent_id.as_str(), recipient, payload);
        let request_id = msg.id;
        self.bus
            .send(msg)
            .await?
            .ok_or_else(|| {
                AgentError::Bus(duet_bridge::BusError::NoResponse {
                    agent: recipient.to_string(),
                    request: request_id,
                })
            })
    }

    pub async fn remember<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.store
            .remember(self.project_id(), &self.agent_id, key, &value)
            .await?;
        Ok(())
    }

    pub async fn recall<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.recall(self.project_id(), &self.agent_id, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Every remembered `(key, value)` whose key starts with `prefix`.
    pub async fn recall_prefix<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>> {
        let rows = self
            .store
            .recall_prefix(self.project_id(), &self.agent_id, prefix)
            .await?;
        rows.into_iter()
            .map(|(k, v)| Ok((k, serde_json::from_value(v)?)))
            .collect()
    }
}
