use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use duet_core::message::{AgentMessage, MessagePayload};
use duet_core::store::{Store, StoreError};
use duet_telemetry::metrics::{self, MetricsCollector};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{self, HandlerError, MessageHandler, ProtocolError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no agent registered as '{0}'")]
    Unroutable(String),

    #[error("agent '{0}' is already registered")]
    DuplicateAgent(String),

    #[error("message {message} belongs to project {found}, bus serves {expected}")]
    ForeignProject {
        message: Uuid,
        expected: Uuid,
        found: Uuid,
    },

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("agent '{agent}' returned no response to request {request}")]
    NoResponse { agent: String, request: Uuid },

    #[error("agent '{agent}' failed handling {request}: {source}")]
    Handler {
        agent: String,
        request: Uuid,
        #[source]
        source: HandlerError,
    },

    #[error("queue for '{0}' is closed")]
    QueueClosed(String),

    #[error("message log: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, BusError>;

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

struct Mailbox {
    handler: Arc<dyn MessageHandler>,
    tx: flume::Sender<AgentMessage>,
    rx: flume::Receiver<AgentMessage>,
}

/// Routes messages between the agents of one project.
///
/// Every message and every synchronous response is appended to the store's
/// message log before it is handed to the recipient, so the log is a
/// complete replay of the conversation. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct MessageBus {
    project_id: Uuid,
    mailboxes: Arc<DashMap<String, Mailbox>>,
    store: Store,
    metrics: Arc<MetricsCollector>,
}

impl MessageBus {
    pub fn new(project_id: Uuid, store: Store, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            project_id,
            mailboxes: Arc::new(DashMap::new()),
            store,
            metrics,
        }
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Register an agent under its id and give it a queue.
    pub fn register(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let id = handler.id().to_string();
        match self.mailboxes.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BusError::DuplicateAgent(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let (tx, rx) = flume::unbounded();
                slot.insert(Mailbox { handler, tx, rx });
                info!(project_id = %self.project_id, agent = %id, "agent registered");
                Ok(())
            }
        }
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.mailboxes.contains_key(agent_id)
    }

    pub fn registered_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.mailboxes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Route a message.
    ///
    /// Requests (`requires_response`) run the recipient's handler inline and
    /// return its single response. When the handler fails, an error status
    /// is logged as the response before the error is returned. Everything else is queued for the
    /// recipient's worker and returns `None` without blocking.
    pub async fn send(&self, msg: AgentMessage) -> Result<Option<AgentMessage>> {
        if let Err(e) = self.check(&msg) {
            self.fail(&msg, "rejected");
            error!(
                project_id = %self.project_id,
                message_id = %msg.id,
                recipient = %msg.recipient,
                error = %e,
                "message not routable"
            );
            return Err(e);
        }

        if msg.requires_response {
            self.send_sync(msg).await.map(Some)
        } else {
            self.send_async(msg).await.map(|_| None)
        }
    }

    fn check(&self, msg: &AgentMessage) -> Result<()> {
        if msg.project_id != self.project_id {
            return Err(BusError::ForeignProject {
                message: msg.id,
                expected: self.project_id,
                found: msg.project_id,
            });
        }
        protocol::validate(msg)?;
        if !self.mailboxes.contains_key(&msg.recipient) {
            return Err(BusError::Unroutable(msg.recipient.clone()));
        }
        Ok(())
    }

    async fn send_async(&self, msg: AgentMessage) -> Result<()> {
        self.store.append_message(&msg).await?;

        let tx = self
            .mailboxes
            .get(&msg.recipient)
            .map(|mb| mb.tx.clone())
            .ok_or_else(|| BusError::Unroutable(msg.recipient.clone()))?;
        let recipient = msg.recipient.clone();
        let kind = msg.kind().to_string();
        debug!(
            project_id = %self.project_id,
            message_id = %msg.id,
            from = %msg.sender,
            to = %recipient,
            kind = %kind,
            "queued"
        );
        tx.send(msg)
            .map_err(|_| BusError::QueueClosed(recipient.clone()))?;

        self.routed(&kind, "async");
        self.metrics
            .add_gauge(metrics::QUEUE_DEPTH, &[("agent", recipient.as_str())], 1);
        Ok(())
    }

    async fn send_sync(&self, msg: AgentMessage) -> Result<AgentMessage> {
        let handler = self
            .mailboxes
            .get(&msg.recipient)
            .map(|mb| Arc::clone(&mb.handler))
            .ok_or_else(|| BusError::Unroutable(msg.recipient.clone()))?;

        self.store.append_message(&msg).await?;
        let request = msg.clone();
        let kind = msg.kind().to_string();
        debug!(
            project_id = %self.project_id,
            message_id = %msg.id,
            from = %msg.sender,
            to = %msg.recipient,
            kind = %kind,
            "dispatching request"
        );

        let response = match handler.handle(msg).await {
            Ok(Some(response)) => response,
            Ok(None) => {
                let err = BusError::NoResponse {
                    agent: request.recipient.clone(),
                    request: request.id,
                };
                self.reply_error(&request, "no_response", &err).await;
                return Err(err);
            }
            Err(source) => {
                let err = BusError::Handler {
                    agent: request.recipient.clone(),
                    request: request.id,
                    source,
                };
                self.reply_error(&request, "handler", &err).await;
                return Err(err);
            }
        };

        if let Err(e) = protocol::validate_response(&request, &response) {
            let err = BusError::from(e);
            self.reply_error(&request, "uncorrelated", &err).await;
            return Err(err);
        }
        self.store.append_message(&response).await?;
        self.routed(&kind, "sync");
        debug!(
            project_id = %self.project_id,
            request = %request.id,
            response = %response.id,
            kind = %response.kind(),
            "response logged"
        );
        Ok(response)
    }

    /// Wait up to `timeout` for the next queued message for `agent_id`.
    pub async fn deliver_next(&self, agent_id: &str, timeout: Duration) -> Result<Option<AgentMessage>> {
        let rx = self
            .mailboxes
            .get(agent_id)
            .map(|mb| mb.rx.clone())
            .ok_or_else(|| BusError::Unroutable(agent_id.to_string()))?;

        match tokio::time::timeout(timeout, rx.recv_async()).await {
            Ok(Ok(msg)) => {
                self.metrics
                    .add_gauge(metrics::QUEUE_DEPTH, &[("agent", agent_id)], -1);
                Ok(Some(msg))
            }
            Ok(Err(_)) => Err(BusError::QueueClosed(agent_id.to_string())),
            Err(_) => Ok(None),
        }
    }

    /// Messages waiting in `agent_id`'s queue.
    pub fn queue_len(&self, agent_id: &str) -> usize {
        self.mailboxes
            .get(agent_id)
            .map(|mb| mb.rx.len())
            .unwrap_or(0)
    }

    /// Full persisted conversation of this bus's project.
    pub async fn history(&self) -> Result<Vec<AgentMessage>> {
        Ok(self.store.message_history(self.project_id).await?)
    }

    /// Request and response logged under one correlation id.
    pub async fn conversation(&self, correlation_id: Uuid) -> Result<Vec<AgentMessage>> {
        Ok(self
            .store
            .messages_by_correlation(self.project_id, correlation_id)
            .await?)
    }

    fn routed(&self, kind: &str, mode: &str) {
        let project = self.project_id.to_string();
        self.metrics.increment_counter(
            metrics::MESSAGES_ROUTED,
            &[("project", project.as_str()), ("kind", kind), ("mode", mode)],
        );
    }

    /// Close a failed request with an error status so the log still pairs
    /// it with exactly one response.
    async fn reply_error(&self, request: &AgentMessage, reason: &str, err: &BusError) {
        self.fail(request, reason);
        let reply = request.reply(MessagePayload::Status {
            state: "error".into(),
            detail: err.to_string(),
        });
        if let Err(e) = self.store.append_message(&reply).await {
            warn!(
                project_id = %self.project_id,
                request = %request.id,
                error = %e,
                "error response not logged"
            );
        }
    }

    fn fail(&self, msg: &AgentMessage, reason: &str) {
        let project = self.project_id.to_string();
        self.metrics.increment_counter(
            metrics::DELIVERY_FAILURES,
            &[("project", project.as_str()), ("reason", reason)],
        );
        debug!(message_id = %msg.id, reason, "delivery failure counted");
    }
}
