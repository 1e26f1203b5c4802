//! Inter-agent message envelope and its strongly typed payloads.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Alert, ChangeSet, ChangeSetRef, ReviewResult, Task, TaskStatus};

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Assignment,
    Completion,
    ChangeSetSubmitted,
    ReviewFeedback,
    Status,
    HealthAlert,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MessageKind::Assignment => "assignment",
            MessageKind::Completion => "completion",
            MessageKind::ChangeSetSubmitted => "change_set_submitted",
            MessageKind::ReviewFeedback => "review_feedback",
            MessageKind::Status => "status",
            MessageKind::HealthAlert => "health_alert",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// MessagePayload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum MessagePayload {
    /// Moderator -> TechLead: implement this task.
    Assignment { task: Task },
    /// TechLead -> Moderator: the task reached a terminal outcome.
    Completion {
        task_id: Uuid,
        status: TaskStatus,
        change_set: Option<ChangeSetRef>,
        /// Why the task failed, empty on success.
        reasons: Vec<String>,
    },
    /// TechLead -> Moderator, always synchronous.
    ChangeSetSubmitted { task_id: Uuid, change_set: ChangeSet },
    /// Moderator -> TechLead, the response to a submission.
    ReviewFeedback { task_id: Uuid, result: ReviewResult },
    Status { state: String, detail: String },
    HealthAlert { alert: Alert },
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessagePayload::Assignment { .. } => MessageKind::Assignment,
            MessagePayload::Completion { .. } => MessageKind::Completion,
            MessagePayload::ChangeSetSubmitted { .. } => MessageKind::ChangeSetSubmitted,
            MessagePayload::ReviewFeedback { .. } => MessageKind::ReviewFeedback,
            MessagePayload::Status { .. } => MessageKind::Status,
            MessagePayload::HealthAlert { .. } => MessageKind::HealthAlert,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentMessage
// ---------------------------------------------------------------------------

/// Immutable envelope routed by the message bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: Uuid,
    pub project_id: Uuid,
    pub sender: String,
    pub recipient: String,
    pub payload: MessagePayload,
    /// The sender blocks until exactly one response arrives.
    pub requires_response: bool,
    /// Links a response to its request. Requests carry their own id here.
    pub correlation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    /// Fire-and-forget message.
    pub fn notify(
        project_id: Uuid,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            sender: sender.into(),
            recipient: recipient.into(),
            payload,
            requires_response: false,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Request that must be answered before the sender proceeds.
    pub fn request(
        project_id: Uuid,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        let mut msg = Self::notify(project_id, sender, recipient, payload);
        msg.requires_response = true;
        msg.correlation_id = Some(msg.id);
        msg
    }

    /// Build the response to `self`, addressed back to its sender.
    pub fn reply(&self, payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: self.project_id,
            sender: self.recipient.clone(),
            recipient: self.sender.clone(),
            payload,
            requires_response: false,
            correlation_id: Some(self.correlation_id.unwrap_or(self.id)),
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_correlates_to_itself() {
        let msg = AgentMessage::request(
            Uuid::new_v4(),
            "tech_lead",
            "moderator",
            MessagePayload::Status {
                state: "idle".into(),
                detail: String::new(),
            },
        );
        assert!(msg.requires_response);
        assert_eq!(msg.correlation_id, Some(msg.id));
    }

    #[test]
    fn reply_swaps_endpoints_and_keeps_correlation() {
        let project = Uuid::new_v4();
        let req = AgentMessage::request(
            project,
            "tech_lead",
            "moderator",
            MessagePayload::Status {
                state: "waiting".into(),
                detail: "ping".into(),
            },
        );
        let resp = req.reply(MessagePayload::Status {
            state: "idle".into(),
            detail: "pong".into(),
        });
        assert_eq!(resp.sender, "moderator");
        assert_eq!(resp.recipient, "tech_lead");
        assert_eq!(resp.correlation_id, Some(req.id));
        assert!(!resp.requires_response);
        assert_eq!(resp.project_id, project);
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let payload = MessagePayload::Status {
            state: "idle".into(),
            detail: "ok".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["payload"]["state"], "idle");
        assert_eq!(payload.kind(), MessageKind::Status);
    }
}
