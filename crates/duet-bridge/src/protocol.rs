//! Routing rules for [`AgentMessage`]s and the handler contract the bus
//! dispatches to.

use duet_core::message::{AgentMessage, MessageKind};

/// Error returned by a handler. The bus wraps it with the agent id.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A named endpoint registered with the bus.
///
/// `handle` is invoked inline for synchronous requests and by the agent's
/// own worker for queued messages, so implementations must tolerate being
/// called from more than one task at a time.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    fn id(&self) -> &str;

    async fn handle(&self, msg: AgentMessage) -> Result<Option<AgentMessage>, HandlerError>;
}

/// Protocol violation detected before a message is routed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("message {0} is addressed to its own sender")]
    SelfAddressed(uuid::Uuid),

    #[error("request {0} must carry its correlation id")]
    MissingCorrelation(uuid::Uuid),

    #[error("{kind} messages must be sent synchronously")]
    MustBeSynchronous { kind: MessageKind },

    #[error("{kind} messages are responses and cannot block")]
    MustNotBlock { kind: MessageKind },

    #[error("response {response} does not correlate with request {request}")]
    Uncorrelated {
        request: uuid::Uuid,
        response: uuid::Uuid,
    },
}

/// Check the envelope before it is logged and routed.
pub fn validate(msg: &AgentMessage) -> Result<(), ProtocolError> {
    if msg.sender == msg.recipient {
        return Err(ProtocolError::SelfAddressed(msg.id));
    }
    let kind = msg.kind();
    if msg.requires_response && msg.correlation_id.is_none() {
        return Err(ProtocolError::MissingCorrelation(msg.id));
    }
    match kind {
        MessageKind::ChangeSetSubmitted if !msg.requires_response => {
            Err(ProtocolError::MustBeSynchronous { kind })
        }
        MessageKind::ReviewFeedback if msg.requires_response => {
            Err(ProtocolError::MustNotBlock { kind })
        }
        _ => Ok(()),
    }
}

/// Check that `response` answers `request` and flows back to its sender.
pub fn validate_response(request: &AgentMessage, response: &AgentMessage) -> Result<(), ProtocolError> {
    let uncorrelated = ProtocolError::Uncorrelated {
        request: request.id,
        response: response.id,
    };
    if response.correlation_id != request.correlation_id
        || response.recipient != request.sender
        || response.project_id != request.project_id
    {
        return Err(uncorrelated);
    }
    if response.requires_response {
        return Err(ProtocolError::MustNotBlock {
            kind: response.kind(),
        });
    }
    Ok(())
}
