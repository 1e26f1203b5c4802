use duet_bridge::BusError;
use duet_core::lifecycle::LifecycleError;
use duet_core::message::MessageKind;
use duet_core::store::StoreError;
use duet_harness::retry::{RetryError, Transient};
use uuid::Uuid;

use crate::backend::BackendError;
use crate::planner::PlanError;
use crate::review::ReviewError;
use crate::state_machine::StateMachineError;

/// How a failure propagates through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth a bounded automatic retry.
    Transient,
    /// Confined to one task or analyzer; the surrounding work continues.
    Recoverable,
    /// The task fails and the operator needs the listed reasons.
    Blocking,
    /// The run cannot continue.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Review(#[from] ReviewError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{agent} cannot handle {kind} messages")]
    UnexpectedMessage { agent: String, kind: MessageKind },

    #[error("task {task_id} blocked: {}", .reasons.join("; "))]
    Blocked { task_id: Uuid, reasons: Vec<String> },

    #[error("{agent} does not support {operation}")]
    Unsupported {
        agent: String,
        operation: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl From<RetryError<BackendError>> for AgentError {
    fn from(err: RetryError<BackendError>) -> Self {
        AgentError::Backend(err.into_inner())
    }
}

impl AgentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AgentError::Bus(BusError::Handler { source, .. }) => source
                .downcast_ref::<AgentError>()
                .map(AgentError::class)
                .unwrap_or(ErrorClass::Recoverable),
            AgentError::Bus(BusError::Store(e)) | AgentError::Store(e) => store_class(e),
            AgentError::Bus(_) => ErrorClass::Fatal,
            AgentError::Backend(e) if e.is_transient() => ErrorClass::Transient,
            AgentError::Backend(_) => ErrorClass::Recoverable,
            AgentError::Review(ReviewError::IterationCapExceeded { .. }) => ErrorClass::Blocking,
            AgentError::Review(_) => ErrorClass::Recoverable,
            AgentError::Blocked { .. } => ErrorClass::Blocking,
            AgentError::Plan(_) => ErrorClass::Blocking,
            AgentError::Serde(_) => ErrorClass::Fatal,
            AgentError::Lifecycle(_)
            | AgentError::StateMachine(_)
            | AgentError::UnexpectedMessage { .. }
            | AgentError::Unsupported { .. } => ErrorClass::Recoverable,
        }
    }

    /// Human-readable reasons to attach to a failed task.
    pub fn reasons(&self) -> Vec<String> {
        match self {
            AgentError::Blocked { reasons, .. } => reasons.clone(),
            other => vec![other.to_string()],
        }
    }
}

fn store_class(err: &StoreError) -> ErrorClass {
    match err {
        StoreError::Corrupt(_) | StoreError::Serde(_) => ErrorClass::Fatal,
        StoreError::Database(_) => ErrorClass::Transient,
        StoreError::AlertNotFound(_) | StoreError::AlreadyAcknowledged { .. } => {
            ErrorClass::Recoverable
        }
    }
}
