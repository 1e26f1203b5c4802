use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// AgentState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Processing,
    /// A synchronous submission is in flight.
    Waiting,
    Error,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentState::Idle => "idle",
            AgentState::Processing => "processing",
            AgentState::Waiting => "waiting",
            AgentState::Error => "error",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// AgentEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEvent {
    Assign,
    Submit,
    Approve,
    Reject,
    /// Work ended without approval (blocked task, finished bookkeeping).
    Release,
    Fail,
    Recover,
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentEvent::Assign => "assign",
            AgentEvent::Submit => "submit",
            AgentEvent::Approve => "approve",
            AgentEvent::Reject => "reject",
            AgentEvent::Release => "release",
            AgentEvent::Fail => "fail",
            AgentEvent::Recover => "recover",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition { state: AgentState, event: AgentEvent },
}

// ---------------------------------------------------------------------------
// AgentStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AgentStateMachine {
    current: AgentState,
    history: Vec<(AgentState, AgentEvent, AgentState)>,
}

impl AgentStateMachine {
    pub fn new() -> Self {
        Self {
            current: AgentState::Idle,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> AgentState {
        self.current
    }

    pub fn history(&self) -> &[(AgentState, AgentEvent, AgentState)] {
        &self.history
    }

    fn next(current: AgentState, event: AgentEvent) -> Option<AgentState> {
        let next = match (current, event) {
            (AgentState::Idle, AgentEvent::Assign) => AgentState::Processing,
            (AgentState::Processing, AgentEvent::Submit) => AgentState::Waiting,
            (AgentState::Waiting, AgentEvent::Approve) => AgentState::Idle,
            (AgentState::Waiting, AgentEvent::Reject) => AgentState::Processing,
            (AgentState::Processing | AgentState::Waiting, AgentEvent::Release) => {
                AgentState::Idle
            }
            (AgentState::Idle | AgentState::Processing | AgentState::Waiting, AgentEvent::Fail) => {
                AgentState::Error
            }
            (AgentState::Error, AgentEvent::Recover) => AgentState::Idle,
            _ => return None,
        };
        Some(next)
    }

    /// Apply `event`.
    ///
    /// - Idle       + Assign  -> Processing
    /// - Processing + Submit  -> Waiting
    /// - Waiting    + Approve -> Idle
    /// - Waiting    + Reject  -> Processing
    /// - Processing | Waiting + Release -> Idle
    /// - any but Error + Fail -> Error
    /// - Error      + Recover -> Idle
    pub fn transition(&mut self, event: AgentEvent) -> Result<AgentState, StateMachineError> {
        let next = Self::next(self.current, event).ok_or(StateMachineError::InvalidTransition {
            state: self.current,
            event,
        })?;

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "agent state transition");
        Ok(next)
    }

    pub fn can_transition(&self, event: AgentEvent) -> bool {
        Self::next(self.current, event).is_some()
    }
}

impl Default for AgentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_loop_cycles_between_processing_and_waiting() {
        let mut sm = AgentStateMachine::new();
        sm.transition(AgentEvent::Assign).unwrap();
        sm.transition(AgentEvent::Submit).unwrap();
        sm.transition(AgentEvent::Reject).unwrap();
        sm.transition(AgentEvent::Submit).unwrap();
        assert_eq!(sm.transition(AgentEvent::Approve).unwrap(), AgentState::Idle);
        assert_eq!(sm.history().len(), 5);
    }

    #[test]
    fn error_only_leaves_through_recover() {
        let mut sm = AgentStateMachine::new();
        sm.transition(AgentEvent::Assign).unwrap();
        sm.transition(AgentEvent::Fail).unwrap();
        assert_eq!(sm.state(), AgentState::Error);
        for event in [
            AgentEvent::Assign,
            AgentEvent::Submit,
            AgentEvent::Approve,
            AgentEvent::Release,
            AgentEvent::Fail,
        ] {
            assert!(!sm.can_transition(event), "{event} should be refused");
        }
        assert_eq!(sm.transition(AgentEvent::Recover).unwrap(), AgentState::Idle);
    }

    #[test]
    fn approve_requires_waiting() {
        let mut sm = AgentStateMachine::new();
        sm.transition(AgentEvent::Assign).unwrap();
        let err = sm.transition(AgentEvent::Approve).unwrap_err();
        assert!(matches!(
            err,
            StateMachineError::InvalidTransition {
                state: AgentState::Processing,
                event: AgentEvent::Approve
            }
        ));
        assert_eq!(sm.state(), AgentState::Processing);
    }

    #[test]
    fn release_returns_to_idle() {
        let mut sm = AgentStateMachine::new();
        sm.transition(AgentEvent::Assign).unwrap();
        sm.transition(AgentEvent::Submit).unwrap();
        assert_eq!(sm.transition(AgentEvent::Release).unwrap(), AgentState::Idle);
    }
}
