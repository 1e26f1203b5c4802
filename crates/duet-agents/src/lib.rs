//! The agents of a duet run and the machinery they share.
//!
//! [`moderator::Moderator`] plans and reviews, [`tech_lead::TechLead`]
//! implements, and both implement [`runtime::Agent`] so the
//! [`supervisor::Supervisor`] can run them on their own workers.

pub mod backend;
pub mod error;
pub mod improvement;
pub mod moderator;
pub mod planner;
pub mod review;
pub mod runtime;
pub mod state_machine;
pub mod supervisor;
pub mod tech_lead;

pub use error::{AgentError, ErrorClass};
pub use moderator::Moderator;
pub use runtime::{Agent, AgentContext, AgentKind, TaskOutcome};
pub use supervisor::Supervisor;
pub use tech_lead::TechLead;
