//! Message routing between the agents of one project.

pub mod bus;
pub mod protocol;

pub use bus::{BusError, MessageBus};
pub use protocol::{HandlerError, MessageHandler};
