//! Logging setup and in-process counters for duet services.

pub mod logging;
pub mod metrics;
