//! Reliability plumbing for agent workers: cooperative shutdown with
//! per-worker drain tracking, and bounded retry of transient failures.

pub mod retry;
pub mod shutdown;
