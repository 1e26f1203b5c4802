//! Runtime wiring for duet: anomaly detection, the Monitor agent and the
//! orchestrator that runs projects side by side.

pub mod anomaly;
pub mod context;
pub mod monitor;
pub mod orchestrator;

pub use anomaly::{AnomalyDetector, DetectorError};
pub use context::Context;
pub use monitor::{HealthScore, MetricSource, Monitor, PipelineMetricSource};
pub use orchestrator::{Orchestrator, OrchestratorError, ProjectHandle};
