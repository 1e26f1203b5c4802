use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::AlertSeverity;

/// Top-level configuration loaded from `~/.duet/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub improvement: ImprovementConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

impl Config {
    /// Load config from `~/.duet/config.toml`, falling back to defaults when
    /// the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    ///
    /// Metric thresholds are deliberately not validated here: a bad threshold
    /// disables only that metric (see `ThresholdConfig::check`).
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.review.validate()?;
        self.improvement.validate()?;
        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "monitor.interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".duet")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Root under which per-project artifacts are written.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            workspace_root: default_workspace_root(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_workspace_root() -> String {
    "~/.duet/workspaces".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.duet/duet.db".into()
}

/// Points available per review category. Must sum to 100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewWeights {
    #[serde(default = "default_quality_weight")]
    pub quality: u32,
    #[serde(default = "default_testing_weight")]
    pub testing: u32,
    #[serde(default = "default_documentation_weight")]
    pub documentation: u32,
    #[serde(default = "default_criteria_weight")]
    pub criteria: u32,
}

impl ReviewWeights {
    pub fn total(&self) -> u32 {
        self.quality + self.testing + self.documentation + self.criteria
    }
}

impl Default for ReviewWeights {
    fn default() -> Self {
        Self {
            quality: default_quality_weight(),
            testing: default_testing_weight(),
            documentation: default_documentation_weight(),
            criteria: default_criteria_weight(),
        }
    }
}

fn default_quality_weight() -> u32 {
    30
}
fn default_testing_weight() -> u32 {
    30
}
fn default_documentation_weight() -> u32 {
    20
}
fn default_criteria_weight() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default = "default_approval_threshold")]
    pub approval_threshold: u32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub weights: ReviewWeights,
}

impl ReviewConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.approval_threshold > 100 {
            return Err(ConfigError::Validation(format!(
                "review.approval_threshold must be <= 100, got {}",
                self.approval_threshold
            )));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::Validation(
                "review.max_iterations must be at least 1".into(),
            ));
        }
        if self.weights.total() != 100 {
            return Err(ConfigError::Validation(format!(
                "review.weights must sum to 100, got {}",
                self.weights.total()
            )));
        }
        Ok(())
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            approval_threshold: default_approval_threshold(),
            max_iterations: default_max_iterations(),
            weights: ReviewWeights::default(),
        }
    }
}

fn default_approval_threshold() -> u32 {
    80
}
fn default_max_iterations() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementConfig {
    /// How many candidates become tasks. 0 skips the cycle.
    #[serde(default = "default_improvement_max_tasks")]
    pub max_tasks: usize,
    #[serde(default = "default_impact_weight")]
    pub impact_weight: f64,
    #[serde(default = "default_effort_weight")]
    pub effort_weight: f64,
    #[serde(default = "default_acceptance_weight")]
    pub acceptance_weight: f64,
}

impl ImprovementConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let weights = [self.impact_weight, self.effort_weight, self.acceptance_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::Validation(
                "improvement weights must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ImprovementConfig {
    fn default() -> Self {
        Self {
            max_tasks: default_improvement_max_tasks(),
            impact_weight: default_impact_weight(),
            effort_weight: default_effort_weight(),
            acceptance_weight: default_acceptance_weight(),
        }
    }
}

fn default_improvement_max_tasks() -> usize {
    3
}
fn default_impact_weight() -> f64 {
    0.5
}
fn default_effort_weight() -> f64 {
    0.3
}
fn default_acceptance_weight() -> f64 {
    0.2
}

/// Per-metric alerting rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub metric: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default = "default_threshold_severity")]
    pub severity: AlertSeverity,
    /// Consecutive violating samples required before alerting.
    #[serde(default = "default_sustained")]
    pub sustained: u32,
    #[serde(default = "default_suppression_mins")]
    pub suppression_mins: i64,
}

impl ThresholdConfig {
    pub fn max(metric: impl Into<String>, max: f64, severity: AlertSeverity) -> Self {
        Self {
            metric: metric.into(),
            min: None,
            max: Some(max),
            severity,
            sustained: default_sustained(),
            suppression_mins: default_suppression_mins(),
        }
    }

    pub fn min(metric: impl Into<String>, min: f64, severity: AlertSeverity) -> Self {
        Self {
            metric: metric.into(),
            min: Some(min),
            max: None,
            severity,
            sustained: default_sustained(),
            suppression_mins: default_suppression_mins(),
        }
    }

    /// Reject rules that can never evaluate sensibly.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.metric.trim().is_empty() {
            return Err(ConfigError::Validation("threshold metric name is empty".into()));
        }
        if self.min.is_none() && self.max.is_none() {
            return Err(ConfigError::Validation(format!(
                "threshold for {} has neither min nor max",
                self.metric
            )));
        }
        if self.min.is_some_and(|v| !v.is_finite()) || self.max.is_some_and(|v| !v.is_finite()) {
            return Err(ConfigError::Validation(format!(
                "threshold for {} is not finite",
                self.metric
            )));
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(ConfigError::Validation(format!(
                    "threshold for {}: min {} > max {}",
                    self.metric, min, max
                )));
            }
        }
        if self.sustained == 0 {
            return Err(ConfigError::Validation(format!(
                "threshold for {}: sustained must be at least 1",
                self.metric
            )));
        }
        if self.suppression_mins < 0 {
            return Err(ConfigError::Validation(format!(
                "threshold for {}: suppression window is negative",
                self.metric
            )));
        }
        if self.suppression_window().is_none() {
            return Err(ConfigError::Validation(format!(
                "threshold for {}: suppression window of {} minutes is out of range",
                self.metric, self.suppression_mins
            )));
        }
        Ok(())
    }

    /// `None` when `suppression_mins` does not fit a duration.
    pub fn suppression_window(&self) -> Option<chrono::Duration> {
        chrono::Duration::try_minutes(self.suppression_mins)
    }
}

fn default_threshold_severity() -> AlertSeverity {
    AlertSeverity::Warning
}
fn default_sustained() -> u32 {
    2
}
fn default_suppression_mins() -> i64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<ThresholdConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            thresholds: default_thresholds(),
        }
    }
}

fn default_monitor_interval() -> u64 {
    60
}
fn default_thresholds() -> Vec<ThresholdConfig> {
    vec![
        ThresholdConfig::max("error_rate", 0.15, AlertSeverity::Critical),
        ThresholdConfig::max("review_rejection_rate", 0.5, AlertSeverity::Warning),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// HTTP code-generation endpoint. Unset falls back to the offline scaffold generator.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_backend_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_backend_timeout() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Stop the project once this many tasks have failed.
    #[serde(default = "default_max_failed_tasks")]
    pub max_failed_tasks: usize,
    #[serde(default)]
    pub stop_on_critical_alert: bool,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_shutdown_grace(),
            poll_interval_ms: default_poll_interval(),
            max_failed_tasks: default_max_failed_tasks(),
            stop_on_critical_alert: false,
        }
    }
}

fn default_shutdown_grace() -> u64 {
    3
}
fn default_poll_interval() -> u64 {
    250
}
fn default_max_failed_tasks() -> usize {
    3
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}
