//! Threshold alerting with sustained-violation counting and per-metric
//! suppression.
//!
//! For each tracked metric the detector keeps the length of the current
//! violation streak and when it last alerted. A sample outside the bounds
//! extends the streak; an in-range sample resets both. An alert fires once
//! the streak reaches `sustained` and the previous alert for the metric is
//! at least `suppression_mins` old. Sample timestamps drive the window, so
//! replayed or backdated samples behave the same as live ones.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use duet_core::config::ThresholdConfig;
use duet_core::store::{Store, StoreError};
use duet_core::types::{Alert, Metric};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("alert could not be persisted: {0}")]
    Store(#[from] StoreError),

    #[error("threshold for '{metric}' rejected: {reason}")]
    InvalidThreshold { metric: String, reason: String },
}

pub type Result<T> = std::result::Result<T, DetectorError>;

#[derive(Debug, Default, Clone)]
struct Streak {
    count: u32,
    last_alert: Option<DateTime<Utc>>,
}

pub struct AnomalyDetector {
    project_id: Uuid,
    store: Store,
    rules: HashMap<String, ThresholdConfig>,
    streaks: HashMap<String, Streak>,
}

impl AnomalyDetector {
    /// Build a detector for one project. Rules that fail validation are
    /// logged and left out; the remaining metrics are still tracked.
    pub fn new(project_id: Uuid, store: Store, thresholds: &[ThresholdConfig]) -> Self {
        let mut detector = Self {
            project_id,
            store,
            rules: HashMap::new(),
            streaks: HashMap::new(),
        };
        for rule in thresholds {
            if let Err(e) = detector.add_rule(rule.clone()) {
                warn!(%project_id, error = %e, "threshold skipped");
            }
        }
        detector
    }

    /// Track a metric, replacing any earlier rule for it.
    pub fn add_rule(&mut self, rule: ThresholdConfig) -> Result<()> {
        rule.check().map_err(|e| DetectorError::InvalidThreshold {
            metric: rule.metric.clone(),
            reason: e.to_string(),
        })?;
        self.streaks.remove(&rule.metric);
        self.rules.insert(rule.metric.clone(), rule);
        Ok(())
    }

    pub fn tracked_metrics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rules.keys().cloned().collect();
        names.sort();
        names
    }

    /// Consecutive violating samples seen for `metric`.
    pub fn streak(&self, metric: &str) -> u32 {
        self.streaks.get(metric).map(|s| s.count).unwrap_or(0)
    }

    /// Pick up suppression windows from alerts persisted by an earlier
    /// detector for this project. Streak counts start from zero.
    pub async fn restore(&mut self) -> Result<()> {
        let alerts = self.store.alert_history(self.project_id).await?;
        for alert in alerts {
            if !self.rules.contains_key(&alert.metric) {
                continue;
            }
            let streak = self.streaks.entry(alert.metric).or_default();
            if streak.last_alert.map_or(true, |last| alert.created_at > last) {
                streak.last_alert = Some(alert.created_at);
            }
        }
        Ok(())
    }

    /// Feed one sample. Returns the alert it raised, already persisted.
    pub async fn observe(&mut self, sample: &Metric) -> Result<Option<Alert>> {
        let Some(rule) = self.rules.get(&sample.name) else {
            return Ok(None);
        };
        if !sample.value.is_finite() {
            warn!(project_id = %self.project_id, metric = %sample.name, "non-finite sample ignored");
            return Ok(None);
        }

        let streak = self.streaks.entry(sample.name.clone()).or_default();
        let Some(bound) = violated_bound(rule, sample.value) else {
            if streak.count > 0 {
                debug!(metric = %sample.name, value = sample.value, "metric back in range");
            }
            *streak = Streak::default();
            return Ok(None);
        };

        streak.count += 1;
        if streak.count < rule.sustained {
            debug!(
                metric = %sample.name,
                value = sample.value,
                streak = streak.count,
                sustained = rule.sustained,
                "violation below sustained count"
            );
            return Ok(None);
        }
        let Some(window) = rule.suppression_window() else {
            warn!(project_id = %self.project_id, metric = %sample.name, "suppression window out of range");
            return Ok(None);
        };
        if let Some(last) = streak.last_alert {
            if sample.timestamp - last < window {
                debug!(metric = %sample.name, last_alert = %last, "alert suppressed");
                return Ok(None);
            }
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            project_id: self.project_id,
            metric: sample.name.clone(),
            threshold: bound.value(),
            observed: sample.value,
            severity: rule.severity,
            message: format!(
                "{} = {:.3} {} for {} consecutive samples",
                sample.name,
                sample.value,
                bound.describe(),
                streak.count
            ),
            acknowledged_by: None,
            acknowledged_at: None,
            created_at: sample.timestamp,
        };
        let count = streak.count;
        self.store.insert_alert(&alert).await?;
        if let Some(streak) = self.streaks.get_mut(&sample.name) {
            streak.last_alert = Some(sample.timestamp);
        }
        info!(
            project_id = %self.project_id,
            metric = %alert.metric,
            severity = %alert.severity,
            observed = alert.observed,
            threshold = alert.threshold,
            streak = count,
            "alert raised"
        );
        Ok(Some(alert))
    }
}

#[derive(Debug, Clone, Copy)]
enum Bound {
    Below(f64),
    Above(f64),
}

impl Bound {
    fn value(&self) -> f64 {
        match self {
            Bound::Below(v) | Bound::Above(v) => *v,
        }
    }

    fn describe(&self) -> String {
        match self {
            Bound::Below(v) => format!("below min {:.3}", v),
            Bound::Above(v) => format!("above max {:.3}", v),
        }
    }
}

fn violated_bound(rule: &ThresholdConfig, value: f64) -> Option<Bound> {
    if let Some(min) = rule.min {
        if value < min {
            return Some(Bound::Below(min));
        }
    }
    match rule.max {
        Some(max) if value > max => Some(Bound::Above(max)),
        _ => None,
    }
}
