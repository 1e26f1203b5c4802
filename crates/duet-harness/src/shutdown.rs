use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Cooperative shutdown shared by every agent worker of a run.
///
/// Workers call [`ShutdownSignal::register`] to obtain a [`WorkerGuard`],
/// poll [`ShutdownSignal::is_shutting_down`] between processing steps (or
/// `select!` on [`ShutdownSignal::subscribe`]) and drop the guard once
/// their state is flushed. The owner triggers and then waits for every
/// registered worker with [`ShutdownSignal::wait_for_drain`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    /// Names of workers that registered and have not yet drained.
    outstanding: Arc<Mutex<BTreeSet<String>>>,
    drain_tx: Arc<watch::Sender<usize>>,
    drain_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        let (drain_tx, drain_rx) = watch::channel(0);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            outstanding: Arc::new(Mutex::new(BTreeSet::new())),
            drain_tx: Arc::new(drain_tx),
            drain_rx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Trigger shutdown for all subscribers. Repeated calls are no-ops.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!(workers = self.outstanding().len(), "shutdown signal triggered");
            let _ = self.trigger.send(());
        }
    }

    /// Register a named worker that must drain before shutdown completes.
    pub fn register(&self, worker: impl Into<String>) -> WorkerGuard {
        let name = worker.into();
        if let Ok(mut set) = self.outstanding.lock() {
            set.insert(name.clone());
        }
        self.bump();
        WorkerGuard {
            signal: self.clone(),
            name,
        }
    }

    /// Workers that registered and have not confirmed their drain.
    pub fn outstanding(&self) -> Vec<String> {
        self.outstanding
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn confirm_drained(&self, worker: &str) {
        if let Ok(mut set) = self.outstanding.lock() {
            set.remove(worker);
        }
        self.bump();
    }

    fn bump(&self) {
        self.drain_tx.send_modify(|generation| *generation += 1);
    }

    /// Wait until every registered worker has drained, or `timeout` expires.
    pub async fn wait_for_drain(&self, timeout: Duration) -> DrainResult {
        let mut rx = self.drain_rx.clone();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let pending = self.outstanding();
            if pending.is_empty() {
                info!("all workers drained");
                return DrainResult::Complete;
            }

            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return DrainResult::Complete,
                Err(_) => {
                    let pending = self.outstanding();
                    if pending.is_empty() {
                        return DrainResult::Complete;
                    }
                    warn!(?pending, "drain timeout, workers still running");
                    return DrainResult::Timeout { pending };
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// DrainResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete,
    /// The grace period expired with these workers still registered.
    Timeout { pending: Vec<String> },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete)
    }
}

// ---------------------------------------------------------------------------
// WorkerGuard
// ---------------------------------------------------------------------------

/// Confirms the worker's drain when dropped.
#[derive(Debug)]
pub struct WorkerGuard {
    signal: ShutdownSignal,
    name: String,
}

impl WorkerGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_idempotent_and_shared_by_clones() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_shutting_down());
        signal.trigger();
        signal.trigger();
        assert!(clone.is_shutting_down());
    }

    #[tokio::test]
    async fn subscriber_wakes_on_trigger() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        signal.trigger();
        let woke = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(woke.is_ok());
    }

    #[tokio::test]
    async fn drain_completes_when_guards_drop() {
        let signal = ShutdownSignal::new();
        let moderator = signal.register("moderator");
        let tech_lead = signal.register("tech_lead");
        assert_eq!(signal.outstanding(), vec!["moderator", "tech_lead"]);

        signal.trigger();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(moderator);
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(tech_lead);
        });

        let result = signal.wait_for_drain(Duration::from_secs(1)).await;
        assert!(result.is_complete());
        assert!(signal.outstanding().is_empty());
    }

    #[tokio::test]
    async fn drain_timeout_names_stragglers() {
        let signal = ShutdownSignal::new();
        let _monitor = signal.register("monitor");
        signal.trigger();

        let result = signal.wait_for_drain(Duration::from_millis(30)).await;
        assert_eq!(
            result,
            DrainResult::Timeout {
                pending: vec!["monitor".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn no_workers_drains_immediately() {
        let signal = ShutdownSignal::new();
        assert!(signal
            .wait_for_drain(Duration::from_millis(1))
            .await
            .is_complete());
    }
}
