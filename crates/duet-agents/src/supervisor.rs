use std::sync::{Arc, Mutex};
use std::time::Duration;

use duet_bridge::MessageBus;
use duet_core::message::AgentMessage;
use duet_harness::shutdown::{DrainResult, ShutdownSignal};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, ErrorClass};
use crate::runtime::{Agent, AgentHandler};

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Runs one worker task per agent and tears them down together.
///
/// A worker drains its agent's queue, and for agents with a tick interval
/// also calls `tick` on that schedule. The shutdown signal is observed
/// between steps and while a step is awaiting. A fatal error from any
/// agent is recorded and shuts the whole run down.
pub struct Supervisor {
    shutdown: ShutdownSignal,
    poll_interval: Duration,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
    fatal: Arc<Mutex<Option<String>>>,
}

impl Supervisor {
    pub fn new(shutdown: ShutdownSignal, poll_interval: Duration) -> Self {
        Self {
            shutdown,
            poll_interval,
            handles: Mutex::new(Vec::new()),
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Register `agent` with the bus and start its worker.
    pub async fn spawn_worker(&self, agent: Arc<dyn Agent>, bus: &MessageBus) -> Result<(), AgentError> {
        bus.register(Arc::new(AgentHandler(Arc::clone(&agent))))?;
        agent.on_start().await?;

        let id = agent.id().to_string();
        let worker = format!("{}:{}", bus.project_id(), id);
        let guard = self.shutdown.register(worker.clone());
        let shutdown = self.shutdown.clone();
        let fatal = Arc::clone(&self.fatal);
        let poll = self.poll_interval;
        let bus = bus.clone();

        let handle = tokio::spawn(async move {
            let mut stop = shutdown.subscribe();
            // First tick one period after start, not immediately.
            let mut ticker = agent
                .tick_interval()
                .map(|period| tokio::time::interval_at(tokio::time::Instant::now() + period, period));
            info!(agent = %agent.id(), kind = %agent.kind(), "agent worker started");

            loop {
                if shutdown.is_shutting_down() {
                    break;
                }

                let step = tokio::select! {
                    _ = stop.recv() => break,
                    _ = next_tick(&mut ticker) => agent.tick().await,
                    next = bus.deliver_next(agent.id(), poll) => match next {
                        Ok(Some(msg)) => {
                            tokio::select! {
                                _ = stop.recv() => break,
                                res = handle_message(agent.as_ref(), &bus, msg) => res,
                            }
                        }
                        Ok(None) => Ok(()),
                        Err(e) => Err(e.into()),
                    },
                };

                if let Err(e) = step {
                    match e.class() {
                        ErrorClass::Fatal => {
                            error!(agent = %agent.id(), error = %e, "fatal agent error, shutting down run");
                            if let Ok(mut slot) = fatal.lock() {
                                slot.get_or_insert_with(|| format!("{}: {}", agent.id(), e));
                            }
                            shutdown.trigger();
                            break;
                        }
                        class => warn!(agent = %agent.id(), ?class, error = %e, "agent step failed"),
                    }
                }
            }

            if let Err(e) = agent.on_stop().await {
                warn!(agent = %agent.id(), error = %e, "on_stop failed");
            }
            info!(agent = %agent.id(), "agent worker stopped");
            drop(guard);
        });

        if let Ok(mut handles) = self.handles.lock() {
            handles.push((worker, handle));
        }
        Ok(())
    }

    /// Names of the workers started so far.
    pub fn workers(&self) -> Vec<String> {
        self.handles
            .lock()
            .map(|h| h.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    /// First fatal error reported by any worker.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().ok().and_then(|slot| slot.clone())
    }

    /// Signal every worker and wait up to `grace` for them to drain.
    /// Workers still running afterwards are aborted.
    pub async fn shutdown(&self, grace: Duration) -> DrainResult {
        self.shutdown.trigger();
        let result = self.shutdown.wait_for_drain(grace).await;
        let handles = self
            .handles
            .lock()
            .map(|mut h| std::mem::take(&mut *h))
            .unwrap_or_default();
        for (name, handle) in handles {
            if !handle.is_finished() {
                warn!(worker = %name, "aborting worker after grace period");
                handle.abort();
            }
        }
        result
    }
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Hand a queued message to the agent and route any reply it produces.
async fn handle_message(agent: &dyn Agent, bus: &MessageBus, msg: AgentMessage) -> Result<(), AgentError> {
    debug!(agent = %agent.id(), kind = %msg.kind(), message_id = %msg.id, "processing queued message");
    if let Some(reply) = agent.receive(msg).await? {
        bus.send(reply).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::runtime::{AgentKind, TaskOutcome};
    use crate::state_machine::AgentState;
    use async_trait::async_trait;
    use duet_core::message::MessagePayload;
    use duet_core::store::Store;
    use duet_core::types::Task;
    use duet_telemetry::metrics::MetricsCollector;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct Counter {
        id: String,
        seen: AtomicUsize,
        fail_with_fatal: bool,
    }

    #[async_trait]
    impl Agent for Counter {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> AgentKind {
            AgentKind::Monitor
        }

        fn state(&self) -> AgentState {
            AgentState::Idle
        }

        async fn receive(&self, _msg: AgentMessage) -> Result<Option<AgentMessage>> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail_with_fatal {
                return Err(AgentError::Bus(duet_bridge::BusError::Unroutable("ghost".into())));
            }
            Ok(None)
        }

        async fn run(&self, _task: Task) -> Result<TaskOutcome> {
            Err(AgentError::Unsupported {
                agent: self.id.clone(),
                operation: "run",
            })
        }
    }

    fn status() -> MessagePayload {
        MessagePayload::Status {
            state: "ping".into(),
            detail: String::new(),
        }
    }

    async fn bus() -> MessageBus {
        let store = Store::open_in_memory().await.unwrap();
        MessageBus::new(Uuid::new_v4(), store, Arc::new(MetricsCollector::new()))
    }

    #[tokio::test]
    async fn worker_drains_queue_and_stops_within_grace() {
        let bus = bus().await;
        let sup = Supervisor::new(ShutdownSignal::new(), Duration::from_millis(20));
        let agent = Arc::new(Counter {
            id: "counter".into(),
            seen: AtomicUsize::new(0),
            fail_with_fatal: false,
        });
        sup.spawn_worker(agent.clone(), &bus).await.unwrap();

        for _ in 0..3 {
            bus.send(AgentMessage::notify(bus.project_id(), "test", "counter", status()))
                .await
                .unwrap();
        }
        for _ in 0..50 {
            if agent.seen.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(agent.seen.load(Ordering::SeqCst), 3);

        let drained = sup.shutdown(Duration::from_secs(2)).await;
        assert!(drained.is_complete());
        assert!(sup.fatal_error().is_none());
    }

    #[tokio::test]
    async fn fatal_error_shuts_the_run_down() {
        let bus = bus().await;
        let sup = Supervisor::new(ShutdownSignal::new(), Duration::from_millis(20));
        let agent = Arc::new(Counter {
            id: "doomed".into(),
            seen: AtomicUsize::new(0),
            fail_with_fatal: true,
        });
        sup.spawn_worker(agent, &bus).await.unwrap();
        bus.send(AgentMessage::notify(bus.project_id(), "test", "doomed", status()))
            .await
            .unwrap();

        let drained = sup.shutdown_signal().wait_for_drain(Duration::from_secs(2)).await;
        assert!(drained.is_complete());
        assert!(sup.shutdown_signal().is_shutting_down());
        assert!(sup.fatal_error().unwrap().contains("doomed"));
    }

    #[tokio::test]
    async fn duplicate_agent_ids_are_rejected() {
        let bus = bus().await;
        let sup = Supervisor::new(ShutdownSignal::new(), Duration::from_millis(20));
        let make = || {
            Arc::new(Counter {
                id: "twin".into(),
                seen: AtomicUsize::new(0),
                fail_with_fatal: false,
            })
        };
        sup.spawn_worker(make(), &bus).await.unwrap();
        assert!(sup.spawn_worker(make(), &bus).await.is_err());
        sup.shutdown(Duration::from_secs(1)).await;
    }
}
