use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use duet_bridge::{BusError, HandlerError, MessageBus, MessageHandler};
use duet_core::message::{AgentMessage, MessageKind, MessagePayload};
use duet_core::store::Store;
use duet_telemetry::metrics::{MetricsCollector, MESSAGES_ROUTED};
use uuid::Uuid;

/// Answers every request, or nothing when `silent`.
struct Responder {
    id: &'static str,
    silent: bool,
    handled: AtomicUsize,
}

impl Responder {
    fn new(id: &'static str, silent: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            silent,
            handled: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl MessageHandler for Responder {
    fn id(&self) -> &str {
        self.id
    }

    async fn handle(&self, msg: AgentMessage) -> Result<Option<AgentMessage>, HandlerError> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        if self.silent {
            return Ok(None);
        }
        Ok(Some(msg.reply(MessagePayload::Status {
            state: "idle".into(),
            detail: "ack".into(),
        })))
    }
}

fn status(detail: &str) -> MessagePayload {
    MessagePayload::Status {
        state: "processing".into(),
        detail: detail.into(),
    }
}

#[tokio::test]
async fn every_request_has_exactly_one_logged_response() {
    let store = Store::open_in_memory().await.unwrap();
    let bus = MessageBus::new(Uuid::new_v4(), store, Arc::new(MetricsCollector::new()));
    let moderator = Responder::new("moderator", false);
    bus.register(moderator.clone()).unwrap();
    bus.register(Responder::new("tech_lead", false)).unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let bus = bus.clone();
        handles.push(tokio::spawn(async move {
            let req = AgentMessage::request(
                bus.project_id(),
                "tech_lead",
                "moderator",
                status(&i.to_string()),
            );
            bus.send(req).await
        }));
    }
    for h in handles {
        assert!(h.await.unwrap().unwrap().is_some());
    }
    assert_eq!(moderator.handled.load(Ordering::SeqCst), 8);

    let history = bus.history().await.unwrap();
    let requests: Vec<_> = history.iter().filter(|m| m.requires_response).collect();
    assert_eq!(requests.len(), 8);
    for req in requests {
        let responses = history
            .iter()
            .filter(|m| !m.requires_response && m.correlation_id == Some(req.id))
            .count();
        assert_eq!(responses, 1, "request {} answered {} times", req.id, responses);
    }
    assert_eq!(bus.metrics().sum_counter(MESSAGES_ROUTED, &[("mode", "sync")]), 8);
}

#[tokio::test]
async fn silent_handler_fails_the_request() {
    let store = Store::open_in_memory().await.unwrap();
    let bus = MessageBus::new(Uuid::new_v4(), store, Arc::new(MetricsCollector::new()));
    bus.register(Responder::new("moderator", true)).unwrap();

    let req = AgentMessage::request(bus.project_id(), "tech_lead", "moderator", status("x"));
    let err = bus.send(req.clone()).await.unwrap_err();
    assert!(matches!(err, BusError::NoResponse { request, .. } if request == req.id));

    let log = bus.conversation(req.id).await.unwrap();
    assert_eq!(log.len(), 2);
    assert!(matches!(&log[1].payload, MessagePayload::Status { state, .. } if state == "error"));
}

/// Refuses every request, the way a stopped project's Moderator does.
struct Refuser;

#[async_trait::async_trait]
impl MessageHandler for Refuser {
    fn id(&self) -> &str {
        "moderator"
    }

    async fn handle(&self, _msg: AgentMessage) -> Result<Option<AgentMessage>, HandlerError> {
        Err("project is stopped".into())
    }
}

#[tokio::test]
async fn handler_error_still_logs_one_response() {
    let store = Store::open_in_memory().await.unwrap();
    let bus = MessageBus::new(Uuid::new_v4(), store, Arc::new(MetricsCollector::new()));
    bus.register(Arc::new(Refuser)).unwrap();

    let req = AgentMessage::request(bus.project_id(), "tech_lead", "moderator", status("submit"));
    let err = bus.send(req.clone()).await.unwrap_err();
    assert!(matches!(err, BusError::Handler { request, .. } if request == req.id));

    let log = bus.conversation(req.id).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].id, req.id);
    let reply = &log[1];
    assert!(!reply.requires_response);
    assert_eq!(reply.sender, "moderator");
    assert_eq!(reply.recipient, "tech_lead");
    match &reply.payload {
        MessagePayload::Status { state, detail } => {
            assert_eq!(state, "error");
            assert!(detail.contains("project is stopped"));
        }
        other => panic!("unexpected payload {:?}", other.kind()),
    }
    assert_eq!(bus.metrics().sum_counter(MESSAGES_ROUTED, &[("mode", "sync")]), 0);
}

#[tokio::test]
async fn queued_messages_keep_send_order() {
    let store = Store::open_in_memory().await.unwrap();
    let bus = MessageBus::new(Uuid::new_v4(), store, Arc::new(MetricsCollector::new()));
    bus.register(Responder::new("tech_lead", false)).unwrap();

    for i in 0..3 {
        let msg = AgentMessage::notify(bus.project_id(), "moderator", "tech_lead", status(&i.to_string()));
        bus.send(msg).await.unwrap();
    }

    for i in 0..3 {
        let msg = bus
            .deliver_next("tech_lead", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind(), MessageKind::Status);
        assert_eq!(msg.payload, status(&i.to_string()));
    }
    assert!(matches!(
        bus.deliver_next("ghost", Duration::from_millis(1)).await,
        Err(BusError::Unroutable(_))
    ));
}

#[tokio::test]
async fn buses_sharing_a_store_do_not_leak_history() {
    let store = Store::open_in_memory().await.unwrap();
    let metrics = Arc::new(MetricsCollector::new());
    let a = MessageBus::new(Uuid::new_v4(), store.clone(), metrics.clone());
    let b = MessageBus::new(Uuid::new_v4(), store, metrics);
    a.register(Responder::new("tech_lead", false)).unwrap();
    b.register(Responder::new("tech_lead", false)).unwrap();

    a.send(AgentMessage::notify(a.project_id(), "moderator", "tech_lead", status("a")))
        .await
        .unwrap();

    assert_eq!(a.history().await.unwrap().len(), 1);
    assert!(b.history().await.unwrap().is_empty());
    assert_eq!(b.queue_len("tech_lead"), 0);
}
