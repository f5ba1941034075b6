use meshcore::{EventBus, EventType};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_events_arrive_in_sequence_order() {
    init_tracing();

    let bus = Arc::new(EventBus::new(16));
    let execution = Uuid::new_v4();
    let mut sub = bus.subscribe();
    let emitter = bus.create_emitter(execution);

    emitter.execution(EventType::ExecutionStarted, json!({"flow": "demo"}));
    emitter.step(EventType::StepStarted, "a", json!({}));
    emitter.step(EventType::StepCompleted, "a", json!({}));
    emitter.execution(EventType::ExecutionCompleted, json!({}));

    let events = sub.drain();
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    assert_eq!(events[1].step_id.as_deref(), Some("a"));
    assert_eq!(events[3].event_type, EventType::ExecutionCompleted);
}

#[tokio::test]
async fn test_slow_subscriber_is_disconnected_without_blocking() {
    init_tracing();

    let bus = Arc::new(EventBus::new(2));
    let emitter = bus.create_emitter(Uuid::new_v4());
    let mut slow = bus.subscribe();
    let mut fast = bus.subscribe();

    emitter.step(EventType::StepStarted, "a", json!({}));
    emitter.step(EventType::StepCompleted, "a", json!({}));
    assert_eq!(fast.drain().len(), 2);

    // Third event overflows the slow subscriber's buffer of two.
    emitter.step(EventType::StepStarted, "b", json!({}));
    assert_eq!(bus.subscriber_count(), 1);
    assert!(slow.is_lagged());
    assert!(!fast.is_lagged());

    assert!(slow.recv().await.is_some());
    assert!(slow.recv().await.is_some());
    assert!(slow.recv().await.is_none());

    emitter.step(EventType::StepCompleted, "b", json!({}));
    assert_eq!(fast.drain().len(), 2);
}

#[tokio::test]
async fn test_execution_filter() {
    let bus = Arc::new(EventBus::new(8));
    let wanted = Uuid::new_v4();
    let mut sub = bus.subscribe_execution(wanted);

    bus.create_emitter(Uuid::new_v4())
        .execution(EventType::ExecutionStarted, json!({}));
    bus.create_emitter(wanted)
        .execution(EventType::ExecutionStarted, json!({}));

    let events = sub.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].execution_id, wanted);
}

#[tokio::test]
async fn test_dropped_subscription_is_pruned() {
    let bus = Arc::new(EventBus::new(8));
    let emitter = bus.create_emitter(Uuid::new_v4());
    let sub = bus.subscribe();
    drop(sub);

    emitter.execution(EventType::ExecutionStarted, json!({}));
    assert_eq!(bus.subscriber_count(), 0);
}

#[test]
fn test_event_wire_format() {
    let bus = Arc::new(EventBus::default());
    let mut sub = bus.subscribe();
    bus.create_emitter(Uuid::new_v4())
        .step(EventType::StepFailed, "login", json!({"error": "boom"}));

    let event = sub.try_recv().unwrap();
    let wire = serde_json::to_value(&event).unwrap();
    assert_eq!(wire["type"], "step.failed");
    assert_eq!(wire["step_id"], "login");
    assert_eq!(wire["data"]["error"], "boom");
}
