use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Lifecycle notifications emitted while a flow runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "execution.started")]
    ExecutionStarted,
    #[serde(rename = "execution.completed")]
    ExecutionCompleted,
    #[serde(rename = "execution.failed")]
    ExecutionFailed,
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.failed")]
    StepFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ExecutionStarted => "execution.started",
            EventType::ExecutionCompleted => "execution.completed",
            EventType::ExecutionFailed => "execution.failed",
            EventType::StepStarted => "step.started",
            EventType::StepCompleted => "step.completed",
            EventType::StepFailed => "step.failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub execution_id: ExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Monotonic per execution, starting at zero.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

struct Subscriber {
    id: u64,
    execution: Option<ExecutionId>,
    sender: mpsc::Sender<ExecutionEvent>,
    lagged: Arc<AtomicBool>,
}

/// Fan-out bus with a bounded buffer per subscriber.
///
/// Publishing never waits. A subscriber whose buffer is full is dropped and
/// sees the end of its stream once it drains what it already has.
pub struct EventBus {
    capacity: usize,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Receive events from every execution.
    pub fn subscribe(&self) -> Subscription {
        self.add_subscriber(None)
    }

    /// Receive events from one execution only.
    pub fn subscribe_execution(&self, execution_id: ExecutionId) -> Subscription {
        self.add_subscriber(Some(execution_id))
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    pub fn create_emitter(self: &Arc<Self>, execution_id: ExecutionId) -> EventEmitter {
        EventEmitter {
            execution_id,
            bus: Arc::clone(self),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    fn add_subscriber(&self, execution: Option<ExecutionId>) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let lagged = Arc::new(AtomicBool::new(false));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push(Subscriber {
            id,
            execution,
            sender,
            lagged: Arc::clone(&lagged),
        });
        debug!(subscriber = id, "Event subscriber added");
        Subscription { receiver, lagged }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Build and deliver one event while holding the subscriber lock, so
    /// sequence order and delivery order agree.
    fn publish(&self, build: impl FnOnce() -> ExecutionEvent) {
        let mut subscribers = self.lock();
        let event = build();
        subscribers.retain(|sub| {
            if sub.execution.is_some_and(|id| id != event.execution_id) {
                return true;
            }
            match sub.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        subscriber = sub.id,
                        event = event.event_type.as_str(),
                        "Event subscriber buffer full, disconnecting"
                    );
                    sub.lagged.store(true, Ordering::Release);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber = sub.id, "Event subscriber gone");
                    false
                }
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Per-execution handle that stamps sequence numbers.
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    bus: Arc<EventBus>,
    sequence: Arc<AtomicU64>,
}

impl EventEmitter {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn emit(&self, event_type: EventType, step_id: Option<&str>, data: Value) {
        self.bus.publish(|| ExecutionEvent {
            event_type,
            execution_id: self.execution_id,
            step_id: step_id.map(str::to_string),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            data,
        });
    }

    pub fn execution(&self, event_type: EventType, data: Value) {
        self.emit(event_type, None, data);
    }

    pub fn step(&self, event_type: EventType, step_id: &str, data: Value) {
        self.emit(event_type, Some(step_id), data);
    }
}

/// Receiving end of a bus subscription.
pub struct Subscription {
    receiver: mpsc::Receiver<ExecutionEvent>,
    lagged: Arc<AtomicBool>,
}

impl Subscription {
    /// Next event, or `None` once the bus dropped this subscriber and the
    /// buffer is drained.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ExecutionEvent> {
        self.receiver.try_recv().ok()
    }

    /// Everything currently buffered.
    pub fn drain(&mut self) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    /// True if the bus disconnected this subscriber for falling behind.
    pub fn is_lagged(&self) -> bool {
        self.lagged.load(Ordering::Acquire)
    }
}
