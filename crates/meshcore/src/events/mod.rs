mod base;

pub use base::{EventBus, EventEmitter, EventType, ExecutionEvent, ExecutionId, Subscription};
