//! Impression and conversion events: building, batching and delivery.
mod batch_event_processor;
mod durable_store;
mod event_builder;
mod event_dispatcher;
mod events_store;
mod persistent_cache;
mod user_event;

pub use batch_event_processor::{BatchEventProcessor, DispatchingDrain, EventDrain};
pub use durable_store::DurableRetryStore;
pub use event_builder::{
    event_endpoint, format_events, make_event_batch, BatchAttribute, BatchDecision, BatchVisitor,
    DecisionMetadata, EventBatch, LogEvent, Snapshot, SnapshotEvent, EU_EVENT_ENDPOINT,
    US_EVENT_ENDPOINT,
};
pub use event_dispatcher::{DispatchResponse, EventDispatcher, HttpEventDispatcher};
pub use events_store::EventsStore;
pub use persistent_cache::{InMemoryPersistentCache, PersistentCache};
pub use user_event::{
    ConversionEvent, EntityRef, EventContext, EventTags, ImpressionEvent, UserEvent, Visitor,
    VisitorAttribute,
};

#[cfg(test)]
pub(crate) use event_dispatcher::RecordingDispatcher;
