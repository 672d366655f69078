use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;

use crate::events::{
    format_events, EventDispatcher, EventDrain, EventsStore, LogEvent, PersistentCache, UserEvent,
};

/// Key of formatted batches waiting for a successful dispatch.
const PENDING_STORE_KEY: &str = "optimizely_pending_events";
/// Key of admitted events not yet folded into a batch.
const BUFFER_STORE_KEY: &str = "optimizely_event_buffer";

/// [`EventDrain`] that persists every batch until the event endpoint accepts it.
///
/// Batches are delivered in the order they were formed: once one fails, every later batch of the
/// same pass is kept for the next pass without being sent. Admitted events are persisted too, so
/// events survive a restart even before they join a batch.
pub struct DurableRetryStore {
    dispatcher: Arc<dyn EventDispatcher>,
    pending: EventsStore<LogEvent>,
    buffer: EventsStore<UserEvent>,
    /// Serializes drains and retry passes.
    drain_lock: tokio::sync::Mutex<()>,
    connected: AtomicBool,
}

impl std::fmt::Debug for DurableRetryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableRetryStore")
            .field("pending", &self.pending)
            .field("buffer", &self.buffer)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

impl DurableRetryStore {
    /// Both the pending batches and the event buffer hold at most `max_size` entries.
    pub fn new(
        dispatcher: Arc<dyn EventDispatcher>,
        cache: Arc<dyn PersistentCache>,
        max_size: usize,
    ) -> DurableRetryStore {
        DurableRetryStore {
            dispatcher,
            pending: EventsStore::new(Arc::clone(&cache), PENDING_STORE_KEY, max_size),
            buffer: EventsStore::new(cache, BUFFER_STORE_KEY, max_size),
            drain_lock: tokio::sync::Mutex::new(()),
            connected: AtomicBool::new(true),
        }
    }

    /// Retry pending batches, then persist `events` as a new batch and send it unless an earlier
    /// batch failed in this pass or the network is known to be down.
    pub async fn drain_queue(&self, events: Vec<UserEvent>) {
        let _guard = self.drain_lock.lock().await;
        let mut skip = !self.connected.load(Ordering::SeqCst);

        self.dispatch_pending_locked(&mut skip).await;

        if events.is_empty() {
            return;
        }

        let batch_id = uuid::Uuid::new_v4().to_string();
        let log_event = format_events(&events);
        let uuids = events.iter().map(UserEvent::uuid).collect::<Vec<_>>();

        if self.pending.set(&batch_id, log_event.clone()).await {
            // The batch now carries these events.
            self.buffer.remove_all(&uuids).await;
            if skip {
                log::debug!(target: "optimizely", batch_id:display = batch_id;
                            "keeping event batch for the next pass");
                return;
            }
            if self.dispatch(&batch_id, &log_event).await {
                self.pending.remove(&batch_id).await;
            }
        } else if !skip && self.dispatch(&batch_id, &log_event).await {
            // The pending store is full. Raw events stay buffered unless the batch went through.
            self.buffer.remove_all(&uuids).await;
        }
    }

    /// Retry every pending batch, in insertion order, stopping at the first failure.
    pub async fn dispatch_pending(&self) {
        let _guard = self.drain_lock.lock().await;
        let mut skip = !self.connected.load(Ordering::SeqCst);
        self.dispatch_pending_locked(&mut skip).await;
    }

    /// Report network availability. Regaining connectivity triggers a retry pass.
    pub async fn set_connectivity(&self, connected: bool) {
        let was_connected = self.connected.swap(connected, Ordering::SeqCst);
        if connected && !was_connected {
            log::debug!(target: "optimizely",
                        "connectivity restored, retrying pending event batches");
            self.dispatch_pending().await;
        }
    }

    /// Batches waiting for delivery, oldest first.
    pub async fn pending_batches(&self) -> Vec<LogEvent> {
        self.pending
            .get_all()
            .await
            .into_iter()
            .map(|(_, batch)| batch)
            .collect()
    }

    async fn dispatch_pending_locked(&self, skip: &mut bool) {
        for (batch_id, log_event) in self.pending.get_all().await {
            if *skip {
                break;
            }
            if self.dispatch(&batch_id, &log_event).await {
                self.pending.remove(&batch_id).await;
            } else {
                *skip = true;
            }
        }
    }

    async fn dispatch(&self, batch_id: &str, log_event: &LogEvent) -> bool {
        match self.dispatcher.dispatch_event(log_event).await {
            Ok(response) if response.is_success() => true,
            Ok(response) => {
                log::warn!(target: "optimizely",
                           batch_id,
                           status_code = response.status_code;
                           "event endpoint rejected batch, will retry");
                false
            }
            Err(err) => {
                log::warn!(target: "optimizely",
                           batch_id,
                           err:display = err;
                           "failed to send event batch, will retry");
                false
            }
        }
    }
}

#[async_trait]
impl EventDrain for DurableRetryStore {
    async fn on_event_admitted(&self, event: &UserEvent) {
        self.buffer.set(event.uuid(), event.clone()).await;
    }

    async fn drain(&self, events: Vec<UserEvent>) {
        self.drain_queue(events).await;
    }

    async fn buffered_events(&self) -> Vec<UserEvent> {
        self.buffer
            .get_all()
            .await
            .into_iter()
            .map(|(_, event)| event)
            .collect()
    }

    async fn retry_pending(&self) {
        self.dispatch_pending().await;
    }
}
