use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    events::{event_builder::is_same_context, format_events, EventDispatcher, UserEvent},
    retry::run_with_retry,
    Error, EventProcessorConfig, Result,
};

/// Destination of flushed batches.
///
/// Batches are handed over one at a time, in flush order.
#[async_trait]
pub trait EventDrain: Send + Sync {
    /// Called for every event admitted by the processor, before it joins a batch.
    async fn on_event_admitted(&self, _event: &UserEvent) {}

    /// Deliver a batch of events sharing one context.
    async fn drain(&self, events: Vec<UserEvent>);

    /// Events admitted before a restart that never made it into a batch.
    async fn buffered_events(&self) -> Vec<UserEvent> {
        Vec::new()
    }

    /// Retry delivery of batches that previously failed.
    async fn retry_pending(&self) {}
}

/// [`EventDrain`] that sends every batch right away, retrying with backoff.
pub struct DispatchingDrain {
    dispatcher: Arc<dyn EventDispatcher>,
    max_retries: Option<u32>,
}

impl DispatchingDrain {
    /// A batch is dropped after `max_retries` failed retries; `None` retries forever.
    pub fn new(dispatcher: Arc<dyn EventDispatcher>, max_retries: Option<u32>) -> DispatchingDrain {
        DispatchingDrain {
            dispatcher,
            max_retries,
        }
    }
}

#[async_trait]
impl EventDrain for DispatchingDrain {
    async fn drain(&self, events: Vec<UserEvent>) {
        if events.is_empty() {
            return;
        }
        let log_event = Arc::new(format_events(&events));
        let dispatcher = Arc::clone(&self.dispatcher);

        let handle = run_with_retry(
            move || {
                let dispatcher = Arc::clone(&dispatcher);
                let log_event = Arc::clone(&log_event);
                async move {
                    let response = dispatcher.dispatch_event(&log_event).await?;
                    if response.is_success() {
                        Ok(())
                    } else {
                        Err(Error::DispatchFailed(response.status_code))
                    }
                }
            },
            None,
            self.max_retries,
        );

        if let Err(err) = handle.result().await {
            log::warn!(target: "optimizely",
                       events = events.len(),
                       err:display = err;
                       "dropping event batch after exhausting retries");
        }
    }
}

enum Job {
    Drain(Vec<UserEvent>),
    RetryPending,
}

struct Queue {
    current: Vec<UserEvent>,
    /// `None` once the processor is stopped.
    jobs: Option<mpsc::UnboundedSender<Job>>,
}

impl Queue {
    fn flush(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.current);
        log::trace!(target: "optimizely", events = batch.len(); "flushing event batch");
        self.send(Job::Drain(batch));
    }

    fn send(&self, job: Job) {
        let Some(jobs) = &self.jobs else {
            return;
        };
        if jobs.send(job).is_err() {
            log::debug!(target: "optimizely", "event drain worker is gone, dropping job");
        }
    }
}

struct Tasks {
    worker: JoinHandle<()>,
    ticker: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Groups events into batches and hands them over to an [`EventDrain`].
///
/// A batch is flushed every `flush_interval`, when it reaches `batch_size`, and before an event
/// with a different context joins it. Batches are drained one at a time, in order.
pub struct BatchEventProcessor {
    batch_size: usize,
    flush_interval: Duration,
    drain: Arc<dyn EventDrain>,
    queue: Arc<Mutex<Queue>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    tasks: Mutex<Option<Tasks>>,
}

impl std::fmt::Debug for BatchEventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEventProcessor")
            .field("batch_size", &self.batch_size)
            .field("flush_interval", &self.flush_interval)
            .finish_non_exhaustive()
    }
}

impl BatchEventProcessor {
    #[allow(missing_docs)]
    pub fn new(config: &EventProcessorConfig, drain: Arc<dyn EventDrain>) -> BatchEventProcessor {
        let (sender, receiver) = mpsc::unbounded_channel();
        BatchEventProcessor {
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
            drain,
            queue: Arc::new(Mutex::new(Queue {
                current: Vec::new(),
                jobs: Some(sender),
            })),
            receiver: Mutex::new(Some(receiver)),
            tasks: Mutex::new(None),
        }
    }

    /// Start the drain worker and the flush ticker, then replay events left over from a previous
    /// run. Must be called within a tokio runtime.
    pub async fn start(&self) {
        let Some(mut receiver) = self.receiver.lock().ok().and_then(|mut it| it.take()) else {
            log::warn!(target: "optimizely", "event processor is already started");
            return;
        };

        let worker = {
            let drain = Arc::clone(&self.drain);
            tokio::spawn(async move {
                while let Some(job) = receiver.recv().await {
                    run_job(&*drain, job).await;
                }
                log::debug!(target: "optimizely", "event drain worker exited");
            })
        };

        let (shutdown, mut shutdown_receiver) = watch::channel(false);
        let ticker = {
            let queue = Arc::clone(&self.queue);
            let flush_interval = self.flush_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(flush_interval);
                // The first tick completes immediately.
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Ok(mut queue) = queue.lock() {
                                queue.flush();
                            }
                        }
                        _ = shutdown_receiver.changed() => return,
                    }
                }
            })
        };

        if let Ok(mut tasks) = self.tasks.lock() {
            *tasks = Some(Tasks {
                worker,
                ticker,
                shutdown,
            });
        }

        // Batches that failed before the restart are older than anything buffered.
        self.send(Job::RetryPending);
        for event in self.drain.buffered_events().await {
            if self.enqueue(event).is_err() {
                break;
            }
        }
    }

    /// Admit `event` into the current batch. Fails once the processor is stopped.
    pub async fn process(&self, event: UserEvent) -> Result<()> {
        if self.is_stopped() {
            log::warn!(target: "optimizely", uuid = event.uuid();
                       "event processor is stopped, dropping event");
            return Err(Error::ProcessorStopped);
        }
        self.drain.on_event_admitted(&event).await;
        self.enqueue(event)
    }

    /// Hand the current batch over to the drain.
    pub fn flush(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.flush();
        }
    }

    /// Flush, wait for every batch to be drained, and stop admitting events.
    pub async fn stop(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.flush();
            // Dropping the sender lets the worker exit after the last batch.
            queue.jobs = None;
        }

        let tasks = self.tasks.lock().ok().and_then(|mut it| it.take());
        if let Some(tasks) = tasks {
            let _ = tasks.shutdown.send(true);
            let _ = tasks.ticker.await;
            if let Err(err) = tasks.worker.await {
                log::warn!(target: "optimizely", err:display = err; "event drain worker failed");
            }
            return;
        }

        // Never started: drain whatever was queued on the caller's task.
        let receiver = self.receiver.lock().ok().and_then(|mut it| it.take());
        if let Some(mut receiver) = receiver {
            while let Ok(job) = receiver.try_recv() {
                run_job(&*self.drain, job).await;
            }
        }
    }

    #[allow(missing_docs)]
    pub fn is_stopped(&self) -> bool {
        self.queue.lock().map(|it| it.jobs.is_none()).unwrap_or(true)
    }

    fn enqueue(&self, event: UserEvent) -> Result<()> {
        let mut queue = self.queue.lock().map_err(|_| Error::ProcessorStopped)?;
        if queue.jobs.is_none() {
            return Err(Error::ProcessorStopped);
        }

        if let Some(first) = queue.current.first() {
            if !is_same_context(first.context(), &event) {
                queue.flush();
            }
        }
        queue.current.push(event);
        if queue.current.len() >= self.batch_size {
            queue.flush();
        }
        Ok(())
    }

    fn send(&self, job: Job) {
        if let Ok(queue) = self.queue.lock() {
            queue.send(job);
        }
    }
}

async fn run_job(drain: &dyn EventDrain, job: Job) {
    match job {
        Job::Drain(events) => drain.drain(events).await,
        Job::RetryPending => drain.retry_pending().await,
    }
}
