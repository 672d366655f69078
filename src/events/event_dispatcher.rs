use async_trait::async_trait;

use crate::{events::LogEvent, Result};

/// Outcome of sending a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchResponse {
    /// HTTP status of the event endpoint.
    pub status_code: u16,
}

impl DispatchResponse {
    /// Statuses in `[200, 400)` count as delivered.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status_code)
    }
}

/// Sends batches to the event endpoint.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    /// Send `event`. Transport failures are errors; any HTTP reply is a [`DispatchResponse`].
    async fn dispatch_event(&self, event: &LogEvent) -> Result<DispatchResponse>;
}

/// [`EventDispatcher`] posting JSON over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpEventDispatcher {
    client: reqwest::Client,
}

impl HttpEventDispatcher {
    #[allow(missing_docs)]
    pub fn new(client: reqwest::Client) -> HttpEventDispatcher {
        HttpEventDispatcher { client }
    }
}

#[async_trait]
impl EventDispatcher for HttpEventDispatcher {
    async fn dispatch_event(&self, event: &LogEvent) -> Result<DispatchResponse> {
        let method = reqwest::Method::from_bytes(event.http_verb.as_bytes())
            .unwrap_or(reqwest::Method::POST);
        let response = self
            .client
            .request(method, &event.url)
            .json(&event.params)
            .send()
            .await?;

        let status_code = response.status().as_u16();
        log::debug!(target: "optimizely",
                    url:display = event.url,
                    status_code,
                    visitors = event.params.visitors.len();
                    "dispatched event batch");
        Ok(DispatchResponse { status_code })
    }
}

/// Dispatcher that records every attempt and fails on demand.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingDispatcher {
    failing: std::sync::atomic::AtomicBool,
    /// Every attempted batch, with the attempt outcome.
    attempts: std::sync::Mutex<Vec<(LogEvent, bool)>>,
}

#[cfg(test)]
impl RecordingDispatcher {
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    /// Visitor ids of every attempt, successful or not.
    pub(crate) fn attempted_visitors(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(event, _)| visitor_ids(event))
            .collect()
    }

    /// Visitor ids of delivered batches, in delivery order.
    pub(crate) fn delivered_visitors(&self) -> Vec<String> {
        self.delivered_batches().into_iter().flatten().collect()
    }

    /// Visitor ids of each delivered batch.
    pub(crate) fn delivered_batches(&self) -> Vec<Vec<String>> {
        self.delivered_events().iter().map(visitor_ids).collect()
    }

    pub(crate) fn delivered_events(&self) -> Vec<LogEvent> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, delivered)| *delivered)
            .map(|(event, _)| event.clone())
            .collect()
    }
}

#[cfg(test)]
fn visitor_ids(event: &LogEvent) -> Vec<String> {
    event
        .params
        .visitors
        .iter()
        .map(|it| it.visitor_id.clone())
        .collect()
}

#[cfg(test)]
#[async_trait]
impl EventDispatcher for RecordingDispatcher {
    async fn dispatch_event(&self, event: &LogEvent) -> Result<DispatchResponse> {
        let failing = self.failing.load(std::sync::atomic::Ordering::SeqCst);
        self.attempts.lock().unwrap().push((event.clone(), !failing));
        Ok(DispatchResponse {
            status_code: if failing { 503 } else { 204 },
        })
    }
}
