use std::{sync::Arc, time::Duration};

use url::Url;

use crate::{
    decision::{CmabDecisionProvider, DecisionService},
    events::{EventDispatcher, PersistentCache},
    odp::SegmentApiClient,
    Client, DecideOption, Error, Result,
};

/// Configuration for [`Client`].
pub struct ClientConfig {
    pub(crate) sdk_key: String,
    pub(crate) datafile: Option<String>,
    pub(crate) default_decide_options: Vec<DecideOption>,
    pub(crate) decision_timeout: Duration,
    pub(crate) poller: PollerConfig,
    pub(crate) event_processor: EventProcessorConfig,
    pub(crate) segment_cache: SegmentCacheConfig,
    pub(crate) event_dispatcher: Option<Arc<dyn EventDispatcher>>,
    pub(crate) persistent_cache: Option<Arc<dyn PersistentCache>>,
    pub(crate) segment_api: Option<Arc<dyn SegmentApiClient>>,
    pub(crate) cmab: Option<Arc<dyn CmabDecisionProvider>>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("default_decide_options", &self.default_decide_options)
            .field("decision_timeout", &self.decision_timeout)
            .field("poller", &self.poller)
            .field("event_processor", &self.event_processor)
            .field("segment_cache", &self.segment_cache)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Create a default configuration using the specified SDK key.
    ///
    /// ```
    /// # use optimizely::ClientConfig;
    /// ClientConfig::from_sdk_key("sdk-key");
    /// ```
    pub fn from_sdk_key(sdk_key: impl Into<String>) -> Self {
        ClientConfig {
            sdk_key: sdk_key.into(),
            datafile: None,
            default_decide_options: Vec::new(),
            decision_timeout: DecisionService::DEFAULT_DECISION_TIMEOUT,
            poller: PollerConfig::new(),
            event_processor: EventProcessorConfig::new(),
            segment_cache: SegmentCacheConfig::new(),
            event_dispatcher: None,
            persistent_cache: None,
            segment_api: None,
            cmab: None,
        }
    }

    /// Datafile to decide with until the poller fetches a fresh one.
    ///
    /// ```
    /// # use optimizely::ClientConfig;
    /// let mut config = ClientConfig::from_sdk_key("sdk-key");
    /// config.datafile(r#"{"version": "4", "revision": "1"}"#);
    /// ```
    pub fn datafile(&mut self, datafile: impl Into<String>) -> &mut Self {
        self.datafile = Some(datafile.into());
        self
    }

    /// Options applied to every `decide*` call in addition to the per-call ones.
    pub fn default_decide_options(&mut self, options: impl Into<Vec<DecideOption>>) -> &mut Self {
        self.default_decide_options = options.into();
        self
    }

    /// Upper bound for deciding a single flag. Defaults to
    /// [`DecisionService::DEFAULT_DECISION_TIMEOUT`].
    pub fn decision_timeout(&mut self, decision_timeout: Duration) -> &mut Self {
        self.decision_timeout = decision_timeout;
        self
    }

    #[allow(missing_docs)]
    pub fn poller(&mut self, poller: PollerConfig) -> &mut Self {
        self.poller = poller;
        self
    }

    #[allow(missing_docs)]
    pub fn event_processor(&mut self, event_processor: EventProcessorConfig) -> &mut Self {
        self.event_processor = event_processor;
        self
    }

    #[allow(missing_docs)]
    pub fn segment_cache(&mut self, segment_cache: SegmentCacheConfig) -> &mut Self {
        self.segment_cache = segment_cache;
        self
    }

    /// Replace the HTTP event dispatcher, e.g. to route events through your own transport.
    pub fn event_dispatcher(&mut self, event_dispatcher: Arc<dyn EventDispatcher>) -> &mut Self {
        self.event_dispatcher = Some(event_dispatcher);
        self
    }

    /// Storage backing the durable event store. Only used when
    /// [`EventProcessorConfig::with_durable_store`] is enabled; defaults to in-memory storage.
    pub fn persistent_cache(&mut self, persistent_cache: Arc<dyn PersistentCache>) -> &mut Self {
        self.persistent_cache = Some(persistent_cache);
        self
    }

    /// Replace the GraphQL segment client.
    pub fn segment_api(&mut self, segment_api: Arc<dyn SegmentApiClient>) -> &mut Self {
        self.segment_api = Some(segment_api);
        self
    }

    /// Replace the CMAB prediction client.
    pub fn cmab_provider(&mut self, cmab: Arc<dyn CmabDecisionProvider>) -> &mut Self {
        self.cmab = Some(cmab);
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use optimizely::{ClientConfig, Client};
    /// let client: Client = ClientConfig::from_sdk_key("sdk-key").to_client();
    /// ```
    pub fn to_client(self) -> Client {
        Client::new(self)
    }
}

/// Configuration of the datafile poller.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    pub(crate) interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) url_template: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PollerConfig {
    /// Default time between datafile fetches.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);
    /// Default upper bound of the random delay added to the interval.
    pub const DEFAULT_JITTER: Duration = Duration::from_secs(30);
    /// Default datafile location. `{sdk_key}` is replaced with the SDK key.
    pub const DEFAULT_URL_TEMPLATE: &'static str =
        "https://cdn.optimizely.com/datafiles/{sdk_key}.json";

    #[allow(missing_docs)]
    pub fn new() -> PollerConfig {
        PollerConfig {
            interval: PollerConfig::DEFAULT_INTERVAL,
            jitter: PollerConfig::DEFAULT_JITTER,
            url_template: PollerConfig::DEFAULT_URL_TEMPLATE.to_owned(),
        }
    }

    #[allow(missing_docs)]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[allow(missing_docs)]
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Override the datafile location. Clients should use the default setting in most cases.
    pub fn with_url_template(mut self, url_template: impl Into<String>) -> Self {
        self.url_template = url_template.into();
        self
    }

    pub(crate) fn datafile_url(&self, sdk_key: &str) -> Result<Url> {
        let url = self.url_template.replace("{sdk_key}", sdk_key);
        Url::parse(&url).map_err(Error::InvalidBaseUrl)
    }
}

/// Configuration of event batching and delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct EventProcessorConfig {
    pub(crate) batch_size: usize,
    pub(crate) flush_interval: Duration,
    pub(crate) max_retries: Option<u32>,
    pub(crate) durable_store: bool,
    pub(crate) store_max_size: usize,
}

impl Default for EventProcessorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EventProcessorConfig {
    /// Default number of events per batch.
    pub const DEFAULT_BATCH_SIZE: usize = 10;
    /// Default time after which a partial batch is sent.
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
    /// Default number of retries of a failed batch, when the durable store is disabled.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    /// Default capacity of each durable event store.
    pub const DEFAULT_STORE_MAX_SIZE: usize = 10_000;

    #[allow(missing_docs)]
    pub fn new() -> EventProcessorConfig {
        EventProcessorConfig {
            batch_size: EventProcessorConfig::DEFAULT_BATCH_SIZE,
            flush_interval: EventProcessorConfig::DEFAULT_FLUSH_INTERVAL,
            max_retries: Some(EventProcessorConfig::DEFAULT_MAX_RETRIES),
            durable_store: false,
            store_max_size: EventProcessorConfig::DEFAULT_STORE_MAX_SIZE,
        }
    }

    /// Values below 1 are treated as 1.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[allow(missing_docs)]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Retries of a failed batch before it is dropped. `None` retries forever.
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Persist batches until they are delivered instead of dropping them after `max_retries`.
    pub fn with_durable_store(mut self, durable_store: bool) -> Self {
        self.durable_store = durable_store;
        self
    }

    /// Capacity of the pending-batch and event-buffer stores.
    pub fn with_store_max_size(mut self, store_max_size: usize) -> Self {
        self.store_max_size = store_max_size;
        self
    }
}

/// Configuration of the qualified-segments cache.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentCacheConfig {
    pub(crate) max_size: usize,
    pub(crate) timeout: Duration,
}

impl Default for SegmentCacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentCacheConfig {
    /// Default number of cached users.
    pub const DEFAULT_MAX_SIZE: usize = 10_000;
    /// Default time a cached answer stays valid.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

    #[allow(missing_docs)]
    pub fn new() -> SegmentCacheConfig {
        SegmentCacheConfig {
            max_size: SegmentCacheConfig::DEFAULT_MAX_SIZE,
            timeout: SegmentCacheConfig::DEFAULT_TIMEOUT,
        }
    }

    /// A size of 0 disables caching.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    #[allow(missing_docs)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
