use std::sync::{Arc, Mutex};

use reqwest::{header, StatusCode, Url};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    configuration_store::ConfigurationStore,
    datafile::ProjectConfig,
    odp::SegmentManager,
    retry::{jitter, run_with_retry},
    Error, PollerConfig, Result,
};

/// Retries of the first fetch before [`Poller::wait_for_configuration`] reports the error.
const INITIAL_FETCH_MAX_RETRIES: u32 = 3;

pub(crate) struct PollerStartConfig {
    pub store: Arc<ConfigurationStore>,
    pub segment_manager: Option<Arc<SegmentManager>>,
    pub sdk_key: String,
    pub config: PollerConfig,
    pub client: reqwest::Client,
}

/// A datafile poller task.
///
/// Use [`Client::start`](crate::Client::start) to get an instance of it.
pub struct Poller {
    join_handle: JoinHandle<()>,

    /// Used to send a stop command to the poller task.
    stop_sender: watch::Sender<bool>,

    /// Holds `None` if the datafile hasn't been fetched yet. Holds `Some(Ok(()))` once a datafile
    /// has been fetched successfully. Holds `Some(Err(...))` if the first fetch failed.
    result: watch::Receiver<Option<Result<()>>>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("result", &*self.result.borrow())
            .finish_non_exhaustive()
    }
}

struct DatafileFetcher {
    client: reqwest::Client,
    url: Url,
    /// `Last-Modified` of the last datafile, sent back as `If-Modified-Since`.
    last_modified: Mutex<Option<String>>,
}

impl DatafileFetcher {
    /// Returns `None` if the datafile has not changed since the last fetch.
    async fn fetch(&self) -> Result<Option<ProjectConfig>> {
        log::debug!(target: "optimizely", url:display = self.url; "fetching datafile");

        let mut request = self.client.get(self.url.clone());
        let last_modified = self.last_modified.lock().ok().and_then(|it| it.clone());
        if let Some(last_modified) = last_modified {
            request = request.header(header::IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::OK => {
                let last_modified = response
                    .headers()
                    .get(header::LAST_MODIFIED)
                    .and_then(|it| it.to_str().ok())
                    .map(str::to_owned);
                let datafile = response.text().await?;
                let config = ProjectConfig::from_datafile(&datafile)?;
                if let Ok(mut slot) = self.last_modified.lock() {
                    *slot = last_modified;
                }
                Ok(Some(config))
            }
            StatusCode::NOT_MODIFIED => Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Unauthorized),
            code => Err(Error::DatafileFetchFailed(code.as_u16())),
        }
    }
}

struct PollerTask {
    store: Arc<ConfigurationStore>,
    segment_manager: Option<Arc<SegmentManager>>,
    result: watch::Sender<Option<Result<()>>>,
}

impl PollerTask {
    /// Returns `false` if polling should stop.
    fn apply(&self, fetched: Result<Option<ProjectConfig>>) -> bool {
        match fetched {
            Ok(Some(config)) => {
                log::debug!(target: "optimizely", revision = config.revision();
                            "successfully fetched datafile");
                if let Some(config) = self.store.set_configuration(config) {
                    if let Some(segment_manager) = &self.segment_manager {
                        segment_manager.update_settings(config.odp_config().clone());
                    }
                }
                self.result.send_replace(Some(Ok(())));
                true
            }
            Ok(None) => {
                log::trace!(target: "optimizely", "datafile not modified");
                self.result.send_replace(Some(Ok(())));
                true
            }
            Err(Error::Unauthorized) => {
                log::warn!(target: "optimizely", "client is not authorized. Check your SDK key");
                self.result.send_replace(Some(Err(Error::Unauthorized)));
                // Unauthorized means that the SDK key is not valid and thus is not recoverable.
                false
            }
            Err(err) => {
                // Ignore other errors, we'll try another request later.
                log::warn!(target: "optimizely", err:display = err; "failed to fetch datafile");
                // Only the first failure is reported, a previous success stays valid.
                self.result.send_if_modified(|result| match result {
                    None => {
                        *result = Some(Err(err));
                        true
                    }
                    Some(_) => false,
                });
                true
            }
        }
    }
}

impl Poller {
    pub(crate) fn start(config: PollerStartConfig) -> Result<Poller> {
        let url = config.config.datafile_url(&config.sdk_key)?;
        let fetcher = Arc::new(DatafileFetcher {
            client: config.client,
            url,
            last_modified: Mutex::new(None),
        });

        let (stop_sender, mut stop_receiver) = watch::channel(false);
        let (result_sender, result) = watch::channel(None);
        let task = PollerTask {
            store: config.store,
            segment_manager: config.segment_manager,
            result: result_sender,
        };
        let interval = config.config.interval;
        let jitter_amount = config.config.jitter;

        let join_handle = tokio::spawn(async move {
            let handle = {
                let fetcher = Arc::clone(&fetcher);
                run_with_retry(
                    move || {
                        let fetcher = Arc::clone(&fetcher);
                        async move {
                            match fetcher.fetch().await {
                                // Not worth retrying, surfaced as a successful attempt.
                                Err(Error::Unauthorized) => Ok(Err(Error::Unauthorized)),
                                Err(err) => Err(err),
                                Ok(fetched) => Ok(Ok(fetched)),
                            }
                        }
                    },
                    None,
                    Some(INITIAL_FETCH_MAX_RETRIES),
                )
            };
            let canceller = handle.canceller();

            let initial = tokio::select! {
                result = handle.result() => result.and_then(|it| it),
                Ok(()) = stop_receiver.changed() => {
                    log::debug!(target: "optimizely", "poller received stop command");
                    canceller.cancel_retry();
                    return;
                }
            };
            if !task.apply(initial) {
                return;
            }

            loop {
                let timeout = jitter(interval, jitter_amount);
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        // Timed out. Loop to fetch a new datafile.
                    }
                    Ok(()) = stop_receiver.changed() => {
                        // The other end asked us to stop. If the other end is dropped this branch
                        // is disabled and the poller keeps running.
                        log::debug!(target: "optimizely", "poller received stop command");
                        return;
                    }
                }

                if !task.apply(fetcher.fetch().await) {
                    return;
                }
            }
        });

        Ok(Poller {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Wait for the first datafile to get fetched.
    pub async fn wait_for_configuration(&self) -> Result<()> {
        let mut result = self.result.clone();
        let result = result
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::PollerPanicked)?;
        result.clone().unwrap_or(Err(Error::ConfigurationMissing))
    }

    /// Stop the poller task.
    ///
    /// This function does not wait for the task to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (task exited). Ignoring it as there's nothing
        // useful we can do.
        let _ = self.stop_sender.send(true);
    }

    /// Stop the poller task and wait for it to exit.
    ///
    /// If you don't need to wait for the task to exit, use [`Poller::stop`] instead.
    pub async fn shutdown(self) -> Result<()> {
        // Send stop signal in case it wasn't sent before.
        self.stop();

        // Error means that the task has panicked and there's nothing useful we can do in that
        // case.
        self.join_handle
            .await
            .map_err(|_| Error::PollerPanicked)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use wiremock::{
        matchers::{header_exists, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::{Poller, PollerStartConfig};
    use crate::{
        configuration_store::ConfigurationStore, datafile::TEST_DATAFILE, Error, PollerConfig,
    };

    fn start(server: &MockServer, store: &Arc<ConfigurationStore>) -> Poller {
        Poller::start(PollerStartConfig {
            store: store.clone(),
            segment_manager: None,
            sdk_key: "sdk-key".to_owned(),
            config: PollerConfig::new()
                .with_url_template(format!("{}/datafiles/{{sdk_key}}.json", server.uri()))
                .with_interval(Duration::from_millis(50))
                .with_jitter(Duration::ZERO),
            client: reqwest::Client::new(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn fetches_datafile() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/datafiles/sdk-key.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Last-Modified", "Wed, 21 Oct 2026 07:28:00 GMT")
                    .set_body_string(TEST_DATAFILE),
            )
            .mount(&server)
            .await;

        let store = Arc::new(ConfigurationStore::new());
        let poller = start(&server, &store);
        poller.wait_for_configuration().await.unwrap();
        assert!(store.get_configuration().is_some());

        poller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn sends_if_modified_since() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists("If-Modified-Since"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Last-Modified", "Wed, 21 Oct 2026 07:28:00 GMT")
                    .set_body_string(TEST_DATAFILE),
            )
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(ConfigurationStore::new());
        let poller = start(&server, &store);
        poller.wait_for_configuration().await.unwrap();
        // A few more polls, answered with 304.
        tokio::time::sleep(Duration::from_millis(200)).await;
        poller.shutdown().await.unwrap();

        assert!(store.get_configuration().is_some());
        server.verify().await;
    }

    #[tokio::test]
    async fn unauthorized_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(ConfigurationStore::new());
        let poller = start(&server, &store);
        let result = poller.wait_for_configuration().await;
        assert!(matches!(result, Err(Error::Unauthorized)));
        assert!(store.get_configuration().is_none());

        poller.shutdown().await.unwrap();
        server.verify().await;
    }

    #[tokio::test]
    async fn invalid_url_template() {
        let store = Arc::new(ConfigurationStore::new());
        let result = Poller::start(PollerStartConfig {
            store,
            segment_manager: None,
            sdk_key: "sdk-key".to_owned(),
            config: PollerConfig::new().with_url_template("cdn/{sdk_key}.json"),
            client: reqwest::Client::new(),
        });
        assert!(matches!(result, Err(Error::InvalidBaseUrl(_))));
    }
}
