use std::sync::{Arc, RwLock};

use crate::{
    odp::{Cache, OdpConfig, SegmentApiClient},
    retry::run_with_retry,
};

/// Separator between user key and user value in cache keys.
const CACHE_KEY_SEPARATOR: &str = "-$-";

/// Retries of a failed segment fetch before giving up on the user.
const FETCH_MAX_RETRIES: u32 = 1;

/// Options of [`SegmentManager::fetch_qualified_segments`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentOption {
    /// Neither read from nor write to the segment cache.
    IgnoreCache,
    /// Clear the whole segment cache before fetching.
    ResetCache,
}

/// Resolves which ODP segments a user qualifies for, caching the answers.
pub struct SegmentManager {
    config: RwLock<OdpConfig>,
    cache: Arc<dyn Cache<Vec<String>>>,
    api: Arc<dyn SegmentApiClient>,
    /// Serializes the cache-then-fetch sequence.
    fetch_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SegmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SegmentManager {
    #[allow(missing_docs)]
    pub fn new(
        config: OdpConfig,
        cache: Arc<dyn Cache<Vec<String>>>,
        api: Arc<dyn SegmentApiClient>,
    ) -> SegmentManager {
        SegmentManager {
            config: RwLock::new(config),
            cache,
            api,
            fetch_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Apply ODP settings of a new datafile. Cached segments are dropped when settings change.
    pub fn update_settings(&self, config: OdpConfig) {
        let Ok(mut current) = self.config.write() else {
            return;
        };
        if *current != config {
            log::debug!(target: "optimizely", "ODP settings changed, resetting segment cache");
            *current = config;
            self.cache.reset();
        }
    }

    /// Segments `user_value` (identified by `user_key`) qualifies for.
    ///
    /// Returns `None` if ODP is not configured or the fetch failed, and an empty list without any
    /// network call if the project references no segments.
    pub async fn fetch_qualified_segments(
        &self,
        user_key: &str,
        user_value: &str,
        options: &[SegmentOption],
    ) -> Option<Vec<String>> {
        let config = self.config.read().ok()?.clone();
        let (Some(api_key), Some(api_host)) = (
            config.api_key.as_deref().filter(|_| config.is_ready()),
            config.api_host.as_deref(),
        ) else {
            log::warn!(target: "optimizely", user_key;
                       "ODP is not configured, cannot fetch segments");
            return None;
        };

        if config.segments_to_check.is_empty() {
            return Some(Vec::new());
        }

        let ignore_cache = options.contains(&SegmentOption::IgnoreCache);
        let cache_key = format!("{user_key}{CACHE_KEY_SEPARATOR}{user_value}");

        let _guard = self.fetch_lock.lock().await;

        if options.contains(&SegmentOption::ResetCache) {
            self.cache.reset();
        }

        if !ignore_cache {
            if let Some(segments) = self.cache.lookup(&cache_key) {
                log::trace!(target: "optimizely", user_key, user_value;
                            "qualified segments served from cache");
                return Some(segments);
            }
        }

        let fetch = {
            let api = Arc::clone(&self.api);
            let api_key = api_key.to_owned();
            let api_host = api_host.to_owned();
            let user_key = user_key.to_owned();
            let user_value = user_value.to_owned();
            let segments_to_check = config.segments_to_check.clone();
            run_with_retry(
                move || {
                    let api = Arc::clone(&api);
                    let api_key = api_key.clone();
                    let api_host = api_host.clone();
                    let user_key = user_key.clone();
                    let user_value = user_value.clone();
                    let segments_to_check = segments_to_check.clone();
                    async move {
                        api.fetch_segments(
                            &api_key,
                            &api_host,
                            &user_key,
                            &user_value,
                            &segments_to_check,
                        )
                        .await
                    }
                },
                None,
                Some(FETCH_MAX_RETRIES),
            )
        };

        match fetch.result().await {
            Ok(segments) => {
                if !ignore_cache {
                    self.cache.save(&cache_key, segments.clone());
                }
                Some(segments)
            }
            Err(err) => {
                log::warn!(target: "optimizely", user_key, user_value, err:display = err;
                           "failed to fetch qualified segments");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;

    use super::{SegmentManager, SegmentOption};
    use crate::{
        odp::{Cache, LruCache, OdpConfig, SegmentApiClient},
        Error, Result,
    };

    #[derive(Default)]
    struct FakeSegmentApi {
        calls: AtomicUsize,
        /// Number of leading calls that fail.
        failures: usize,
    }

    #[async_trait]
    impl SegmentApiClient for FakeSegmentApi {
        async fn fetch_segments(
            &self,
            api_key: &str,
            _api_host: &str,
            _user_key: &str,
            user_value: &str,
            segments_to_check: &[String],
        ) -> Result<Vec<String>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(api_key, "key");
            if call < self.failures {
                return Err(Error::SegmentFetch("boom".to_owned()));
            }
            Ok(segments_to_check
                .iter()
                .map(|it| format!("{it}-{user_value}"))
                .collect())
        }
    }

    fn odp_config(segments: &[&str]) -> OdpConfig {
        OdpConfig::new(
            Some("key".to_owned()),
            Some("https://odp.example.com".to_owned()),
            segments.iter().map(|it| (*it).to_owned()).collect(),
        )
    }

    fn new_manager(
        config: OdpConfig,
        api: Arc<FakeSegmentApi>,
    ) -> (SegmentManager, Arc<LruCache<Vec<String>>>) {
        let cache = Arc::new(LruCache::new(10, Duration::from_secs(600)));
        (SegmentManager::new(config, cache.clone(), api), cache)
    }

    #[tokio::test]
    async fn caches_fetched_segments() {
        let api = Arc::new(FakeSegmentApi::default());
        let (manager, cache) = new_manager(odp_config(&["vip"]), api.clone());

        let segments = manager.fetch_qualified_segments("fs_user_id", "u1", &[]).await;
        assert_eq!(segments, Some(vec!["vip-u1".to_owned()]));
        assert_eq!(cache.peek("fs_user_id-$-u1"), Some(vec!["vip-u1".to_owned()]));

        let segments = manager.fetch_qualified_segments("fs_user_id", "u1", &[]).await;
        assert_eq!(segments, Some(vec!["vip-u1".to_owned()]));
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ignore_cache_bypasses_reads_and_writes() {
        let api = Arc::new(FakeSegmentApi::default());
        let (manager, cache) = new_manager(odp_config(&["vip"]), api.clone());
        cache.save("fs_user_id-$-u1", vec!["stale".to_owned()]);

        let segments = manager
            .fetch_qualified_segments("fs_user_id", "u1", &[SegmentOption::IgnoreCache])
            .await;
        assert_eq!(segments, Some(vec!["vip-u1".to_owned()]));
        assert_eq!(cache.peek("fs_user_id-$-u1"), Some(vec!["stale".to_owned()]));
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_cache_clears_every_user() {
        let api = Arc::new(FakeSegmentApi::default());
        let (manager, cache) = new_manager(odp_config(&["vip"]), api.clone());
        cache.save("fs_user_id-$-u1", vec!["stale".to_owned()]);
        cache.save("fs_user_id-$-u2", vec!["stale".to_owned()]);

        let segments = manager
            .fetch_qualified_segments("fs_user_id", "u1", &[SegmentOption::ResetCache])
            .await;
        assert_eq!(segments, Some(vec!["vip-u1".to_owned()]));
        assert_eq!(cache.peek("fs_user_id-$-u2"), None);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn no_segments_skips_network() {
        let api = Arc::new(FakeSegmentApi::default());
        let (manager, _) = new_manager(odp_config(&[]), api.clone());
        let segments = manager.fetch_qualified_segments("fs_user_id", "u1", &[]).await;
        assert_eq!(segments, Some(vec![]));
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_and_failures_yield_none() {
        let api = Arc::new(FakeSegmentApi::default());
        let (manager, _) = new_manager(OdpConfig::default(), api.clone());
        assert_eq!(manager.fetch_qualified_segments("fs_user_id", "u1", &[]).await, None);
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);

        let api = Arc::new(FakeSegmentApi {
            failures: usize::MAX,
            ..Default::default()
        });
        let (manager, cache) = new_manager(odp_config(&["vip"]), api.clone());
        assert_eq!(manager.fetch_qualified_segments("fs_user_id", "u1", &[]).await, None);
        assert!(cache.is_empty());
        // The first attempt and a single retry.
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_is_retried() {
        let api = Arc::new(FakeSegmentApi {
            failures: 1,
            ..Default::default()
        });
        let (manager, cache) = new_manager(odp_config(&["vip"]), api.clone());

        let segments = manager.fetch_qualified_segments("fs_user_id", "u1", &[]).await;
        assert_eq!(segments, Some(vec!["vip-u1".to_owned()]));
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.peek("fs_user_id-$-u1"), Some(vec!["vip-u1".to_owned()]));
    }

    #[tokio::test]
    async fn changed_settings_reset_cache() {
        let api = Arc::new(FakeSegmentApi::default());
        let (manager, cache) = new_manager(odp_config(&["vip"]), api);
        manager.fetch_qualified_segments("fs_user_id", "u1", &[]).await;

        manager.update_settings(odp_config(&["vip"]));
        assert_eq!(cache.len(), 1);

        manager.update_settings(odp_config(&["vip", "new"]));
        assert!(cache.is_empty());
    }
}
