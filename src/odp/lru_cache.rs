use std::{num::NonZeroUsize, sync::Mutex, time::Duration};

use tokio::time::Instant;

/// Key-value cache used for qualified segments.
///
/// Implementations must be safe to share between tasks.
pub trait Cache<V>: Send + Sync {
    /// Insert or replace `key`.
    fn save(&self, key: &str, value: V);

    /// Returns the value of `key` if it is present and not expired.
    fn lookup(&self, key: &str) -> Option<V>;

    /// Remove every entry.
    fn reset(&self);
}

/// Bounded cache evicting the least recently used entry, with an optional per-entry time to live.
///
/// A `max_size` of zero disables the cache. A zero `timeout` disables expiry.
#[derive(Debug)]
pub struct LruCache<V> {
    timeout: Duration,
    /// `None` when caching is disabled.
    entries: Option<Mutex<lru::LruCache<String, Element<V>>>>,
}

#[derive(Debug)]
struct Element<V> {
    value: V,
    saved_at: Instant,
}

impl<V: Clone> LruCache<V> {
    /// Default number of entries.
    pub const DEFAULT_MAX_SIZE: usize = 10_000;
    /// Default entry time to live.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

    #[allow(missing_docs)]
    pub fn new(max_size: usize, timeout: Duration) -> LruCache<V> {
        LruCache {
            timeout,
            entries: NonZeroUsize::new(max_size).map(|it| Mutex::new(lru::LruCache::new(it))),
        }
    }

    /// Returns the value of `key` without refreshing its recency or evicting it when expired.
    pub fn peek(&self, key: &str) -> Option<V> {
        let entries = self.entries.as_ref()?.lock().ok()?;
        entries.peek(key).map(|it| it.value.clone())
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.entries
            .as_ref()
            .and_then(|it| it.lock().ok().map(|entries| entries.len()))
            .unwrap_or(0)
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, element: &Element<V>) -> bool {
        !self.timeout.is_zero() && element.saved_at.elapsed() >= self.timeout
    }
}

impl<V: Clone + Send> Cache<V> for LruCache<V> {
    fn save(&self, key: &str, value: V) {
        let Some(Ok(mut entries)) = self.entries.as_ref().map(|it| it.lock()) else {
            return;
        };
        entries.put(
            key.to_owned(),
            Element {
                value,
                saved_at: Instant::now(),
            },
        );
    }

    fn lookup(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.as_ref()?.lock().ok()?;
        let expired = self.is_expired(entries.get(key)?);
        if expired {
            entries.pop(key);
            return None;
        }
        entries.peek(key).map(|it| it.value.clone())
    }

    fn reset(&self) {
        if let Some(Ok(mut entries)) = self.entries.as_ref().map(|it| it.lock()) {
            entries.clear();
        }
    }
}
