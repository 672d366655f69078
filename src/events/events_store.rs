use std::{marker::PhantomData, sync::Arc};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{events::PersistentCache, Error};

/// Bounded, insertion-ordered map persisted under a single key of a [`PersistentCache`].
///
/// Every operation holds the store lock for its whole read-modify-write cycle.
pub struct EventsStore<T> {
    store_key: String,
    max_size: usize,
    cache: Arc<dyn PersistentCache>,
    lock: tokio::sync::Mutex<()>,
    _value: PhantomData<fn() -> T>,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry<T> {
    key: String,
    value: T,
}

impl<T> std::fmt::Debug for EventsStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventsStore")
            .field("store_key", &self.store_key)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl<T: Serialize + DeserializeOwned> EventsStore<T> {
    #[allow(missing_docs)]
    pub fn new(
        cache: Arc<dyn PersistentCache>,
        store_key: impl Into<String>,
        max_size: usize,
    ) -> EventsStore<T> {
        EventsStore {
            store_key: store_key.into(),
            max_size,
            cache,
            lock: tokio::sync::Mutex::new(()),
            _value: PhantomData,
        }
    }

    /// Insert or replace `key`. A new key is dropped, with a warning, once the store holds
    /// `max_size` entries. Returns `true` if the value was stored.
    pub async fn set(&self, key: &str, value: T) -> bool {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await;
        let len = entries.len();

        match entries.iter_mut().find(|it| it.key == key) {
            Some(entry) => entry.value = value,
            None if len >= self.max_size => {
                log::warn!(target: "optimizely",
                           store_key:display = self.store_key,
                           max_size = self.max_size;
                           "event store is full, dropping entry");
                return false;
            }
            None => entries.push(StoredEntry {
                key: key.to_owned(),
                value,
            }),
        }

        self.save(&entries).await
    }

    #[allow(missing_docs)]
    pub async fn get(&self, key: &str) -> Option<T> {
        let _guard = self.lock.lock().await;
        self.load()
            .await
            .into_iter()
            .find(|it| it.key == key)
            .map(|it| it.value)
    }

    /// Returns `true` if the key was present.
    pub async fn remove(&self, key: &str) -> bool {
        self.remove_all(&[key]).await > 0
    }

    /// Remove `keys` in a single write. Returns the number of removed entries.
    pub async fn remove_all(&self, keys: &[&str]) -> usize {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await;
        let before = entries.len();
        entries.retain(|it| !keys.contains(&it.key.as_str()));
        let removed = before - entries.len();
        if removed > 0 {
            self.save(&entries).await;
        }
        removed
    }

    /// All entries in insertion order.
    pub async fn get_all(&self) -> Vec<(String, T)> {
        let _guard = self.lock.lock().await;
        self.load()
            .await
            .into_iter()
            .map(|it| (it.key, it.value))
            .collect()
    }

    #[allow(missing_docs)]
    pub async fn len(&self) -> usize {
        let _guard = self.lock.lock().await;
        self.load().await.len()
    }

    #[allow(missing_docs)]
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn load(&self) -> Vec<StoredEntry<T>> {
        let Some(stored) = self.cache.get(&self.store_key).await else {
            return Vec::new();
        };
        match serde_json::from_str(&stored) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!(target: "optimizely",
                           store_key:display = self.store_key,
                           err:display = Error::Serialization(Arc::new(err));
                           "discarding unreadable event store");
                Vec::new()
            }
        }
    }

    async fn save(&self, entries: &[StoredEntry<T>]) -> bool {
        let result = match serde_json::to_string(entries) {
            Ok(serialized) => self.cache.set(&self.store_key, serialized).await,
            Err(err) => Err(Error::Serialization(Arc::new(err))),
        };
        if let Err(err) = &result {
            log::warn!(target: "optimizely",
                       store_key:display = self.store_key,
                       err:display = err;
                       "failed to persist event store");
        }
        result.is_ok()
    }
}
