use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::Result;

/// Durable string key-value storage backing the event stores.
///
/// Platform integrations (files, databases, mobile storage) implement this trait; only an in-memory
/// implementation ships with the crate.
#[async_trait]
pub trait PersistentCache: Send + Sync {
    #[allow(missing_docs)]
    async fn get(&self, key: &str) -> Option<String>;

    #[allow(missing_docs)]
    async fn set(&self, key: &str, value: String) -> Result<()>;

    #[allow(missing_docs)]
    async fn contains(&self, key: &str) -> bool;

    /// Returns `true` if the key was present.
    async fn remove(&self, key: &str) -> bool;
}

/// [`PersistentCache`] that lives as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryPersistentCache {
    entries: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl PersistentCache for InMemoryPersistentCache {
    async fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_owned(), value);
        }
        Ok(())
    }

    async fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|it| it.contains_key(key))
            .unwrap_or(false)
    }

    async fn remove(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|mut it| it.remove(key).is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemoryPersistentCache, PersistentCache};

    #[tokio::test]
    async fn in_memory_cache() {
        let cache = InMemoryPersistentCache::default();
        assert!(!cache.contains("a").await);

        cache.set("a", "1".to_owned()).await.unwrap();
        assert!(cache.contains("a").await);
        assert_eq!(cache.get("a").await.as_deref(), Some("1"));

        assert!(cache.remove("a").await);
        assert!(!cache.remove("a").await);
        assert_eq!(cache.get("a").await, None);
    }
}
