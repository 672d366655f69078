use std::sync::{Arc, RwLock};

use crate::datafile::ProjectConfig;

/// `ConfigurationStore` provides a Sync storage for the project configuration that allows
/// concurrent access for readers and writers.
#[derive(Debug, Default)]
pub struct ConfigurationStore {
    configuration: RwLock<Option<Arc<ProjectConfig>>>,
}

impl ConfigurationStore {
    pub fn new() -> Self {
        Self {
            configuration: RwLock::new(None),
        }
    }

    pub fn get_configuration(&self) -> Option<Arc<ProjectConfig>> {
        // self.configuration.read() should always return Ok(). Err() is possible only if the lock
        // is poisoned (writer panicked while holding the lock), which should never happen. Still,
        // using .ok()? here to not crash the app.
        let configuration = self.configuration.read().ok()?;
        configuration.clone()
    }

    /// Set new configuration unless it has the same revision as the current one.
    ///
    /// Returns the stored configuration if it was replaced.
    pub fn set_configuration(&self, config: ProjectConfig) -> Option<Arc<ProjectConfig>> {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Arc::new(config);

        let mut configuration_slot = self.configuration.write().ok()?;
        if configuration_slot
            .as_ref()
            .is_some_and(|current| current.revision() == new_value.revision())
        {
            return None;
        }
        log::debug!(target: "optimizely", revision = new_value.revision();
                    "updated project configuration");
        *configuration_slot = Some(Arc::clone(&new_value));
        Some(new_value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::ConfigurationStore;
    use crate::datafile::{ProjectConfig, TEST_DATAFILE};

    fn config_with_revision(revision: &str) -> ProjectConfig {
        let mut datafile: serde_json::Value = serde_json::from_str(TEST_DATAFILE).unwrap();
        datafile["revision"] = revision.into();
        ProjectConfig::from_datafile(&datafile.to_string()).unwrap()
    }

    #[test]
    fn can_set_configuration_from_another_thread() {
        let store = Arc::new(ConfigurationStore::new());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set_configuration(config_with_revision("1"));
            })
            .join();
        }

        assert!(store.get_configuration().is_some());
    }

    #[test]
    fn same_revision_is_not_replaced() {
        let store = ConfigurationStore::new();
        assert!(store.set_configuration(config_with_revision("1")).is_some());
        let first = store.get_configuration().unwrap();

        assert!(store.set_configuration(config_with_revision("1")).is_none());
        assert!(Arc::ptr_eq(&first, &store.get_configuration().unwrap()));

        assert!(store.set_configuration(config_with_revision("2")).is_some());
        assert_eq!(store.get_configuration().unwrap().revision(), "2");
    }
}
