/// ODP (audience segmentation service) settings of a project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OdpConfig {
    /// Public API key of the ODP account.
    pub api_key: Option<String>,
    /// ODP API host, e.g. `https://api.zaius.com`.
    pub api_host: Option<String>,
    /// Segments referenced by audiences of the project, in first-seen order.
    pub segments_to_check: Vec<String>,
}

impl OdpConfig {
    #[allow(missing_docs)]
    pub fn new(
        api_key: Option<String>,
        api_host: Option<String>,
        segments_to_check: Vec<String>,
    ) -> OdpConfig {
        OdpConfig {
            api_key,
            api_host,
            segments_to_check,
        }
    }

    /// Returns `true` if segments can be fetched.
    pub fn is_ready(&self) -> bool {
        self.api_key.as_deref().is_some_and(|it| !it.is_empty())
            && self.api_host.as_deref().is_some_and(|it| !it.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::OdpConfig;

    #[test]
    fn ready_requires_key_and_host() {
        assert!(!OdpConfig::default().is_ready());
        assert!(!OdpConfig::new(Some("key".into()), None, vec![]).is_ready());
        assert!(!OdpConfig::new(Some("".into()), Some("https://odp".into()), vec![]).is_ready());
        assert!(OdpConfig::new(Some("key".into()), Some("https://odp".into()), vec![]).is_ready());
    }
}
