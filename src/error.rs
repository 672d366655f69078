use std::sync::Arc;

use thiserror::Error;

/// Represents a result type for operations in the SDK.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the SDK.
///
/// Most of these never reach the caller of `decide()` or `track()`: they are logged and turned
/// into a benign default (an error decision, a dropped event).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The datafile is not valid JSON or does not have the expected shape.
    #[error("invalid datafile")]
    InvalidDatafile(#[source] Arc<serde_json::Error>),

    /// The datafile version is not supported by this SDK.
    #[error("unsupported datafile version: {0}")]
    UnsupportedDatafileVersion(String),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid SDK key.
    #[error("unauthorized, sdk_key is likely invalid")]
    Unauthorized,

    /// Datafile endpoint replied with an unexpected status.
    #[error("datafile fetch failed with status {0}")]
    DatafileFetchFailed(u16),

    /// Indicates that the poller task panicked. This should normally never happen.
    #[error("poller task panicked")]
    PollerPanicked,

    /// Datafile has not been fetched (or supplied) yet.
    #[error("configuration missing")]
    ConfigurationMissing,

    /// The tracked event does not exist in the datafile.
    #[error("event not found: {0}")]
    EventNotFound(String),

    /// Decision for a flag did not complete in time.
    #[error("decision for flag {0} timed out")]
    DecisionTimeout(String),

    /// Remote (CMAB) decision failed.
    #[error("failed to fetch CMAB decision for rule {rule_id}: {message}")]
    Cmab {
        /// Id of the rule being decided.
        rule_id: String,
        /// Human-readable failure description.
        message: String,
    },

    /// Segment service rejected the query or returned an unexpected payload.
    #[error("failed to fetch qualified segments: {0}")]
    SegmentFetch(String),

    /// Event endpoint replied with a status outside of `[200, 400)`.
    #[error("event dispatch failed with status {0}")]
    DispatchFailed(u16),

    /// The event processor has been stopped and no longer admits events.
    #[error("event processor is stopped")]
    ProcessorStopped,

    /// Persisted data could not be (de)serialized.
    #[error("failed to (de)serialize stored value")]
    Serialization(#[source] Arc<serde_json::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}
