//! The Rust SDK core for Optimizely feature flags and experimentation.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that decides feature flags for users, where each user has
//! a unique id, key-value attributes and, optionally, the ODP segments they qualify for. Deciding a
//! flag results in a [`Decision`]: the variation the user gets, whether the flag is enabled for
//! them, and the flag variables.
//!
//! Decisions follow the project datafile, fetched periodically by a [`Poller`] or supplied with
//! [`ClientConfig::datafile`]. Holdouts are evaluated first, then the flag's experiments, then its
//! rollout rules. Impressions and conversions are batched and sent to the event endpoint in the
//! background; see [`EventProcessorConfig`] to make delivery survive restarts.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Deciding a flag never fails: problems yield a disabled [`Decision`] with reasons. Other
//! operations return errors that are valuable for debugging and usually indicate that developer's
//! attention is needed. In production, it is recommended to log and otherwise ignore them, as
//! feature flagging should not be critical enough to cause system crashes.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, with
//! the `optimizely` target and structured key-values. Consider integrating a `log`-compatible
//! logger implementation for better visibility into SDK operations.
//!
//! # Examples
//!
//! ```no_run
//! # async fn run() -> optimizely::Result<()> {
//! use optimizely::{ClientConfig, DecideOption, UserAttributes};
//!
//! let client = ClientConfig::from_sdk_key("sdk-key").to_client();
//! let poller = client.start().await?;
//! poller.wait_for_configuration().await?;
//!
//! let user = client.create_user_context(
//!     "user-1",
//!     [("plan".to_owned(), "premium".into())].into_iter().collect::<UserAttributes>(),
//! );
//! let decision = client.decide(&user, "checkout_flow", &[DecideOption::IncludeReasons]).await;
//! if decision.enabled {
//!     client.track("purchase", &user, None).await?;
//! }
//!
//! client.close().await;
//! poller.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod attributes;
mod client;
mod config;
mod configuration_store;
mod error;
mod poller;
mod retry;
mod sharder;
mod user_context;

pub mod audience;
pub mod datafile;
pub mod decision;
pub mod events;
pub mod odp;

pub use attributes::{AttributeValue, UserAttributes};
pub use client::{Client, DecideOption, Decision, FeatureVariable};
pub use config::{ClientConfig, EventProcessorConfig, PollerConfig, SegmentCacheConfig};
pub use error::{Error, Result};
pub use poller::Poller;
pub use retry::{
    run_with_retry, BackoffController, ExponentialBackoff, RetryCanceller, RetryHandle,
};
pub use sharder::{Murmur3Sharder, Sharder, MAX_TRAFFIC_VALUE};
pub use user_context::UserContext;
