//! ODP segment qualification: which audience segments a user belongs to.
mod config;
mod lru_cache;
mod segment_api;
mod segment_manager;

pub use config::OdpConfig;
pub use lru_cache::{Cache, LruCache};
pub use segment_api::{GraphqlSegmentApiClient, SegmentApiClient};
pub use segment_manager::{SegmentManager, SegmentOption};
