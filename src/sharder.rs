//! Sharder implementation.
use std::io::Cursor;

/// Seed used by every Optimizely SDK. Changing it breaks cross-SDK bucketing parity.
const HASH_SEED: u32 = 1;

/// Size of the bucket space. Traffic allocation ranges are expressed in this unit.
pub const MAX_TRAFFIC_VALUE: u32 = 10_000;

const MAX_HASH_VALUE: f64 = 4_294_967_296.0; // 2^32

/// Hash function mapping bucketing keys onto traffic ranges.
pub trait Sharder {
    /// Map `input` into `[0, MAX_TRAFFIC_VALUE)`.
    fn bucket_value(&self, input: &str) -> u32;
}

/// The default (and only) sharder: MurmurHash3 x86 32-bit.
#[derive(Debug, Clone, Copy, Default)]
pub struct Murmur3Sharder;

impl Sharder for Murmur3Sharder {
    fn bucket_value(&self, input: &str) -> u32 {
        let hash = murmur3::murmur3_32(&mut Cursor::new(input.as_bytes()), HASH_SEED)
            .expect("reading from an in-memory buffer should not fail");
        let ratio = f64::from(hash) / MAX_HASH_VALUE;
        (ratio * f64::from(MAX_TRAFFIC_VALUE)).floor() as u32
    }
}

#[cfg(test)]
pub struct DeterministicSharder(pub std::collections::HashMap<String, u32>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn bucket_value(&self, input: &str) -> u32 {
        self.0.get(input).copied().unwrap_or(0) % MAX_TRAFFIC_VALUE
    }
}
