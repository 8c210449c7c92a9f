//! Algorithms for choosing how many operations may be in flight at once.

mod aimd;
mod dynamic;

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;

pub use aimd::StaticThrottler;
pub use dynamic::DynamicThrottler;

/// Latencies below this are clamped, so a zero latency can't dominate any ratio.
pub(crate) const MIN_SAMPLE_LATENCY: Duration = Duration::from_micros(1);

/// Controls the target number of concurrent operations.
///
/// All methods may be called concurrently from many completing operations.
#[async_trait]
pub trait Throttler: Debug + Send + Sync {
    /// Record a completed attempt, including its latency and the concurrency it was sent at.
    async fn sent(&self, sample: Sample);

    /// An operation succeeded.
    fn success(&self);

    /// The cluster rejected an operation because it was overloaded, while `in_flight` operations
    /// were outstanding.
    fn throttled(&self, in_flight: usize);

    /// The current number of operations allowed in flight.
    ///
    /// Always within the configured [InflightBounds].
    fn target_inflight(&self) -> usize;
}

/// The result of a single attempt, as seen by the throttler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub(crate) latency: Duration,
    /// Attempts in flight when this one was sent, including itself.
    pub(crate) in_flight: usize,
    /// `None` if no response was received.
    pub(crate) status: Option<u16>,
}

/// The range the target inflight is clamped to.
///
/// Derived from the connection layout: every connection should be able to carry some minimum
/// number of streams, but never more than it supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InflightBounds {
    min: usize,
    max: usize,
}

impl Sample {
    #[allow(missing_docs)]
    pub fn new(latency: Duration, in_flight: usize, status: Option<u16>) -> Self {
        Self {
            latency,
            in_flight,
            status,
        }
    }

    /// Whether a 2xx response was received.
    pub fn is_success(&self) -> bool {
        matches!(self.status, Some(200..=299))
    }
}

impl InflightBounds {
    const MIN_STREAMS_PER_CONNECTION: usize = 16;

    /// Bounds for `endpoints` endpoints with the given connection layout.
    ///
    /// `min = endpoints × connections × min(16, streams)`,
    /// `max = endpoints × connections × streams`.
    pub fn new(
        endpoints: usize,
        connections_per_endpoint: usize,
        max_streams_per_connection: usize,
    ) -> Self {
        assert!(endpoints > 0, "at least one endpoint is required");
        assert!(connections_per_endpoint > 0);
        assert!(max_streams_per_connection > 0);

        let connections = endpoints * connections_per_endpoint;
        Self {
            min: connections * max_streams_per_connection.min(Self::MIN_STREAMS_PER_CONNECTION),
            max: connections * max_streams_per_connection,
        }
    }

    #[allow(missing_docs)]
    pub fn min(&self) -> usize {
        self.min
    }

    #[allow(missing_docs)]
    pub fn max(&self) -> usize {
        self.max
    }

    pub(crate) fn clamp(&self, inflight: usize) -> usize {
        inflight.clamp(self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_follow_connection_layout() {
        let bounds = InflightBounds::new(1, 4, 1024);
        assert_eq!(bounds.max(), 4096);
        assert_eq!(bounds.min(), 64);

        let few_streams = InflightBounds::new(2, 3, 8);
        assert_eq!(few_streams.max(), 48);
        assert_eq!(few_streams.min(), 48, "min can't exceed the streams available");
    }

    #[test]
    fn only_2xx_is_success() {
        let sample = |status| Sample::new(Duration::from_millis(1), 1, status);
        assert!(sample(Some(200)).is_success());
        assert!(sample(Some(204)).is_success());
        assert!(!sample(Some(429)).is_success());
        assert!(!sample(Some(412)).is_success());
        assert!(!sample(None).is_success());
    }
}
