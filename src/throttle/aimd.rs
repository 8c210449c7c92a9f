use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{InflightBounds, Sample, Throttler};

/// Loss-based congestion avoidance.
///
/// Additive-increase, multiplicative decrease.
///
/// Starts at the maximum. Every success adds 0.1 to the target; every throttling response sets it
/// to half the concurrency observed when the response arrived, but never below the minimum.
#[derive(Debug)]
pub struct StaticThrottler {
    bounds: InflightBounds,

    /// Ten times the target, so it can grow in steps of 0.1.
    target_x10: AtomicUsize,
}

impl StaticThrottler {
    const SCALE: usize = 10;
    const INCREASE_X10: usize = 1;
    /// Halves the observed concurrency, expressed in tenths.
    const DECREASE_X10: usize = Self::SCALE / 2;

    #[allow(missing_docs)]
    pub fn new(bounds: InflightBounds) -> Self {
        Self {
            bounds,
            target_x10: AtomicUsize::new(bounds.max() * Self::SCALE),
        }
    }

    #[allow(missing_docs)]
    pub fn bounds(&self) -> InflightBounds {
        self.bounds
    }
}

#[async_trait]
impl Throttler for StaticThrottler {
    async fn sent(&self, _sample: Sample) {}

    fn success(&self) {
        let ceiling = self.bounds.max() * Self::SCALE;
        self.target_x10
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |target| {
                Some((target + Self::INCREASE_X10).min(ceiling))
            })
            .expect("we always return Some(target)");
    }

    fn throttled(&self, in_flight: usize) {
        let target = in_flight
            .saturating_mul(Self::DECREASE_X10)
            .max(self.bounds.min() * Self::SCALE);
        self.target_x10.store(target, Ordering::SeqCst);
    }

    fn target_inflight(&self) -> usize {
        self.bounds
            .clamp(self.target_x10.load(Ordering::Acquire) / Self::SCALE)
    }
}
