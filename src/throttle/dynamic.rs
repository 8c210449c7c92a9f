use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use conv::ConvUtil;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tokio::{sync::Mutex, time::Instant};
use tracing::trace;

use crate::moving_avg;

use super::{InflightBounds, Sample, StaticThrottler, Throttler, MIN_SAMPLE_LATENCY};

/// Delay-based search for the concurrency which best trades throughput against latency.
///
/// Keeps a latency estimate for each of a set of buckets, spread logarithmically over
/// `[min, 256 × min)`. Samples update the bucket matching the concurrency they were sent at.
/// Periodically, the bucket maximising `inflight^0.8 / latency` is picked, and the target is set
/// to a random point near it. The random walk is skewed upwards, so unexplored, higher
/// concurrency levels keep getting tried.
///
/// Wraps a [StaticThrottler], whose target acts as a ceiling: throttling responses cut concurrency
/// immediately, whatever the search believes.
#[derive(Debug)]
pub struct DynamicThrottler {
    ceiling: StaticThrottler,
    bounds: InflightBounds,

    target: AtomicUsize,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    latencies: Vec<moving_avg::ExpSmoothed>,
    next_update: Instant,
    rng: SmallRng,
}

impl DynamicThrottler {
    const BUCKETS: usize = 128;
    const SPAN: f64 = 256.;

    /// Weighting of throughput against latency in the objective.
    const THROUGHPUT_WEIGHT: f64 = 0.8;

    const SUCCESS_SMOOTHING: f64 = 0.01;
    /// Non-successes replace the estimate outright.
    const FAILURE_SMOOTHING: f64 = 1.0;

    const UPDATE_INTERVAL: Duration = Duration::from_millis(100);

    const MIN_WALK: f64 = 0.95;
    const MAX_WALK: f64 = 1.10;

    #[allow(missing_docs)]
    pub fn new(bounds: InflightBounds) -> Self {
        Self {
            ceiling: StaticThrottler::new(bounds),
            bounds,

            target: AtomicUsize::new(bounds.min()),
            inner: Mutex::new(Inner {
                latencies: vec![moving_avg::ExpSmoothed::default(); Self::BUCKETS],
                next_update: Instant::now(),
                rng: SmallRng::from_entropy(),
            }),
        }
    }

    /// Use a deterministic random walk.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.inner.get_mut().rng = SmallRng::seed_from_u64(seed);
        self
    }

    fn bucket_index(&self, in_flight: usize) -> usize {
        let relative = (in_flight as f64 / self.bounds.min() as f64).max(1.);
        let index = Self::BUCKETS as f64 * relative.ln() / Self::SPAN.ln();

        index
            .floor()
            .approx_as::<usize>()
            .unwrap_or(usize::MAX)
            .min(Self::BUCKETS - 1)
    }

    fn bucket_inflight(&self, index: usize) -> f64 {
        self.bounds.min() as f64 * Self::SPAN.powf((index as f64 + 0.5) / Self::BUCKETS as f64)
    }

    fn best_inflight(&self, inner: &Inner) -> Option<f64> {
        let mut best: Option<(f64, f64)> = None;

        for (index, bucket) in inner.latencies.iter().enumerate() {
            let Some(latency) = bucket.value() else {
                continue;
            };
            let inflight = self.bucket_inflight(index);
            let objective = inflight.powf(Self::THROUGHPUT_WEIGHT)
                / latency.max(MIN_SAMPLE_LATENCY).as_secs_f64();

            if best.map_or(true, |(max, _)| objective > max) {
                best = Some((objective, inflight));
            }
        }

        best.map(|(_, inflight)| inflight)
    }
}

#[async_trait]
impl Throttler for DynamicThrottler {
    async fn sent(&self, sample: Sample) {
        let index = self.bucket_index(sample.in_flight);
        let smoothing = if sample.is_success() {
            Self::SUCCESS_SMOOTHING
        } else {
            Self::FAILURE_SMOOTHING
        };

        let mut inner = self.inner.lock().await;
        inner.latencies[index].sample(sample.latency, smoothing);

        let now = Instant::now();
        if now < inner.next_update {
            return;
        }
        inner.next_update = now + Self::UPDATE_INTERVAL;

        let Some(best) = self.best_inflight(&inner) else {
            return;
        };
        let walk = inner.rng.gen_range(Self::MIN_WALK..Self::MAX_WALK);
        let target = self.bounds.clamp(
            (walk * best)
                .round()
                .approx_as::<usize>()
                .unwrap_or(usize::MAX),
        );
        self.target.store(target, Ordering::Release);

        trace!(best, target, "recalculated target inflight");
    }

    fn success(&self) {
        self.ceiling.success();
    }

    fn throttled(&self, in_flight: usize) {
        self.ceiling.throttled(in_flight);
    }

    fn target_inflight(&self) -> usize {
        self.ceiling
            .target_inflight()
            .min(self.target.load(Ordering::Acquire))
    }
}
