use std::sync::atomic::{AtomicU64, Ordering};

/// An exponentially weighted estimate of the fraction of recent attempts which failed.
#[derive(Debug)]
pub(crate) struct ErrorRate {
    /// Bits of an `f64` in `[0, 1]`.
    rate: AtomicU64,
    cycle: f64,
}

impl ErrorRate {
    /// Roughly how many attempts the estimate remembers.
    pub(crate) const DEFAULT_CYCLE: f64 = 1000.;

    pub(crate) fn new(cycle: f64) -> Self {
        assert!(cycle >= 1., "cycle must be at least one attempt");
        Self {
            rate: AtomicU64::new(0f64.to_bits()),
            cycle,
        }
    }

    /// Move the estimate towards 1. Returns the new estimate.
    pub(crate) fn failure(&self) -> f64 {
        self.update(|rate| rate + (1. - rate) / self.cycle)
    }

    /// Move the estimate towards 0.
    pub(crate) fn success(&self) {
        self.update(|rate| rate - rate / self.cycle);
    }

    pub(crate) fn value(&self) -> f64 {
        f64::from_bits(self.rate.load(Ordering::Acquire))
    }

    fn update(&self, f: impl Fn(f64) -> f64) -> f64 {
        let previous = self
            .rate
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some(f(f64::from_bits(bits)).clamp(0., 1.).to_bits())
            })
            .expect("we always return Some(rate)");
        f(f64::from_bits(previous)).clamp(0., 1.)
    }
}

impl Default for ErrorRate {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CYCLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_on_failure_fraction() {
        let rate = ErrorRate::new(100.);

        for i in 0..10_000 {
            if i % 5 == 0 {
                rate.failure();
            } else {
                rate.success();
            }
        }

        let value = rate.value();
        assert!((0.15..0.25).contains(&value), "rate = {value}");
    }

    #[test]
    fn grows_towards_one() {
        let rate = ErrorRate::new(10.);

        assert!((rate.failure() - 0.1).abs() < 1e-12);
        assert!((rate.failure() - 0.19).abs() < 1e-12);
        for _ in 0..1000 {
            rate.failure();
        }
        assert!(rate.value() <= 1.);
        assert!(rate.value() > 0.99);

        rate.success();
        assert!(rate.value() < 0.99);
    }
}
