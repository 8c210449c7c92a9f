//! Moving averages.

use std::time::Duration;

/// An [exponential moving average](https://en.wikipedia.org/wiki/Exponential_smoothing) of
/// latency, unknown until the first sample.
///
/// The smoothing factor is given per sample, so callers can weight some observations more
/// heavily than others.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ExpSmoothed {
    value: Option<Duration>,
}

impl ExpSmoothed {
    /// Move the average towards `sample` by `smoothing_factor`.
    ///
    /// 0 <= `smoothing_factor` <= 1. The first sample is taken as-is.
    pub(crate) fn sample(&mut self, sample: Duration, smoothing_factor: f64) -> Duration {
        debug_assert!((0.0..=1.0).contains(&smoothing_factor));

        let value = match self.value {
            None => sample,
            Some(value) => {
                value.mul_f64(1.0 - smoothing_factor) + sample.mul_f64(smoothing_factor)
            }
        };
        self.value = Some(value);
        value
    }

    pub(crate) fn value(&self) -> Option<Duration> {
        self.value
    }
}
