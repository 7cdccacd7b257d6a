//! Moving averages.

use std::time::Duration;

/// An [exponential moving average](https://en.wikipedia.org/wiki/Exponential_smoothing).
///
/// Used as a long-term latency baseline, sampled once per evaluation window.
#[derive(Debug)]
pub struct ExpSmoothed {
    /// Smoothing factor `α`. Weighting for the newest sample.
    ///
    /// 0 < `a` < 1
    smoothing_factor: f64,

    value: Duration,

    // For initial warmup period
    initial_sum: Duration,
    initial_count: u16,
    warmup_samples: u16,
}

impl ExpSmoothed {
    /// > Exponential smoothing puts substantial weight on past observations, so the initial value
    /// > of demand will have an unreasonably large effect on early forecasts. This problem can be
    /// > overcome by allowing the process to evolve for a reasonable number of periods (10 or more)
    /// > and using the average of the demand during those periods as the initial forecast.
    /// >
    /// > [Source](https://en.wikipedia.org/wiki/Exponential_smoothing#Choosing_the_initial_smoothed_value)
    const MAX_WARMUP_SAMPLES: u16 = 10;

    pub fn new_with_window_size(k: u16) -> Self {
        Self {
            smoothing_factor: Self::smoothing_for_window(k),
            value: Duration::ZERO,
            initial_sum: Duration::ZERO,
            initial_count: 0,
            warmup_samples: k.min(Self::MAX_WARMUP_SAMPLES),
        }
    }

    pub fn sample(&mut self, sample: Duration) -> Duration {
        if self.initial_count < self.warmup_samples {
            self.initial_sum += sample;
            self.initial_count += 1;

            self.value = self.initial_sum / self.initial_count.into();
        } else if sample >= self.value {
            self.value += (sample - self.value).mul_f64(self.smoothing_factor);
        } else {
            self.value -= (self.value - sample).mul_f64(self.smoothing_factor);
        }
        self.value
    }

    /// The current average, or `None` before the first sample.
    pub fn value(&self) -> Option<Duration> {
        (self.initial_count > 0).then_some(self.value)
    }

    fn smoothing_for_window(k: u16) -> f64 {
        assert!(k > 0, "window size must be > 0");
        assert!(k < u16::MAX, "window size mustn't overflow");

        2.0 / (f64::from(k + 1))
    }
}
