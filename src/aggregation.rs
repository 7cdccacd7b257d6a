//! [Sample] aggregation over one evaluation window.

use std::time::Duration;

use crate::{throttle::Sample, Outcome};

/// Summary of the samples seen in a window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Aggregate {
    /// Mean latency.
    pub latency: Duration,
    /// Mean jobs in flight when each sample was taken.
    pub in_flight: f64,
    /// How many samples were overloaded.
    pub overloads: usize,
    /// How many samples were aggregated.
    pub samples: usize,
}

/// Average latency and concurrency (in flight), and a count of overloads.
#[derive(Debug, Default)]
pub struct Average {
    latency_sum: Duration,
    in_flight_sum: u128,
    overloads: usize,
    samples: usize,
}

impl Average {
    /// Add a sample to the aggregation.
    ///
    /// Returns the current aggregate.
    pub fn sample(&mut self, sample: Sample) -> Aggregate {
        self.latency_sum += sample.latency;
        self.in_flight_sum += sample.in_flight as u128;
        if sample.outcome == Outcome::Overload {
            self.overloads += 1;
        }
        self.samples += 1;
        self.aggregate()
    }

    /// The current aggregate. All zeroes if there are no samples.
    pub fn aggregate(&self) -> Aggregate {
        if self.samples == 0 {
            return Aggregate::default();
        }
        Aggregate {
            latency: self.latency_sum.div_f64(self.samples as f64),
            in_flight: self.in_flight_sum as f64 / self.samples as f64,
            overloads: self.overloads,
            samples: self.samples,
        }
    }

    #[allow(missing_docs)]
    pub fn sample_size(&self) -> usize {
        self.samples
    }

    /// Return the current aggregate and start a new window.
    pub fn take(&mut self) -> Aggregate {
        let aggregate = self.aggregate();
        *self = Self::default();
        aggregate
    }
}

impl Aggregate {
    /// Fraction of samples which were overloaded, from 0 to 1.
    pub fn overload_ratio(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.overloads as f64 / self.samples as f64
        }
    }
}
