use std::{
    sync::{
        atomic::{self, AtomicUsize},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::OwnedSemaphorePermit, time::Instant};

/// A concurrency token, required to run a job.
///
/// Release the token back to the [ConcurrencyLimiter](super::ConcurrencyLimiter) after the job is
/// complete. Dropping it without releasing frees the permit but records nothing.
#[derive(Debug)]
pub struct Token {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,

    start: Instant,
    #[cfg(test)]
    latency: Duration,
}

impl Token {
    pub(crate) fn new(permit: OwnedSemaphorePermit, in_flight: Arc<AtomicUsize>) -> Self {
        in_flight.fetch_add(1, atomic::Ordering::SeqCst);
        Self {
            _permit: permit,
            in_flight,
            start: Instant::now(),
            #[cfg(test)]
            latency: Duration::ZERO,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_latency(&mut self, latency: Duration) {
        use std::ops::Sub;

        self.start = Instant::now().sub(latency);
        self.latency = latency;
    }

    #[cfg(test)]
    pub(crate) fn latency(&self) -> Duration {
        self.latency
    }

    #[cfg(not(test))]
    pub(crate) fn latency(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Token {
    /// Reduces the number of jobs in flight. The permit goes back to the pool.
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, atomic::Ordering::SeqCst);
    }
}
