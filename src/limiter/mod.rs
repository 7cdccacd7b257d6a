use std::{
    cmp,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use conv::ValueFrom;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError},
    time::timeout,
};

pub use token::Token;

use crate::manager::ConcurrencyThrottleManager;

mod token;

/// Enforces one function's concurrency on the listener side.
///
/// Concurrency is limited through the use of [Token]s. Acquire a token to run a job, and release the
/// token once the job is finished. The number of tokens follows the
/// [ConcurrencyThrottleManager]'s decision for the function, and released tokens feed samples back
/// into it.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    function_id: String,
    manager: Arc<ConcurrencyThrottleManager>,

    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,

    /// Best-effort
    in_flight: Arc<AtomicUsize>,

    #[cfg(test)]
    notifier: Option<Arc<tokio::sync::Notify>>,
}

/// A snapshot of the state of the [ConcurrencyLimiter].
///
/// Not guaranteed to be consistent under high concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterState {
    limit: usize,
    available: usize,
    in_flight: usize,
}

/// Whether a job succeeded or failed as a result of congestion/overload.
///
/// Errors not considered to be caused by overload should be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The job succeeded, or failed in a way unrelated to overload.
    Success,
    /// The job failed because of overload, e.g. it timed out or an explicit backpressure signal
    /// was observed.
    Overload,
}

impl ConcurrencyLimiter {
    /// Create a limiter for `function_id`, starting at the manager's current decision.
    pub fn new(manager: Arc<ConcurrencyThrottleManager>, function_id: impl Into<String>) -> Self {
        let function_id = function_id.into();
        let initial_permits = to_usize(manager.get_current_concurrency(&function_id));

        Self {
            function_id,
            manager,
            semaphore: Arc::new(Semaphore::new(initial_permits)),
            limit: AtomicUsize::new(initial_permits),
            in_flight: Arc::new(AtomicUsize::new(0)),

            #[cfg(test)]
            notifier: None,
        }
    }

    /// In some cases permits are removed asynchronously when the limit goes down.
    #[cfg(test)]
    pub fn with_release_notifier(mut self, n: Arc<tokio::sync::Notify>) -> Self {
        self.notifier.replace(n);
        self
    }

    #[allow(missing_docs)]
    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    /// Try to immediately acquire a concurrency [Token].
    ///
    /// Returns `None` if there are none available.
    pub fn try_acquire(&self) -> Option<Token> {
        self.sync();

        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Some(self.mint_token(permit)),
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => None,
        }
    }

    /// Try to acquire a concurrency [Token], waiting for `duration` if there are none available.
    ///
    /// Returns `None` if there are none available after `duration`.
    pub async fn acquire_timeout(&self, duration: Duration) -> Option<Token> {
        self.sync();

        match timeout(duration, Arc::clone(&self.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => Some(self.mint_token(permit)),
            Ok(Err(_)) | Err(_) => None,
        }
    }

    /// Return the concurrency [Token], along with the outcome of the job.
    ///
    /// The [Outcome] of the job, and the time taken to perform it, are recorded with the manager
    /// for its next evaluation.
    ///
    /// Set the outcome to `None` to ignore the job.
    pub fn release(&self, token: Token, outcome: Option<Outcome>) {
        if let Some(outcome) = outcome {
            self.manager.record_sample(
                &self.function_id,
                token.latency(),
                self.in_flight(),
                outcome,
            );
        }

        drop(token);
    }

    /// Align the number of permits with the manager's current decision.
    ///
    /// Returns the new limit.
    pub fn sync(&self) -> usize {
        let new_limit = to_usize(self.manager.get_current_concurrency(&self.function_id));
        let old_limit = self.limit.swap(new_limit, Ordering::SeqCst);

        match new_limit.cmp(&old_limit) {
            cmp::Ordering::Greater => {
                self.semaphore.add_permits(new_limit - old_limit);
                self.notify();
            }
            cmp::Ordering::Less => {
                let reduce_by = u32::value_from(old_limit - new_limit).unwrap_or(u32::MAX);

                if let Ok(permits) = self.semaphore.try_acquire_many(reduce_by) {
                    permits.forget();
                    self.notify();
                    return new_limit;
                }

                let semaphore = self.semaphore.clone();
                #[cfg(test)]
                let notifier = self.notifier.clone();

                tokio::spawn(async move {
                    // If there aren't enough permits available then this will wait until enough
                    // become available. This could take a while, so we do this in the background.
                    if let Ok(permits) = semaphore.acquire_many(reduce_by).await {
                        // Acquiring some permits and throwing them away reduces the available limit.
                        permits.forget();
                    }

                    #[cfg(test)]
                    if let Some(n) = notifier {
                        n.notify_one();
                    }
                });
            }
            cmp::Ordering::Equal => {}
        }

        new_limit
    }

    /// The current state of the limiter.
    pub fn state(&self) -> LimiterState {
        LimiterState {
            limit: self.limit.load(Ordering::Acquire),
            available: self.semaphore.available_permits(),
            in_flight: self.in_flight(),
        }
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn mint_token(&self, permit: OwnedSemaphorePermit) -> Token {
        Token::new(permit, self.in_flight.clone())
    }

    fn notify(&self) {
        #[cfg(test)]
        if let Some(n) = &self.notifier {
            n.notify_one();
        }
    }
}

impl LimiterState {
    /// The current concurrency limit.
    pub fn limit(&self) -> usize {
        self.limit
    }
    /// The amount of concurrency available to use.
    pub fn available(&self) -> usize {
        self.available
    }
    /// The number of jobs in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

fn to_usize(concurrency: u32) -> usize {
    usize::value_from(concurrency).unwrap_or(usize::MAX)
}
