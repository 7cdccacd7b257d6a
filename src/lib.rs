//! Dynamic per-function concurrency control for job hosts.
//!
//! A [ConcurrencyThrottleManager] adjusts each function's concurrency on a fixed tick, based on
//! samples reported by listeners and host-wide throttle signals. Decisions are published as
//! [HostConcurrencySnapshot]s through a [ConcurrencyStatusRepository], so a restarted host can
//! resume where it left off. Listeners enforce decisions with a [ConcurrencyLimiter].

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

pub mod aggregation;
mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod host_id;
mod limiter;
pub mod manager;
mod moving_avg;
pub mod repository;
pub mod snapshot;
pub mod storage;
pub mod throttle;

pub use config::Settings;
pub use error::{Error, Result};
pub use limiter::{ConcurrencyLimiter, LimiterState, Outcome, Token};
pub use manager::{ConcurrencyThrottleManager, Evaluation};
pub use repository::{
    BlobStorageConcurrencyStatusRepository, ConcurrencyStatusRepository,
    NullConcurrencyStatusRepository,
};
pub use snapshot::{FunctionConcurrencySnapshot, HostConcurrencySnapshot};
pub use throttle::ConcurrencyOptions;
