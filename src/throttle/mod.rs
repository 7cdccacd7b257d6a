//! Local throttling decisions.
//!
//! Each function's concurrency is adjusted once per evaluation tick from two kinds of signal:
//!
//! 1. [Sample]s reported by the function's listener: latency, jobs in flight, and whether the job
//!    was overloaded (loss).
//! 2. Host-wide [ThrottleStatus] from [ThrottleProvider]s, e.g. CPU saturation or an explicit
//!    backpressure signal.

mod options;
mod policy;
mod state;

use std::{
    fmt::Debug,
    sync::atomic::{AtomicU8, Ordering},
    time::Duration,
};

use crate::Outcome;

pub use options::{ConcurrencyOptions, FunctionLimits};
pub use policy::{adjust, Adjustment};
pub use state::{FunctionState, Phase};

/// The result of a job, including the [Outcome] (loss) and latency (delay).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub(crate) latency: Duration,
    /// Jobs in flight when the sample was taken.
    pub(crate) in_flight: usize,
    pub(crate) outcome: Outcome,
}

impl Sample {
    #[allow(missing_docs)]
    pub fn new(latency: Duration, in_flight: usize, outcome: Outcome) -> Self {
        Self {
            latency,
            in_flight,
            outcome,
        }
    }
}

/// Whether a host-wide throttle is currently in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThrottleState {
    /// Not enough information to tell.
    #[default]
    Unknown,
    /// No throttle: there is headroom.
    Disabled,
    /// Throttled: concurrency should come down.
    Enabled,
}

/// A host-wide throttle state, with the names of any throttles which are enabled.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThrottleStatus {
    #[allow(missing_docs)]
    pub state: ThrottleState,
    #[allow(missing_docs)]
    pub enabled_throttles: Vec<String>,
}

/// A source of host-wide throttle signals.
pub trait ThrottleProvider: Debug + Send + Sync {
    /// The current status. Must be cheap and must not block.
    fn status(&self) -> ThrottleStatus;
}

impl ThrottleStatus {
    /// Combine statuses from several providers.
    ///
    /// Enabled if any provider is enabled, disabled only if every provider is disabled, otherwise
    /// unknown. No providers at all means disabled.
    pub fn combine(statuses: impl IntoIterator<Item = ThrottleStatus>) -> ThrottleStatus {
        let mut combined = ThrottleStatus {
            state: ThrottleState::Disabled,
            enabled_throttles: Vec::new(),
        };

        for status in statuses {
            match status.state {
                ThrottleState::Enabled => {
                    combined.state = ThrottleState::Enabled;
                    combined.enabled_throttles.extend(status.enabled_throttles);
                }
                ThrottleState::Unknown if combined.state == ThrottleState::Disabled => {
                    combined.state = ThrottleState::Unknown;
                }
                _ => {}
            }
        }

        combined
    }
}

/// A throttle set directly, e.g. by a listener which sees explicit backpressure.
#[derive(Debug)]
pub struct ManualThrottle {
    name: String,
    state: AtomicU8,
}

impl ManualThrottle {
    /// Starts in [ThrottleState::Unknown].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(encode(ThrottleState::Unknown)),
        }
    }

    #[allow(missing_docs)]
    pub fn set(&self, state: ThrottleState) {
        self.state.store(encode(state), Ordering::Release);
    }
}

impl ThrottleProvider for ManualThrottle {
    fn status(&self) -> ThrottleStatus {
        let state = decode(self.state.load(Ordering::Acquire));
        ThrottleStatus {
            state,
            enabled_throttles: if state == ThrottleState::Enabled {
                vec![self.name.clone()]
            } else {
                Vec::new()
            },
        }
    }
}

fn encode(state: ThrottleState) -> u8 {
    match state {
        ThrottleState::Unknown => 0,
        ThrottleState::Disabled => 1,
        ThrottleState::Enabled => 2,
    }
}

fn decode(raw: u8) -> ThrottleState {
    match raw {
        1 => ThrottleState::Disabled,
        2 => ThrottleState::Enabled,
        _ => ThrottleState::Unknown,
    }
}
