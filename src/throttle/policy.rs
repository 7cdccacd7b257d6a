use std::time::Duration;

use conv::ConvUtil;

use crate::aggregation::Aggregate;

use super::{ConcurrencyOptions, FunctionLimits, ThrottleState};

/// The direction of a single concurrency adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    #[allow(missing_docs)]
    Increase,
    /// No change warranted.
    Hold,
    #[allow(missing_docs)]
    Decrease,
}

/// Additive-increase, multiplicative-decrease over one evaluation window.
///
/// Decreases when:
/// 1. a host-wide throttle is enabled, or
/// 2. too many samples in the window were overloaded, or
/// 3. the window's latency is well above the long-term `baseline`.
///
/// Otherwise increases when there are enough samples and utilisation of the current concurrency is
/// high.
///
/// Returns the direction and the new concurrency, which is always within `limits`.
pub fn adjust(
    current: u32,
    window: &Aggregate,
    baseline: Option<Duration>,
    host: ThrottleState,
    limits: FunctionLimits,
    options: &ConcurrencyOptions,
) -> (Adjustment, u32) {
    let latency_degraded = baseline.is_some_and(|baseline| {
        window.samples > 0
            && window.latency.as_secs_f64() > baseline.as_secs_f64() * options.latency_tolerance
    });
    let overloaded = window.overload_ratio() > options.max_overload_ratio;

    if host == ThrottleState::Enabled || overloaded || latency_degraded {
        let decreased = multiplicative_decrease(current, options.decrease_factor);
        return (Adjustment::Decrease, limits.clamp(decreased));
    }

    // Throttled all the way down, nothing runs so nothing is sampled. Probe once the host has
    // headroom again.
    if current == 0 {
        return if host == ThrottleState::Disabled {
            (Adjustment::Increase, limits.clamp(options.increase_by))
        } else {
            (Adjustment::Hold, limits.clamp(current))
        };
    }

    let utilisation = window.in_flight / f64::from(current);
    if window.samples >= options.min_samples && utilisation >= options.min_utilisation {
        let increased = current.saturating_add(options.increase_by);
        return (Adjustment::Increase, limits.clamp(increased));
    }

    (Adjustment::Hold, limits.clamp(current))
}

fn multiplicative_decrease(current: u32, decrease_factor: f64) -> u32 {
    // Floor instead of round, so the value reduces even with small numbers.
    // E.g. round(2 * 0.9) = 2, but floor(2 * 0.9) = 1
    let decreased = (f64::from(current) * decrease_factor)
        .floor()
        .approx_as::<u32>()
        .unwrap_or(0);

    decreased.min(current.saturating_sub(1))
}
