use crate::{aggregation::Average, moving_avg::ExpSmoothed};

use super::{adjust, Adjustment, ConcurrencyOptions, FunctionLimits, Sample, ThrottleState};

/// Where a function is in its concurrency lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No history yet. Running at the configured floor.
    Warming,
    #[allow(missing_docs)]
    Increasing,
    /// Last evaluation found no reason to change.
    Steady,
    #[allow(missing_docs)]
    Decreasing,
    /// Explicitly paused. Concurrency is zero until resumed.
    Paused,
}

/// Throttling state for one function.
#[derive(Debug)]
pub struct FunctionState {
    phase: Phase,
    concurrency: u32,
    /// Concurrency to go back to on resume.
    paused_from: Option<u32>,

    window: Average,
    baseline: ExpSmoothed,
}

impl FunctionState {
    /// Number of windows the latency baseline is smoothed over.
    const BASELINE_WINDOWS: u16 = 20;

    #[allow(missing_docs)]
    pub fn new(limits: FunctionLimits) -> Self {
        Self {
            phase: Phase::Warming,
            concurrency: limits.initial(),
            paused_from: None,
            window: Average::default(),
            baseline: ExpSmoothed::new_with_window_size(Self::BASELINE_WINDOWS),
        }
    }

    #[allow(missing_docs)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The current decision.
    pub fn concurrency(&self) -> u32 {
        self.concurrency
    }

    /// Add a sample to the current window. Ignored while paused.
    pub fn record(&mut self, sample: Sample) {
        if self.phase != Phase::Paused {
            self.window.sample(sample);
        }
    }

    /// Close the current window and adjust concurrency.
    ///
    /// An empty window leaves everything unchanged, except that a function throttled down to zero
    /// is probed back up once the host has headroom.
    ///
    /// Returns the new concurrency.
    pub fn evaluate(
        &mut self,
        host: ThrottleState,
        options: &ConcurrencyOptions,
        limits: FunctionLimits,
    ) -> u32 {
        if self.phase == Phase::Paused {
            return self.concurrency;
        }

        let window = self.window.take();
        if window.samples == 0 && self.concurrency > 0 {
            return self.concurrency;
        }

        let (adjustment, concurrency) = adjust(
            self.concurrency,
            &window,
            self.baseline.value(),
            host,
            limits,
            options,
        );

        // Compare against the baseline before it absorbs this window, and don't let degraded
        // windows drag the baseline up.
        if window.samples > 0 && adjustment != Adjustment::Decrease {
            self.baseline.sample(window.latency);
        }

        self.phase = match adjustment {
            Adjustment::Increase => Phase::Increasing,
            Adjustment::Decrease => Phase::Decreasing,
            Adjustment::Hold => Phase::Steady,
        };
        self.concurrency = concurrency;
        self.concurrency
    }

    /// Start from a previously published value instead of the floor.
    ///
    /// Only applies while still [Warming](Phase::Warming). Zero (paused) seeds the floor, since
    /// pauses are only ever applied explicitly.
    ///
    /// Returns whether the seed was applied.
    pub fn seed(&mut self, concurrency: u32, limits: FunctionLimits) -> bool {
        if self.phase != Phase::Warming {
            return false;
        }
        self.concurrency = limits.clamp(concurrency).max(limits.initial());
        true
    }

    /// Stop the function: concurrency is zero until [resume](Self::resume)d.
    pub fn pause(&mut self) {
        if self.phase == Phase::Paused {
            return;
        }
        self.paused_from = Some(self.concurrency);
        self.window.take();
        self.phase = Phase::Paused;
        self.concurrency = 0;
    }

    /// Restore the concurrency from before the pause. Does nothing if not paused.
    pub fn resume(&mut self, limits: FunctionLimits) {
        if self.phase != Phase::Paused {
            return;
        }
        let restored = self.paused_from.take().unwrap_or_else(|| limits.initial());
        self.concurrency = limits.clamp(restored).max(limits.initial());
        self.phase = Phase::Steady;
    }
}
