use std::{collections::HashMap, time::Duration};

use serde::Deserialize;

use crate::config::{ConfigError, Settings};

/// Parameters of the control loop and the concurrency adjustment policy.
///
/// Can be deserialized (field names in camelCase, durations in milliseconds), read from
/// [Settings] under the `concurrency:` section, or built up with the `with_*` methods.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConcurrencyOptions {
    /// How often every function's concurrency is re-evaluated.
    #[serde(rename = "evaluationIntervalMs", with = "millis")]
    pub evaluation_interval: Duration,

    /// Publish at least this often, even if nothing changed.
    #[serde(rename = "heartbeatIntervalMs", with = "millis")]
    pub heartbeat_interval: Duration,

    /// Publish early when any function's concurrency moved by more than this.
    pub publish_threshold: u32,

    /// Read the previous snapshot on startup and publish new ones.
    pub snapshot_persistence_enabled: bool,

    /// Snapshots older than this aren't used to resume on startup.
    #[serde(rename = "snapshotMaxAgeMs", with = "optional_millis")]
    pub snapshot_max_age: Option<Duration>,

    /// Default bounds for every function.
    #[serde(flatten)]
    pub limits: FunctionLimits,

    /// Per-function bounds, overriding [limits](Self::limits).
    pub function_limits: HashMap<String, FunctionLimits>,

    /// Additive increase.
    pub increase_by: u32,

    /// Multiplicative decrease. 0.5 <= factor < 1.
    pub decrease_factor: f64,

    /// Samples needed in a window before concurrency can increase.
    pub min_samples: usize,

    /// Utilisation (jobs in flight / concurrency) needed before concurrency can increase.
    pub min_utilisation: f64,

    /// Decrease when more than this fraction of a window's samples were overloaded.
    pub max_overload_ratio: f64,

    /// Decrease when a window's latency exceeds the long-term baseline by this factor.
    pub latency_tolerance: f64,
}

/// Bounds on one function's concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunctionLimits {
    /// Concurrency is never lowered below this. Zero allows a function to be throttled to a
    /// standstill.
    #[serde(rename = "minConcurrency")]
    pub min: u32,
    /// Concurrency is never raised above this.
    #[serde(rename = "maxConcurrency")]
    pub max: u32,
}

impl ConcurrencyOptions {
    const DEFAULT_EVALUATION_INTERVAL: Duration = Duration::from_secs(1);
    const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
    const DEFAULT_INCREASE: u32 = 1;
    const DEFAULT_DECREASE_FACTOR: f64 = 0.9;
    const DEFAULT_MIN_SAMPLES: usize = 1;
    const DEFAULT_INCREASE_MIN_UTILISATION: f64 = 0.8;
    const DEFAULT_MAX_OVERLOAD_RATIO: f64 = 0.1;
    const DEFAULT_LATENCY_TOLERANCE: f64 = 2.0;

    /// Read options from the `concurrency:` section, falling back to defaults.
    ///
    /// Recognised keys: `evaluationIntervalMs`, `heartbeatIntervalMs`, `publishThreshold`,
    /// `snapshotPersistenceEnabled`, `snapshotMaxAgeMs`, `minConcurrency`, `maxConcurrency`,
    /// `increaseBy`, `decreaseFactor`, `minSamples`, `minUtilisation`, `maxOverloadRatio`,
    /// `latencyTolerance`.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let key = |name: &str| format!("concurrency:{name}");
        let mut options = Self::default();

        if let Some(ms) = settings.parse::<u64>(&key("evaluationIntervalMs"))? {
            options.evaluation_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = settings.parse::<u64>(&key("heartbeatIntervalMs"))? {
            options.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(threshold) = settings.parse(&key("publishThreshold"))? {
            options.publish_threshold = threshold;
        }
        if let Some(enabled) = settings.parse(&key("snapshotPersistenceEnabled"))? {
            options.snapshot_persistence_enabled = enabled;
        }
        if let Some(ms) = settings.parse::<u64>(&key("snapshotMaxAgeMs"))? {
            options.snapshot_max_age = Some(Duration::from_millis(ms));
        }
        if let Some(min) = settings.parse(&key("minConcurrency"))? {
            options.limits.min = min;
        }
        if let Some(max) = settings.parse(&key("maxConcurrency"))? {
            options.limits.max = max;
        }
        if let Some(increase) = settings.parse(&key("increaseBy"))? {
            options.increase_by = increase;
        }
        if let Some(factor) = settings.parse(&key("decreaseFactor"))? {
            options.decrease_factor = factor;
        }
        if let Some(samples) = settings.parse(&key("minSamples"))? {
            options.min_samples = samples;
        }
        if let Some(util) = settings.parse(&key("minUtilisation"))? {
            options.min_utilisation = util;
        }
        if let Some(ratio) = settings.parse(&key("maxOverloadRatio"))? {
            options.max_overload_ratio = ratio;
        }
        if let Some(tolerance) = settings.parse(&key("latencyTolerance"))? {
            options.latency_tolerance = tolerance;
        }

        options.validate()?;
        Ok(options)
    }

    /// Check that every parameter is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, reason: &str| {
            Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: reason.to_string(),
            })
        };

        if self.evaluation_interval.is_zero() {
            return invalid("evaluationIntervalMs", "must be > 0");
        }
        if self.heartbeat_interval < self.evaluation_interval {
            return invalid("heartbeatIntervalMs", "must be >= evaluationIntervalMs");
        }
        let all_limits = std::iter::once(("default", &self.limits)).chain(
            self.function_limits
                .iter()
                .map(|(name, limits)| (name.as_str(), limits)),
        );
        for (name, limits) in all_limits {
            if limits.max == 0 || limits.min > limits.max {
                return invalid(
                    "maxConcurrency",
                    &format!("{name}: must be > 0 and >= minConcurrency"),
                );
            }
        }
        if self.increase_by == 0 {
            return invalid("increaseBy", "must be > 0");
        }
        if !(0.5..1.0).contains(&self.decrease_factor) {
            return invalid("decreaseFactor", "must be in [0.5, 1)");
        }
        if self.min_samples == 0 {
            return invalid("minSamples", "must be > 0");
        }
        if !(0.0..=1.0).contains(&self.min_utilisation) {
            return invalid("minUtilisation", "must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.max_overload_ratio) {
            return invalid("maxOverloadRatio", "must be in [0, 1]");
        }
        if !self.latency_tolerance.is_finite() || self.latency_tolerance < 1.0 {
            return invalid("latencyTolerance", "must be finite and >= 1");
        }

        Ok(())
    }

    /// The bounds for a function.
    pub fn limits_for(&self, function_id: &str) -> FunctionLimits {
        self.function_limits
            .get(function_id)
            .copied()
            .unwrap_or(self.limits)
    }

    #[allow(missing_docs)]
    pub fn with_evaluation_interval(mut self, interval: Duration) -> Self {
        assert!(!interval.is_zero());
        self.evaluation_interval = interval;
        self
    }

    #[allow(missing_docs)]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        assert!(!interval.is_zero());
        self.heartbeat_interval = interval;
        self
    }

    #[allow(missing_docs)]
    pub fn with_publish_threshold(mut self, threshold: u32) -> Self {
        self.publish_threshold = threshold;
        self
    }

    #[allow(missing_docs)]
    pub fn with_snapshot_persistence(mut self, enabled: bool) -> Self {
        self.snapshot_persistence_enabled = enabled;
        self
    }

    #[allow(missing_docs)]
    pub fn with_snapshot_max_age(mut self, max_age: Duration) -> Self {
        self.snapshot_max_age = Some(max_age);
        self
    }

    #[allow(missing_docs)]
    pub fn with_limits(mut self, min: u32, max: u32) -> Self {
        assert!(max > 0 && min <= max);
        self.limits = FunctionLimits { min, max };
        self
    }

    /// Bounds for one function, overriding the defaults.
    pub fn with_function_limits(mut self, function_id: impl Into<String>, min: u32, max: u32) -> Self {
        assert!(max > 0 && min <= max);
        self.function_limits
            .insert(function_id.into(), FunctionLimits { min, max });
        self
    }

    #[allow(missing_docs)]
    pub fn increase_by(mut self, increase: u32) -> Self {
        assert!(increase > 0);
        self.increase_by = increase;
        self
    }

    #[allow(missing_docs)]
    pub fn decrease_factor(mut self, factor: f64) -> Self {
        assert!((0.5..1.0).contains(&factor));
        self.decrease_factor = factor;
        self
    }

    /// At least this many samples need to be aggregated in a window before increasing.
    pub fn with_min_samples(mut self, samples: usize) -> Self {
        assert!(samples > 0, "at least one sample required per window");
        self.min_samples = samples;
        self
    }

    /// A threshold below which the limit won't be increased. 0.5 = 50%.
    pub fn with_min_utilisation_threshold(mut self, min_util: f64) -> Self {
        assert!((0.0..=1.0).contains(&min_util));
        self.min_utilisation = min_util;
        self
    }

    #[allow(missing_docs)]
    pub fn with_max_overload_ratio(mut self, ratio: f64) -> Self {
        assert!((0.0..=1.0).contains(&ratio));
        self.max_overload_ratio = ratio;
        self
    }

    #[allow(missing_docs)]
    pub fn with_latency_tolerance(mut self, tolerance: f64) -> Self {
        assert!(tolerance.is_finite() && tolerance >= 1.0);
        self.latency_tolerance = tolerance;
        self
    }
}

impl Default for ConcurrencyOptions {
    fn default() -> Self {
        Self {
            evaluation_interval: Self::DEFAULT_EVALUATION_INTERVAL,
            heartbeat_interval: Self::DEFAULT_HEARTBEAT_INTERVAL,
            publish_threshold: 0,
            snapshot_persistence_enabled: true,
            snapshot_max_age: None,
            limits: FunctionLimits::default(),
            function_limits: HashMap::new(),
            increase_by: Self::DEFAULT_INCREASE,
            decrease_factor: Self::DEFAULT_DECREASE_FACTOR,
            min_samples: Self::DEFAULT_MIN_SAMPLES,
            min_utilisation: Self::DEFAULT_INCREASE_MIN_UTILISATION,
            max_overload_ratio: Self::DEFAULT_MAX_OVERLOAD_RATIO,
            latency_tolerance: Self::DEFAULT_LATENCY_TOLERANCE,
        }
    }
}

impl FunctionLimits {
    const DEFAULT_MIN: u32 = 1;
    const DEFAULT_MAX: u32 = 500;

    /// The concurrency a function starts at with no history: the floor, but at least 1.
    pub fn initial(&self) -> u32 {
        self.min.max(1).min(self.max)
    }

    #[allow(missing_docs)]
    pub fn clamp(&self, concurrency: u32) -> u32 {
        concurrency.clamp(self.min, self.max)
    }
}

impl Default for FunctionLimits {
    fn default() -> Self {
        Self {
            min: Self::DEFAULT_MIN,
            max: Self::DEFAULT_MAX,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(ConcurrencyOptions::default().validate(), Ok(()));
    }

    #[test]
    fn deserialize_json() {
        let options: ConcurrencyOptions = serde_json::from_str(
            r#"{
                "evaluationIntervalMs": 500,
                "heartbeatIntervalMs": 30000,
                "minConcurrency": 0,
                "maxConcurrency": 50,
                "functionLimits": { "orders": { "minConcurrency": 2, "maxConcurrency": 8 } },
                "decreaseFactor": 0.5
            }"#,
        )
        .unwrap();

        assert_eq!(options.evaluation_interval, Duration::from_millis(500));
        assert_eq!(options.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(options.limits, FunctionLimits { min: 0, max: 50 });
        assert_eq!(options.limits_for("orders"), FunctionLimits { min: 2, max: 8 });
        assert_eq!(options.limits_for("other"), FunctionLimits { min: 0, max: 50 });
        assert_eq!(options.decrease_factor, 0.5);
        assert_eq!(options.increase_by, 1, "unspecified fields keep defaults");
        assert_eq!(options.validate(), Ok(()));
    }

    #[test]
    fn from_settings() {
        let settings: Settings = [
            ("Concurrency__EvaluationIntervalMs", "250"),
            ("concurrency:MaxConcurrency", "20"),
            ("concurrency:snapshotPersistenceEnabled", "false"),
            ("concurrency:snapshotMaxAgeMs", "60000"),
        ]
        .into_iter()
        .collect();

        let options = ConcurrencyOptions::from_settings(&settings).unwrap();

        assert_eq!(options.evaluation_interval, Duration::from_millis(250));
        assert_eq!(options.limits.max, 20);
        assert!(!options.snapshot_persistence_enabled);
        assert_eq!(options.snapshot_max_age, Some(Duration::from_secs(60)));
    }

    #[test]
    fn from_settings_rejects_invalid() {
        let settings: Settings = [("concurrency:decreaseFactor", "1.5")].into_iter().collect();
        assert!(matches!(
            ConcurrencyOptions::from_settings(&settings),
            Err(ConfigError::InvalidValue { key, .. }) if key == "decreaseFactor"
        ));

        let settings: Settings = [("concurrency:maxConcurrency", "lots")].into_iter().collect();
        assert!(ConcurrencyOptions::from_settings(&settings).is_err());

        let settings: Settings = [
            ("concurrency:minConcurrency", "10"),
            ("concurrency:maxConcurrency", "5"),
        ]
        .into_iter()
        .collect();
        assert!(ConcurrencyOptions::from_settings(&settings).is_err());

        for tolerance in ["inf", "NaN", "0.5"] {
            let settings: Settings = [("concurrency:latencyTolerance", tolerance)]
                .into_iter()
                .collect();
            assert!(
                matches!(
                    ConcurrencyOptions::from_settings(&settings),
                    Err(ConfigError::InvalidValue { key, .. }) if key == "latencyTolerance"
                ),
                "accepted latency tolerance {tolerance}"
            );
        }
    }

    #[test]
    #[should_panic]
    fn infinite_latency_tolerance_panics() {
        let _ = ConcurrencyOptions::default().with_latency_tolerance(f64::INFINITY);
    }

    #[test]
    fn initial_concurrency() {
        assert_eq!(FunctionLimits { min: 0, max: 10 }.initial(), 1);
        assert_eq!(FunctionLimits { min: 4, max: 10 }.initial(), 4);
        assert_eq!(FunctionLimits { min: 1, max: 1 }.initial(), 1);
    }
}
