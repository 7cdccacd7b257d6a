//! Point-in-time concurrency state of a host, as shared with other hosts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The concurrency state of one host at one moment.
///
/// Serialized as:
///
/// ```json
/// {
///   "NumberOfCores": 4,
///   "Timestamp": "2024-05-01T12:00:00.500Z",
///   "FunctionSnapshots": { "f0": { "Concurrency": 5 } }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConcurrencySnapshot {
    /// Cores available to the publishing host. Used to scale concurrency between hosts of
    /// different sizes.
    pub number_of_cores: u32,

    /// When the snapshot was published.
    #[serde(with = "rfc3339")]
    pub timestamp: DateTime<Utc>,

    /// Per-function state, keyed by function ID.
    #[serde(default)]
    pub function_snapshots: HashMap<String, FunctionConcurrencySnapshot>,
}

/// The concurrency state of one function on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FunctionConcurrencySnapshot {
    /// The concurrency the host believes is sustainable. Zero means the function is paused.
    pub concurrency: u32,
}

impl HostConcurrencySnapshot {
    /// A snapshot with no function data.
    pub fn new(number_of_cores: u32, timestamp: DateTime<Utc>) -> Self {
        Self {
            number_of_cores,
            timestamp,
            function_snapshots: HashMap::new(),
        }
    }

    /// Add (or replace) a function's concurrency.
    pub fn with_function(mut self, function_id: impl Into<String>, concurrency: u32) -> Self {
        self.function_snapshots.insert(
            function_id.into(),
            FunctionConcurrencySnapshot { concurrency },
        );
        self
    }

    /// The recorded concurrency for a function, if any.
    pub fn function_concurrency(&self, function_id: &str) -> Option<u32> {
        self.function_snapshots
            .get(function_id)
            .map(|f| f.concurrency)
    }

    /// No function data yet.
    pub fn is_empty(&self) -> bool {
        self.function_snapshots.is_empty()
    }

    /// Whether the function data differs meaningfully from `other`.
    ///
    /// True if the set of functions differs, or any function's concurrency differs by more than
    /// `threshold`. Timestamps and core counts are ignored.
    pub fn differs_from(&self, other: &HostConcurrencySnapshot, threshold: u32) -> bool {
        if self.function_snapshots.len() != other.function_snapshots.len() {
            return true;
        }

        self.function_snapshots.iter().any(|(id, snapshot)| {
            match other.function_snapshots.get(id) {
                Some(theirs) => snapshot.concurrency.abs_diff(theirs.concurrency) > threshold,
                None => true,
            }
        })
    }

    /// Serialize to the stable JSON representation.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse the stable JSON representation.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// RFC 3339 in UTC with a `Z` suffix, using as many sub-second digits as needed.
mod rfc3339 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}
