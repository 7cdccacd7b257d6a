#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use dynamic_concurrency::{host_id::FixedHostIdProvider, HostConcurrencySnapshot};

/// A unique, valid host ID, so tests sharing a store don't see each other's snapshots.
pub fn unique_host_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("host-{}", &id[..16])
}

pub fn host_id_provider(host_id: &str) -> Arc<FixedHostIdProvider> {
    Arc::new(FixedHostIdProvider::new(host_id).unwrap())
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Three functions at 5, 10 and 15.
pub fn three_function_snapshot() -> HostConcurrencySnapshot {
    HostConcurrencySnapshot::new(4, epoch() + chrono::Duration::milliseconds(123))
        .with_function("function0", 5)
        .with_function("function1", 10)
        .with_function("function2", 15)
}

pub trait MeanExt: Iterator {
    fn mean<M>(self) -> M
    where
        M: Mean<Self::Item>,
        Self: Sized,
    {
        M::mean(self)
    }
}

impl<I: Iterator> MeanExt for I {}

pub trait Mean<A = Self> {
    fn mean<I>(iter: I) -> Self
    where
        I: Iterator<Item = A>;
}

impl Mean for Duration {
    fn mean<I>(iter: I) -> Self
    where
        I: Iterator<Item = Duration>,
    {
        let (sum, count) = iter.fold((Duration::ZERO, 0u32), |(sum, n), v| (sum + v, n + 1));
        if count > 0 {
            sum / count
        } else {
            sum
        }
    }
}

impl Mean<usize> for f64 {
    fn mean<I>(iter: I) -> Self
    where
        I: Iterator<Item = usize>,
    {
        let (sum, count) = iter.fold((0.0, 0.0), |(sum, n), v| (sum + v as f64, n + 1.0));
        if count > 0.0 {
            sum / count
        } else {
            0.0
        }
    }
}
