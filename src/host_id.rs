//! Host identity.
//!
//! A host ID partitions durable state between host instances. It must be stable for the lifetime of
//! the process, and may be expensive to resolve (e.g. a remote lookup), so it is normally cached.

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::{
    cancel::cancellable,
    error::{Error, Result},
};

/// The maximum length of a host ID.
pub const MAX_HOST_ID_LENGTH: usize = 32;

/// Resolves the ID of the current host.
#[async_trait]
pub trait HostIdProvider: Send + Sync {
    /// The current host's ID.
    ///
    /// Fails with [Error::HostId] if it can't be resolved, or [Error::Cancelled].
    async fn get_host_id(&self, cancel: &CancellationToken) -> Result<String>;
}

/// A host ID known up front.
#[derive(Debug, Clone)]
pub struct FixedHostIdProvider {
    host_id: String,
}

impl FixedHostIdProvider {
    /// Fails if `host_id` isn't a valid host ID. See [validate_host_id].
    pub fn new(host_id: impl Into<String>) -> Result<Self> {
        let host_id = host_id.into();
        validate_host_id(&host_id)?;
        Ok(Self { host_id })
    }
}

#[async_trait]
impl HostIdProvider for FixedHostIdProvider {
    async fn get_host_id(&self, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(self.host_id.clone())
    }
}

/// Resolves the host ID once through an inner provider, then serves the cached value.
///
/// Failed or cancelled resolutions are not cached, so the next call tries again.
#[derive(Debug)]
pub struct CachingHostIdProvider<P> {
    inner: P,
    host_id: OnceCell<String>,
}

impl<P: HostIdProvider> CachingHostIdProvider<P> {
    #[allow(missing_docs)]
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            host_id: OnceCell::new(),
        }
    }
}

#[async_trait]
impl<P: HostIdProvider> HostIdProvider for CachingHostIdProvider<P> {
    async fn get_host_id(&self, cancel: &CancellationToken) -> Result<String> {
        let host_id = self
            .host_id
            .get_or_try_init(|| async {
                let host_id = cancellable(cancel, self.inner.get_host_id(cancel)).await?;
                validate_host_id(&host_id)?;
                tracing::debug!(host_id = %host_id, "Resolved host ID");
                Ok::<_, Error>(host_id)
            })
            .await?;

        Ok(host_id.clone())
    }
}

/// Host IDs are 1 to 32 characters of lowercase ASCII letters, digits and single dashes, and
/// don't start or end with a dash.
pub fn validate_host_id(host_id: &str) -> Result<()> {
    let invalid = |reason: &str| Err(Error::HostId(format!("{reason}: {host_id:?}")));

    if host_id.is_empty() {
        return invalid("host ID is empty");
    }
    if host_id.len() > MAX_HOST_ID_LENGTH {
        return invalid("host ID is longer than 32 characters");
    }
    if !host_id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return invalid("host ID may only contain lowercase letters, digits and dashes");
    }
    if host_id.starts_with('-') || host_id.ends_with('-') || host_id.contains("--") {
        return invalid("host ID has a leading, trailing or repeated dash");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct CountingProvider {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl HostIdProvider for CountingProvider {
        async fn get_host_id(&self, _cancel: &CancellationToken) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                Err(Error::HostId("lookup failed".into()))
            } else {
                Ok("test123".into())
            }
        }
    }

    #[tokio::test]
    async fn caches_after_first_success() {
        let provider = CachingHostIdProvider::new(CountingProvider::default());
        let cancel = CancellationToken::new();

        assert_eq!(provider.get_host_id(&cancel).await.unwrap(), "test123");
        assert_eq!(provider.get_host_id(&cancel).await.unwrap(), "test123");

        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let provider = CachingHostIdProvider::new(CountingProvider {
            fail_first: true,
            ..Default::default()
        });
        let cancel = CancellationToken::new();

        assert!(matches!(
            provider.get_host_id(&cancel).await,
            Err(Error::HostId(_))
        ));
        assert_eq!(provider.get_host_id(&cancel).await.unwrap(), "test123");
    }

    #[tokio::test]
    async fn cancelled() {
        let provider = CachingHostIdProvider::new(CountingProvider::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            provider.get_host_id(&cancel).await,
            Err(Error::Cancelled)
        ));
        assert!(matches!(
            FixedHostIdProvider::new("h1")
                .unwrap()
                .get_host_id(&cancel)
                .await,
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn validation() {
        let longest = "x".repeat(32);
        let too_long = "x".repeat(33);

        for valid in ["test123", "a", "my-host-1", longest.as_str()] {
            assert!(validate_host_id(valid).is_ok(), "{valid}");
        }
        for invalid in ["", "Upper", "under_score", "-lead", "trail-", "dou--ble", too_long.as_str()] {
            assert!(validate_host_id(invalid).is_err(), "{invalid}");
        }
    }
}
