use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Race `fut` against `cancel`, failing fast with [Error::Cancelled].
///
/// An already-cancelled token wins even if `fut` would complete immediately.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;

        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}
