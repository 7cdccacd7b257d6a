//! Lazy provisioning of storage resources.
//!
//! Rather than creating containers and queues up front, operations are attempted directly. If the
//! resource turns out to be missing it is created and the operation is tried once more.

use std::future::Future;

use super::{MessageQueue, StorageError};

/// Run `operation`. If it fails with an error for which `is_recoverable` returns `true`, run
/// `provision` and then retry `operation` exactly once.
///
/// Errors which aren't recoverable, errors from `provision`, and errors from the retry are
/// returned unchanged.
pub async fn create_and_retry_once<T, E, Op, OpFut, Recoverable, Provision, ProvisionFut>(
    mut operation: Op,
    is_recoverable: Recoverable,
    provision: Provision,
) -> Result<T, E>
where
    Op: FnMut() -> OpFut,
    OpFut: Future<Output = Result<T, E>>,
    Recoverable: Fn(&E) -> bool,
    Provision: FnOnce() -> ProvisionFut,
    ProvisionFut: Future<Output = Result<(), E>>,
{
    match operation().await {
        Err(e) if is_recoverable(&e) => {
            provision().await?;
            operation().await
        }
        result => result,
    }
}

/// Add a message to `queue`, creating the queue first if it doesn't exist.
pub async fn add_message_and_create_if_not_exists(
    queue: &dyn MessageQueue,
    message: &str,
) -> Result<(), StorageError> {
    create_and_retry_once(
        || queue.add_message(message),
        StorageError::is_queue_not_found,
        || async {
            let created = queue.create_if_not_exists().await?;
            tracing::debug!(queue = queue.name(), created, "Provisioned missing queue");
            Ok(())
        },
    )
    .await
}
