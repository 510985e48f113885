use std::time::SystemTimeError;

/// Errors surfaced by the public operations of [`crate::Queue`] and
/// [`crate::Item`].
///
/// Retriable conditions (key collisions on enqueue, lost hand-off races on
/// dequeue, lost races during reaping) are handled internally and never
/// reach the caller as an `Err`.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The caller's cancellation token fired before the operation completed.
    /// No state change is attributable to the call.
    #[error("operation cancelled")]
    Cancelled,

    /// The etcd client reported a transport or server-side failure.
    #[error("store error: {0}")]
    Store(#[from] etcd_client::Error),

    /// Producing a unique key failed. Should not occur in practice; kept
    /// distinct from `Store` so callers can tell a clock/encoding bug apart
    /// from a transport failure.
    #[error("failed to encode a unique item key: {0}")]
    Encoding(#[from] SystemTimeError),

    /// Ack/Nack's compare-and-swap guard did not match: the handle's
    /// in-flight key was already gone (reaped, or raced by a concurrent
    /// keepalive). The handle is defunct; this is not retried by the core.
    #[error("handle is stale: its in-flight key no longer matches the expected revision")]
    StaleHandle,
}

pub type Result<T> = std::result::Result<T, QueueError>;
