// Remote Store Port
//
// The abstract service of record the reconciler replays changes against.
// Transport is the implementor's concern; the kernel only sees outcomes.

use std::time::Duration;

use async_trait::async_trait;

use crate::log::ChangeRecord;

/// Failure reported by a remote port call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Network error, 5xx, or anything worth retrying.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// Malformed request or logical rejection.
    #[error("remote rejected request: {0}")]
    Rejected(String),

    #[error("remote call timed out after {0:?}")]
    TimedOut(Duration),

    #[error("remote call cancelled")]
    Cancelled,
}

impl RemoteError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Remote service of record.
///
/// `upsert` and `delete` must be idempotent and last-write-wins per key;
/// the reconciler delivers at least once.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upsert(&self, key: &str, value: &str) -> Result<(), RemoteError>;

    async fn delete(&self, key: &str) -> Result<(), RemoteError>;

    /// `Ok(None)` when the remote has no value for `key`.
    async fn fetch(&self, key: &str) -> Result<Option<String>, RemoteError>;

    /// Accept a copy of the outstanding change log as one batch.
    async fn upload_change_log(&self, changes: &[ChangeRecord]) -> Result<(), RemoteError>;
}

/// Run a port call under `limit`, mapping expiry to [`RemoteError::TimedOut`].
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, RemoteError>
where
    F: std::future::Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::TimedOut(limit)),
    }
}
