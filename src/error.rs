use thiserror::Error;

use crate::storage::StorageError;

/// Status taxonomy surfaced by the quota engine. Any non-`Ok` result means
/// "the requested number may be stale or a write may not have taken effect";
/// callers retry or tolerate degraded accuracy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    /// The owning manager was shut down while the operation was in flight.
    #[error("operation aborted because the quota manager was shut down")]
    Aborted,
    /// A requested write was rejected, e.g. a deletion that partially failed
    /// or a negative quota value.
    #[error("invalid modification: {0}")]
    InvalidModification(String),
    /// The operation is not meaningful for the given class or host.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// The persistence layer is unavailable or has been disabled after an
    /// earlier failure.
    #[error("quota database unavailable")]
    DatabaseDisabled,
}

pub type QuotaResult<T> = Result<T, QuotaError>;

impl From<StorageError> for QuotaError {
    fn from(_: StorageError) -> Self {
        QuotaError::DatabaseDisabled
    }
}
