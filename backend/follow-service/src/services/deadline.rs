/// Bounded waits for storage calls
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::{DirectoryError, RelationError};

/// Errors that can describe an elapsed deadline
pub trait TimedOut {
    fn timed_out(operation: &'static str, limit: Duration) -> Self;
}

impl TimedOut for RelationError {
    fn timed_out(operation: &'static str, limit: Duration) -> Self {
        RelationError::Unavailable(format!("{} timed out after {:?}", operation, limit))
    }
}

impl TimedOut for DirectoryError {
    fn timed_out(operation: &'static str, limit: Duration) -> Self {
        DirectoryError::Unavailable(format!("{} timed out after {:?}", operation, limit))
    }
}

/// Execute a fallible future with a deadline; an elapsed deadline is mapped
/// into the future's own error type.
pub async fn with_deadline<F, T, E>(
    limit: Duration,
    operation: &'static str,
    future: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: TimedOut,
{
    match timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                operation,
                timeout_ms = limit.as_millis() as u64,
                "Operation timed out"
            );
            Err(E::timed_out(operation, limit))
        }
    }
}
