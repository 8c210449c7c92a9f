use std::fmt::Debug;

use crate::OperationType;

/// Decides which failed operations are worth another attempt.
///
/// Only transient failures are ever retried: throttling, server errors which are hopefully
/// temporary, and connection-level I/O errors.
pub trait RetryStrategy: Debug + Send + Sync {
    /// Whether operations of this type may be retried at all.
    fn retry(&self, operation: OperationType) -> bool {
        let _ = operation;
        true
    }

    /// The maximum number of retries of a single operation.
    fn retries(&self) -> u32 {
        DefaultRetryStrategy::DEFAULT_RETRIES
    }
}

/// Retries every type of operation, up to 5 times.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryStrategy;

impl DefaultRetryStrategy {
    const DEFAULT_RETRIES: u32 = 5;
}

impl RetryStrategy for DefaultRetryStrategy {}
