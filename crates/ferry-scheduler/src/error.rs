//! Error types for scheduler operations.

use ferry_core::{RequestId, TransferError};
use thiserror::Error;

/// Primary error type for scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler no longer admits work.
    #[error("scheduler is stopped")]
    Stopped {
        /// Operation that was refused.
        operation: &'static str,
    },
    /// A request could not be accepted.
    #[error("transfer request rejected")]
    Rejected {
        /// Identifier of the rejected request.
        request_id: RequestId,
        /// Reason reported by the request state machine.
        #[source]
        source: TransferError,
    },
    /// A share configuration value was invalid.
    #[error("invalid transfer share configuration")]
    InvalidShare {
        /// Share the value applies to.
        share: String,
        /// Machine-readable reason.
        reason: &'static str,
    },
    /// A URL mapping rule was malformed.
    #[error("invalid URL mapping")]
    InvalidMapping {
        /// Template of the offending rule.
        template: String,
        /// Parse failure.
        #[source]
        source: TransferError,
    },
    /// The control loop went away before answering.
    #[error("scheduler loop unavailable")]
    LoopUnavailable {
        /// Operation that was waiting for the loop.
        operation: &'static str,
    },
    /// The control loop task panicked or was aborted.
    #[error("scheduler loop terminated abnormally")]
    LoopJoin {
        /// Underlying join error.
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Convenience alias for scheduler results.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
