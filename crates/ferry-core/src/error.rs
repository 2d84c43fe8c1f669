//! Outcome errors produced by stage operations.

use std::any::Any;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification that drives the retry decision for a failed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable condition such as a network hiccup or a stalled transfer.
    Temporary,
    /// Non-retryable condition such as a malformed URL or a full disk.
    Permanent,
    /// Caller-initiated cancellation.
    Cancelled,
    /// Worker crash or accounting fault; treated as temporary at the worker boundary.
    Internal,
}

impl ErrorKind {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Temporary => "temporary",
            Self::Permanent => "permanent",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }

    /// Whether an error of this kind consumes a retry rather than ending the request.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Temporary | Self::Internal)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Error result of one stage operation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct TransferError {
    kind: ErrorKind,
    message: String,
}

impl TransferError {
    /// Build an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Retryable failure.
    #[must_use]
    pub fn temporary(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Temporary, message)
    }

    /// Non-retryable failure.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    /// Cancellation outcome.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Worker crash or internal fault.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Error classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable cause.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Re-classify internal faults as temporary so they consume a retry.
    #[must_use]
    pub fn normalized(self) -> Self {
        match self.kind {
            ErrorKind::Internal => Self {
                kind: ErrorKind::Temporary,
                message: self.message,
            },
            _ => self,
        }
    }
}

/// Convenience alias for stage operation results.
pub type TransferResult<T> = Result<T, TransferError>;

/// Text of a caught panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "unknown panic");
    }

    #[test]
    fn internal_errors_normalize_to_temporary() {
        let err = TransferError::internal("worker panicked").normalized();
        assert_eq!(err.kind(), ErrorKind::Temporary);
        assert_eq!(err.message(), "worker panicked");

        let permanent = TransferError::permanent("disk full").normalized();
        assert_eq!(permanent.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn display_uses_message_only() {
        let err = TransferError::temporary("connection reset");
        assert_eq!(err.to_string(), "connection reset");
        assert!(err.kind().is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }
}
