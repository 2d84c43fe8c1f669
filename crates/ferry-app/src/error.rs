//! # Design
//!
//! - Centralize application-level errors for bootstrap and job submission.
//! - Keep error messages constant while carrying context fields for debugging.
//! - Preserve source errors without re-logging at call sites.

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Command line arguments were malformed.
    #[error("invalid command line")]
    Usage {
        /// Machine-readable reason for the failure.
        reason: &'static str,
    },
    /// Configuration operations failed.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: ferry_config::ConfigError,
    },
    /// Telemetry operations failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: ferry_telemetry::TelemetryError,
    },
    /// Scheduler operations failed.
    #[error("scheduler operation failed")]
    Scheduler {
        /// Operation identifier.
        operation: &'static str,
        /// Source scheduler error.
        source: ferry_scheduler::SchedulerError,
    },
    /// Local account lookup failed.
    #[error("local user lookup failed")]
    User {
        /// Source system error.
        source: nix::Error,
    },
    /// The generator refused a request.
    #[error("transfer request rejected")]
    Rejected {
        /// Job the request belonged to.
        job_id: String,
        /// Source location of the rejected request.
        source_url: String,
    },
    /// A job finished with failed requests.
    #[error("job finished with errors")]
    JobFailed {
        /// Job identifier.
        job_id: String,
        /// Accumulated error text.
        errors: String,
    },
}

impl AppError {
    pub(crate) const fn config(operation: &'static str, source: ferry_config::ConfigError) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn telemetry(
        operation: &'static str,
        source: ferry_telemetry::TelemetryError,
    ) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) const fn scheduler(
        operation: &'static str,
        source: ferry_scheduler::SchedulerError,
    ) -> Self {
        Self::Scheduler { operation, source }
    }
}

/// Errors surfaced by [`crate::Generator`] queries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeneratorError {
    /// No request was ever registered for the job.
    #[error("job not found")]
    NotFound {
        /// Job identifier that was queried.
        job_id: String,
    },
}
