//! Throughput thresholds enforced while a delivery is running.

use std::time::Duration;

/// Speed and inactivity limits applied by the delivery worker.
///
/// A zero speed or duration disables the corresponding check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParameters {
    /// Minimum throughput over the whole transfer, in bytes per second.
    pub min_average_speed: u64,
    /// Longest period without any progress before the transfer is aborted.
    pub max_inactivity_time: Duration,
    /// Minimum throughput over the most recent `averaging_time`, in bytes per second.
    pub min_current_speed: u64,
    /// Grace period before speed checks apply, and the window for the current speed.
    pub averaging_time: Duration,
}

impl Default for TransferParameters {
    fn default() -> Self {
        Self {
            min_average_speed: 0,
            max_inactivity_time: Duration::from_secs(300),
            min_current_speed: 0,
            averaging_time: Duration::ZERO,
        }
    }
}
