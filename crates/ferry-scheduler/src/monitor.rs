//! Throughput and inactivity checks for a running delivery.

use std::time::Duration;

use ferry_core::{TransferError, TransferParameters};
use tokio::time::Instant;

/// Shortest run judged against the average speed limit when no averaging
/// window is configured.
const AVERAGE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    bytes: u64,
}

/// Tracks progress samples and reports when a limit is broken.
#[derive(Debug)]
pub(crate) struct SpeedMonitor {
    limits: TransferParameters,
    started: Instant,
    last_progress: Sample,
    window_start: Sample,
}

impl SpeedMonitor {
    pub(crate) const fn new(limits: TransferParameters, started: Instant) -> Self {
        let origin = Sample {
            at: started,
            bytes: 0,
        };
        Self {
            limits,
            started,
            last_progress: origin,
            window_start: origin,
        }
    }

    /// Record the byte counter at `now` and check every limit.
    pub(crate) fn check(&mut self, bytes: u64, now: Instant) -> Option<TransferError> {
        if bytes > self.last_progress.bytes {
            self.last_progress = Sample { at: now, bytes };
        }

        let idle = now.saturating_duration_since(self.last_progress.at);
        let max_idle = self.limits.max_inactivity_time;
        if !max_idle.is_zero() && idle >= max_idle {
            return Some(TransferError::temporary(format!(
                "no data received for {}s",
                idle.as_secs()
            )));
        }

        let averaging = self.limits.averaging_time;
        let elapsed = now.saturating_duration_since(self.started);
        if self.limits.min_average_speed > 0 && elapsed >= averaging.max(AVERAGE_GRACE) {
            let average = rate(bytes, elapsed);
            if average < self.limits.min_average_speed {
                return Some(TransferError::temporary(format!(
                    "average speed {average} B/s below minimum {} B/s",
                    self.limits.min_average_speed
                )));
            }
        }

        if averaging.is_zero() || elapsed < averaging {
            return None;
        }
        let window = now.saturating_duration_since(self.window_start.at);
        if window < averaging {
            return None;
        }
        let current = rate(bytes.saturating_sub(self.window_start.bytes), window);
        self.window_start = Sample { at: now, bytes };
        if self.limits.min_current_speed > 0 && current < self.limits.min_current_speed {
            return Some(TransferError::temporary(format!(
                "current speed {current} B/s below minimum {} B/s",
                self.limits.min_current_speed
            )));
        }
        None
    }
}

fn rate(bytes: u64, over: Duration) -> u64 {
    let millis = over.as_millis().max(1);
    u64::try_from(u128::from(bytes) * 1000 / millis).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> TransferParameters {
        TransferParameters {
            min_average_speed: 100,
            max_inactivity_time: Duration::from_secs(5),
            min_current_speed: 50,
            averaging_time: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn inactivity_is_a_temporary_error() {
        let start = Instant::now();
        let mut monitor = SpeedMonitor::new(
            TransferParameters {
                max_inactivity_time: Duration::from_secs(5),
                ..TransferParameters::default()
            },
            start,
        );
        assert!(monitor.check(10, start + Duration::from_secs(1)).is_none());
        assert!(monitor.check(10, start + Duration::from_secs(5)).is_none());
        let err = monitor
            .check(10, start + Duration::from_secs(6))
            .expect("idle too long");
        assert_eq!(err.kind(), ferry_core::ErrorKind::Temporary);
        assert!(err.message().contains("no data"));
    }

    #[tokio::test]
    async fn speed_checks_wait_for_the_averaging_window() {
        let start = Instant::now();
        let mut monitor = SpeedMonitor::new(limits(), start);
        assert!(monitor.check(1, start + Duration::from_secs(1)).is_none());
        let err = monitor
            .check(2, start + Duration::from_secs(2))
            .expect("too slow");
        assert!(err.message().contains("average speed"));
    }

    #[tokio::test]
    async fn current_speed_uses_the_latest_window() {
        let start = Instant::now();
        let mut monitor = SpeedMonitor::new(limits(), start);
        assert!(monitor.check(10_000, start + Duration::from_secs(2)).is_none());
        let err = monitor
            .check(10_010, start + Duration::from_secs(4))
            .expect("stalled window");
        assert!(err.message().contains("current speed"));
    }

    #[tokio::test]
    async fn average_speed_applies_without_an_averaging_window() {
        let start = Instant::now();
        let mut monitor = SpeedMonitor::new(
            TransferParameters {
                min_average_speed: 1_000,
                max_inactivity_time: Duration::ZERO,
                min_current_speed: 0,
                averaging_time: Duration::ZERO,
            },
            start,
        );
        assert!(monitor.check(10, start + Duration::from_millis(500)).is_none());
        let err = (1..=3_600)
            .find_map(|second| monitor.check(second, start + Duration::from_secs(second)))
            .expect("one byte per second is too slow");
        assert_eq!(err.kind(), ferry_core::ErrorKind::Temporary);
        assert!(err.message().contains("average speed 1 B/s"), "{}", err.message());
    }

    #[tokio::test]
    async fn zero_limits_disable_checks() {
        let start = Instant::now();
        let mut monitor = SpeedMonitor::new(
            TransferParameters {
                min_average_speed: 0,
                max_inactivity_time: Duration::ZERO,
                min_current_speed: 0,
                averaging_time: Duration::ZERO,
            },
            start,
        );
        assert!(monitor.check(0, start + Duration::from_secs(3600)).is_none());
    }
}
