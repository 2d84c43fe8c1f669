//! Default values applied when the configuration document omits a field.

/// Pre-processing slots.
pub const PRE_PROCESSOR_SLOTS: usize = 20;
/// Delivery slots.
pub const DELIVERY_SLOTS: usize = 10;
/// Emergency slots shared by every stage.
pub const EMERGENCY_SLOTS: usize = 2;
/// Post-processing slots.
pub const POST_PROCESSOR_SLOTS: usize = 20;
/// Requests a share may have prepared ahead of delivery.
pub const STAGED_PREPARED: usize = 200;
/// Weight of shares without a reference entry.
pub const SHARE_WEIGHT: u32 = 50;
/// Retries granted to each request.
pub const MAX_RETRIES: u32 = 3;
/// First retry delay.
pub const RETRY_INITIAL_DELAY_MS: u64 = 10_000;
/// Growth factor between retry delays; 1.0 keeps the delay fixed.
pub const RETRY_MULTIPLIER: f64 = 1.0;
/// Upper bound on a retry delay.
pub const RETRY_MAX_DELAY_MS: u64 = 600_000;
/// Inactivity limit for deliveries.
pub const MAX_INACTIVITY_SECS: u64 = 300;
/// How long a last-retry request waits for a normal slot before using an emergency one.
pub const EMERGENCY_THRESHOLD_MS: u64 = 30_000;
/// Sub-share given to requests created by the generator.
pub const SUB_SHARE: &str = "candypond-download";
/// Logging level.
pub const LOG_LEVEL: &str = "info";
/// Logging format.
pub const LOG_FORMAT: &str = "pretty";
