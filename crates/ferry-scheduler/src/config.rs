//! Scheduler settings and the collaborators it is composed with.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ferry_config::StagingConfig;
use ferry_core::{CacheStore, MoverRegistry, TransferParameters};
use ferry_events::EventBus;
use ferry_telemetry::Metrics;

use crate::backoff::RetryPolicy;
use crate::error::SchedulerResult;
use crate::mapping::UrlMap;
use crate::shares::ShareConfiguration;
use crate::slots::SlotLimits;

const DEFAULT_TICK: Duration = Duration::from_millis(50);
const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_DUMP_INTERVAL: Duration = Duration::from_secs(5);

/// Tunables for one scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Slot capacity per stage.
    pub slots: SlotLimits,
    /// Share classification and weights.
    pub shares: ShareConfiguration,
    /// Delay curve for retry-wait.
    pub retry: RetryPolicy,
    /// Throughput limits enforced during delivery.
    pub transfer: TransferParameters,
    /// How long a last-retry request waits for a normal slot before an emergency slot is used.
    pub emergency_threshold: Duration,
    /// Period of the control loop's housekeeping tick.
    pub tick_interval: Duration,
    /// Period of the delivery speed and inactivity checks.
    pub monitor_interval: Duration,
    /// Time a cancelled mover gets to reach a check point before it is abandoned.
    pub cancel_grace: Duration,
    /// Sources read from mapped locations instead.
    pub url_map: UrlMap,
    /// File rewritten with the scheduler's request list, when set.
    pub dump_location: Option<PathBuf>,
    /// Period between state dumps.
    pub dump_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            slots: SlotLimits::default(),
            shares: ShareConfiguration::default(),
            retry: RetryPolicy::default(),
            transfer: TransferParameters::default(),
            emergency_threshold: Duration::from_secs(30),
            tick_interval: DEFAULT_TICK,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            url_map: UrlMap::new(),
            dump_location: None,
            dump_interval: DEFAULT_DUMP_INTERVAL,
        }
    }
}

impl SchedulerConfig {
    /// Derive scheduler settings from a validated staging configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the share weights are not positive or a URL
    /// mapping is malformed.
    pub fn from_staging(config: &StagingConfig) -> SchedulerResult<Self> {
        let transfer = &config.transfer;
        Ok(Self {
            slots: SlotLimits::from(&config.slots),
            shares: ShareConfiguration::from_config(&config.shares)?,
            retry: RetryPolicy::from_config(&config.retry),
            transfer: TransferParameters {
                min_average_speed: transfer.min_average_speed,
                max_inactivity_time: Duration::from_secs(transfer.max_inactivity_time_secs),
                min_current_speed: transfer.min_current_speed,
                averaging_time: Duration::from_secs(transfer.averaging_time_secs),
            },
            emergency_threshold: config.emergency_threshold(),
            url_map: UrlMap::from_config(&config.url_mappings)?,
            dump_location: config.dump_location.as_ref().map(PathBuf::from),
            ..Self::default()
        })
    }
}

/// Collaborators shared with the scheduler.
#[derive(Clone)]
pub struct SchedulerContext {
    /// Lifecycle event sink.
    pub events: EventBus,
    /// Metrics registry.
    pub metrics: Metrics,
    /// Protocol movers by scheme.
    pub movers: MoverRegistry,
    /// Cache layer, when caching is enabled.
    pub cache: Option<Arc<dyn CacheStore>>,
}

impl SchedulerContext {
    /// Context without a cache layer.
    #[must_use]
    pub const fn new(events: EventBus, metrics: Metrics, movers: MoverRegistry) -> Self {
        Self {
            events,
            metrics,
            movers,
            cache: None,
        }
    }

    /// Attach a cache layer.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }
}
