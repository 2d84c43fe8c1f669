//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Stage-labelled gauges mirror the scheduler's slot and queue accounting.

use std::sync::Arc;

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
    core::Collector,
};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Terminal outcome label for the transfer counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed every stage.
    Done,
    /// Failed permanently or exhausted its retries.
    Failed,
    /// Cancelled by a caller.
    Cancelled,
}

impl Outcome {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Prometheus-backed metrics registry shared across services.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    slots_in_use: IntGaugeVec,
    queue_depth: IntGaugeVec,
    retry_waiting: IntGauge,
    active_requests: IntGauge,
    transfers_total: IntCounterVec,
    retries_total: IntCounter,
    bytes_transferred_total: IntCounter,
    emergency_admissions_total: IntCounter,
}

/// Snapshot of selected gauges and counters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Requests currently executing in any stage.
    pub active_requests: i64,
    /// Requests held in retry-wait.
    pub retry_waiting: i64,
    /// Requests that completed every stage.
    pub transfers_done: u64,
    /// Requests that failed.
    pub transfers_failed: u64,
    /// Requests that were cancelled.
    pub transfers_cancelled: u64,
    /// Retries scheduled.
    pub retries_total: u64,
    /// Bytes moved by successful deliveries.
    pub bytes_transferred_total: u64,
    /// Admissions that used an emergency slot.
    pub emergency_admissions_total: u64,
}

fn register<C>(registry: &Registry, name: &'static str, collector: C) -> Result<C>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })?;
    Ok(collector)
}

fn collector<C>(name: &'static str, built: prometheus::Result<C>) -> Result<C> {
    built.map_err(|source| TelemetryError::MetricsCollector { name, source })
}

impl Metrics {
    /// Construct a registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any collector cannot be built or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let slots_in_use = register(
            &registry,
            "ferry_slots_in_use",
            collector(
                "ferry_slots_in_use",
                IntGaugeVec::new(
                    Opts::new("ferry_slots_in_use", "Slots held per stage"),
                    &["stage"],
                ),
            )?,
        )?;
        let queue_depth = register(
            &registry,
            "ferry_queue_depth",
            collector(
                "ferry_queue_depth",
                IntGaugeVec::new(
                    Opts::new("ferry_queue_depth", "Requests queued per stage"),
                    &["stage"],
                ),
            )?,
        )?;
        let retry_waiting = register(
            &registry,
            "ferry_retry_waiting",
            collector(
                "ferry_retry_waiting",
                IntGauge::with_opts(Opts::new(
                    "ferry_retry_waiting",
                    "Requests waiting out a retry delay",
                )),
            )?,
        )?;
        let active_requests = register(
            &registry,
            "ferry_active_requests",
            collector(
                "ferry_active_requests",
                IntGauge::with_opts(Opts::new(
                    "ferry_active_requests",
                    "Requests currently executing",
                )),
            )?,
        )?;
        let transfers_total = register(
            &registry,
            "ferry_transfers_total",
            collector(
                "ferry_transfers_total",
                IntCounterVec::new(
                    Opts::new("ferry_transfers_total", "Finished requests by outcome"),
                    &["outcome"],
                ),
            )?,
        )?;
        let retries_total = register(
            &registry,
            "ferry_retries_total",
            collector(
                "ferry_retries_total",
                IntCounter::with_opts(Opts::new("ferry_retries_total", "Retries scheduled")),
            )?,
        )?;
        let bytes_transferred_total = register(
            &registry,
            "ferry_bytes_transferred_total",
            collector(
                "ferry_bytes_transferred_total",
                IntCounter::with_opts(Opts::new(
                    "ferry_bytes_transferred_total",
                    "Bytes moved by successful deliveries",
                )),
            )?,
        )?;
        let emergency_admissions_total = register(
            &registry,
            "ferry_emergency_admissions_total",
            collector(
                "ferry_emergency_admissions_total",
                IntCounter::with_opts(Opts::new(
                    "ferry_emergency_admissions_total",
                    "Admissions served from the emergency pool",
                )),
            )?,
        )?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                slots_in_use,
                queue_depth,
                retry_waiting,
                active_requests,
                transfers_total,
                retries_total,
                bytes_transferred_total,
                emergency_admissions_total,
            }),
        })
    }

    /// Set the slots-in-use gauge for a stage (or `emergency`).
    pub fn set_slots_in_use(&self, stage: &str, value: usize) {
        self.inner
            .slots_in_use
            .with_label_values(&[stage])
            .set(to_gauge(value));
    }

    /// Set the queue depth gauge for a stage.
    pub fn set_queue_depth(&self, stage: &str, value: usize) {
        self.inner
            .queue_depth
            .with_label_values(&[stage])
            .set(to_gauge(value));
    }

    /// Set the retry-wait gauge.
    pub fn set_retry_waiting(&self, value: usize) {
        self.inner.retry_waiting.set(to_gauge(value));
    }

    /// Set the active request gauge.
    pub fn set_active_requests(&self, value: usize) {
        self.inner.active_requests.set(to_gauge(value));
    }

    /// Count a finished request.
    pub fn inc_transfer(&self, outcome: Outcome) {
        self.inner
            .transfers_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    /// Count a scheduled retry.
    pub fn inc_retry(&self) {
        self.inner.retries_total.inc();
    }

    /// Add delivered bytes.
    pub fn add_bytes_transferred(&self, bytes: u64) {
        self.inner.bytes_transferred_total.inc_by(bytes);
    }

    /// Count an emergency-slot admission.
    pub fn inc_emergency_admission(&self) {
        self.inner.emergency_admissions_total.inc();
    }

    /// Render the registry in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the output is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Point-in-time snapshot of the headline gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let outcome = |outcome: Outcome| {
            self.inner
                .transfers_total
                .with_label_values(&[outcome.as_str()])
                .get()
        };
        MetricsSnapshot {
            active_requests: self.inner.active_requests.get(),
            retry_waiting: self.inner.retry_waiting.get(),
            transfers_done: outcome(Outcome::Done),
            transfers_failed: outcome(Outcome::Failed),
            transfers_cancelled: outcome(Outcome::Cancelled),
            retries_total: self.inner.retries_total.get(),
            bytes_transferred_total: self.inner.bytes_transferred_total.get(),
            emergency_admissions_total: self.inner.emergency_admissions_total.get(),
        }
    }
}

fn to_gauge(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
