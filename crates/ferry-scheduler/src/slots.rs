//! Per-stage slot accounting plus the shared emergency pool.

use std::sync::{Mutex, PoisonError};

use ferry_config::SlotConfig;
use ferry_core::Stage;
use serde::Serialize;
use tracing::error;

/// Slot capacity per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotLimits {
    /// Concurrent pre-processing operations.
    pub pre_processor: usize,
    /// Concurrent deliveries.
    pub delivery: usize,
    /// Concurrent post-processing operations.
    pub post_processor: usize,
    /// Emergency slots usable by any stage.
    pub emergency: usize,
    /// Requests a share may have prepared and waiting for delivery.
    pub staged_prepared: usize,
}

impl SlotLimits {
    /// Capacity of a stage's normal pool.
    #[must_use]
    pub const fn for_stage(&self, stage: Stage) -> usize {
        match stage {
            Stage::PreProcessing => self.pre_processor,
            Stage::Delivery => self.delivery,
            Stage::PostProcessing => self.post_processor,
        }
    }
}

impl Default for SlotLimits {
    fn default() -> Self {
        Self::from(&SlotConfig::default())
    }
}

impl From<&SlotConfig> for SlotLimits {
    fn from(config: &SlotConfig) -> Self {
        Self {
            pre_processor: config.pre_processor,
            delivery: config.delivery,
            post_processor: config.post_processor,
            emergency: config.emergency,
            staged_prepared: config.staged_prepared,
        }
    }
}

/// Point-in-time usage of one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlotUsage {
    /// Capacity.
    pub total: usize,
    /// Slots currently held.
    pub in_use: usize,
}

impl SlotUsage {
    /// Slots still available.
    #[must_use]
    pub const fn free(&self) -> usize {
        self.total.saturating_sub(self.in_use)
    }
}

#[derive(Debug)]
struct Counters {
    limits: SlotLimits,
    in_use: [usize; 3],
    emergency_in_use: usize,
}

/// Thread-safe slot counters.
///
/// Shrinking a pool never revokes held slots; new acquisitions wait until
/// usage drops below the new capacity.
#[derive(Debug)]
pub struct SlotPool {
    counters: Mutex<Counters>,
}

impl SlotPool {
    /// Pool with the given capacities and nothing held.
    #[must_use]
    pub const fn new(limits: SlotLimits) -> Self {
        Self {
            counters: Mutex::new(Counters {
                limits,
                in_use: [0; 3],
                emergency_in_use: 0,
            }),
        }
    }

    /// Take a normal slot for `stage` if one is free.
    pub fn try_acquire(&self, stage: Stage) -> bool {
        let mut counters = self.lock();
        let total = counters.limits.for_stage(stage);
        let held = &mut counters.in_use[stage.index()];
        if *held < total {
            *held += 1;
            true
        } else {
            false
        }
    }

    /// Return a normal slot for `stage`.
    pub fn release(&self, stage: Stage) {
        let underflow = {
            let mut counters = self.lock();
            let held = &mut counters.in_use[stage.index()];
            if *held == 0 {
                true
            } else {
                *held -= 1;
                false
            }
        };
        if underflow {
            error!(stage = stage.as_str(), "slot released with none held");
        }
        debug_assert!(!underflow, "{} slot released with none held", stage.as_str());
    }

    /// Take an emergency slot if one is free.
    pub fn try_acquire_emergency(&self) -> bool {
        let mut counters = self.lock();
        if counters.emergency_in_use < counters.limits.emergency {
            counters.emergency_in_use += 1;
            true
        } else {
            false
        }
    }

    /// Return an emergency slot.
    pub fn release_emergency(&self) {
        let underflow = {
            let mut counters = self.lock();
            if counters.emergency_in_use == 0 {
                true
            } else {
                counters.emergency_in_use -= 1;
                false
            }
        };
        if underflow {
            error!("emergency slot released with none held");
        }
        debug_assert!(!underflow, "emergency slot released with none held");
    }

    /// Replace every capacity.
    pub fn resize(&self, limits: SlotLimits) {
        self.lock().limits = limits;
    }

    /// Current capacities.
    #[must_use]
    pub fn limits(&self) -> SlotLimits {
        self.lock().limits
    }

    /// Usage of a stage's normal pool.
    #[must_use]
    pub fn usage(&self, stage: Stage) -> SlotUsage {
        let counters = self.lock();
        SlotUsage {
            total: counters.limits.for_stage(stage),
            in_use: counters.in_use[stage.index()],
        }
    }

    /// Usage of the emergency pool.
    #[must_use]
    pub fn emergency_usage(&self) -> SlotUsage {
        let counters = self.lock();
        SlotUsage {
            total: counters.limits.emergency,
            in_use: counters.emergency_in_use,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
