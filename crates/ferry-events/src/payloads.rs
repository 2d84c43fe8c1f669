//! Event payload types carried across the workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier assigned to each published event.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Lifecycle states of a transfer request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Created but not yet accepted by a scheduler.
    New,
    /// Waiting for or holding a pre-processing slot.
    PreProcessing,
    /// Waiting for or holding a delivery slot.
    Delivering,
    /// Waiting for or holding a post-processing slot.
    PostProcessing,
    /// Held back after a temporary error until its backoff delay expires.
    RetryWait,
    /// All stages completed successfully.
    Done,
    /// Terminal failure (permanent error or retries exhausted).
    Failed,
    /// Terminal cancellation requested by a caller.
    Cancelled,
}

impl RequestState {
    /// Whether no further transitions are possible from this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Stable lowercase label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::PreProcessing => "pre_processing",
            Self::Delivering => "delivering",
            Self::PostProcessing => "post_processing",
            Self::RetryWait => "retry_wait",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Typed domain events surfaced by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A request was accepted by the scheduler.
    RequestSubmitted {
        /// Request identifier.
        request_id: String,
        /// Owning job identifier.
        job_id: String,
        /// Source URL as submitted.
        source: String,
        /// Destination URL as submitted.
        destination: String,
    },
    /// A request moved into a new non-terminal state.
    StageChanged {
        /// Request identifier.
        request_id: String,
        /// Owning job identifier.
        job_id: String,
        /// State the request entered.
        state: RequestState,
        /// Share the request was queued under.
        share: String,
    },
    /// A request hit a temporary error and will be retried after a delay.
    RetryScheduled {
        /// Request identifier.
        request_id: String,
        /// Owning job identifier.
        job_id: String,
        /// Retries left after this one was consumed.
        retries_remaining: u32,
        /// Delay before the request becomes eligible again.
        delay_ms: u64,
        /// Cause of the temporary failure.
        reason: String,
    },
    /// A request reached a terminal state.
    RequestFinished {
        /// Request identifier.
        request_id: String,
        /// Owning job identifier.
        job_id: String,
        /// Terminal state reached.
        state: RequestState,
        /// Error text when the request did not complete successfully.
        error: Option<String>,
    },
    /// Slot capacity was reconfigured.
    SlotsReconfigured {
        /// Pre-processing slots.
        pre_processor: usize,
        /// Delivery slots.
        delivery: usize,
        /// Post-processing slots.
        post_processor: usize,
        /// Emergency slots.
        emergency: usize,
        /// Per-share cap on requests staged ahead of delivery.
        staged_prepared: usize,
    },
    /// Transfer share configuration was replaced.
    SharesReconfigured {
        /// Classification rule in effect.
        share_type: String,
        /// Number of shares with explicit reference weights.
        reference_shares: usize,
    },
    /// The scheduler loop exited.
    SchedulerStopped {
        /// Whether in-flight work was cancelled rather than drained.
        cancelled_in_flight: bool,
    },
}

impl Event {
    /// Machine-friendly discriminator for consumers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RequestSubmitted { .. } => "request_submitted",
            Self::StageChanged { .. } => "stage_changed",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::RequestFinished { .. } => "request_finished",
            Self::SlotsReconfigured { .. } => "slots_reconfigured",
            Self::SharesReconfigured { .. } => "shares_reconfigured",
            Self::SchedulerStopped { .. } => "scheduler_stopped",
        }
    }

    /// Request identifier the event refers to, when it concerns a single request.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::RequestSubmitted { request_id, .. }
            | Self::StageChanged { request_id, .. }
            | Self::RetryScheduled { request_id, .. }
            | Self::RequestFinished { request_id, .. } => Some(request_id),
            Self::SlotsReconfigured { .. }
            | Self::SharesReconfigured { .. }
            | Self::SchedulerStopped { .. } => None,
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and emission timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Sequential identifier.
    pub id: EventId,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Event payload.
    pub event: Event,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_flagged() {
        assert!(RequestState::Done.is_terminal());
        assert!(RequestState::Failed.is_terminal());
        assert!(RequestState::Cancelled.is_terminal());
        assert!(!RequestState::RetryWait.is_terminal());
        assert!(!RequestState::New.is_terminal());
    }

    #[test]
    fn event_serializes_with_snake_case_tag() {
        let event = Event::StageChanged {
            request_id: "r1".into(),
            job_id: "j1".into(),
            state: RequestState::PostProcessing,
            share: "atlas".into(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "stage_changed");
        assert_eq!(json["state"], "post_processing");
        assert_eq!(json["share"], "atlas");
        assert_eq!(event.kind(), "stage_changed");
        assert_eq!(event.request_id(), Some("r1"));
        assert_eq!(
            Event::SchedulerStopped {
                cancelled_in_flight: false
            }
            .request_id(),
            None
        );
    }
}
