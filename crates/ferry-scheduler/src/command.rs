use std::path::PathBuf;

use ferry_core::{RequestId, TransferRequest};
use tokio::sync::oneshot;

use crate::scheduler::SchedulerSnapshot;
use crate::shares::ShareConfiguration;
use crate::slots::SlotLimits;

/// Messages from [`crate::Scheduler`] handles to the control loop.
#[derive(Debug)]
pub(crate) enum SchedulerCommand {
    /// Enqueue a request that has already left `New`.
    Submit(Box<TransferRequest>),
    /// Replace slot capacities.
    SetSlots(SlotLimits),
    /// Replace the share configuration.
    SetShares(ShareConfiguration),
    /// Start, move, or stop the periodic state dump.
    SetDumpLocation(Option<PathBuf>),
    /// Cancel every request of a job.
    CancelJob {
        /// Job whose requests are cancelled.
        job_id: String,
    },
    /// Cancel one request.
    CancelRequest {
        /// Request to cancel.
        request_id: RequestId,
    },
    /// Report queue and slot usage.
    Snapshot {
        /// Reply channel.
        respond_to: oneshot::Sender<SchedulerSnapshot>,
    },
    /// Stop admitting work and exit once idle.
    Stop {
        /// Cancel queued and executing requests instead of draining them.
        cancel_in_flight: bool,
    },
}
