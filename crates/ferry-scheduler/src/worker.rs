//! Harness that executes one stage of one request.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;

use ferry_core::{
    CacheState, ErrorKind, MoverJob, MoverRegistry, MoverReport, Progress, Stage, TransferContext,
    TransferError, TransferParameters, TransferRequest, TransferResult, panic_message,
};
use futures_util::FutureExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, warn};

use crate::monitor::SpeedMonitor;
use crate::processor::StageProcessor;

/// Result of one stage execution, handing the request back to the loop.
#[derive(Debug)]
pub(crate) struct WorkerReport {
    pub(crate) request: TransferRequest,
    pub(crate) stage: Stage,
    pub(crate) outcome: TransferResult<()>,
}

#[derive(Clone)]
pub(crate) struct StageWorker {
    processor: StageProcessor,
    movers: MoverRegistry,
    limits: TransferParameters,
    monitor_interval: Duration,
    cancel_grace: Duration,
}

impl StageWorker {
    pub(crate) const fn new(
        processor: StageProcessor,
        movers: MoverRegistry,
        limits: TransferParameters,
        monitor_interval: Duration,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            processor,
            movers,
            limits,
            monitor_interval,
            cancel_grace,
        }
    }

    /// Run the request's current stage. Panics are caught and reported as
    /// internal errors; a fired token always yields a cancellation.
    pub(crate) async fn run(self, mut request: TransferRequest, cancel: CancellationToken) -> WorkerReport {
        let stage = request.stage();
        let span = info_span!(
            "transfer",
            request_id = %request.id(),
            job_id = request.job_id(),
            stage = stage.as_str()
        );
        let executed = AssertUnwindSafe(self.execute(&mut request, &cancel))
            .catch_unwind()
            .instrument(span)
            .await;

        let mut outcome = executed.unwrap_or_else(|payload| {
            let message = panic_message(&*payload);
            error!(request_id = %request.id(), stage = stage.as_str(), panic = %message, "stage worker panicked");
            Err(TransferError::internal(format!("worker panicked: {message}")))
        });
        if cancel.is_cancelled() && !matches!(&outcome, Err(err) if err.kind() == ErrorKind::Cancelled) {
            outcome = Err(TransferError::cancelled("request cancelled"));
        }
        WorkerReport {
            request,
            stage,
            outcome,
        }
    }

    async fn execute(&self, request: &mut TransferRequest, cancel: &CancellationToken) -> TransferResult<()> {
        if cancel.is_cancelled() {
            return Err(TransferError::cancelled("request cancelled"));
        }
        match request.stage() {
            Stage::PreProcessing => {
                tokio::select! {
                    result = self.processor.pre_process(request) => result,
                    () = cancel.cancelled() => Err(TransferError::cancelled("request cancelled")),
                }
            }
            Stage::Delivery => self.deliver(request, cancel).await,
            Stage::PostProcessing => {
                tokio::select! {
                    result = self.processor.post_process(request) => result,
                    () = cancel.cancelled() => Err(TransferError::cancelled("request cancelled")),
                }
            }
        }
    }

    async fn deliver(&self, request: &mut TransferRequest, cancel: &CancellationToken) -> TransferResult<()> {
        let mover = self.movers.resolve(request.effective_source())?;
        let limits = request.transfer_parameters().copied().unwrap_or(self.limits);
        let progress = Progress::new();
        let token = cancel.child_token();

        let delivered = {
            let job = MoverJob::from_request(request);
            let transfer = mover.transfer(job, TransferContext::new(progress.clone(), token.clone()));
            tokio::pin!(transfer);

            let started = Instant::now();
            let mut monitor = SpeedMonitor::new(limits, started);
            let mut ticks = tokio::time::interval_at(started + self.monitor_interval, self.monitor_interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    result = &mut transfer => break result,
                    () = cancel.cancelled() => {
                        break wind_down(self.cancel_grace, &mut transfer, TransferError::cancelled("request cancelled")).await;
                    }
                    now = ticks.tick() => {
                        if let Some(err) = monitor.check(progress.bytes(), now) {
                            warn!(bytes = progress.bytes(), reason = %err, "aborting delivery");
                            token.cancel();
                            break wind_down(self.cancel_grace, &mut transfer, err).await;
                        }
                    }
                }
            }
        };

        let report = match delivered {
            Ok(report) => report,
            Err(err) => {
                if request.cache_state() == CacheState::AlreadyPresent && err.kind() != ErrorKind::Cancelled {
                    self.processor.evict_cached(request).await;
                }
                return Err(err);
            }
        };
        let bytes = report.bytes_transferred.max(progress.bytes());
        debug!(bytes, "delivery finished");
        request.record_bytes(bytes);
        Ok(())
    }
}

/// Give a signalled mover `grace` to return, then abandon it and report `reason`.
async fn wind_down<F>(grace: Duration, transfer: &mut Pin<&mut F>, reason: TransferError) -> TransferResult<MoverReport>
where
    F: Future<Output = TransferResult<MoverReport>>,
{
    if tokio::time::timeout(grace, transfer.as_mut()).await.is_err() {
        warn!(grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX), "mover ignored cancellation; abandoning it");
    }
    Err(reason)
}
