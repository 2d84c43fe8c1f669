//! Scripted protocol mover and a callback that records finished requests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ferry_core::{
    CompletionCallback, MoverJob, MoverReport, ProtocolMover, RequestId, RequestState,
    TransferContext, TransferError, TransferRequest, TransferResult,
};
use tokio::sync::Notify;

/// One scripted outcome for a transfer attempt.
#[derive(Debug, Clone)]
pub enum Step {
    /// Hold for the mover's hold time, then report `bytes`.
    Succeed(u64),
    /// Fail with a temporary error.
    Temporary(String),
    /// Fail with a permanent error.
    Permanent(String),
    /// Panic inside the mover.
    Panic(String),
    /// Move no data until cancelled.
    Stall,
    /// Advance `bytes` every `every` until cancelled.
    Trickle {
        /// Bytes per step.
        bytes: u64,
        /// Pause between steps.
        every: Duration,
    },
}

/// Protocol mover for the `mock` scheme whose outcomes follow per-source scripts.
///
/// Sources without a script (or whose script ran out) succeed. The mover also
/// counts attempts per source and watches for two attempts on the same request
/// overlapping in time.
#[derive(Default)]
pub struct ScriptedMover {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    attempts: Mutex<HashMap<String, usize>>,
    holders: Mutex<HashMap<RequestId, usize>>,
    order: Mutex<Vec<String>>,
    hold: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    overlaps: AtomicUsize,
}

impl ScriptedMover {
    /// Mover whose successful transfers complete immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mover whose successful transfers take `hold`.
    #[must_use]
    pub fn with_hold(hold: Duration) -> Self {
        Self {
            hold,
            ..Self::default()
        }
    }

    /// Queue outcomes for attempts on `source`.
    pub fn script(&self, source: &str, steps: impl IntoIterator<Item = Step>) {
        lock(&self.scripts)
            .entry(source.to_string())
            .or_default()
            .extend(steps);
    }

    /// Attempts made so far for `source`.
    #[must_use]
    pub fn attempts(&self, source: &str) -> usize {
        lock(&self.attempts).get(source).copied().unwrap_or(0)
    }

    /// Sources in the order their attempts started.
    #[must_use]
    pub fn start_order(&self) -> Vec<String> {
        lock(&self.order).clone()
    }

    /// Highest number of simultaneous transfers observed.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Times a request was being transferred by two attempts at once.
    #[must_use]
    pub fn overlapping_holders(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    fn next_step(&self, source: &str) -> Step {
        lock(&self.scripts)
            .get_mut(source)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed(1_024))
    }

    async fn hold_or_cancel(&self, context: &TransferContext) -> TransferResult<()> {
        if self.hold.is_zero() {
            return context.checkpoint();
        }
        tokio::select! {
            () = tokio::time::sleep(self.hold) => context.checkpoint(),
            () = context.cancellation().cancelled() => Err(TransferError::cancelled("transfer cancelled")),
        }
    }
}

struct HolderGuard<'a> {
    mover: &'a ScriptedMover,
    request_id: RequestId,
}

impl<'a> HolderGuard<'a> {
    fn enter(mover: &'a ScriptedMover, request_id: &RequestId) -> Self {
        {
            let mut holders = lock(&mover.holders);
            let count = holders.entry(request_id.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                mover.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }
        let now = mover.active.fetch_add(1, Ordering::SeqCst) + 1;
        mover.max_active.fetch_max(now, Ordering::SeqCst);
        Self {
            mover,
            request_id: request_id.clone(),
        }
    }
}

impl Drop for HolderGuard<'_> {
    fn drop(&mut self) {
        self.mover.active.fetch_sub(1, Ordering::SeqCst);
        let mut holders = lock(&self.mover.holders);
        if let Some(count) = holders.get_mut(&self.request_id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl ProtocolMover for ScriptedMover {
    fn schemes(&self) -> &'static [&'static str] {
        &["mock"]
    }

    async fn transfer(
        &self,
        job: MoverJob<'_>,
        context: TransferContext,
    ) -> TransferResult<MoverReport> {
        *lock(&self.attempts)
            .entry(job.source.to_string())
            .or_insert(0) += 1;
        lock(&self.order).push(job.source.to_string());
        let _guard = HolderGuard::enter(self, job.request_id);

        match self.next_step(job.source) {
            Step::Succeed(bytes) => {
                self.hold_or_cancel(&context).await?;
                context.progress().advance(bytes);
                Ok(MoverReport {
                    bytes_transferred: bytes,
                })
            }
            Step::Temporary(message) => Err(TransferError::temporary(message)),
            Step::Permanent(message) => Err(TransferError::permanent(message)),
            Step::Panic(message) => panic!("{message}"),
            Step::Stall => {
                context.cancellation().cancelled().await;
                Err(TransferError::cancelled("stalled transfer cancelled"))
            }
            Step::Trickle { bytes, every } => loop {
                context.checkpoint()?;
                context.progress().advance(bytes);
                tokio::select! {
                    () = tokio::time::sleep(every) => {}
                    () = context.cancellation().cancelled() => {
                        return Err(TransferError::cancelled("trickling transfer cancelled"));
                    }
                }
            },
        }
    }
}

/// Terminal snapshot of a request captured by [`RecordingCallback`].
#[derive(Debug, Clone)]
pub struct Finished {
    /// Request identifier.
    pub id: RequestId,
    /// Owning job.
    pub job_id: String,
    /// Source location.
    pub source: String,
    /// Terminal state.
    pub state: RequestState,
    /// Recorded error, if any.
    pub error: Option<TransferError>,
    /// Stage executions performed.
    pub attempts: u32,
    /// Retries left at the end.
    pub retries_remaining: u32,
}

/// Completion callback that stores every finished request.
#[derive(Default)]
pub struct RecordingCallback {
    finished: Mutex<Vec<Finished>>,
    notify: Notify,
}

impl RecordingCallback {
    /// Shared recorder.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything recorded so far.
    #[must_use]
    pub fn finished(&self) -> Vec<Finished> {
        lock(&self.finished).clone()
    }

    /// Wait until at least `count` requests finished, or `timeout` elapses.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Finished> {
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if lock(&self.finished).len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;
        let _ = waited;
        self.finished()
    }
}

impl CompletionCallback for RecordingCallback {
    fn on_finished(&self, request: &TransferRequest) {
        lock(&self.finished).push(Finished {
            id: request.id().clone(),
            job_id: request.job_id().to_string(),
            source: request.source().to_string(),
            state: request.state(),
            error: request.error().cloned(),
            attempts: request.attempts(),
            retries_remaining: request.retries_remaining(),
        });
        self.notify.notify_waiters();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::mock_request;
    use ferry_core::{ErrorKind, Progress};

    fn token() -> TransferContext {
        TransferContext::new(Progress::new(), Default::default())
    }

    #[tokio::test]
    async fn scripts_play_in_order_then_succeed() {
        let mover = ScriptedMover::new();
        mover.script(
            "mock://s/a",
            [Step::Temporary("flaky".into()), Step::Permanent("gone".into())],
        );
        let request = mock_request("j", "mock://s/a");

        let first = mover
            .transfer(MoverJob::from_request(&request), token())
            .await
            .expect_err("temporary");
        assert_eq!(first.kind(), ErrorKind::Temporary);
        let second = mover
            .transfer(MoverJob::from_request(&request), token())
            .await
            .expect_err("permanent");
        assert_eq!(second.kind(), ErrorKind::Permanent);
        let third = mover
            .transfer(MoverJob::from_request(&request), token())
            .await
            .expect("default success");
        assert_eq!(third.bytes_transferred, 1_024);
        assert_eq!(mover.attempts("mock://s/a"), 3);
        assert_eq!(mover.overlapping_holders(), 0);
        assert_eq!(mover.max_concurrent(), 1);
    }
}
