//! Scheduler handle and the control loop that owns every queue.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{TimeDelta, Utc};
use ferry_core::{RequestId, RequestState, Stage, TransferError, TransferRequest, Transition};
use ferry_events::{Event, EventBus};
use ferry_telemetry::{Metrics, Outcome};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{self, JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::SchedulerCommand;
use crate::config::{SchedulerConfig, SchedulerContext};
use crate::error::{SchedulerError, SchedulerResult};
use crate::processor::StageProcessor;
use crate::queue::{QueueEntry, StageQueue};
use crate::shares::{ShareCandidate, ShareConfiguration, ShareLedger};
use crate::slots::{SlotLimits, SlotPool, SlotUsage};
use crate::worker::{StageWorker, WorkerReport};

/// Stage admission order: finishing work first frees downstream capacity.
const ADMISSION_ORDER: [Stage; 3] = [Stage::PostProcessing, Stage::Delivery, Stage::PreProcessing];

/// Queue and slot usage of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageSnapshot {
    /// Stage described.
    pub stage: Stage,
    /// Normal slot usage.
    pub slots: SlotUsage,
    /// Requests waiting for a slot.
    pub queued: usize,
}

/// Point-in-time view of the scheduler for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    /// One entry per stage in processing order.
    pub stages: Vec<StageSnapshot>,
    /// Emergency pool usage.
    pub emergency: SlotUsage,
    /// Requests held in retry-wait.
    pub retry_waiting: usize,
    /// Requests currently executing.
    pub active: usize,
}

impl SchedulerSnapshot {
    /// Entry for `stage`.
    #[must_use]
    pub fn stage(&self, stage: Stage) -> Option<&StageSnapshot> {
        self.stages.iter().find(|entry| entry.stage == stage)
    }
}

struct Inner {
    commands: mpsc::UnboundedSender<SchedulerCommand>,
    stopped: AtomicBool,
    slots: Arc<SlotPool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to a running scheduler.
///
/// Every clone talks to the same control loop. When the last handle is
/// dropped the loop cancels outstanding work and exits.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Spawn the control loop on the current Tokio runtime.
    #[must_use]
    pub fn start(config: SchedulerConfig, context: SchedulerContext) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let slots = Arc::new(SlotPool::new(config.slots));
        info!(
            pre_processor = config.slots.pre_processor,
            delivery = config.slots.delivery,
            post_processor = config.slots.post_processor,
            emergency = config.slots.emergency,
            movers = ?context.movers.schemes(),
            "transfer scheduler starting"
        );
        let control = ControlLoop::new(config, context, Arc::clone(&slots), receiver);
        let join = tokio::spawn(control.run());
        Self {
            inner: Arc::new(Inner {
                commands,
                stopped: AtomicBool::new(false),
                slots,
                join: Mutex::new(Some(join)),
            }),
        }
    }

    /// Accept a new request into pre-processing.
    ///
    /// # Errors
    ///
    /// Returns an error when the scheduler is stopped or the request was
    /// already submitted elsewhere.
    pub fn submit(&self, mut request: TransferRequest) -> SchedulerResult<RequestId> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(SchedulerError::Stopped { operation: "submit" });
        }
        request.submit().map_err(|source| SchedulerError::Rejected {
            request_id: request.id().clone(),
            source,
        })?;
        let request_id = request.id().clone();
        self.send(SchedulerCommand::Submit(Box::new(request)), "submit")?;
        Ok(request_id)
    }

    /// Reconfigure capacity. Post-processing gets as many slots as
    /// pre-processing.
    ///
    /// # Errors
    ///
    /// Returns an error when the scheduler is stopped.
    pub fn set_slots(
        &self,
        pre_processor: usize,
        delivery: usize,
        emergency: usize,
        staged_prepared: usize,
    ) -> SchedulerResult<()> {
        self.set_slot_limits(SlotLimits {
            pre_processor,
            delivery,
            post_processor: pre_processor,
            emergency,
            staged_prepared,
        })
    }

    /// Replace every slot capacity. Held slots are never revoked.
    ///
    /// # Errors
    ///
    /// Returns an error when the scheduler is stopped.
    pub fn set_slot_limits(&self, limits: SlotLimits) -> SchedulerResult<()> {
        self.send(SchedulerCommand::SetSlots(limits), "set_slots")
    }

    /// Replace the share configuration. Requests pick up their new share at
    /// their next stage transition.
    ///
    /// # Errors
    ///
    /// Returns an error when the scheduler is stopped.
    pub fn set_transfer_shares_conf(&self, shares: ShareConfiguration) -> SchedulerResult<()> {
        self.send(SchedulerCommand::SetShares(shares), "set_transfer_shares_conf")
    }

    /// Write the request list to `location` periodically, or stop dumping
    /// with `None`.
    ///
    /// # Errors
    ///
    /// Returns an error when the scheduler is stopped.
    pub fn set_dump_location(&self, location: Option<PathBuf>) -> SchedulerResult<()> {
        self.send(SchedulerCommand::SetDumpLocation(location), "set_dump_location")
    }

    /// Cancel every request belonging to `job_id`.
    ///
    /// # Errors
    ///
    /// Returns an error when the scheduler is stopped.
    pub fn cancel_job(&self, job_id: &str) -> SchedulerResult<()> {
        self.send(
            SchedulerCommand::CancelJob {
                job_id: job_id.to_string(),
            },
            "cancel_job",
        )
    }

    /// Cancel one request.
    ///
    /// # Errors
    ///
    /// Returns an error when the scheduler is stopped.
    pub fn cancel_request(&self, request_id: &RequestId) -> SchedulerResult<()> {
        self.send(
            SchedulerCommand::CancelRequest {
                request_id: request_id.clone(),
            },
            "cancel_request",
        )
    }

    /// Queue depths and slot usage as seen by the control loop.
    ///
    /// # Errors
    ///
    /// Returns an error when the loop has exited.
    pub async fn snapshot(&self) -> SchedulerResult<SchedulerSnapshot> {
        let (respond_to, response) = oneshot::channel();
        self.send(SchedulerCommand::Snapshot { respond_to }, "snapshot")?;
        response
            .await
            .map_err(|_| SchedulerError::LoopUnavailable { operation: "snapshot" })
    }

    /// Normal slot usage of one stage.
    #[must_use]
    pub fn slot_usage(&self, stage: Stage) -> SlotUsage {
        self.inner.slots.usage(stage)
    }

    /// Emergency pool usage.
    #[must_use]
    pub fn emergency_usage(&self) -> SlotUsage {
        self.inner.slots.emergency_usage()
    }

    /// Whether the scheduler still admits requests.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::Acquire) && !self.inner.commands.is_closed()
    }

    /// Stop admitting requests and wait for the loop to exit.
    ///
    /// With `cancel_in_flight` every queued, waiting, and executing request
    /// is cancelled; otherwise outstanding requests run to completion first.
    /// Later calls return immediately.
    ///
    /// # Errors
    ///
    /// Returns an error when the loop task panicked.
    pub async fn stop(&self, cancel_in_flight: bool) -> SchedulerResult<()> {
        self.inner.stopped.store(true, Ordering::Release);
        if self
            .inner
            .commands
            .send(SchedulerCommand::Stop { cancel_in_flight })
            .is_err()
        {
            debug!("scheduler loop already gone");
        }
        let join = self
            .inner
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            join.await.map_err(|source| SchedulerError::LoopJoin { source })?;
        }
        Ok(())
    }

    fn send(&self, command: SchedulerCommand, operation: &'static str) -> SchedulerResult<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| SchedulerError::Stopped { operation })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Normal,
    Emergency,
}

/// Bookkeeping for a request whose stage is executing.
///
/// `shadow` is a detached copy taken at dispatch; it only reports the request
/// when the worker task never hands it back.
#[derive(Debug)]
struct ActiveTask {
    stage: Stage,
    slot: SlotKind,
    cancel: CancellationToken,
    cancelled_for: Option<&'static str>,
    shadow: TransferRequest,
}

#[derive(Debug)]
struct Waiting {
    ready_at: Instant,
    request: TransferRequest,
}

enum CancelTarget {
    All,
    Job(String),
    Request(RequestId),
}

impl CancelTarget {
    fn matches(&self, request_id: &RequestId, job_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Job(job) => job == job_id,
            Self::Request(id) => id == request_id,
        }
    }

    const fn reason(&self) -> &'static str {
        match self {
            Self::All => "scheduler stopped",
            Self::Job(_) => "job cancelled",
            Self::Request(_) => "request cancelled",
        }
    }
}

struct ControlLoop {
    config: SchedulerConfig,
    shares: ShareConfiguration,
    slots: Arc<SlotPool>,
    events: EventBus,
    metrics: Metrics,
    worker: StageWorker,
    commands: mpsc::UnboundedReceiver<SchedulerCommand>,
    commands_open: bool,
    queues: [StageQueue; 3],
    ledgers: [ShareLedger; 3],
    retry_wait: Vec<Waiting>,
    active: HashMap<RequestId, ActiveTask>,
    tasks: HashMap<task::Id, RequestId>,
    workers: JoinSet<WorkerReport>,
    seq: u64,
    /// `Some(cancel_in_flight)` once a stop was requested.
    stopping: Option<bool>,
}

impl ControlLoop {
    fn new(
        config: SchedulerConfig,
        context: SchedulerContext,
        slots: Arc<SlotPool>,
        commands: mpsc::UnboundedReceiver<SchedulerCommand>,
    ) -> Self {
        let processor = StageProcessor::new(context.movers.clone(), context.cache)
            .with_url_map(config.url_map.clone());
        let worker = StageWorker::new(
            processor,
            context.movers,
            config.transfer,
            config.monitor_interval,
            config.cancel_grace,
        );
        Self {
            shares: config.shares.clone(),
            config,
            slots,
            events: context.events,
            metrics: context.metrics,
            worker,
            commands,
            commands_open: true,
            queues: Default::default(),
            ledgers: Default::default(),
            retry_wait: Vec::new(),
            active: HashMap::new(),
            tasks: HashMap::new(),
            workers: JoinSet::new(),
            seq: 0,
            stopping: None,
        }
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut dump = tokio::time::interval(self.config.dump_interval);
        dump.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle(command),
                    None => {
                        self.commands_open = false;
                        self.begin_stop(true);
                    }
                },
                Some(joined) = self.workers.join_next_with_id(), if !self.workers.is_empty() => {
                    self.on_joined(joined);
                }
                _ = tick.tick() => {}
                _ = dump.tick(), if self.config.dump_location.is_some() => self.dump_state(),
            }
            self.promote_ready_retries();
            self.schedule();
            self.publish_gauges();
            if self.stopping.is_some() && self.is_idle() {
                break;
            }
        }
        let cancelled_in_flight = self.stopping.unwrap_or(true);
        self.events.publish(Event::SchedulerStopped { cancelled_in_flight });
        info!(cancelled_in_flight, "transfer scheduler stopped");
    }

    fn handle(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Submit(request) => self.accept(*request),
            SchedulerCommand::SetSlots(limits) => {
                self.slots.resize(limits);
                self.events.publish(Event::SlotsReconfigured {
                    pre_processor: limits.pre_processor,
                    delivery: limits.delivery,
                    post_processor: limits.post_processor,
                    emergency: limits.emergency,
                    staged_prepared: limits.staged_prepared,
                });
                info!(
                    pre_processor = limits.pre_processor,
                    delivery = limits.delivery,
                    post_processor = limits.post_processor,
                    emergency = limits.emergency,
                    staged_prepared = limits.staged_prepared,
                    "slot limits updated"
                );
            }
            SchedulerCommand::SetShares(shares) => {
                self.events.publish(Event::SharesReconfigured {
                    share_type: shares.share_type().as_str().to_string(),
                    reference_shares: shares.reference_count(),
                });
                info!(
                    share_type = shares.share_type().as_str(),
                    reference_shares = shares.reference_count(),
                    "transfer share configuration replaced"
                );
                self.shares = shares;
                for ledger in &mut self.ledgers {
                    ledger.reset();
                }
            }
            SchedulerCommand::SetDumpLocation(location) => {
                info!(location = ?location.as_ref().map(|path| path.display().to_string()), "state dump location set");
                self.config.dump_location = location;
            }
            SchedulerCommand::CancelJob { job_id } => self.cancel(&CancelTarget::Job(job_id)),
            SchedulerCommand::CancelRequest { request_id } => {
                self.cancel(&CancelTarget::Request(request_id));
            }
            SchedulerCommand::Snapshot { respond_to } => {
                if respond_to.send(self.snapshot()).is_err() {
                    debug!("snapshot requester went away");
                }
            }
            SchedulerCommand::Stop { cancel_in_flight } => self.begin_stop(cancel_in_flight),
        }
    }

    fn accept(&mut self, mut request: TransferRequest) {
        self.events.publish(Event::RequestSubmitted {
            request_id: request.id().to_string(),
            job_id: request.job_id().to_string(),
            source: request.source().to_string(),
            destination: request.destination().to_string(),
        });
        info!(
            request_id = %request.id(),
            job_id = request.job_id(),
            source = request.source(),
            destination = request.destination(),
            "transfer request submitted"
        );
        if self.stopping == Some(true) {
            let _ = request.cancel(CancelTarget::All.reason());
            self.finish(request);
            return;
        }
        self.enqueue(request);
    }

    fn enqueue(&mut self, mut request: TransferRequest) {
        let share = self.shares.classify(&request);
        let priority = self.shares.effective_priority(&share, request.priority());
        request.set_share(share);
        self.seq += 1;
        let stage = request.stage();
        self.events.publish(Event::StageChanged {
            request_id: request.id().to_string(),
            job_id: request.job_id().to_string(),
            state: request.state(),
            share: request.share().to_string(),
        });
        debug!(
            request_id = %request.id(),
            share = request.share(),
            stage = stage.as_str(),
            priority,
            "request queued"
        );
        self.queues[stage.index()].push(QueueEntry {
            request,
            priority,
            seq: self.seq,
            enqueued_at: Instant::now(),
        });
    }

    fn schedule(&mut self) {
        for stage in ADMISSION_ORDER {
            while self.admit(stage) {}
        }
    }

    fn admit(&mut self, stage: Stage) -> bool {
        if self.queues[stage.index()].is_empty() {
            return false;
        }
        if self.slots.try_acquire(stage) {
            if let Some(entry) = self.pick(stage) {
                self.dispatch(entry, SlotKind::Normal);
                return true;
            }
            self.slots.release(stage);
            return false;
        }
        self.admit_emergency(stage)
    }

    /// Fair choice among the shares queued for `stage`.
    fn pick(&mut self, stage: Stage) -> Option<QueueEntry> {
        let share = {
            let candidates: Vec<ShareCandidate<'_>> = self.queues[stage.index()]
                .heads()
                .filter(|(share, _)| self.may_prepare(stage, share))
                .map(|(share, head)| ShareCandidate {
                    share,
                    weight: self.shares.weight(share),
                    priority: head.priority,
                    seq: head.seq,
                })
                .collect();
            let index = self.ledgers[stage.index()].select(&candidates)?;
            candidates[index].share.to_string()
        };
        self.queues[stage.index()].pop(&share)
    }

    /// Last-retry requests that waited past the threshold may use the emergency pool.
    fn admit_emergency(&mut self, stage: Stage) -> bool {
        if !self.slots.try_acquire_emergency() {
            return false;
        }
        let now = Instant::now();
        let threshold = self.config.emergency_threshold;
        let blocked: Vec<String> = self.queues[stage.index()]
            .heads()
            .filter(|(share, _)| !self.may_prepare(stage, share))
            .map(|(share, _)| share.to_string())
            .collect();
        let entry = self.queues[stage.index()].take_best_where(|entry| {
            entry.request.retries_remaining() <= 1
                && now.saturating_duration_since(entry.enqueued_at) >= threshold
                && !blocked.iter().any(|share| share == entry.request.share())
        });
        match entry {
            Some(entry) => {
                self.metrics.inc_emergency_admission();
                info!(
                    request_id = %entry.request.id(),
                    stage = stage.as_str(),
                    retries_remaining = entry.request.retries_remaining(),
                    "admitted through emergency slot"
                );
                self.dispatch(entry, SlotKind::Emergency);
                true
            }
            None => {
                self.slots.release_emergency();
                false
            }
        }
    }

    /// Pre-processing pauses for a share once it has `staged_prepared`
    /// requests prepared or being prepared ahead of delivery.
    fn may_prepare(&self, stage: Stage, share: &str) -> bool {
        if stage != Stage::PreProcessing {
            return true;
        }
        let preparing = self
            .active
            .values()
            .filter(|task| task.stage == Stage::PreProcessing && task.shadow.share() == share)
            .count();
        let prepared = self.queues[Stage::Delivery.index()].share_len(share);
        preparing + prepared < self.slots.limits().staged_prepared
    }

    fn dispatch(&mut self, entry: QueueEntry, slot: SlotKind) {
        let request = entry.request;
        let stage = request.stage();
        let request_id = request.id().clone();
        let shadow = request.detached_copy();
        let cancel = CancellationToken::new();
        debug!(
            request_id = %request_id,
            share = request.share(),
            stage = stage.as_str(),
            waited_ms = u64::try_from(entry.enqueued_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "dispatching stage worker"
        );
        let handle = self
            .workers
            .spawn(self.worker.clone().run(request, cancel.clone()));
        self.tasks.insert(handle.id(), request_id.clone());
        self.active.insert(
            request_id,
            ActiveTask {
                stage,
                slot,
                cancel,
                cancelled_for: None,
                shadow,
            },
        );
    }

    fn on_joined(&mut self, joined: Result<(task::Id, WorkerReport), JoinError>) {
        match joined {
            Ok((task_id, report)) => {
                self.tasks.remove(&task_id);
                self.complete(report);
            }
            Err(err) => {
                let task = self
                    .tasks
                    .remove(&err.id())
                    .and_then(|request_id| self.active.remove(&request_id));
                let Some(task) = task else {
                    error!(error = %err, "untracked stage worker task failed");
                    return;
                };
                self.release_slot(task.stage, task.slot);
                error!(
                    request_id = %task.shadow.id(),
                    stage = task.stage.as_str(),
                    error = %err,
                    "stage worker task lost; finishing request from its dispatch copy"
                );
                let mut request = task.shadow;
                let _ = match task.cancelled_for {
                    Some(reason) => request.cancel(reason),
                    None => request.apply_outcome(Err(TransferError::permanent(format!(
                        "stage worker lost: {err}"
                    )))),
                };
                self.finish(request);
            }
        }
    }

    fn complete(&mut self, report: WorkerReport) {
        let WorkerReport {
            mut request,
            stage,
            outcome,
        } = report;
        let cancelled_for = match self.active.remove(request.id()) {
            Some(task) => {
                self.release_slot(task.stage, task.slot);
                task.cancelled_for
            }
            None => {
                warn!(request_id = %request.id(), "completed request was not tracked as active");
                None
            }
        };
        if let Some(reason) = cancelled_for {
            debug!(
                request_id = %request.id(),
                stage = stage.as_str(),
                succeeded = outcome.is_ok(),
                "cancelled while its stage was executing"
            );
            let _ = request.cancel(reason);
            self.finish(request);
            return;
        }
        match &outcome {
            Ok(()) if stage == Stage::Delivery => {
                self.metrics.add_bytes_transferred(request.bytes_transferred());
            }
            Ok(()) => {}
            Err(err) => debug!(
                request_id = %request.id(),
                stage = stage.as_str(),
                kind = err.kind().as_str(),
                error = %err,
                "stage attempt failed"
            ),
        }
        let transition = request.apply_outcome(outcome);
        self.follow(request, transition);
    }

    fn follow(&mut self, mut request: TransferRequest, transition: Transition) {
        if self.stopping == Some(true) && !request.state().is_terminal() {
            let _ = request.cancel(CancelTarget::All.reason());
            self.finish(request);
            return;
        }
        match transition {
            Transition::Advanced(_) => self.enqueue(request),
            Transition::RetryWait {
                stage,
                retries_remaining,
            } => {
                let delay = self.config.retry.delay_for(request.retries_used());
                if let Some(at) = TimeDelta::from_std(delay)
                    .ok()
                    .and_then(|delay| Utc::now().checked_add_signed(delay))
                {
                    request.set_next_eligible_at(at);
                }
                let reason = request
                    .error()
                    .map(|err| err.message().to_string())
                    .unwrap_or_default();
                self.metrics.inc_retry();
                self.events.publish(Event::RetryScheduled {
                    request_id: request.id().to_string(),
                    job_id: request.job_id().to_string(),
                    retries_remaining,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    reason: reason.clone(),
                });
                warn!(
                    request_id = %request.id(),
                    stage = stage.as_str(),
                    retries_remaining,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %reason,
                    "temporary failure; retry scheduled"
                );
                self.retry_wait.push(Waiting {
                    ready_at: Instant::now() + delay,
                    request,
                });
            }
            Transition::Finished(_) => self.finish(request),
        }
    }

    fn finish(&mut self, request: TransferRequest) {
        let state = request.state();
        let outcome = match state {
            RequestState::Done => Outcome::Done,
            RequestState::Cancelled => Outcome::Cancelled,
            _ => Outcome::Failed,
        };
        self.metrics.inc_transfer(outcome);
        let error = request.error().map(|err| err.message().to_string());
        match state {
            RequestState::Failed => error!(
                request_id = %request.id(),
                job_id = request.job_id(),
                attempts = request.attempts(),
                error = error.as_deref().unwrap_or_default(),
                "transfer request failed"
            ),
            _ => info!(
                request_id = %request.id(),
                job_id = request.job_id(),
                state = state.as_str(),
                attempts = request.attempts(),
                bytes = request.bytes_transferred(),
                "transfer request finished"
            ),
        }
        self.events.publish(Event::RequestFinished {
            request_id: request.id().to_string(),
            job_id: request.job_id().to_string(),
            state,
            error,
        });
        for panic in request.notify_callbacks() {
            error!(
                request_id = %request.id(),
                job_id = request.job_id(),
                panic = %panic,
                "completion callback panicked"
            );
        }
    }

    fn promote_ready_retries(&mut self) {
        if self.retry_wait.is_empty() {
            return;
        }
        let now = Instant::now();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retry_wait)
            .into_iter()
            .partition(|waiting| waiting.ready_at <= now);
        self.retry_wait = waiting;
        for Waiting { mut request, .. } in ready {
            request.resume_after_wait();
            self.enqueue(request);
        }
    }

    fn cancel(&mut self, target: &CancelTarget) {
        let reason = target.reason();
        let queued: Vec<TransferRequest> = self
            .queues
            .iter_mut()
            .flat_map(|queue| queue.take_where(|request| target.matches(request.id(), request.job_id())))
            .map(|entry| entry.request)
            .collect();
        let (waiting, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retry_wait)
            .into_iter()
            .partition(|waiting| target.matches(waiting.request.id(), waiting.request.job_id()));
        self.retry_wait = kept;

        let mut signalled = 0_usize;
        for (request_id, task) in &mut self.active {
            if target.matches(request_id, task.shadow.job_id()) {
                task.cancel.cancel();
                task.cancelled_for = task.cancelled_for.or(Some(reason));
                signalled += 1;
            }
        }
        let removed = queued.len() + waiting.len();
        if removed > 0 || signalled > 0 {
            info!(reason, removed, signalled, "cancelling requests");
        }
        for mut request in queued
            .into_iter()
            .chain(waiting.into_iter().map(|waiting| waiting.request))
        {
            let _ = request.cancel(reason);
            self.finish(request);
        }
    }

    fn begin_stop(&mut self, cancel_in_flight: bool) {
        let cancel_in_flight = cancel_in_flight || self.stopping == Some(true);
        self.stopping = Some(cancel_in_flight);
        info!(
            cancel_in_flight,
            active = self.active.len(),
            "transfer scheduler stopping"
        );
        if cancel_in_flight {
            self.cancel(&CancelTarget::All);
        }
    }

    fn release_slot(&self, stage: Stage, slot: SlotKind) {
        match slot {
            SlotKind::Normal => self.slots.release(stage),
            SlotKind::Emergency => self.slots.release_emergency(),
        }
    }

    fn is_idle(&self) -> bool {
        self.workers.is_empty()
            && self.retry_wait.is_empty()
            && self.queues.iter().all(StageQueue::is_empty)
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            stages: Stage::ALL
                .iter()
                .map(|stage| StageSnapshot {
                    stage: *stage,
                    slots: self.slots.usage(*stage),
                    queued: self.queues[stage.index()].len(),
                })
                .collect(),
            emergency: self.slots.emergency_usage(),
            retry_waiting: self.retry_wait.len(),
            active: self.active.len(),
        }
    }

    /// Rewrite the dump file with one `id state priority share` line per
    /// executing, queued, and waiting request.
    fn dump_state(&self) {
        let Some(path) = self.config.dump_location.clone() else {
            return;
        };
        let mut lines = String::new();
        for task in self.active.values() {
            let request = &task.shadow;
            let _ = writeln!(
                lines,
                "{} {} {} {}",
                request.id(),
                request.state().as_str(),
                request.priority(),
                request.share()
            );
        }
        for entry in self.queues.iter().flat_map(StageQueue::iter) {
            let _ = writeln!(
                lines,
                "{} {} {} {}",
                entry.request.id(),
                entry.request.state().as_str(),
                entry.priority,
                entry.request.share()
            );
        }
        for waiting in &self.retry_wait {
            let _ = writeln!(
                lines,
                "{} {} {} {}",
                waiting.request.id(),
                waiting.request.state().as_str(),
                waiting.request.priority(),
                waiting.request.share()
            );
        }
        tokio::spawn(async move {
            if let Err(err) = tokio::fs::write(&path, lines).await {
                warn!(path = %path.display(), error = %err, "state dump failed");
            }
        });
    }

    fn publish_gauges(&self) {
        for stage in Stage::ALL {
            let usage = self.slots.usage(stage);
            self.metrics.set_slots_in_use(stage.as_str(), usage.in_use);
            self.metrics
                .set_queue_depth(stage.as_str(), self.queues[stage.index()].len());
        }
        self.metrics.set_retry_waiting(self.retry_wait.len());
        self.metrics.set_active_requests(self.active.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ferry_core::MoverRegistry;
    use ferry_test_support::fixtures::mock_request;
    use ferry_test_support::mocks::{RecordingCallback, ScriptedMover};

    fn control_loop(mover: Arc<ScriptedMover>) -> ControlLoop {
        let config = SchedulerConfig::default();
        let slots = Arc::new(SlotPool::new(config.slots));
        let context = SchedulerContext::new(
            EventBus::new(),
            Metrics::new().expect("metrics registry"),
            MoverRegistry::new().with(mover),
        );
        let (_commands, receiver) = mpsc::unbounded_channel();
        ControlLoop::new(config, context, slots, receiver)
    }

    fn submitted(recorder: &Arc<RecordingCallback>, source: &str) -> TransferRequest {
        let mut request = mock_request("job-race", source)
            .with_callback(Arc::clone(recorder) as Arc<dyn ferry_core::CompletionCallback>);
        request.submit().expect("submit");
        request
    }

    #[tokio::test]
    async fn cancel_landing_after_the_worker_returned_still_cancels() {
        let mut control = control_loop(Arc::new(ScriptedMover::new()));
        let recorder = RecordingCallback::new();
        let request = submitted(&recorder, "mock://source/race");
        let request_id = request.id().clone();
        control.accept(request);
        control.schedule();
        assert_eq!(control.active.len(), 1);

        // Let pre-processing finish without collecting its report.
        tokio::time::sleep(Duration::from_millis(50)).await;
        control.cancel(&CancelTarget::Request(request_id.clone()));
        let joined = control.workers.join_next_with_id().await.expect("one worker");
        control.on_joined(joined);

        let snapshot = control.snapshot();
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.stage(Stage::Delivery).map(|s| s.queued), Some(0));
        assert_eq!(control.slots.usage(Stage::PreProcessing).in_use, 0);
        let finished = recorder.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].id, request_id);
        assert_eq!(finished[0].state, RequestState::Cancelled);
        assert_eq!(
            finished[0].error.as_ref().map(|err| err.message().to_string()),
            Some("request cancelled".to_string())
        );
    }

    #[tokio::test]
    async fn lost_worker_tasks_still_report_their_request() {
        let mut control = control_loop(Arc::new(ScriptedMover::new()));
        let recorder = RecordingCallback::new();
        let request = submitted(&recorder, "mock://source/lost");
        let request_id = request.id().clone();
        let shadow = request.detached_copy();

        assert!(control.slots.try_acquire(Stage::PreProcessing));
        let handle = control.workers.spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            WorkerReport {
                request,
                stage: Stage::PreProcessing,
                outcome: Ok(()),
            }
        });
        control.tasks.insert(handle.id(), request_id.clone());
        control.active.insert(
            request_id.clone(),
            ActiveTask {
                stage: Stage::PreProcessing,
                slot: SlotKind::Normal,
                cancel: CancellationToken::new(),
                cancelled_for: None,
                shadow,
            },
        );
        handle.abort();

        let joined = control.workers.join_next_with_id().await.expect("one worker");
        assert!(joined.is_err());
        control.on_joined(joined);

        assert!(control.active.is_empty());
        assert!(control.tasks.is_empty());
        assert_eq!(control.slots.usage(Stage::PreProcessing).in_use, 0);
        let finished = recorder.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].id, request_id);
        assert_eq!(finished[0].state, RequestState::Failed);
        let error = finished[0].error.as_ref().expect("failure recorded");
        assert!(error.message().contains("stage worker lost"), "{}", error.message());
    }
}
