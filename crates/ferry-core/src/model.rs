//! Transfer request entity and its state machine.

use std::fmt::{self, Debug, Display, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ferry_events::RequestState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{CacheParameters, CacheState, LocalUser};
use crate::credential::Credential;
use crate::error::{ErrorKind, TransferError, panic_message};
use crate::limits::TransferParameters;
use crate::service::CompletionCallback;

/// Priority assigned to requests that do not specify one.
pub const DEFAULT_PRIORITY: u32 = 50;
/// Retries granted to requests that do not specify a count.
pub const DEFAULT_RETRIES: u32 = 1;
/// Share used when classification yields no name.
pub const DEFAULT_SHARE: &str = "_default";

/// Opaque request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Processing stage a request is queued for or executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// URL validation and cache lookup.
    PreProcessing,
    /// Byte transfer through a protocol mover.
    Delivery,
    /// Cache insertion and cleanup after delivery.
    PostProcessing,
}

impl Stage {
    /// Every stage in processing order.
    pub const ALL: [Self; 3] = [Self::PreProcessing, Self::Delivery, Self::PostProcessing];

    /// Stable lowercase label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreProcessing => "pre_processing",
            Self::Delivery => "delivery",
            Self::PostProcessing => "post_processing",
        }
    }

    /// Position of the stage in [`Stage::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::PreProcessing => 0,
            Self::Delivery => 1,
            Self::PostProcessing => 2,
        }
    }

    /// Stage that follows a successful completion of this one.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::PreProcessing => Some(Self::Delivery),
            Self::Delivery => Some(Self::PostProcessing),
            Self::PostProcessing => None,
        }
    }

    /// Lifecycle state of a request active in this stage.
    #[must_use]
    pub const fn state(self) -> RequestState {
        match self {
            Self::PreProcessing => RequestState::PreProcessing,
            Self::Delivery => RequestState::Delivering,
            Self::PostProcessing => RequestState::PostProcessing,
        }
    }
}

/// Result of feeding a stage outcome into a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The request moved on to the given stage.
    Advanced(Stage),
    /// The request consumed a retry and waits before re-entering `stage`.
    RetryWait {
        /// Stage that will be retried.
        stage: Stage,
        /// Retries left after this one.
        retries_remaining: u32,
    },
    /// The request reached a terminal state.
    Finished(RequestState),
}

#[derive(Clone, Default)]
struct Callbacks(Vec<Arc<dyn CompletionCallback>>);

impl Debug for Callbacks {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} callback(s)", self.0.len())
    }
}

/// One source to destination transfer plus its runtime state.
///
/// A request is owned by exactly one holder at a time: a stage queue, the
/// retry-wait list, or the single worker executing it. It moves between them
/// by value.
#[derive(Debug)]
pub struct TransferRequest {
    id: RequestId,
    job_id: String,
    source: String,
    destination: String,
    user: LocalUser,
    vo: Option<String>,
    state: RequestState,
    stage: Stage,
    priority: u32,
    retries_remaining: u32,
    retries_used: u32,
    attempts: u32,
    share: String,
    sub_share: Option<String>,
    error: Option<TransferError>,
    cache_parameters: CacheParameters,
    cache_state: CacheState,
    mapped_source: Option<String>,
    credential: Option<Credential>,
    transfer_parameters: Option<TransferParameters>,
    bytes_transferred: u64,
    created_at: DateTime<Utc>,
    next_eligible_at: Option<DateTime<Utc>>,
    callbacks: Callbacks,
}

impl TransferRequest {
    /// Create a request in state `New` with default priority and retries.
    #[must_use]
    pub fn new(
        job_id: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        user: LocalUser,
    ) -> Self {
        Self {
            id: RequestId::generate(),
            job_id: job_id.into(),
            source: source.into(),
            destination: destination.into(),
            user,
            vo: None,
            state: RequestState::New,
            stage: Stage::PreProcessing,
            priority: DEFAULT_PRIORITY,
            retries_remaining: DEFAULT_RETRIES,
            retries_used: 0,
            attempts: 0,
            share: DEFAULT_SHARE.to_string(),
            sub_share: None,
            error: None,
            cache_parameters: CacheParameters::default(),
            cache_state: CacheState::NotUsed,
            mapped_source: None,
            credential: None,
            transfer_parameters: None,
            bytes_transferred: 0,
            created_at: Utc::now(),
            next_eligible_at: None,
            callbacks: Callbacks::default(),
        }
    }

    /// Override the generated identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the job priority (higher is served first within a share).
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the number of retries granted after the first attempt.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_remaining = retries;
        self
    }

    /// Set the virtual organisation used by VO share classification.
    #[must_use]
    pub fn with_vo(mut self, vo: impl Into<String>) -> Self {
        self.vo = Some(vo.into());
        self
    }

    /// Set the sub-share appended to the classified share name.
    #[must_use]
    pub fn with_sub_share(mut self, sub_share: impl Into<String>) -> Self {
        self.sub_share = Some(sub_share.into());
        self
    }

    /// Attach cache parameters (already substituted for the user).
    #[must_use]
    pub fn with_cache_parameters(mut self, parameters: CacheParameters) -> Self {
        self.cache_parameters = parameters;
        self
    }

    /// Attach the credential handed to the protocol mover.
    #[must_use]
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Override the scheduler-wide speed and inactivity limits for this request.
    #[must_use]
    pub const fn with_transfer_parameters(mut self, parameters: TransferParameters) -> Self {
        self.transfer_parameters = Some(parameters);
        self
    }

    /// Register a callback fired once the request reaches a terminal state.
    #[must_use]
    pub fn with_callback(mut self, callback: Arc<dyn CompletionCallback>) -> Self {
        self.callbacks.0.push(callback);
        self
    }

    /// Request identifier.
    #[must_use]
    pub const fn id(&self) -> &RequestId {
        &self.id
    }

    /// Owning job identifier.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Source location as submitted.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Destination location.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Location the delivery reads from: the cached copy when one was mapped.
    #[must_use]
    pub fn effective_source(&self) -> &str {
        self.mapped_source.as_deref().unwrap_or(&self.source)
    }

    /// Local account mapping.
    #[must_use]
    pub const fn user(&self) -> &LocalUser {
        &self.user
    }

    /// Virtual organisation, when known.
    #[must_use]
    pub fn vo(&self) -> Option<&str> {
        self.vo.as_deref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> RequestState {
        self.state
    }

    /// Stage the request is queued for, executing, or waiting to retry.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Job priority.
    #[must_use]
    pub const fn priority(&self) -> u32 {
        self.priority
    }

    /// Retries still available.
    #[must_use]
    pub const fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    /// Retries consumed so far.
    #[must_use]
    pub const fn retries_used(&self) -> u32 {
        self.retries_used
    }

    /// Stage executions recorded so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Share the scheduler last classified the request into.
    #[must_use]
    pub fn share(&self) -> &str {
        &self.share
    }

    /// Sub-share name, when set.
    #[must_use]
    pub fn sub_share(&self) -> Option<&str> {
        self.sub_share.as_deref()
    }

    /// Last recorded error.
    #[must_use]
    pub const fn error(&self) -> Option<&TransferError> {
        self.error.as_ref()
    }

    /// Cache parameters handed to the cache layer.
    #[must_use]
    pub const fn cache_parameters(&self) -> &CacheParameters {
        &self.cache_parameters
    }

    /// Cache outcome so far.
    #[must_use]
    pub const fn cache_state(&self) -> CacheState {
        self.cache_state
    }

    /// Cached location used instead of the source, when mapped.
    #[must_use]
    pub fn mapped_source(&self) -> Option<&str> {
        self.mapped_source.as_deref()
    }

    /// Credential passed to the mover.
    #[must_use]
    pub const fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Bytes moved by the last successful delivery.
    #[must_use]
    pub const fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Per-request throughput limits, when overridden.
    #[must_use]
    pub const fn transfer_parameters(&self) -> Option<&TransferParameters> {
        self.transfer_parameters.as_ref()
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Earliest time a request in `RetryWait` may run again.
    #[must_use]
    pub const fn next_eligible_at(&self) -> Option<DateTime<Utc>> {
        self.next_eligible_at
    }

    /// Record when a waiting request becomes eligible.
    pub const fn set_next_eligible_at(&mut self, at: DateTime<Utc>) {
        self.next_eligible_at = Some(at);
    }

    /// Consume one retry. Returns whether any retry was left to consume.
    pub const fn decrease_retries(&mut self) -> bool {
        if self.retries_remaining == 0 {
            return false;
        }
        self.retries_remaining -= 1;
        self.retries_used = self.retries_used.saturating_add(1);
        true
    }

    /// Record the share name resolved by the scheduler.
    pub fn set_share(&mut self, share: impl Into<String>) {
        self.share = share.into();
    }

    /// Record the cache outcome.
    pub const fn set_cache_state(&mut self, state: CacheState) {
        self.cache_state = state;
    }

    /// Read from a cached copy instead of the original source.
    pub fn set_mapped_source(&mut self, location: impl Into<String>) {
        self.mapped_source = Some(location.into());
    }

    /// Go back to reading the original source.
    pub fn clear_mapped_source(&mut self) {
        self.mapped_source = None;
    }

    /// Record the byte count of a completed delivery.
    pub const fn record_bytes(&mut self, bytes: u64) {
        self.bytes_transferred = bytes;
    }

    /// Accept the request into a scheduler: `New` to `PreProcessing`.
    ///
    /// # Errors
    ///
    /// Returns an internal error when the request was already submitted.
    pub fn submit(&mut self) -> Result<(), TransferError> {
        if self.state != RequestState::New {
            return Err(TransferError::internal(format!(
                "request {} already submitted (state {})",
                self.id,
                self.state.as_str()
            )));
        }
        self.stage = Stage::PreProcessing;
        self.state = Stage::PreProcessing.state();
        Ok(())
    }

    /// Apply the outcome of one execution of the current stage.
    ///
    /// Success advances to the next stage or to `Done`. Retryable errors
    /// consume a retry and enter `RetryWait`, or fail the request once none
    /// remain. Permanent errors fail it and cancellations cancel it.
    pub fn apply_outcome(&mut self, outcome: Result<(), TransferError>) -> Transition {
        if self.state.is_terminal() {
            return Transition::Finished(self.state);
        }
        self.attempts = self.attempts.saturating_add(1);
        match outcome {
            Ok(()) => {
                self.error = None;
                match self.stage.next() {
                    Some(next) => {
                        self.stage = next;
                        self.state = next.state();
                        Transition::Advanced(next)
                    }
                    None => self.finish(RequestState::Done, None),
                }
            }
            Err(err) => match err.kind() {
                ErrorKind::Cancelled => self.finish(RequestState::Cancelled, Some(err)),
                ErrorKind::Permanent => self.finish(RequestState::Failed, Some(err)),
                ErrorKind::Temporary | ErrorKind::Internal => {
                    if self.retries_remaining == 0 {
                        let exhausted = TransferError::permanent(format!(
                            "{}; no retries left",
                            err.message()
                        ));
                        return self.finish(RequestState::Failed, Some(exhausted));
                    }
                    self.decrease_retries();
                    self.state = RequestState::RetryWait;
                    self.error = Some(err.normalized());
                    Transition::RetryWait {
                        stage: self.stage,
                        retries_remaining: self.retries_remaining,
                    }
                }
            },
        }
    }

    /// Leave `RetryWait` and become eligible for the same stage again.
    pub fn resume_after_wait(&mut self) {
        if matches!(self.state, RequestState::RetryWait) {
            self.state = self.stage.state();
            self.next_eligible_at = None;
        }
    }

    /// Cancel a request that is not executing. Terminal requests are left untouched.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Transition {
        if self.state.is_terminal() {
            return Transition::Finished(self.state);
        }
        self.finish(RequestState::Cancelled, Some(TransferError::cancelled(reason)))
    }

    /// Invoke every registered completion callback.
    ///
    /// Only meaningful once the request is terminal; callers must not hold
    /// scheduler locks while calling this. A panicking callback does not stop
    /// the others; the panic message of each one that did is returned.
    #[must_use = "panicking callbacks should be reported"]
    pub fn notify_callbacks(&self) -> Vec<String> {
        self.callbacks
            .0
            .iter()
            .filter_map(|callback| {
                panic::catch_unwind(AssertUnwindSafe(|| callback.on_finished(self)))
                    .err()
                    .map(|payload| panic_message(&*payload))
            })
            .collect()
    }

    /// Copy of the request's identity, progress, and callbacks.
    ///
    /// The copy stands in for the request when its owner is lost and must
    /// never be submitted or queued alongside the original.
    #[must_use]
    pub fn detached_copy(&self) -> Self {
        Self {
            id: self.id.clone(),
            job_id: self.job_id.clone(),
            source: self.source.clone(),
            destination: self.destination.clone(),
            user: self.user.clone(),
            vo: self.vo.clone(),
            state: self.state,
            stage: self.stage,
            priority: self.priority,
            retries_remaining: self.retries_remaining,
            retries_used: self.retries_used,
            attempts: self.attempts,
            share: self.share.clone(),
            sub_share: self.sub_share.clone(),
            error: self.error.clone(),
            cache_parameters: self.cache_parameters.clone(),
            cache_state: self.cache_state,
            mapped_source: self.mapped_source.clone(),
            credential: self.credential.clone(),
            transfer_parameters: self.transfer_parameters,
            bytes_transferred: self.bytes_transferred,
            created_at: self.created_at,
            next_eligible_at: self.next_eligible_at,
            callbacks: self.callbacks.clone(),
        }
    }

    fn finish(&mut self, state: RequestState, error: Option<TransferError>) -> Transition {
        self.state = state;
        self.error = error;
        Transition::Finished(state)
    }
}
