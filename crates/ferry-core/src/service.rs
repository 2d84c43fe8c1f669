//! Collaborator interfaces consumed by the scheduler, plus the mover registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::bail;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheParameters, LocalUser};
use crate::credential::Credential;
use crate::error::{TransferError, TransferResult};
use crate::location::scheme_of;
use crate::model::{RequestId, TransferRequest};

/// Borrowed view of the request fields a mover needs.
#[derive(Debug, Clone, Copy)]
pub struct MoverJob<'a> {
    /// Request being delivered.
    pub request_id: &'a RequestId,
    /// Location to read from (the cached copy when one was mapped).
    pub source: &'a str,
    /// Location to write to.
    pub destination: &'a str,
    /// Cache parameters substituted for the user.
    pub cache: &'a CacheParameters,
    /// Local account the transfer runs as.
    pub user: &'a LocalUser,
    /// Credential to authenticate with, passed through unchanged.
    pub credential: Option<&'a Credential>,
}

impl<'a> MoverJob<'a> {
    /// Build the mover view of a request.
    #[must_use]
    pub fn from_request(request: &'a TransferRequest) -> Self {
        Self {
            request_id: request.id(),
            source: request.effective_source(),
            destination: request.destination(),
            cache: request.cache_parameters(),
            user: request.user(),
            credential: request.credential(),
        }
    }
}

/// Outcome of a successful transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoverReport {
    /// Bytes written to the destination.
    pub bytes_transferred: u64,
}

/// Shared byte counter a mover advances as data flows.
#[derive(Debug, Clone, Default)]
pub struct Progress(Arc<AtomicU64>);

impl Progress {
    /// Fresh counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `bytes` to the running total.
    pub fn advance(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes recorded so far.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Runtime hooks handed to a mover for one transfer.
#[derive(Debug, Clone)]
pub struct TransferContext {
    progress: Progress,
    cancel: CancellationToken,
}

impl TransferContext {
    /// Bundle a progress counter with a cancellation token.
    #[must_use]
    pub const fn new(progress: Progress, cancel: CancellationToken) -> Self {
        Self { progress, cancel }
    }

    /// Progress counter to advance after each buffer.
    #[must_use]
    pub const fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Token that fires when the transfer must stop.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Check point for movers: fails with a cancellation error once the token fired.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorKind::Cancelled`] when cancellation was requested.
    pub fn checkpoint(&self) -> TransferResult<()> {
        if self.cancel.is_cancelled() {
            Err(TransferError::cancelled("transfer cancelled"))
        } else {
            Ok(())
        }
    }
}

/// Protocol-specific data mover.
#[async_trait]
pub trait ProtocolMover: Send + Sync {
    /// URL schemes served by this mover.
    fn schemes(&self) -> &'static [&'static str];

    /// Copy `job.source` to `job.destination`.
    ///
    /// Implementations advance `context.progress()` after each buffer and call
    /// `context.checkpoint()` at buffer boundaries.
    async fn transfer(
        &self,
        job: MoverJob<'_>,
        context: TransferContext,
    ) -> TransferResult<MoverReport>;
}

/// Key-value cache of delivered files.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up a cached copy for `key` under the given (substituted) parameters.
    async fn get(&self, params: &CacheParameters, key: &str) -> anyhow::Result<Option<PathBuf>>;

    /// Store the file at `data` under `key`, returning the cached location.
    async fn put(
        &self,
        params: &CacheParameters,
        key: &str,
        data: &Path,
    ) -> anyhow::Result<PathBuf>;

    /// Drop the entry for `key`.
    async fn remove(&self, params: &CacheParameters, key: &str) -> anyhow::Result<()> {
        let _ = (params, key);
        bail!("cache removal not supported");
    }
}

/// Supplies the identity handle used by protocol movers.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Credential for the given local user, or `None` when transfers run anonymously.
    async fn credential_for(&self, user: &LocalUser) -> anyhow::Result<Option<Credential>>;
}

/// Receives requests once they reach a terminal state.
pub trait CompletionCallback: Send + Sync {
    /// Called exactly once per request with its final state.
    fn on_finished(&self, request: &TransferRequest);
}

/// Static registry of movers keyed by URL scheme.
#[derive(Clone, Default)]
pub struct MoverRegistry {
    movers: HashMap<String, Arc<dyn ProtocolMover>>,
}

impl MoverRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `mover` for each scheme it declares, replacing earlier entries.
    pub fn register(&mut self, mover: Arc<dyn ProtocolMover>) {
        for scheme in mover.schemes() {
            self.movers
                .insert(scheme.to_ascii_lowercase(), Arc::clone(&mover));
        }
    }

    /// Builder-style [`MoverRegistry::register`].
    #[must_use]
    pub fn with(mut self, mover: Arc<dyn ProtocolMover>) -> Self {
        self.register(mover);
        self
    }

    /// Whether a mover is registered for `scheme`.
    #[must_use]
    pub fn supports(&self, scheme: &str) -> bool {
        self.movers.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Registered schemes, sorted.
    #[must_use]
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.movers.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Mover responsible for `location`.
    ///
    /// # Errors
    ///
    /// Returns a permanent error for malformed locations or unknown schemes.
    pub fn resolve(&self, location: &str) -> TransferResult<Arc<dyn ProtocolMover>> {
        let scheme = scheme_of(location)?;
        self.movers.get(&scheme).cloned().ok_or_else(|| {
            TransferError::permanent(format!("no protocol mover registered for scheme '{scheme}'"))
        })
    }
}
