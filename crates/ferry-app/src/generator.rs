//! Job-facing façade over the scheduler.
//!
//! A job is a group of transfer requests sharing one identifier. The
//! generator tracks how many of a job's requests are outstanding and folds
//! their failures into a single error string once the last one finishes.
//! With a scratch directory configured, each successful download is moved
//! there from the session directory, keeping its path below the job id.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ferry_config::StagingConfig;
use ferry_core::{
    CacheParameters, CompletionCallback, CredentialProvider, LocalUser, RequestState,
    TransferRequest, local_path,
};
use ferry_scheduler::Scheduler;
use tracing::{debug, error, info, warn};

use crate::error::GeneratorError;

/// Lifecycle of a generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Constructed, not yet accepting requests.
    Initiated,
    /// Accepting requests.
    Running,
    /// Shut down; new requests are refused.
    Stopped,
}

/// Completion state of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// At least one request is still outstanding.
    Running,
    /// Every request reached a terminal state. `error` is empty on full success.
    Finished {
        /// Accumulated failure text.
        error: String,
    },
    /// No request was ever registered under this job.
    NotFound,
}

/// Per-request settings applied by the generator.
#[derive(Debug, Clone, Default)]
pub struct GeneratorSettings {
    /// Retries granted to each request.
    pub max_retries: u32,
    /// Sub-share appended to the request's share name.
    pub sub_share: String,
    /// Cache directories before per-user substitution.
    pub cache: CacheParameters,
    /// Where successful downloads are moved after delivery.
    pub scratch_dir: Option<PathBuf>,
}

impl GeneratorSettings {
    /// Settings from the staging configuration.
    #[must_use]
    pub fn from_config(config: &StagingConfig) -> Self {
        Self {
            max_retries: config.retry.max_retries,
            sub_share: config.sub_share.clone(),
            cache: CacheParameters {
                cache_dirs: config.cache.dirs.clone(),
                readonly_dirs: config.cache.readonly_dirs.clone(),
                draining_dirs: config.cache.draining_dirs.clone(),
            },
            scratch_dir: config.scratch_dir.as_ref().map(PathBuf::from),
        }
    }
}

/// Submits transfer requests on behalf of jobs and reports job completion.
pub struct Generator {
    scheduler: Scheduler,
    settings: GeneratorSettings,
    credentials: Option<Arc<dyn CredentialProvider>>,
    state: Mutex<ProcessState>,
    jobs: Arc<JobBook>,
}

impl Generator {
    /// Generator in state [`ProcessState::Initiated`].
    #[must_use]
    pub fn new(
        scheduler: Scheduler,
        settings: GeneratorSettings,
        credentials: Option<Arc<dyn CredentialProvider>>,
    ) -> Self {
        let jobs = Arc::new(JobBook::with_scratch(settings.scratch_dir.clone()));
        Self {
            scheduler,
            settings,
            credentials,
            state: Mutex::new(ProcessState::Initiated),
            jobs,
        }
    }

    /// Begin accepting requests. Has no effect once stopped.
    pub fn start(&self) {
        let mut state = self.lock_state();
        if *state == ProcessState::Initiated {
            *state = ProcessState::Running;
            info!("generator running");
        }
    }

    /// Refuse further requests. Requests already submitted run to completion.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        if *state != ProcessState::Stopped {
            *state = ProcessState::Stopped;
            info!("generator stopped");
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.lock_state()
    }

    /// Register and submit one transfer for `job_id`.
    ///
    /// Returns `false` without building anything when the generator is not
    /// running, and `false` after rolling the registration back when the
    /// scheduler refuses the request.
    pub async fn add_request(
        &self,
        user: &LocalUser,
        source: &str,
        destination: &str,
        job_id: &str,
        priority: u32,
    ) -> bool {
        if self.state() != ProcessState::Running {
            debug!(job_id, "generator not running, request refused");
            return false;
        }

        let mut request = TransferRequest::new(job_id, source, destination, user.clone())
            .with_priority(priority)
            .with_retries(self.settings.max_retries)
            .with_cache_parameters(self.settings.cache.substitute(user));
        if !self.settings.sub_share.is_empty() {
            request = request.with_sub_share(self.settings.sub_share.clone());
        }
        if let Some(provider) = &self.credentials {
            match provider.credential_for(user).await {
                Ok(Some(credential)) => request = request.with_credential(credential),
                Ok(None) => {}
                Err(err) => {
                    warn!(job_id, user = %user.name, error = %err, "credential lookup failed");
                    return false;
                }
            }
        }
        let request = request.with_callback(Arc::clone(&self.jobs) as Arc<dyn CompletionCallback>);
        let request_id = request.id().clone();

        self.jobs.register(job_id);
        match self.scheduler.submit(request) {
            Ok(_) => {
                info!(%request_id, job_id, source, destination, "transfer request added");
                true
            }
            Err(err) => {
                warn!(%request_id, job_id, error = %err, "scheduler refused transfer request");
                self.jobs.unregister(job_id);
                false
            }
        }
    }

    /// Completion state of `job_id`.
    #[must_use]
    pub fn query_finished(&self, job_id: &str) -> JobStatus {
        self.jobs.status(job_id)
    }

    /// `(finished, error)` view of [`Generator::query_finished`].
    ///
    /// # Errors
    ///
    /// Returns [`GeneratorError::NotFound`] for jobs that were never registered.
    pub fn query_finished_pair(&self, job_id: &str) -> Result<(bool, String), GeneratorError> {
        match self.query_finished(job_id) {
            JobStatus::Running => Ok((false, String::new())),
            JobStatus::Finished { error } => Ok((true, error)),
            JobStatus::NotFound => Err(GeneratorError::NotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    /// Cancel every outstanding request of `job_id`.
    ///
    /// Returns `false` when the scheduler has already stopped.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        match self.scheduler.cancel_job(job_id) {
            Ok(()) => true,
            Err(err) => {
                warn!(job_id, error = %err, "job cancellation refused");
                false
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Default)]
struct Outstanding {
    remaining: usize,
    errors: String,
}

#[derive(Debug, Default)]
struct Ledger {
    outstanding: HashMap<String, Outstanding>,
    finished: HashMap<String, String>,
}

/// Outstanding and finished jobs behind one lock of their own.
#[derive(Debug, Default)]
struct JobBook {
    ledger: Mutex<Ledger>,
    scratch: Option<PathBuf>,
}

impl JobBook {
    fn with_scratch(scratch: Option<PathBuf>) -> Self {
        Self {
            ledger: Mutex::default(),
            scratch,
        }
    }

    fn register(&self, job_id: &str) {
        let mut ledger = self.lock();
        if ledger.finished.remove(job_id).is_some() {
            debug!(job_id, "finished job reopened by a new request");
        }
        ledger
            .outstanding
            .entry(job_id.to_string())
            .or_default()
            .remaining += 1;
    }

    fn unregister(&self, job_id: &str) {
        let mut ledger = self.lock();
        if let Some(entry) = ledger.outstanding.get_mut(job_id) {
            entry.remaining = entry.remaining.saturating_sub(1);
            if entry.remaining == 0 {
                ledger.outstanding.remove(job_id);
            }
        }
    }

    fn status(&self, job_id: &str) -> JobStatus {
        let ledger = self.lock();
        if ledger.outstanding.contains_key(job_id) {
            return JobStatus::Running;
        }
        ledger
            .finished
            .get(job_id)
            .map_or(JobStatus::NotFound, |error| JobStatus::Finished {
                error: error.clone(),
            })
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CompletionCallback for JobBook {
    fn on_finished(&self, request: &TransferRequest) {
        let job_id = request.job_id();
        let moved = match &self.scratch {
            Some(scratch) if request.state() == RequestState::Done => move_to_scratch(scratch, request),
            _ => Ok(()),
        };
        let mut ledger = self.lock();
        let Some(entry) = ledger.outstanding.get_mut(job_id) else {
            warn!(request_id = %request.id(), job_id, "completion for unknown job");
            return;
        };
        if request.state() != RequestState::Done {
            let message = request
                .error()
                .map_or_else(|| request.state().as_str().to_string(), |err| err.message().to_string());
            let _ = write!(
                entry.errors,
                "{} ({}): {}. ",
                request.id(),
                request.source(),
                message
            );
        }
        if let Err(reason) = moved {
            let _ = write!(entry.errors, "{} ({}): {reason}. ", request.id(), request.source());
        }
        entry.remaining = entry.remaining.saturating_sub(1);
        if entry.remaining > 0 {
            return;
        }
        if let Some(done) = ledger.outstanding.remove(job_id) {
            let errors = done.errors.trim_end().to_string();
            info!(job_id, failed = !errors.is_empty(), "job finished");
            ledger.finished.insert(job_id.to_string(), errors);
        }
    }
}

/// Rename the delivered file from the session directory into `scratch`,
/// keeping the part of its path that starts at the job id.
fn move_to_scratch(scratch: &Path, request: &TransferRequest) -> Result<(), &'static str> {
    const UNKNOWN_SESSION: &str = "could not determine session directory from filename during move to scratch";
    let session_file = local_path(request.destination()).map_err(|_| UNKNOWN_SESSION)?;
    let session_name = session_file.to_string_lossy().into_owned();
    let Some(position) = session_name.find(request.job_id()) else {
        error!(
            request_id = %request.id(),
            file = %session_file.display(),
            "could not determine session directory from filename"
        );
        return Err(UNKNOWN_SESSION);
    };
    let scratch_file = scratch.join(&session_name[position..]);
    match std::fs::rename(&session_file, &scratch_file) {
        Ok(()) => {
            debug!(request_id = %request.id(), to = %scratch_file.display(), "moved to scratch");
            Ok(())
        }
        Err(err) => {
            error!(
                request_id = %request.id(),
                from = %session_file.display(),
                to = %scratch_file.display(),
                error = %err,
                "failed to move file to scratch"
            );
            Err("failed to move file from session dir to scratch")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::TransferError;

    fn finished(job_id: &str, outcome: Result<(), TransferError>) -> TransferRequest {
        let mut request = TransferRequest::new(
            job_id,
            "file:///data/in",
            "file:///data/out",
            LocalUser::new("alice", 1000, 1000),
        )
        .with_retries(0);
        request.submit().expect("fresh request");
        let _ = request.apply_outcome(outcome);
        request
    }

    #[test]
    fn job_finishes_when_last_request_reports() {
        let book = JobBook::default();
        book.register("J1");
        book.register("J1");
        assert_eq!(book.status("J1"), JobStatus::Running);

        book.on_finished(&finished("J1", Err(TransferError::permanent("disk full"))));
        assert_eq!(book.status("J1"), JobStatus::Running);

        let mut last = finished("J1", Ok(()));
        while !last.state().is_terminal() {
            let _ = last.apply_outcome(Ok(()));
        }
        book.on_finished(&last);
        match book.status("J1") {
            JobStatus::Finished { error } => {
                assert!(error.contains("file:///data/in"));
                assert!(error.contains("disk full"));
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn unregister_drops_empty_jobs() {
        let book = JobBook::default();
        book.register("J3");
        book.unregister("J3");
        assert_eq!(book.status("J3"), JobStatus::NotFound);
    }

    #[test]
    fn new_request_reopens_finished_job() {
        let book = JobBook::default();
        book.register("J4");
        book.on_finished(&finished("J4", Err(TransferError::permanent("gone"))));
        assert!(matches!(book.status("J4"), JobStatus::Finished { .. }));

        book.register("J4");
        assert_eq!(book.status("J4"), JobStatus::Running);
    }

    fn delivered(job_id: &str, destination: &str) -> TransferRequest {
        let mut request = TransferRequest::new(
            job_id,
            "mock://remote/in.dat",
            destination,
            LocalUser::new("alice", 1000, 1000),
        );
        request.submit().expect("fresh request");
        while !request.state().is_terminal() {
            let _ = request.apply_outcome(Ok(()));
        }
        request
    }

    #[test]
    fn successful_downloads_move_to_scratch() {
        let root = tempfile::tempdir().expect("tempdir");
        let session = root.path().join("session/J5");
        let scratch = root.path().join("scratch");
        std::fs::create_dir_all(&session).expect("session dir");
        std::fs::create_dir_all(scratch.join("J5")).expect("scratch dir");
        std::fs::write(session.join("out.dat"), b"payload").expect("seed");

        let book = JobBook::with_scratch(Some(scratch.clone()));
        book.register("J5");
        let destination = format!("{}/out.dat", session.display());
        book.on_finished(&delivered("J5", &destination));

        assert_eq!(book.status("J5"), JobStatus::Finished { error: String::new() });
        assert!(!session.join("out.dat").exists());
        assert_eq!(
            std::fs::read(scratch.join("J5/out.dat")).expect("moved"),
            b"payload"
        );
    }

    #[test]
    fn scratch_failures_are_reported_in_the_job_error() {
        let root = tempfile::tempdir().expect("tempdir");
        let book = JobBook::with_scratch(Some(root.path().join("scratch")));
        book.register("J6");
        book.register("J6");

        book.on_finished(&delivered("J6", "/data/elsewhere/out.dat"));
        let missing = format!("{}/J6/gone.dat", root.path().display());
        book.on_finished(&delivered("J6", &missing));

        match book.status("J6") {
            JobStatus::Finished { error } => {
                assert!(error.contains("could not determine session directory"), "{error}");
                assert!(error.contains("failed to move file from session dir to scratch"), "{error}");
            }
            other => panic!("unexpected status {other:?}"),
        }
    }
}
