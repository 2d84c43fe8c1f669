//! Composition root: configuration, logging, collaborators, scheduler.

use std::path::Path;
use std::sync::Arc;

use ferry_config::StagingConfig;
use ferry_core::{CredentialProvider, LocalUser, MoverRegistry};
use ferry_events::EventBus;
use ferry_fsops::{FsCacheStore, LocalFileMover};
use ferry_scheduler::{Scheduler, SchedulerConfig, SchedulerContext};
use ferry_telemetry::{LogFormat, LoggingConfig, Metrics};
use nix::unistd::{Gid, Uid, User};
use tracing::info;

use crate::credentials::ProxyFileCredentials;
use crate::error::{AppError, AppResult};
use crate::generator::{Generator, GeneratorSettings};

/// Running services owned by the process.
pub struct Services {
    /// Effective configuration.
    pub config: StagingConfig,
    /// Lifecycle event bus.
    pub events: EventBus,
    /// Metrics registry.
    pub metrics: Metrics,
    /// Scheduler shared by every generator.
    pub scheduler: Scheduler,
    /// Job façade.
    pub generator: Arc<Generator>,
}

impl Services {
    /// Start with the built-in movers and credentials from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error when metrics cannot be registered or the share
    /// configuration is invalid.
    pub fn from_config(config: StagingConfig) -> AppResult<Self> {
        let credentials = ProxyFileCredentials::from_env()
            .map(|provider| Arc::new(provider) as Arc<dyn CredentialProvider>);
        Self::start(config, movers(), credentials)
    }

    /// Start the scheduler and a generator from an already validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when metrics cannot be registered or the share
    /// configuration is invalid.
    pub fn start(
        config: StagingConfig,
        movers: MoverRegistry,
        credentials: Option<Arc<dyn CredentialProvider>>,
    ) -> AppResult<Self> {
        let events = EventBus::new();
        let metrics = Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;
        let scheduler_config = SchedulerConfig::from_staging(&config)
            .map_err(|err| AppError::scheduler("scheduler.config", err))?;
        let context = SchedulerContext::new(events.clone(), metrics.clone(), movers)
            .with_cache(Arc::new(FsCacheStore));
        let scheduler = Scheduler::start(scheduler_config, context);

        let generator = Arc::new(Generator::new(
            scheduler.clone(),
            GeneratorSettings::from_config(&config),
            credentials,
        ));
        generator.start();
        info!("ferry services started");

        Ok(Self {
            config,
            events,
            metrics,
            scheduler,
            generator,
        })
    }

    /// Stop accepting jobs and wind the scheduler down.
    ///
    /// # Errors
    ///
    /// Returns an error when the scheduler loop cannot be joined.
    pub async fn shutdown(&self, cancel_in_flight: bool) -> AppResult<()> {
        self.generator.stop();
        self.scheduler
            .stop(cancel_in_flight)
            .await
            .map_err(|err| AppError::scheduler("scheduler.stop", err))?;
        info!(cancel_in_flight, "ferry services stopped");
        Ok(())
    }
}

/// Load, override, and validate the configuration document.
///
/// # Errors
///
/// Returns an error when the document cannot be read or fails validation.
pub async fn load_config(path: Option<&Path>) -> AppResult<StagingConfig> {
    ferry_config::load(path)
        .await
        .map_err(|err| AppError::config("config.load", err))
}

/// Movers compiled into the binary.
#[must_use]
pub fn movers() -> MoverRegistry {
    MoverRegistry::new().with(Arc::new(LocalFileMover::new()))
}

/// Install the global subscriber from the configured logging settings.
///
/// # Errors
///
/// Returns an error when a subscriber is already installed.
pub fn init_logging(config: &StagingConfig) -> AppResult<()> {
    ferry_telemetry::init_logging(&LoggingConfig {
        level: &config.logging.level,
        format: LogFormat::parse(&config.logging.format),
        build_sha: ferry_telemetry::build_sha(),
    })
    .map_err(|err| AppError::telemetry("telemetry.init", err))
}

/// Account the process runs as.
///
/// # Errors
///
/// Returns an error when the password database cannot be read.
pub fn current_user() -> AppResult<LocalUser> {
    let uid = Uid::effective();
    let gid = Gid::effective();
    let user = User::from_uid(uid).map_err(|source| AppError::User { source })?;
    Ok(match user {
        Some(user) => LocalUser::new(user.name, uid.as_raw(), gid.as_raw())
            .with_home(user.dir.display().to_string()),
        None => LocalUser::new(uid.to_string(), uid.as_raw(), gid.as_raw()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_movers_cover_local_files() {
        assert!(movers().supports("file"));
    }

    #[test]
    fn current_user_matches_effective_uid() {
        let user = current_user().expect("passwd lookup");
        assert_eq!(user.uid, Uid::effective().as_raw());
    }
}
