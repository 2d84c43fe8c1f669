#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

//! Ferry application wiring.
//!
//! Layout: `bootstrap.rs` (composition root), `generator.rs` (job-facing
//! façade over the scheduler), `credentials.rs` (proxy file credentials).

/// Composition root and logging setup.
pub mod bootstrap;
/// Proxy-file credential provider.
pub mod credentials;
/// Application error types.
pub mod error;
/// Job-facing request generator.
pub mod generator;

pub use bootstrap::{Services, current_user, init_logging, load_config, movers};
pub use credentials::ProxyFileCredentials;
pub use error::{AppError, AppResult, GeneratorError};
pub use generator::{Generator, GeneratorSettings, JobStatus, ProcessState};
