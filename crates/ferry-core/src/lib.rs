//! Protocol-agnostic transfer request model and collaborator interfaces.
//!
//! # Design
//! - `TransferRequest` owns its own state machine; only `submit`,
//!   `apply_outcome`, `cancel`, and `resume_after_wait` change its state.
//! - Outcomes are values (`TransferError` with an `ErrorKind`), never panics.
//! - Protocol movers, cache stores, and credential providers are traits so
//!   schedulers can be composed with any backend.

#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

pub mod cache;
pub mod credential;
pub mod error;
pub mod limits;
pub mod location;
pub mod model;
pub mod service;

pub use cache::{CacheParameters, CacheState, LocalUser};
pub use credential::Credential;
pub use error::{ErrorKind, TransferError, TransferResult, panic_message};
pub use ferry_events::RequestState;
pub use limits::TransferParameters;
pub use location::{file_url, is_local, local_path, parse_location, scheme_of};
pub use model::{
    DEFAULT_PRIORITY, DEFAULT_RETRIES, DEFAULT_SHARE, RequestId, Stage, TransferRequest,
    Transition,
};
pub use service::{
    CacheStore, CompletionCallback, CredentialProvider, MoverJob, MoverRegistry, MoverReport,
    Progress, ProtocolMover, TransferContext,
};
