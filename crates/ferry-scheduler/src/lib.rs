#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

//! Transfer scheduler: slot accounting, share fairness, retries, and the
//! worker harness that runs each stage of a transfer request.
//!
//! # Design
//! - One control loop task owns every queue and the retry-wait list; the
//!   [`Scheduler`] handle talks to it over a command channel.
//! - Stage work runs in spawned tasks that take the request by value and hand
//!   it back in a report, so a request is never held by two owners.
//! - Worker panics are caught at the task boundary and become temporary errors.

mod backoff;
mod command;
mod config;
mod error;
mod mapping;
mod monitor;
mod processor;
mod queue;
mod scheduler;
mod shares;
mod slots;
mod worker;

pub use backoff::RetryPolicy;
pub use config::{SchedulerConfig, SchedulerContext};
pub use error::{SchedulerError, SchedulerResult};
pub use mapping::{MappedSource, UrlMap};
pub use processor::StageProcessor;
pub use scheduler::{Scheduler, SchedulerSnapshot, StageSnapshot};
pub use shares::{ShareCandidate, ShareConfiguration, ShareLedger};
pub use slots::{SlotLimits, SlotPool, SlotUsage};
