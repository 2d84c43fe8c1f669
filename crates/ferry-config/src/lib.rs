#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

//! Staging configuration: slot capacity, transfer shares, retry policy,
//! throughput limits, cache directories, and logging.
//!
//! # Design
//! - A single JSON document deserialises into [`StagingConfig`]; every field has a default.
//! - `FERRY_*` environment variables override selected fields after loading.
//! - [`validate`] runs last so overrides are checked too.

pub mod defaults;
pub mod error;
pub mod loader;
pub mod model;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ENV_PREFIX, load};
pub use model::{
    CacheConfig, LoggingSettings, RetryConfig, ShareConfig, ShareType, SlotConfig, StagingConfig,
    TransferConfig, UrlMappingConfig,
};
pub use validate::validate;
