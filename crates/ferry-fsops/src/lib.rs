#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

//! Local filesystem collaborators for the transfer scheduler: a `file://`
//! protocol mover and a directory-backed cache store.
//!
//! # Design
//! - Files are written to a temporary sibling and renamed into place, so a
//!   destination or cache entry is either complete or absent.
//! - IO failures map onto transfer error kinds: missing files, permission
//!   problems, and full or read-only volumes are permanent; everything else
//!   is worth a retry.

pub mod cache;
pub mod error;
pub mod mover;

mod copy;

pub use cache::{FsCacheStore, cache_key};
pub use error::{FsOpsError, FsOpsResult};
pub use mover::LocalFileMover;
