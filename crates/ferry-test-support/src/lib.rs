#![forbid(unsafe_code)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic)]

//! Shared test helpers used across the workspace's suites.
//! Layout: fixtures.rs (request builders and waiting helpers), mocks.rs (scripted mover and recording callback).

pub mod fixtures;
pub mod mocks;
