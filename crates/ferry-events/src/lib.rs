//! Event bus for the ferry staging workspace.
//!
//! The bus carries typed lifecycle events for transfer requests and scheduler
//! reconfiguration, assigns sequential identifiers, and keeps a bounded replay
//! ring so late subscribers can catch up from a known id.

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod payloads;
pub mod routing;

pub use payloads::{DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId, RequestState};
pub use routing::{EventBus, EventStream};
