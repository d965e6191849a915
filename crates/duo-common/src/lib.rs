//! Common types shared by the duo pairing server and its clients.
//!
//! This crate provides:
//! - JSON wire events in both directions ([`event`])
//! - Session identifiers and protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod event;
pub mod types;

pub use event::{ClientEvent, EventError, Payload, RelayKind, ServerEvent};
pub use types::SessionId;
