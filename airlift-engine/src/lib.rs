//! # airlift-engine
//!
//! Session negotiation and transport runtime for Airlift.
//!
//! This crate provides:
//! - **Session state machines**: event-driven, cancellable outgoing and
//!   incoming transfer sessions, one task per session
//! - **Session manager**: the single dispatcher between the signaling
//!   channel and all live sessions, plus the session-request surface for
//!   unmatched offers
//! - **TCP data plane**: the accept/connect socket pair and the chunked
//!   file copy it carries
//! - **Event surface**: per-session events (accept, progress, complete,
//!   peer-closed, failures) consumed by CLI loggers or UI subscribers

mod incoming;
mod outgoing;

pub mod manager;
pub mod session;
pub mod tcp;
