//! # airlift-core
//!
//! Shared building blocks for the Airlift file-transfer protocol.
//!
//! This crate provides the foundational types and utilities used by
//! [`airlift-engine`] and the binary crate (`airlift-cli`).
//!
//! ## Responsibilities
//!
//! - **Signaling primitives** — the session-initiate / session-accept /
//!   session-terminate message model, file-offer metadata, and session-id
//!   generation.
//!
//! - **Endpoint model** — the stream-host (host/port/mode) advertisement
//!   exchanged once a transfer is accepted.
//!
//! - **Channel abstraction** — the [`channel::SignalChannel`] trait the
//!   engine talks signaling through, plus an in-memory hub used by tests
//!   and the loopback demo.
//!
//! - **Net helpers** — free-port allocation and local-address resolution
//!   for the data channel.

pub mod channel;
pub mod endpoint;
pub mod net;
pub mod signal;
