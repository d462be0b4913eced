//! An RDMA-based live-migration transport for virtual machine
//! hypervisors.
//!
//! The transport carries two payload classes between a migration source
//! and destination over one reliable-connected queue pair:
//!
//! - guest RAM pages, delivered by one-sided RDMA WRITEs straight into
//!   the destination's memory ([`RdmaStream::save_page`]), coalesced
//!   into chunk-sized transfers and registered on demand;
//! - a bidirectional control byte-stream (device state, negotiation,
//!   protocol commands) framed over two-sided SEND/RECV with explicit
//!   READY-token flow control.
//!
//! The outer migration driver opens the transport with
//! [`start_outgoing`] or [`start_incoming`] and then talks to an
//! [`RdmaStream`]. What to send and when, zero-page detection, and
//! user-visible error reporting all remain the driver's concern: the
//! crate consumes a RAM block list and a zero-page probe and exposes
//! the byte-stream and page-save entry points.

#[cfg(not(target_os = "linux"))]
compile_error!("`rdmig` currently only supports Linux");

/// Shared utility functions.
#[macro_use]
mod utils;

/// Thin wrappers over the RDMA CM and verbs surface.
mod verbs;

/// Control-channel wire formats.
mod proto;

/// RAM block directory and registration cache.
mod ram;

/// Control channel with READY-gated flow control.
mod control;

/// Completion queue pump.
mod poll;

/// Write-coalescing engine.
mod write;

/// Session lifecycle and resource ownership.
mod session;

/// Byte-stream surface for the migration driver.
mod stream;

/// Transport tunables.
mod config;

/// Error types.
mod error;

pub use config::Config;
pub use error::{Error, Result};
pub use ram::RamBlockInfo;
pub use session::ZeroProbe;
pub use stream::{start_incoming, start_outgoing, Incoming, RdmaStream};
