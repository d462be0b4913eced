//! Crate-level error types.

use std::io;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the migration driver.
///
/// Every kind except [`Error::Capacity`] is fatal to the session: the
/// transport tears itself down and must not be used afterwards. `Capacity`
/// (a full send queue) is recovered inside the write engine by waiting for
/// an RDMA WRITE completion and retrying the post, and never escapes it.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad migration address or invalid tunable.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection-manager or verbs primitive failure.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    /// Peer violated the control protocol (bad version, wrong message
    /// type, directory mismatch).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A work completion carried a non-success status.
    #[error("work request {wr_id} completed with status {status}: {msg}")]
    Completion {
        wr_id: u64,
        status: u32,
        msg: String,
    },

    /// The send queue is full. Recovered locally by the write engine.
    #[error("send queue is full")]
    Capacity,

    /// Unrecoverable condition that fits no other kind.
    #[error("fatal migration error: {0}")]
    Fatal(String),
}
