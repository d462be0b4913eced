//! Thin wrappers over the RDMA connection manager and verbs surface.
//!
//! Everything here is a `NonNull` wrapper around one `librdmacm` or
//! `libibverbs` resource. The wrappers do not own their resource in the
//! `Drop` sense: a migration session must release its handles in a strict
//! total order across resource kinds, so the owning [`Session`] performs
//! teardown explicitly through the `unsafe` destroy methods.
//!
//! [`Session`]: crate::session::Session

// Connection-manager event channels, ids, and events.
pub(crate) mod cm;

// Completion queues and completion channels.
pub(crate) mod cq;

// Memory regions and access permissions.
pub(crate) mod mr;

// Protection domains.
pub(crate) mod pd;

// Queue pairs.
pub(crate) mod qp;

// Work request identifiers.
pub(crate) mod wr;
