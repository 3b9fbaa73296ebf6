//! Relic archiver.
//!
//! Moves aged rows from PostgreSQL-family databases into S3-compatible
//! cold storage and deletes them from the source, with cryptographic
//! verification at every step, and restores archived batches back into
//! the database.
//!
//! The crates underneath supply the adapters (`relic-source`,
//! `relic-object-store`), the wire formats (`relic-datastore`) and the
//! shared types (`relic-api-types`); this crate carries the coordination
//! layer: the per-batch state machine, the multi-target driver, the
//! distributed lock with heartbeat, policy gates, the restore engine and
//! the offline validator.

use thiserror::Error;

pub mod archive;
pub mod audit;
pub mod lock_manager;
pub mod logging;
pub mod restore;
pub mod shutdown;
pub mod validate;

/// Error markers the coordination layer needs to tell apart.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// A cancellation signal arrived; the current transaction rolled
    /// back and the run winds down.
    #[error("run cancelled")]
    Cancelled,
    /// A count or primary-key equality check failed; always fatal for
    /// the batch.
    #[error("verification failed: {0}")]
    Verification(String),
}

/// Whether an error chain carries a cancellation marker.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref(), Some(ArchiveError::Cancelled)))
}
