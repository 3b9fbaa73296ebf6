//! The restore pipeline: enumerate archives, read and validate them,
//! reconcile schemas, and bulk-insert with a conflict strategy.

pub mod engine;
pub mod migrate;
pub mod reader;

pub use engine::{RestoreEngine, RestoreFileStats, RestoreOptions, RestoreSummary};
pub use reader::{decode_archive, fetch_archive, DecodedArchive};
