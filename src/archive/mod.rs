//! The archival pipeline: cursor-based batching, the per-table state
//! machine, policy gates, drift detection, sample verification and the
//! multi-target driver.

pub mod batch;
pub mod drift;
pub mod driver;
pub mod orchestrator;
pub mod policy;
pub mod sample;

pub use driver::{run_archival, DatabaseStats, DatabaseStatus, RunSummary, TableStats, TableStatus};
pub use orchestrator::DatabaseArchiver;
