//! Shared types for the relic archiver.
//!
//! Everything that crosses a crate boundary lives here: the dynamic row
//! value model, normalized table schema shapes, the archive sidecar
//! documents (metadata, deletion manifest), durable cursor state
//! (watermark, checkpoint, restore watermark), lock records, and the
//! object key layout.

mod keys;
mod metadata;
mod schema;
mod state;
mod strategy;
mod value;

pub use keys::*;
pub use metadata::*;
pub use schema::*;
pub use state::*;
pub use strategy::*;
pub use value::*;
