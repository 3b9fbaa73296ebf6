//! Archive data formats and durable cursor state.
//!
//! The codec turns dynamic rows into the gzip-compressed JSONL wire
//! format (and back), computing the SHA-256 sums the verification steps
//! depend on. The store modules persist watermarks, checkpoints and
//! restore watermarks behind pluggable backends.

mod codec;
mod stores;

pub use codec::*;
pub use stores::*;
