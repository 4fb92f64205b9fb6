//! Append-only per-mailbox cache file: fixed header, field-header chain,
//! record chain, an in-memory add-buffer, and compaction.

pub mod compression;
pub mod error;
pub mod format;
pub mod txn;

pub use error::{CacheError, Result};
