//! Two-way mailbox tree reconciliation and the change exporter/importer
//! that synchronizes message state between two replicas.

pub mod error;
pub mod export_import;
pub mod reconcile;
pub mod tree;
pub mod wire;

pub use error::{DsyncError, Result};
