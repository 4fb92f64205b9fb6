//! Maildir `new/`/`cur/`/`tmp/` scanning and the persistent UID list that
//! survives across scans.

pub mod error;
pub mod scanner;
pub mod uidlist;

pub use error::{MaildirError, Result};
