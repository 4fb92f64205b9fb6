//! The per-message record kept in a mailbox's index: identity, flags, and
//! the modseqs that drive change detection. Grounded on the `IndexEntry`
//! struct in `aero-collections/src/mail/uidindex.rs` (uid + identifiers +
//! flags), extended with the private modseq spec.md §3 calls for.

use serde::{Deserialize, Serialize};

use crate::flags::Flags;
use crate::ids::{ContentId, ModSeq, Uid};

/// A single message's state as tracked by a mailbox index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub uid: Uid,
    pub content: ContentId,
    pub flags: Flags,
    /// Bumped whenever shared state (flags visible to every replica) changes.
    pub modseq: ModSeq,
    /// Bumped whenever only replica-private state (private flag bits)
    /// changes; never transmitted to a remote peer.
    pub pvt_modseq: ModSeq,
    /// Milliseconds since epoch, UTC. Zone-aware SEARCH semantics are left
    /// to the IMAP layer; this core only stores and compares the instant.
    pub save_timestamp: u64,
    pub expunged: bool,
}

impl MessageRecord {
    pub fn new(uid: Uid, content: ContentId, save_timestamp: u64, modseq: ModSeq) -> Self {
        MessageRecord {
            uid,
            content,
            flags: Flags::default(),
            modseq,
            pvt_modseq: modseq,
            save_timestamp,
            expunged: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Guid;

    #[test]
    fn new_record_starts_unexpunged_with_equal_modseqs() {
        let rec = MessageRecord::new(
            Uid::new(1).unwrap(),
            ContentId::Guid(Guid([9; 16])),
            1_700_000_000_000,
            ModSeq::new(1).unwrap(),
        );
        assert!(!rec.expunged);
        assert_eq!(rec.modseq, rec.pvt_modseq);
    }
}
