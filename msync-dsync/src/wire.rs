//! Wire message shapes exchanged between an exporter and an importer,
//! named and shaped after spec.md §6/§4.8. Every type derives
//! `Serialize`/`Deserialize` the way every wire/state struct across this
//! workspace does (`uidindex.rs`, `davdag.rs`, `namespace.rs`).

use serde::{Deserialize, Serialize};

pub use msync_index::ids::{ContentId, Guid, HeaderHash, MailboxGuid, ModSeq, Uid};
use msync_index::flags::Flags;

/// A peer's view of one mailbox's synchronization state as of the last
/// successful round, exchanged at the start of a sync.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MailboxState {
    pub mailbox: MailboxGuid,
    pub last_common_uid: u32,
    pub last_common_modseq: u64,
    pub uid_next: u32,
    pub first_recent_uid: u32,
}

/// A single per-message change as emitted by the exporter, carrying
/// enough identity to match against the importer's local state without
/// requiring the body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Change {
    Save {
        uid: Uid,
        content: ContentId,
        save_timestamp: u64,
        flags: Flags,
    },
    Expunge {
        uid: Uid,
    },
    FlagsChanged {
        uid: Uid,
        flags: Flags,
        modseq: ModSeq,
        pvt_modseq: ModSeq,
    },
}

/// Importer → exporter: "send me the body for this content identity."
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MailRequest {
    pub content: ContentId,
}

/// Exporter → importer: the requested body, streamed out-of-band; this
/// struct carries only the framing metadata spec.md §4.8 names.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mail {
    pub content: ContentId,
    pub uid: Uid,
    pub pop3_uidl: Option<String>,
    pub pop3_order: Option<u32>,
    pub received_date: u64,
}

/// Terminator of a change stream; carries the list of content identities
/// that were expunged before their body could be retrieved, per spec.md
/// §4.8's "expunged-during-export" list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Done {
    pub expunged_during_export: Vec<ContentId>,
    pub changes_during_sync: bool,
}
