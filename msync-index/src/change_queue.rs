//! Change queue (C2): the ordered list of locally-visible changes since the
//! last successful sync with a given peer, merged so that only one entry
//! survives per UID. Grounded on `UidIndexOp`/`apply`'s replay discipline in
//! `uidindex.rs`, with the last-writer-wins merge rule adapted from
//! `src/mail/namespace.rs`'s `MailboxListEntry::merge` (there: timestamp +
//! id tie-break over a flat namespace; here: modseq + pvt_modseq tie-break
//! over one mailbox's messages).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::flags::Flags;
use crate::ids::{ContentId, ModSeq, Uid};

/// Which replica a change queue belongs to: the brain used to break ties
/// when two changes race (master side always wins, per spec.md §4.2).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Side {
    Master,
    Replica,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    Added {
        content: ContentId,
        save_timestamp: u64,
    },
    Expunged,
    FlagsChanged {
        flags: Flags,
        modseq: ModSeq,
        pvt_modseq: ModSeq,
    },
}

/// Per-UID queue of merged changes awaiting export to a peer.
#[derive(Clone, Debug, Default)]
pub struct ChangeQueue {
    entries: BTreeMap<Uid, Change>,
    /// The highest UID both sides agreed on as of the last successful
    /// sync; flag changes for UIDs at or below this watermark that arrive
    /// after a UID-clash regression are dropped rather than replayed,
    /// per spec.md §4.2's "changes during sync" handling.
    last_common_uid: u32,
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_last_common_uid(&mut self, uid: u32) {
        self.last_common_uid = uid;
    }

    pub fn last_common_uid(&self) -> u32 {
        self.last_common_uid
    }

    /// Records a change, merging with whatever's already queued for this
    /// UID. `Added` is absorbed by the queue so that an add-then-expunge in
    /// the same window doesn't round-trip through the peer as a no-op
    /// message followed by an expunge; `FlagsChanged` entries merge by
    /// keeping the one with the higher modseq (shared state) and, on a
    /// tie, the higher pvt_modseq — the same LWW shape `namespace.rs` uses,
    /// just keyed on modseq instead of wall-clock time.
    pub fn push(&mut self, side: Side, uid: Uid, change: Change) {
        if uid.get() as u32 <= self.last_common_uid {
            if matches!(change, Change::FlagsChanged { .. }) {
                return;
            }
        }

        match (self.entries.get(&uid), &change) {
            (Some(Change::Added { .. }), Change::Expunged) => {
                self.entries.remove(&uid);
                return;
            }
            (
                Some(Change::FlagsChanged {
                    modseq: old_modseq,
                    pvt_modseq: old_pvt,
                    ..
                }),
                Change::FlagsChanged {
                    modseq: new_modseq,
                    pvt_modseq: new_pvt,
                    ..
                },
            ) => {
                let old_wins = match side {
                    Side::Master => old_modseq > new_modseq
                        || (old_modseq == new_modseq && old_pvt >= new_pvt),
                    Side::Replica => old_modseq >= new_modseq
                        || (old_modseq == new_modseq && old_pvt > new_pvt),
                };
                if old_wins {
                    return;
                }
            }
            _ => {}
        }
        self.entries.insert(uid, change);
    }

    pub fn drain(&mut self) -> Vec<(Uid, Change)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
