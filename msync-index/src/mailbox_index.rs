//! Per-mailbox replayable state: the in-memory view a sequence of
//! `IndexOp`s folds into, kept consistent with its secondary indices on
//! every mutation. Grounded directly on `aero-collections/src/mail/
//! uidindex.rs`'s `UidIndex`/`UidIndexOp`/`apply` trio — same shape
//! (table + idx_by_uid + idx_by_flag + counters, ops replayed in order),
//! retargeted at this data model's `MessageRecord`/`Flags`/`ContentId`.

use im::OrdMap;
use serde::{Deserialize, Serialize};

use crate::flags::{FlagIndex, Flags, KeywordTable};
use crate::ids::{ContentId, ModSeq, Uid, UidValidity};
use crate::message::MessageRecord;

/// One atomic mutation of a mailbox index, as folded by the sync engine.
/// Mirrors `UidIndexOp` in shape: each variant is self-contained and
/// idempotent to re-apply (replay safety is required by spec.md §4.4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum IndexOp {
    MailAdd {
        uid: Uid,
        content: ContentId,
        save_timestamp: u64,
    },
    MailExpunge {
        uid: Uid,
    },
    FlagsChanged {
        uid: Uid,
        flags: Flags,
    },
    BumpUidValidity {
        new_uidvalidity: UidValidity,
    },
}

/// The full folded state of one mailbox: current messages plus the
/// counters that must survive every fold (uidvalidity, uidnext, highest
/// modseq), exactly the fields `UidIndex` keeps alongside its table.
#[derive(Clone, Debug)]
pub struct MailboxIndex {
    pub uidvalidity: UidValidity,
    pub uidnext: u32,
    pub highestmodseq: u64,
    pub highest_pvt_modseq: u64,
    table: OrdMap<Uid, MessageRecord>,
    flag_index: FlagIndex,
    pub keywords: KeywordTable,
}

impl MailboxIndex {
    pub fn new(uidvalidity: UidValidity) -> Self {
        MailboxIndex {
            uidvalidity,
            uidnext: 1,
            highestmodseq: 0,
            highest_pvt_modseq: 0,
            table: OrdMap::new(),
            flag_index: FlagIndex::new(),
            keywords: KeywordTable::new(),
        }
    }

    pub fn get(&self, uid: Uid) -> Option<&MessageRecord> {
        self.table.get(&uid)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uid, &MessageRecord)> {
        self.table.iter()
    }

    fn next_modseq(&mut self) -> ModSeq {
        self.highestmodseq += 1;
        ModSeq::new(self.highestmodseq).expect("highestmodseq overflowed to zero")
    }

    /// Folds one operation into the current state. Re-applying an op whose
    /// effect is already present (e.g. expunging an already-absent uid) is
    /// a no-op rather than an error, so a replayed log never fails a fold.
    pub fn apply(&mut self, op: &IndexOp) {
        match op {
            IndexOp::MailAdd {
                uid,
                content,
                save_timestamp,
            } => {
                if self.table.contains_key(uid) {
                    return;
                }
                let modseq = self.next_modseq();
                let rec = MessageRecord::new(*uid, *content, *save_timestamp, modseq);
                self.flag_index.insert(*uid, &rec.flags);
                self.table.insert(*uid, rec);
                if uid.get() >= self.uidnext {
                    self.uidnext = uid.get() + 1;
                }
            }
            IndexOp::MailExpunge { uid } => {
                if let Some(rec) = self.table.get(uid) {
                    self.flag_index.remove(*uid, &rec.flags);
                }
                self.table.remove(uid);
            }
            IndexOp::FlagsChanged { uid, flags } => {
                if let Some(rec) = self.table.get_mut(uid) {
                    if rec.flags == *flags {
                        return;
                    }
                    self.flag_index.remove(*uid, &rec.flags);
                    rec.flags = flags.clone();
                    self.flag_index.insert(*uid, &rec.flags);
                    self.highestmodseq += 1;
                    rec.modseq = ModSeq::new(self.highestmodseq).expect("modseq overflow");
                }
            }
            IndexOp::BumpUidValidity { new_uidvalidity } => {
                self.uidvalidity = *new_uidvalidity;
                self.table = OrdMap::new();
                self.flag_index = FlagIndex::new();
                self.uidnext = 1;
            }
        }
    }

    pub fn flags_with(&self, f: impl Fn(&FlagIndex) -> im::OrdSet<Uid>) -> im::OrdSet<Uid> {
        f(&self.flag_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Guid;
    use proptest::prelude::*;

    fn uidvalidity(n: u32) -> UidValidity {
        UidValidity::new(n).unwrap()
    }

    #[test]
    fn add_then_expunge_round_trips() {
        let mut idx = MailboxIndex::new(uidvalidity(1));
        let uid = Uid::new(1).unwrap();
        idx.apply(&IndexOp::MailAdd {
            uid,
            content: ContentId::Guid(Guid([1; 16])),
            save_timestamp: 1,
        });
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.uidnext, 2);
        idx.apply(&IndexOp::MailExpunge { uid });
        assert!(idx.is_empty());
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let mut idx = MailboxIndex::new(uidvalidity(1));
        let uid = Uid::new(5).unwrap();
        let op = IndexOp::MailAdd {
            uid,
            content: ContentId::Guid(Guid([2; 16])),
            save_timestamp: 10,
        };
        idx.apply(&op);
        let modseq_after_first = idx.get(uid).unwrap().modseq;
        idx.apply(&op);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.get(uid).unwrap().modseq, modseq_after_first);
    }

    #[test]
    fn bump_uidvalidity_clears_table() {
        let mut idx = MailboxIndex::new(uidvalidity(1));
        idx.apply(&IndexOp::MailAdd {
            uid: Uid::new(1).unwrap(),
            content: ContentId::Guid(Guid([3; 16])),
            save_timestamp: 1,
        });
        idx.apply(&IndexOp::BumpUidValidity {
            new_uidvalidity: uidvalidity(2),
        });
        assert!(idx.is_empty());
        assert_eq!(idx.uidvalidity, uidvalidity(2));
    }

    proptest! {
        /// UID monotonicity: for any sequence of adds with strictly
        /// increasing uids, `uidnext` never goes backward and always
        /// stays ahead of the highest uid seen so far.
        #[test]
        fn uidnext_is_monotonic_over_any_add_sequence(deltas in proptest::collection::vec(1u32..50, 1..40)) {
            let mut idx = MailboxIndex::new(uidvalidity(1));
            let mut uid_val = 0u32;
            let mut prev_uidnext = idx.uidnext;
            for d in deltas {
                uid_val += d;
                let uid = Uid::new(uid_val).unwrap();
                idx.apply(&IndexOp::MailAdd {
                    uid,
                    content: ContentId::Guid(Guid([(uid_val % 255) as u8; 16])),
                    save_timestamp: uid_val as u64,
                });
                prop_assert!(idx.uidnext >= prev_uidnext);
                prop_assert!(idx.uidnext > uid_val);
                prev_uidnext = idx.uidnext;
            }
        }
    }
}
