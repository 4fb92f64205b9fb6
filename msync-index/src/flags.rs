//! Flag storage: six standard flags plus a private bitset, and an interned
//! keyword dictionary so keywords compare as integers instead of strings.
//!
//! Grounded on `aero-collections/src/mail/uidindex.rs`'s `FlagIndex`
//! (`HashMap<Flag, OrdSet<ImapUid>>` reverse index), kept here for the
//! keyword side while the standard/private flags move to a fixed bitset —
//! the data model calls for a bounded set of well-known flags, unlike
//! `uidindex.rs`'s free-form `Flag = String`.

use std::sync::atomic::{AtomicU32, Ordering};

use im::{HashMap, OrdSet};
use serde::{Deserialize, Serialize};

use crate::ids::Uid;

bitflags::bitflags! {
    /// Standard IMAP flags, bits 0..6; bits 6..38 are reserved for private
    /// (non-shared) flags local to one replica.
    #[derive(Serialize, Deserialize)]
    pub struct StdFlags: u8 {
        const SEEN     = 0b0000_0001;
        const ANSWERED = 0b0000_0010;
        const FLAGGED  = 0b0000_0100;
        const DELETED  = 0b0000_1000;
        const DRAFT    = 0b0001_0000;
        const RECENT   = 0b0010_0000;
    }
}

/// A keyword index into a mailbox's `KeywordTable`.
pub type KeywordId = u32;

/// Per-mailbox interned keyword dictionary: keywords are assigned small
/// dense ids the first time they're seen and never renumbered, so a
/// `KeywordId` remains valid for the mailbox's lifetime.
#[derive(Clone, Debug, Default)]
pub struct KeywordTable {
    by_name: HashMap<String, KeywordId>,
    by_id: Vec<String>,
}

impl KeywordTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a keyword's id, assigning one if this is the first time
    /// it's been seen.
    pub fn intern(&mut self, name: &str) -> KeywordId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = self.by_id.len() as KeywordId;
        self.by_id.push(name.to_string());
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn id_of(&self, name: &str) -> Option<KeywordId> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: KeywordId) -> Option<&str> {
        self.by_id.get(id as usize).map(|s| s.as_str())
    }
}

/// A message's full flag state: standard bits, private bits, and the set
/// of interned keywords currently set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    pub std: u8,
    pub private: u32,
    pub keywords: im::OrdSet<KeywordId>,
}

impl Flags {
    pub fn has_std(&self, f: StdFlags) -> bool {
        (self.std & f.bits()) != 0
    }

    pub fn set_std(&mut self, f: StdFlags, on: bool) {
        if on {
            self.std |= f.bits();
        } else {
            self.std &= !f.bits();
        }
    }

    pub fn has_private(&self, bit: u32) -> bool {
        debug_assert!(bit < 32);
        (self.private & (1 << bit)) != 0
    }

    pub fn set_private(&mut self, bit: u32, on: bool) {
        debug_assert!(bit < 32);
        if on {
            self.private |= 1 << bit;
        } else {
            self.private &= !(1 << bit);
        }
    }

    /// Resolves a flag conflict between a local and a remote view of the
    /// same message, per `dsync-mailbox-import.c`'s conflict table: shared
    /// state (standard flags and keywords) follows `prefer_remote`, the
    /// private bitset follows `prefer_pvt_remote` independently.
    pub fn merge(local: &Flags, remote: &Flags, prefer_remote: bool, prefer_pvt_remote: bool) -> Flags {
        let (std, keywords) = if prefer_remote {
            (remote.std, remote.keywords.clone())
        } else {
            (local.std, local.keywords.clone())
        };
        let private = if prefer_pvt_remote { remote.private } else { local.private };
        Flags { std, private, keywords }
    }
}

/// Reverse index from flag/keyword to the set of UIDs carrying it, so
/// flag-based search stays O(matches) rather than O(mailbox size).
#[derive(Clone, Debug, Default)]
pub struct FlagIndex {
    pub by_std: [OrdSet<Uid>; 6],
    pub by_keyword: HashMap<KeywordId, OrdSet<Uid>>,
}

impl FlagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uid: Uid, flags: &Flags) {
        for bit in 0..6u8 {
            if flags.std & (1 << bit) != 0 {
                self.by_std[bit as usize].insert(uid);
            }
        }
        for kw in flags.keywords.iter() {
            self.by_keyword.entry(*kw).or_default().insert(uid);
        }
    }

    pub fn remove(&mut self, uid: Uid, flags: &Flags) {
        for bit in 0..6u8 {
            if flags.std & (1 << bit) != 0 {
                self.by_std[bit as usize].remove(&uid);
            }
        }
        for kw in flags.keywords.iter() {
            if let Some(set) = self.by_keyword.get_mut(kw) {
                set.remove(&uid);
            }
        }
    }
}

/// Process-wide counter used when a caller needs a locally-unique private
/// flag bit allocation (e.g. assigning a bit to a brand-new per-replica
/// pseudo-flag); follows the same lazy-static id-generator shape as
/// `src/mail/unique_ident.rs`, scaled down to a plain atomic since the
/// range here is only 32 values.
pub static NEXT_PRIVATE_BIT: AtomicU32 = AtomicU32::new(0);

pub fn alloc_private_bit() -> Option<u32> {
    let v = NEXT_PRIVATE_BIT.fetch_add(1, Ordering::Relaxed);
    if v < 32 {
        Some(v)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_interning_is_stable() {
        let mut t = KeywordTable::new();
        let a = t.intern("$Forwarded");
        let b = t.intern("$Forwarded");
        let c = t.intern("$Junk");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(t.name_of(a), Some("$Forwarded"));
    }

    #[test]
    fn flag_index_round_trips() {
        let mut idx = FlagIndex::new();
        let uid = Uid::new(1).unwrap();
        let mut flags = Flags::default();
        flags.set_std(StdFlags::SEEN, true);
        idx.insert(uid, &flags);
        assert!(idx.by_std[0].contains(&uid));
        idx.remove(uid, &flags);
        assert!(!idx.by_std[0].contains(&uid));
    }

    #[test]
    fn merge_resolves_shared_and_private_independently() {
        let mut local = Flags::default();
        local.set_std(StdFlags::SEEN, true);
        local.set_private(0, true);
        let mut remote = Flags::default();
        remote.set_std(StdFlags::FLAGGED, true);
        remote.set_private(1, true);

        let merged = Flags::merge(&local, &remote, true, false);
        assert!(merged.has_std(StdFlags::FLAGGED));
        assert!(!merged.has_std(StdFlags::SEEN));
        assert!(merged.has_private(0));
        assert!(!merged.has_private(1));
    }
}
