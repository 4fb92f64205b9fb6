//! Fingerprint map (C1): tracks, per content identity, the set of mailbox
//! locations that currently hold a copy of that content, so the sync engine
//! can recognize "this message already exists elsewhere" without touching
//! storage. Grounded on `aero-collections/src/mail/uidindex.rs`'s `UidIndex`
//! (`table: OrdMap<UniqueIdent, IndexEntry>` plus secondary indices kept in
//! lockstep on every mutation).

use im::{OrdMap, OrdSet};
use serde::{Deserialize, Serialize};

use crate::ids::{ContentId, MailboxGuid, Uid};

/// One known location of a piece of content: which mailbox, which UID there.
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Instance {
    pub mailbox: MailboxGuid,
    pub uid: Uid,
}

/// Maps a content identity to every location it's known to occupy, and
/// tracks, per identity, the instance already issued to the message-store
/// search during the current pass (the "side channel" spec.md §4.1 calls
/// for, so a retry moves forward to the next instance instead of handing
/// back the one just expunged). `order` records each guid's first-insertion
/// position so `iterate()` can yield insertion order as spec.md §4.1
/// requires, something the sorted `OrdMap` key order alone can't give.
#[derive(Clone, Debug, Default)]
pub struct FingerprintMap {
    instances: OrdMap<ContentId, OrdSet<Instance>>,
    searched: OrdMap<ContentId, Instance>,
    order: im::Vector<ContentId>,
}

impl FingerprintMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ContentId, instance: Instance) {
        if !self.instances.contains_key(&id) {
            self.order.push_back(id);
        }
        self.instances.entry(id).or_default().insert(instance);
    }

    pub fn remove(&mut self, id: ContentId, instance: &Instance) {
        if let Some(set) = self.instances.get_mut(&id) {
            set.remove(instance);
            if set.is_empty() {
                self.instances.remove(&id);
            }
        }
    }

    pub fn instances_of(&self, id: &ContentId) -> OrdSet<Instance> {
        self.instances.get(id).cloned().unwrap_or_default()
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.instances.contains_key(id)
    }

    /// Yields `(guid, instances)` for every content identity that still has
    /// at least one instance, in the order each guid was first inserted.
    pub fn iterate(&self) -> Vec<(ContentId, OrdSet<Instance>)> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for id in self.order.iter() {
            if !seen.insert(*id) {
                continue;
            }
            if let Some(set) = self.instances.get(id) {
                out.push((*id, set.clone()));
            }
        }
        out
    }

    /// Returns the next still-present instance of `id` to serve: the first
    /// instance on the first call, and whichever instance sorts just after
    /// the one issued last time on every call after that (spec.md §4.1's
    /// "later retries skip this instance and take the next one"). Returns
    /// `None` once every instance has already been issued or removed.
    pub fn next_instance(&mut self, id: ContentId) -> Option<Instance> {
        let set = self.instances.get(&id)?;
        let candidate = match self.searched.get(&id) {
            Some(prev) => set.iter().find(|inst| *inst > prev).copied(),
            None => set.iter().next().copied(),
        };
        if let Some(inst) = candidate {
            self.searched.insert(id, inst);
        }
        candidate
    }

    /// Clears the searched side-channel at the start of a new pass, leaving
    /// the instance map itself untouched.
    pub fn reset_pass(&mut self) {
        self.searched = OrdMap::new();
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
