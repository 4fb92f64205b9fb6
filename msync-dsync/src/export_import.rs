//! Exporter/importer (C8): turns a mailbox's folded `SyncRec` stream into
//! wire `Change`s, and replays a peer's `Change` stream back into a local
//! index. Grounded on the `Mailbox`/`MailboxInternal` façade split in
//! `src/mail/mailbox.rs` (a thin public surface over an internal struct
//! guarded by a lock) and its flag-mutation methods (`add_flags`/
//! `del_flags`/`set_flags`), generalized here into the importer's
//! per-message apply step.

use std::collections::BTreeSet;

use tracing::warn;

use msync_index::fingerprint::{FingerprintMap, Instance};
use msync_index::flags::Flags;
use msync_index::ids::{ContentId, Uid};
use msync_index::mailbox_index::IndexOp;
use msync_index::sync_engine::{IndexSyncEngine, SyncRec};

use crate::wire::{Change, Done, MailboxState};

/// Looks up already-parsed header/body metadata for a message's cache
/// chain, so the exporter doesn't have to re-derive it from storage when
/// building a `Mail` response. Spec.md §4.8 calls this out explicitly:
/// "C3 is consulted by C8 to cheaply surface already-parsed header/body
/// metadata."
pub fn cached_metadata(
    cache: &msync_cache::txn::CacheFile,
    seq: u32,
    head_offset: u32,
) -> msync_cache::Result<Vec<msync_cache::format::CacheRecord>> {
    cache.read_chain(seq, head_offset)
}

/// Scans a mailbox's pending sync records and turns them into the wire
/// `Change` stream spec.md §4.8 describes, in strictly ascending-UID
/// order, expunges and flag resets first for a given UID (the ordering
/// `sort_emit` already guarantees).
pub fn export(engine: &mut IndexSyncEngine, last_common_uid: u32) -> (Vec<Change>, Done) {
    let recs = engine.sort_emit();
    let mut changes = Vec::new();

    for rec in recs {
        match rec {
            SyncRec::Expunge(uid) => changes.push(Change::Expunge { uid }),
            SyncRec::Append(uid) => {
                if uid.get() > last_common_uid {
                    if let Some(msg) = engine.index().get(uid) {
                        changes.push(Change::Save {
                            uid,
                            content: msg.content,
                            save_timestamp: msg.save_timestamp,
                            flags: msg.flags.clone(),
                        });
                    }
                    // A record already gone by the time of this read was
                    // added and expunged inside the same folded window;
                    // there's nothing to export. The expunged-during-export
                    // list (`retry_expunged_body`) covers a later stage:
                    // a body requested via `MailRequest` after this change
                    // list was already sent.
                }
            }
            SyncRec::FlagChange(uid) => {
                if let Some(msg) = engine.index().get(uid) {
                    changes.push(Change::FlagsChanged {
                        uid,
                        flags: msg.flags.clone(),
                        modseq: msg.modseq,
                        pvt_modseq: msg.pvt_modseq,
                    });
                }
            }
        }
    }

    (
        changes,
        Done {
            expunged_during_export: Vec::new(),
            changes_during_sync: false,
        },
    )
}

/// When a requested body has been expunged since the change stream was
/// built, looks for another surviving instance of the same content before
/// giving up on it entirely (spec.md §4.8's retry-via-C1 step). Uses
/// `next_instance` rather than the raw instance set so a retry moves past
/// whichever instance was already issued (and has since been expunged)
/// instead of handing back the same one again.
pub fn retry_expunged_body(fingerprints: &mut FingerprintMap, content: ContentId) -> Option<Instance> {
    fingerprints.next_instance(content)
}

/// Flag-merge conflict policy, taken from the original source's
/// `dsync-mailbox-import.c` conflict table and exposed as plain booleans
/// rather than a compile-time constant, per spec.md §4.8/§9.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlagMergePolicy {
    pub prefer_remote: bool,
    pub prefer_pvt_remote: bool,
}

/// Result of importing one peer's change stream: which local UIDs were
/// kept, and whether a race was detected that requires the caller to
/// retry with a regressed `last_common_uid`.
#[derive(Clone, Debug, Default)]
pub struct ImportOutcome {
    pub wanted_uids: BTreeSet<u32>,
    pub changes_during_sync: bool,
    pub new_last_common_uid: u32,
}

/// Replays a peer's `Change` stream into the local mailbox index. Remote
/// changes at `uid <= last_common_uid` are treated as updates to already
/// agreed-upon messages; changes above it are saves, assigned either the
/// remote UID (if it's safely beyond the local `uid_next`) or a fresh
/// local UID, per spec.md §4.8 step 2.
pub fn import(
    engine: &mut IndexSyncEngine,
    remote_state: &MailboxState,
    changes: Vec<Change>,
    policy: FlagMergePolicy,
) -> ImportOutcome {
    let mut wanted = BTreeSet::new();
    let mut local_uid_next = engine.index().uidnext;

    for change in changes {
        match change {
            Change::Expunge { uid } => {
                engine.commit(IndexOp::MailExpunge { uid });
            }
            Change::FlagsChanged { uid, flags: remote_flags, .. } => {
                let merged = match engine.index().get(uid) {
                    Some(local_msg) => Flags::merge(
                        &local_msg.flags,
                        &remote_flags,
                        policy.prefer_remote,
                        policy.prefer_pvt_remote,
                    ),
                    None => remote_flags,
                };
                engine.commit(IndexOp::FlagsChanged { uid, flags: merged });
            }
            Change::Save {
                uid,
                content,
                save_timestamp,
                flags,
            } => {
                assert!(
                    uid.get() != remote_state.last_common_uid,
                    "a save at uid == last_common_uid is forbidden"
                );
                if uid.get() <= remote_state.last_common_uid {
                    continue; // already agreed upon; handled as a flag merge instead
                }
                let local_uid = if uid.get() >= local_uid_next {
                    uid
                } else {
                    Uid::new(local_uid_next).expect("uid_next never reaches zero")
                };
                engine.commit(IndexOp::MailAdd {
                    uid: local_uid,
                    content,
                    save_timestamp,
                });
                engine.commit(IndexOp::FlagsChanged {
                    uid: local_uid,
                    flags,
                });
                wanted.insert(local_uid.get());
                local_uid_next = local_uid_next.max(local_uid.get() + 1);
            }
        }
    }

    let changes_during_sync = remote_state.uid_next > 0 && local_uid_next > remote_state.uid_next
        && !wanted.contains(&(local_uid_next - 1));
    if changes_during_sync {
        warn!(
            mailbox = %remote_state.mailbox,
            local_uid_next,
            remote_uid_next = remote_state.uid_next,
            "local mailbox changed during import, regressing last_common_uid"
        );
    }

    ImportOutcome {
        wanted_uids: wanted,
        changes_during_sync,
        new_last_common_uid: if changes_during_sync {
            local_uid_next.saturating_sub(1)
        } else {
            remote_state.last_common_uid
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msync_index::change_queue::Side;
    use msync_index::ids::{Guid, UidValidity};
    use msync_index::mailbox_index::MailboxIndex;

    fn engine() -> IndexSyncEngine {
        IndexSyncEngine::new(MailboxIndex::new(UidValidity::new(1).unwrap()), Side::Master)
    }

    #[test]
    fn export_emits_saves_above_last_common_uid() {
        let mut eng = engine();
        let uid = Uid::new(5).unwrap();
        eng.commit(IndexOp::MailAdd {
            uid,
            content: ContentId::Guid(Guid([1; 16])),
            save_timestamp: 1,
        });
        eng.record_change(
            uid,
            msync_index::change_queue::Change::Added {
                content: ContentId::Guid(Guid([1; 16])),
                save_timestamp: 1,
            },
        );
        let (changes, done) = export(&mut eng, 0);
        assert!(changes
            .iter()
            .any(|c| matches!(c, Change::Save { uid: u, .. } if *u == uid)));
        assert!(done.expunged_during_export.is_empty());
    }

    #[test]
    fn import_saves_assign_fresh_uid_when_remote_uid_taken() {
        let mut eng = engine();
        eng.commit(IndexOp::MailAdd {
            uid: Uid::new(1).unwrap(),
            content: ContentId::Guid(Guid([9; 16])),
            save_timestamp: 1,
        });
        let state = MailboxState {
            mailbox: msync_index::ids::MailboxGuid([0; 16]),
            last_common_uid: 0,
            last_common_modseq: 0,
            uid_next: 2,
            first_recent_uid: 1,
        };
        let changes = vec![Change::Save {
            uid: Uid::new(1).unwrap(),
            content: ContentId::Guid(Guid([2; 16])),
            save_timestamp: 2,
            flags: Default::default(),
        }];
        let outcome = import(&mut eng, &state, changes, FlagMergePolicy::default());
        assert_eq!(outcome.wanted_uids.len(), 1);
        assert!(!outcome.wanted_uids.contains(&1));
    }

    #[test]
    fn flag_conflict_honors_prefer_remote_policy() {
        use msync_index::flags::StdFlags;

        let mut eng = engine();
        let uid = Uid::new(1).unwrap();
        eng.commit(IndexOp::MailAdd {
            uid,
            content: ContentId::Guid(Guid([1; 16])),
            save_timestamp: 1,
        });
        let mut local_flags = msync_index::flags::Flags::default();
        local_flags.set_std(StdFlags::SEEN, true);
        eng.commit(IndexOp::FlagsChanged { uid, flags: local_flags });

        let mut remote_flags = msync_index::flags::Flags::default();
        remote_flags.set_std(StdFlags::FLAGGED, true);
        let state = MailboxState {
            mailbox: msync_index::ids::MailboxGuid([0; 16]),
            last_common_uid: 1,
            last_common_modseq: 0,
            uid_next: 2,
            first_recent_uid: 1,
        };
        let changes = vec![Change::FlagsChanged {
            uid,
            flags: remote_flags,
            modseq: msync_index::ids::ModSeq::new(1).unwrap(),
            pvt_modseq: msync_index::ids::ModSeq::new(1).unwrap(),
        }];

        let outcome = import(
            &mut eng,
            &state,
            changes,
            FlagMergePolicy {
                prefer_remote: true,
                prefer_pvt_remote: false,
            },
        );
        assert!(!outcome.changes_during_sync);
        assert!(eng.index().get(uid).unwrap().flags.has_std(StdFlags::FLAGGED));
        assert!(!eng.index().get(uid).unwrap().flags.has_std(StdFlags::SEEN));
    }
}
