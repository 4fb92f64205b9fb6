//! Index sync engine (C4): folds the transaction log into a `MailboxIndex`,
//! sorts and emits the resulting `SyncRec`s in the order external readers
//! require, and commits new operations back onto the log. Grounded on
//! `aero-bayou`'s `Bayou<S>` (`src/bayou.rs`): `fold` mirrors `Bayou::sync`
//! ("replay ops past the last known point into an in-memory state"),
//! `commit` mirrors `Bayou::push` ("apply locally, then persist"), and the
//! checkpoint/compression trigger mirrors `checkpoint_internal`'s
//! age/count thresholds — reused here to decide when `msync-cache` should
//! compact rather than when to ship a new K2V checkpoint object.

use tracing::{debug, warn};

use crate::change_queue::{Change, ChangeQueue, Side};
use crate::error::{IndexError, Result};
use crate::ids::Uid;
use crate::mailbox_index::{IndexOp, MailboxIndex};
use crate::txlog::{LogPosition, LogRecord, MemoryLog};

/// One emitted synchronization record: an ordered, externally-visible
/// description of a single mailbox change, the unit the exporter in
/// `msync-dsync` consumes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncRec {
    Expunge(Uid),
    Append(Uid),
    FlagChange(Uid),
}

/// Ordering key for emitted records: expunges first (so a UID can be
/// reused within the same fold), then appends, then flag changes — the
/// same three-bucket ordering spec.md §4.4 requires so a downstream reader
/// never observes a UID referenced before its append record.
fn bucket(rec: &SyncRec) -> u8 {
    match rec {
        SyncRec::Expunge(_) => 0,
        SyncRec::Append(_) => 1,
        SyncRec::FlagChange(_) => 2,
    }
}

fn uid_of(rec: &SyncRec) -> Uid {
    match rec {
        SyncRec::Expunge(u) | SyncRec::Append(u) | SyncRec::FlagChange(u) => *u,
    }
}

/// Folds, sorts, and commits mailbox index state, pairing a `MailboxIndex`
/// with the `ChangeQueue` that tracks what's changed since the last
/// successful sync with a peer.
pub struct IndexSyncEngine {
    index: MailboxIndex,
    queue: ChangeQueue,
    log: MemoryLog,
    position: LogPosition,
    side: Side,
    /// Number of folded records since the last checkpoint; used the same
    /// way `Bayou::checkpoint_internal` gates on op count before
    /// triggering compaction.
    ops_since_checkpoint: u64,
}

/// Checkpoint/compaction thresholds, mirroring `Bayou`'s age/count gate but
/// repurposed here to decide when the cache file (C3) should compact.
pub struct CheckpointPolicy {
    pub max_ops_since_checkpoint: u64,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        CheckpointPolicy {
            max_ops_since_checkpoint: 1000,
        }
    }
}

impl IndexSyncEngine {
    pub fn new(index: MailboxIndex, side: Side) -> Self {
        IndexSyncEngine {
            index,
            queue: ChangeQueue::new(),
            log: MemoryLog::new(),
            position: LogPosition::zero(),
            side,
            ops_since_checkpoint: 0,
        }
    }

    pub fn index(&self) -> &MailboxIndex {
        &self.index
    }

    pub fn queue_mut(&mut self) -> &mut ChangeQueue {
        &mut self.queue
    }

    /// Begin phase: establishes the starting position for a fold, the
    /// log position as of the last successful commit.
    pub fn begin(&self) -> LogPosition {
        self.position
    }

    /// Fold phase: replays every record appended since `from`, applying
    /// `Index` ops to the mailbox state and `ChangeFor` entries into the
    /// change queue. A gap between the caller's expected position and the
    /// log's actual contents (a torn or skipped prefix) surfaces as
    /// `IndexError::Corrupted` so the caller can fall back to a full
    /// rebuild, per spec.md §7's "recover locally, else surface" policy.
    pub fn fold(&mut self, from: LogPosition) -> Result<()> {
        if from.sequence > self.log.position().sequence {
            return Err(IndexError::Corrupted(format!(
                "fold requested from {} but log only extends to {}",
                from.sequence,
                self.log.position().sequence
            )));
        }
        for rec in self.log.since(from) {
            match rec {
                LogRecord::Index(op) => {
                    self.index.apply(op);
                    self.ops_since_checkpoint += 1;
                }
                LogRecord::ChangeFor { uid, change } => {
                    self.queue.push(self.side, *uid, change.clone());
                }
                LogRecord::Checkpoint { .. } => {
                    self.ops_since_checkpoint = 0;
                }
            }
        }
        self.position = self.log.position();
        Ok(())
    }

    /// Sort-and-emit phase: drains the change queue and returns its
    /// contents as an ordered stream of `SyncRec`s (expunges, then
    /// appends, then flag changes), the ordering external importers rely
    /// on per spec.md §4.4.
    pub fn sort_emit(&mut self) -> Vec<SyncRec> {
        let mut recs: Vec<SyncRec> = self
            .queue
            .drain()
            .into_iter()
            .map(|(uid, change)| match change {
                Change::Added { .. } => SyncRec::Append(uid),
                Change::Expunged => SyncRec::Expunge(uid),
                Change::FlagsChanged { .. } => SyncRec::FlagChange(uid),
            })
            .collect();
        recs.sort_by_key(|r| (bucket(r), uid_of(r)));
        recs
    }

    /// Commit phase: appends a locally-originated op to the log and
    /// applies it to the in-memory index immediately (apply-then-persist,
    /// mirroring `Bayou::push`).
    pub fn commit(&mut self, op: IndexOp) -> LogPosition {
        self.index.apply(&op);
        let pos = self.log.append(LogRecord::Index(op));
        self.ops_since_checkpoint += 1;
        self.position = self.log.position();
        pos
    }

    /// Returns whether the cache file should be asked to compact, per the
    /// configured checkpoint policy.
    pub fn should_checkpoint(&self, policy: &CheckpointPolicy) -> bool {
        self.ops_since_checkpoint >= policy.max_ops_since_checkpoint
    }

    /// Marks a checkpoint in the log, resetting the since-checkpoint
    /// counter. Called after `msync-cache` has successfully compacted.
    pub fn checkpoint(&mut self) -> LogPosition {
        debug!(ops = self.ops_since_checkpoint, "checkpointing index log");
        let pos = self.log.append(LogRecord::Checkpoint {
            sequence: self.position.sequence,
        });
        self.ops_since_checkpoint = 0;
        self.position = self.log.position();
        pos
    }

    /// Appends a change-queue entry without touching the folded index
    /// state — used when a change is observed out-of-band (e.g. the
    /// maildir scanner reports a flag change) and must be queued for
    /// export before it's folded into the authoritative index.
    pub fn record_change(&mut self, uid: Uid, change: Change) {
        self.log.append(LogRecord::ChangeFor {
            uid,
            change: change.clone(),
        });
        self.queue.push(self.side, uid, change);
    }

    /// Recovery path for a corrupted fold: drops all in-memory state and
    /// starts over from position zero, logging the event rather than
    /// panicking, per spec.md §7's "fsck on missing position" contract.
    pub fn reset_for_rebuild(&mut self, fresh: MailboxIndex) {
        warn!("resetting mailbox index after detected corruption");
        self.index = fresh;
        self.queue = ChangeQueue::new();
        self.position = LogPosition::zero();
        self.ops_since_checkpoint = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ContentId, Guid, UidValidity};

    fn engine() -> IndexSyncEngine {
        IndexSyncEngine::new(MailboxIndex::new(UidValidity::new(1).unwrap()), Side::Master)
    }

    #[test]
    fn commit_then_fold_is_idempotent() {
        let mut eng = engine();
        let uid = Uid::new(1).unwrap();
        eng.commit(IndexOp::MailAdd {
            uid,
            content: ContentId::Guid(Guid([1; 16])),
            save_timestamp: 1,
        });
        let start = eng.begin();
        eng.fold(start).unwrap();
        assert_eq!(eng.index().len(), 1);
    }

    #[test]
    fn sort_emit_orders_expunge_before_append_before_flags() {
        let mut eng = engine();
        eng.record_change(
            Uid::new(3).unwrap(),
            Change::FlagsChanged {
                flags: crate::flags::Flags::default(),
                modseq: crate::ids::ModSeq::new(1).unwrap(),
                pvt_modseq: crate::ids::ModSeq::new(1).unwrap(),
            },
        );
        eng.record_change(Uid::new(1).unwrap(), Change::Expunged);
        eng.record_change(
            Uid::new(2).unwrap(),
            Change::Added {
                content: ContentId::Guid(Guid([2; 16])),
                save_timestamp: 2,
            },
        );
        let recs = eng.sort_emit();
        assert_eq!(
            recs,
            vec![
                SyncRec::Expunge(Uid::new(1).unwrap()),
                SyncRec::Append(Uid::new(2).unwrap()),
                SyncRec::FlagChange(Uid::new(3).unwrap()),
            ]
        );
    }

    #[test]
    fn fold_from_beyond_log_head_is_corrupted() {
        let mut eng = engine();
        let bogus = LogPosition { sequence: 99 };
        assert!(matches!(eng.fold(bogus), Err(IndexError::Corrupted(_))));
    }

    #[test]
    fn reset_for_rebuild_clears_state() {
        let mut eng = engine();
        eng.commit(IndexOp::MailAdd {
            uid: Uid::new(1).unwrap(),
            content: ContentId::Guid(Guid([1; 16])),
            save_timestamp: 1,
        });
        eng.reset_for_rebuild(MailboxIndex::new(UidValidity::new(2).unwrap()));
        assert!(eng.index().is_empty());
    }
}
