//! Six-pass two-way mailbox tree reconciliation (C7), producing the
//! change list describing what each side must apply to converge. Grounded
//! on spec.md §4.7's pass order, with the rename/temp-name/subscription
//! last-writer-wins policy adapted from `src/mail/namespace.rs`'s
//! `MailboxListEntry::merge`/`set_mailbox` (there: a flat namespace keyed
//! by name with a timestamp LWW; here: the same idea walked over a tree).
//! Sibling-group lockstep walking uses `itertools::merge_join_by`. Deletes
//! (passes 1 and 5) and renames (pass 2) are emitted for whichever side
//! actually needs to act, not just one fixed side.

use itertools::{EitherOrBoth, Itertools};

use msync_index::ids::MailboxGuid;

use crate::tree::{MailboxTree, NodeId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncChange {
    CreateBox {
        name: String,
        guid: Option<MailboxGuid>,
        uid_validity: u32,
    },
    DeleteBox {
        name: String,
    },
    CreateDir {
        name: String,
    },
    DeleteDir {
        name: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Subscribe {
        name: String,
    },
    Unsubscribe {
        name: String,
    },
}

/// Runs all six passes and returns the ordered list of changes the
/// **local** tree must apply to converge toward `remote`. Calling this a
/// second time with the roles swapped yields `remote`'s mirror list, per
/// spec.md §4.7's deterministic-regardless-of-side property.
pub fn reconcile(local: &mut MailboxTree, remote: &mut MailboxTree) -> Vec<SyncChange> {
    let mut changes = Vec::new();

    sort_and_delete(local, remote, &mut changes);
    let local_root = local.root();
    let remote_root = remote.root();
    rename_pass(local, remote, local_root, remote_root, &mut changes);
    resolve_temp_names(local);
    resolve_temp_names(remote);
    create_pass(local, remote, &mut changes);
    directory_pass(local, remote, &mut changes);
    subscription_pass(local, remote, &mut changes);

    changes
}

/// Pass 1: any node marked `deleted` that isn't a pure directory gets a
/// `DeleteBox` emitted for every side that still carries a live entry for
/// its guid, and the guid is cleared on both sides so later passes don't
/// try to pair it up again.
fn sort_and_delete(local: &mut MailboxTree, remote: &mut MailboxTree, changes: &mut Vec<SyncChange>) {
    let deleted_guids: Vec<MailboxGuid> = collect_deleted_guids(local)
        .into_iter()
        .chain(collect_deleted_guids(remote))
        .collect();

    for guid in deleted_guids {
        if let Some(id) = remote.by_guid(&guid) {
            changes.push(SyncChange::DeleteBox {
                name: remote.full_name(id),
            });
            remote.get_mut(id).guid = None;
        }
        if let Some(id) = local.by_guid(&guid) {
            changes.push(SyncChange::DeleteBox {
                name: local.full_name(id),
            });
            local.get_mut(id).guid = None;
        }
    }
}

fn collect_deleted_guids(tree: &MailboxTree) -> Vec<MailboxGuid> {
    let mut out = Vec::new();
    walk(tree, tree.root(), &mut |tree, id| {
        let node = tree.get(id);
        if node.deleted && !node.is_dir {
            if let Some(g) = node.guid {
                out.push(g);
            }
        }
    });
    out
}

fn walk(tree: &MailboxTree, start: NodeId, f: &mut impl FnMut(&MailboxTree, NodeId)) {
    for child in tree.children(start) {
        f(tree, child);
        walk(tree, child, f);
    }
}

/// Pass 2: walks both trees' sibling groups in lockstep by sorted name.
/// Matched directories recurse; matched leaves with differing guids are
/// renamed to a deterministic temporary name (resolved in pass 3) so the
/// name collision doesn't block the rest of the pass. The **older** of the
/// two nodes (by `last_renamed_or_created`) is the one renamed, so both
/// sides make the same choice regardless of which one happens to be
/// passed as `local` — required for the determinism property of spec.md
/// §8. A tie is broken by guid so the choice still doesn't depend on
/// argument order.
fn rename_pass(
    local: &mut MailboxTree,
    remote: &mut MailboxTree,
    local_parent: NodeId,
    remote_parent: NodeId,
    changes: &mut Vec<SyncChange>,
) {
    let local_children = local.sorted_children(local_parent);
    let remote_children = remote.sorted_children(remote_parent);

    let local_named: Vec<(String, NodeId)> = local_children
        .iter()
        .map(|id| (local.get(*id).display_name().to_string(), *id))
        .collect();
    let remote_named: Vec<(String, NodeId)> = remote_children
        .iter()
        .map(|id| (remote.get(*id).display_name().to_string(), *id))
        .collect();

    for pair in local_named
        .into_iter()
        .merge_join_by(remote_named, |(ln, _), (rn, _)| ln.cmp(rn))
    {
        match pair {
            EitherOrBoth::Both((_, l), (_, r)) => {
                let l_guid = local.get(l).guid;
                let r_guid = remote.get(r).guid;
                match (l_guid, r_guid) {
                    (Some(lg), Some(rg)) if lg != rg => {
                        let l_ts = local.get(l).last_renamed_or_created;
                        let r_ts = remote.get(r).last_renamed_or_created;
                        let rename_local = match l_ts.cmp(&r_ts) {
                            std::cmp::Ordering::Less => true,
                            std::cmp::Ordering::Greater => false,
                            std::cmp::Ordering::Equal => lg.0 < rg.0,
                        };
                        if rename_local {
                            let from = local.full_name(l);
                            assign_temp_name(local, l);
                            let to = local.full_name(l);
                            changes.push(SyncChange::Rename { from, to });
                        } else {
                            let from = remote.full_name(r);
                            assign_temp_name(remote, r);
                            let to = remote.full_name(r);
                            changes.push(SyncChange::Rename { from, to });
                        }
                    }
                    _ => {
                        if local.get(l).is_dir && remote.get(r).is_dir {
                            rename_pass(local, remote, l, r, changes);
                        }
                    }
                }
            }
            EitherOrBoth::Left(_) | EitherOrBoth::Right(_) => {
                // one side lacks this name entirely; left to the create
                // pass, unless the guid already exists elsewhere in the
                // other tree (a move), which the create pass also
                // recognizes by guid lookup.
            }
        }
    }
}

fn assign_temp_name(tree: &mut MailboxTree, id: NodeId) {
    let suffix = match tree.get(id).guid {
        Some(g) => hex::encode(&g.0[..4]),
        None => format!("{:x}", id.0),
    };
    let base = tree.get(id).name.clone();
    tree.get_mut(id).sync_temporary_name = Some(format!("{}-{}", base, suffix));
}

fn resolve_temp_names(tree: &mut MailboxTree) {
    for id in 0..tree_len(tree) {
        let id = NodeId(id as u32);
        if let Some(tmp) = tree.get(id).sync_temporary_name.take() {
            tree.get_mut(id).name = tmp;
        }
    }
}

fn tree_len(tree: &MailboxTree) -> usize {
    // walking the whole arena by index is safe: NodeId values are dense
    // and never reused within one reconciliation pass.
    let mut max = 0usize;
    walk(tree, tree.root(), &mut |_, id| max = max.max(id.0 as usize + 1));
    max
}

/// Pass 4: any mailbox present in one tree's `guid_hash` but absent from
/// the other's gets a `CreateBox`/`CreateDir` emitted for the deficient
/// side, copying guid and directory-ness.
fn create_pass(local: &MailboxTree, remote: &MailboxTree, changes: &mut Vec<SyncChange>) {
    walk(local, local.root(), &mut |tree, id| {
        let node = tree.get(id);
        if let Some(g) = node.guid {
            if remote.by_guid(&g).is_none() {
                changes.push(SyncChange::CreateBox {
                    name: tree.full_name(id),
                    guid: Some(g),
                    uid_validity: 1,
                });
            }
        }
    });
}

/// Pass 5: directory-only nodes (no guid) are aligned between the two
/// trees by path. A directory present on one side but missing on the
/// other is created there if it still has children on the side that has
/// it; if it has none left on either side, it's a stale placeholder and
/// is deleted instead of recreated.
fn directory_pass(local: &MailboxTree, remote: &MailboxTree, changes: &mut Vec<SyncChange>) {
    let local_dirs = collect_dir_nodes(local);
    let remote_dirs = collect_dir_nodes(remote);

    for (path, id) in &local_dirs {
        if !remote_dirs.contains_key(path) {
            if local.children(*id).is_empty() {
                changes.push(SyncChange::DeleteDir { name: path.clone() });
            } else {
                changes.push(SyncChange::CreateDir { name: path.clone() });
            }
        }
    }
    for (path, id) in &remote_dirs {
        if !local_dirs.contains_key(path) {
            if remote.children(*id).is_empty() {
                changes.push(SyncChange::DeleteDir { name: path.clone() });
            } else {
                changes.push(SyncChange::CreateDir { name: path.clone() });
            }
        }
    }
}

fn collect_dir_nodes(tree: &MailboxTree) -> std::collections::BTreeMap<String, NodeId> {
    let mut out = std::collections::BTreeMap::new();
    walk(tree, tree.root(), &mut |tree, id| {
        let node = tree.get(id);
        if node.is_dir && node.guid.is_none() {
            out.insert(tree.full_name(id), id);
        }
    });
    out
}

/// Pass 6: for every mailbox present on both sides, whichever side
/// changed its subscription more recently wins; a tie favors
/// `subscribed == true`.
fn subscription_pass(local: &mut MailboxTree, remote: &mut MailboxTree, changes: &mut Vec<SyncChange>) {
    let guids: Vec<MailboxGuid> = collect_guids(local);
    for guid in guids {
        let (Some(l), Some(r)) = (local.by_guid(&guid), remote.by_guid(&guid)) else {
            continue;
        };
        let ln = local.get(l);
        let rn = remote.get(r);
        let (winner_subscribed, winner_is_local) =
            match ln.last_subscription_change.cmp(&rn.last_subscription_change) {
                std::cmp::Ordering::Greater => (ln.subscribed, true),
                std::cmp::Ordering::Less => (rn.subscribed, false),
                std::cmp::Ordering::Equal => (ln.subscribed || rn.subscribed, ln.subscribed),
            };
        if winner_is_local && rn.subscribed != winner_subscribed {
            let name = remote.full_name(r);
            remote.get_mut(r).subscribed = winner_subscribed;
            changes.push(subscription_change(winner_subscribed, name));
        } else if !winner_is_local && ln.subscribed != winner_subscribed {
            let name = local.full_name(l);
            local.get_mut(l).subscribed = winner_subscribed;
            changes.push(subscription_change(winner_subscribed, name));
        }
    }
}

fn subscription_change(subscribed: bool, name: String) -> SyncChange {
    if subscribed {
        SyncChange::Subscribe { name }
    } else {
        SyncChange::Unsubscribe { name }
    }
}

fn collect_guids(tree: &MailboxTree) -> Vec<MailboxGuid> {
    let mut out = Vec::new();
    walk(tree, tree.root(), &mut |tree, id| {
        if let Some(g) = tree.get(id).guid {
            out.push(g);
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn create_pass_fills_missing_mailbox() {
        let mut local = MailboxTree::new();
        let mut remote = MailboxTree::new();
        let root = local.root();
        local.add_child(root, "INBOX", Some(MailboxGuid([1; 16])), false, 1);

        let changes = reconcile(&mut local, &mut remote);
        assert!(changes
            .iter()
            .any(|c| matches!(c, SyncChange::CreateBox { name, .. } if name == "INBOX")));
    }

    #[test]
    fn matching_trees_produce_no_changes() {
        let mut local = MailboxTree::new();
        let mut remote = MailboxTree::new();
        let lroot = local.root();
        let rroot = remote.root();
        let guid = MailboxGuid([2; 16]);
        local.add_child(lroot, "INBOX", Some(guid), false, 1);
        remote.add_child(rroot, "INBOX", Some(guid), false, 1);

        let changes = reconcile(&mut local, &mut remote);
        assert!(changes.is_empty());
    }

    #[test]
    fn subscription_pass_prefers_later_change() {
        let mut local = MailboxTree::new();
        let mut remote = MailboxTree::new();
        let lroot = local.root();
        let rroot = remote.root();
        let guid = MailboxGuid([3; 16]);
        let l = local.add_child(lroot, "Archive", Some(guid), false, 1);
        let r = remote.add_child(rroot, "Archive", Some(guid), false, 1);
        local.get_mut(l).subscribed = true;
        local.get_mut(l).last_subscription_change = 10;
        remote.get_mut(r).last_subscription_change = 5;

        let changes = reconcile(&mut local, &mut remote);
        assert!(changes
            .iter()
            .any(|c| matches!(c, SyncChange::Subscribe { name } if name == "Archive")));
    }

    #[test]
    fn rename_pass_renames_the_older_side_and_emits_rename() {
        let mut local = MailboxTree::new();
        let mut remote = MailboxTree::new();
        let lroot = local.root();
        let rroot = remote.root();
        let guid_local = MailboxGuid([1; 16]);
        let guid_remote = MailboxGuid([2; 16]);
        local.add_child(lroot, "A", Some(guid_local), false, 100);
        remote.add_child(rroot, "A", Some(guid_remote), false, 50);

        let changes = reconcile(&mut local, &mut remote);
        let suffix = hex::encode(&guid_remote.0[..4]);
        let expected_to = format!("A-{suffix}");
        assert!(
            changes.iter().any(|c| matches!(
                c,
                SyncChange::Rename { from, to } if from == "A" && *to == expected_to
            )),
            "expected remote (older, ts=50) to be renamed with a suffix from its own guid, got {changes:?}"
        );
        assert!(
            !changes.iter().any(|c| matches!(
                c,
                SyncChange::Rename { to, .. } if to.contains(&hex::encode(&guid_local.0[..4]))
            )),
            "local (newer, ts=100) must not be the one renamed"
        );
    }

    #[test]
    fn delete_box_is_emitted_for_both_sides() {
        let mut local = MailboxTree::new();
        let mut remote = MailboxTree::new();
        let lroot = local.root();
        let rroot = remote.root();
        let guid = MailboxGuid([7; 16]);
        let l = local.add_child(lroot, "Trash", Some(guid), false, 1);
        remote.add_child(rroot, "Trash", Some(guid), false, 1);
        local.get_mut(l).deleted = true;

        let mut changes = Vec::new();
        sort_and_delete(&mut local, &mut remote, &mut changes);

        let delete_count = changes
            .iter()
            .filter(|c| matches!(c, SyncChange::DeleteBox { name } if name == "Trash"))
            .count();
        assert_eq!(delete_count, 2, "expected DeleteBox for both local and remote, got {changes:?}");
    }

    #[test]
    fn directory_pass_deletes_an_empty_stale_directory() {
        let mut local = MailboxTree::new();
        let mut remote = MailboxTree::new();
        let lroot = local.root();
        local.add_child(lroot, "Empty", None, true, 1);
        // remote has no such directory at all

        let mut changes = Vec::new();
        directory_pass(&local, &remote, &mut changes);

        assert!(changes
            .iter()
            .any(|c| matches!(c, SyncChange::DeleteDir { name } if name == "Empty")));
        assert!(!changes
            .iter()
            .any(|c| matches!(c, SyncChange::CreateDir { name } if name == "Empty")));
    }

    #[test]
    fn directory_pass_creates_a_nonempty_missing_directory() {
        let mut local = MailboxTree::new();
        let mut remote = MailboxTree::new();
        let lroot = local.root();
        let dir = local.add_child(lroot, "Work", None, true, 1);
        local.add_child(dir, "Inbox", Some(MailboxGuid([8; 16])), false, 1);

        let mut changes = Vec::new();
        directory_pass(&local, &remote, &mut changes);

        assert!(changes
            .iter()
            .any(|c| matches!(c, SyncChange::CreateDir { name } if name == "Work")));
    }

    proptest! {
        /// Sync determinism (spec.md §8): two trees built from the same
        /// guids and names, in any order, already agree — reconciling them
        /// against each other produces no changes.
        #[test]
        fn identical_trees_reconcile_to_no_changes(
            guids in proptest::collection::hash_set(1u8..=20, 1..10),
        ) {
            let mut local = MailboxTree::new();
            let mut remote = MailboxTree::new();
            let lroot = local.root();
            let rroot = remote.root();
            for g in guids {
                let name = format!("box-{g}");
                local.add_child(lroot, &name, Some(MailboxGuid([g; 16])), false, g as u64);
                remote.add_child(rroot, &name, Some(MailboxGuid([g; 16])), false, g as u64);
            }

            let changes = reconcile(&mut local, &mut remote);
            prop_assert!(changes.is_empty());
        }
    }
}
