//! Arena-of-nodes mailbox tree: nodes refer to each other by `NodeId`, not
//! by owning pointers, so two trees (`local`/`remote`) can be walked and
//! mutated independently while reconciliation compares them. Grounded on
//! `aero-collections/src/davdag.rs`'s arena/graph style (`OrdMap<
//! UniqueIdent, _>` keyed indices, explicit ids rather than references),
//! generalized from a flat DAG of revisions to a rooted tree of mailboxes.

use im::OrdMap;

use msync_index::ids::MailboxGuid;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub u32);

#[derive(Clone, Debug)]
pub struct Node {
    pub parent: Option<NodeId>,
    pub first_child: Option<NodeId>,
    pub next_sibling: Option<NodeId>,
    pub name: String,
    pub guid: Option<MailboxGuid>,
    pub is_dir: bool,
    pub deleted: bool,
    pub last_renamed_or_created: u64,
    pub last_subscription_change: u64,
    pub subscribed: bool,
    /// Temporary name assigned mid-reconciliation, resolved to `name` by
    /// the temp-name-resolution pass.
    pub sync_temporary_name: Option<String>,
}

impl Node {
    fn leaf(name: &str, guid: Option<MailboxGuid>, is_dir: bool, timestamp: u64) -> Self {
        Node {
            parent: None,
            first_child: None,
            next_sibling: None,
            name: name.to_string(),
            guid,
            is_dir,
            deleted: false,
            last_renamed_or_created: timestamp,
            last_subscription_change: timestamp,
            subscribed: false,
            sync_temporary_name: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.sync_temporary_name.as_deref().unwrap_or(&self.name)
    }
}

/// A mailbox tree: an arena of `Node`s plus a `guid_hash` for O(1) lookup
/// by mailbox GUID, matching spec.md §4.7's stated inputs.
#[derive(Clone, Debug)]
pub struct MailboxTree {
    nodes: Vec<Node>,
    guid_hash: OrdMap<MailboxGuid, NodeId>,
    root: NodeId,
}

impl MailboxTree {
    pub fn new() -> Self {
        let root = Node::leaf("", None, true, 0);
        MailboxTree {
            nodes: vec![root],
            guid_hash: OrdMap::new(),
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn by_guid(&self, guid: &MailboxGuid) -> Option<NodeId> {
        self.guid_hash.get(guid).copied()
    }

    /// Appends a new child of `parent`, at the head of its sibling list.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: &str,
        guid: Option<MailboxGuid>,
        is_dir: bool,
        timestamp: u64,
    ) -> NodeId {
        let mut node = Node::leaf(name, guid, is_dir, timestamp);
        node.parent = Some(parent);
        node.next_sibling = self.get(parent).first_child;
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.get_mut(parent).first_child = Some(id);
        if let Some(g) = guid {
            self.guid_hash.insert(g, id);
        }
        id
    }

    pub fn children(&self, parent: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.get(parent).first_child;
        while let Some(id) = cur {
            out.push(id);
            cur = self.get(id).next_sibling;
        }
        out
    }

    /// Children of `parent` sorted by display name, the order every pass
    /// in §4.7 requires before lockstep comparison.
    pub fn sorted_children(&self, parent: NodeId) -> Vec<NodeId> {
        let mut kids = self.children(parent);
        kids.sort_by(|a, b| self.get(*a).display_name().cmp(self.get(*b).display_name()));
        kids
    }

    /// Full dotted path from the root to `id`, used for `CreateBox`/
    /// `DeleteBox` change descriptions and for cycle detection.
    pub fn full_name(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            if n == self.root {
                break;
            }
            parts.push(self.get(n).display_name().to_string());
            cur = self.get(n).parent;
        }
        parts.reverse();
        parts.join("/")
    }

    /// Whether `ancestor` is actually an ancestor of `node` (or equal to
    /// it) — used to refuse a rename that would create a cycle.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = Some(node);
        while let Some(n) = cur {
            if n == ancestor {
                return true;
            }
            cur = self.get(n).parent;
        }
        false
    }

    pub fn rename(&mut self, id: NodeId, new_parent: NodeId, new_name: &str, timestamp: u64) {
        // detach from current sibling chain
        if let Some(parent) = self.get(id).parent {
            let mut cur = self.get(parent).first_child;
            if cur == Some(id) {
                self.get_mut(parent).first_child = self.get(id).next_sibling;
            } else {
                while let Some(c) = cur {
                    if self.get(c).next_sibling == Some(id) {
                        let next = self.get(id).next_sibling;
                        self.get_mut(c).next_sibling = next;
                        break;
                    }
                    cur = self.get(c).next_sibling;
                }
            }
        }
        self.get_mut(id).next_sibling = self.get(new_parent).first_child;
        self.get_mut(new_parent).first_child = Some(id);
        self.get_mut(id).parent = Some(new_parent);
        self.get_mut(id).name = new_name.to_string();
        self.get_mut(id).sync_temporary_name = None;
        self.get_mut(id).last_renamed_or_created = timestamp;
    }

    /// Sorted-BFS traversal yielding `(full_name, guid, subscribed)`
    /// triples, used by the cross-tree-equality invariant of spec.md
    /// §4.7.
    pub fn sorted_bfs(&self) -> Vec<(String, Option<MailboxGuid>, bool)> {
        let mut out = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(self.root);
        while let Some(id) = queue.pop_front() {
            if id != self.root {
                let node = self.get(id);
                out.push((self.full_name(id), node.guid, node.subscribed));
            }
            for child in self.sorted_children(id) {
                queue.push_back(child);
            }
        }
        out
    }
}

impl Default for MailboxTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_child_registers_guid() {
        let mut tree = MailboxTree::new();
        let root = tree.root();
        let guid = MailboxGuid([1; 16]);
        let id = tree.add_child(root, "INBOX", Some(guid), false, 1);
        assert_eq!(tree.by_guid(&guid), Some(id));
    }

    #[test]
    fn sorted_children_orders_by_name() {
        let mut tree = MailboxTree::new();
        let root = tree.root();
        tree.add_child(root, "b", None, true, 1);
        tree.add_child(root, "a", None, true, 1);
        let sorted = tree.sorted_children(root);
        assert_eq!(tree.get(sorted[0]).name, "a");
        assert_eq!(tree.get(sorted[1]).name, "b");
    }

    #[test]
    fn rename_moves_between_parents() {
        let mut tree = MailboxTree::new();
        let root = tree.root();
        let dir = tree.add_child(root, "dir", None, true, 1);
        let leaf = tree.add_child(root, "leaf", Some(MailboxGuid([2; 16])), false, 1);
        tree.rename(leaf, dir, "leaf", 2);
        assert_eq!(tree.get(leaf).parent, Some(dir));
        assert_eq!(tree.full_name(leaf), "dir/leaf");
    }

    #[test]
    fn is_ancestor_detects_self_and_parents() {
        let mut tree = MailboxTree::new();
        let root = tree.root();
        let dir = tree.add_child(root, "dir", None, true, 1);
        let leaf = tree.add_child(dir, "leaf", None, false, 1);
        assert!(tree.is_ancestor(dir, leaf));
        assert!(tree.is_ancestor(root, leaf));
        assert!(!tree.is_ancestor(leaf, dir));
    }
}
