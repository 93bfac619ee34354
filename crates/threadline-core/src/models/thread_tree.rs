use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::note::Note;

/// A fetched note plus what we know about its replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub note: Note,
    /// True until there is evidence every child of this node is known
    pub has_unfetched_children: bool,
    /// Set once a fetch targeting this node's children has completed,
    /// whatever it returned. Never cleared.
    pub children_fetch_attempted: bool,
}

impl TreeNode {
    pub fn new(note: Note) -> Self {
        Self {
            note,
            has_unfetched_children: true,
            children_fetch_attempted: false,
        }
    }

    pub fn mark_children_fetched(&mut self) {
        self.children_fetch_attempted = true;
        self.has_unfetched_children = false;
    }
}

/// Reply tree for one conversation, addressed only by its root id.
///
/// Notes live in an arena keyed by id; `child_to_parent` and
/// `parent_to_children` are the two adjacency indices over it. Both are
/// rebuilt together by [`crate::tree::merge::merge_notes_into_tree`], which
/// is the only writer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadTree {
    pub root_id: String,
    pub nodes: HashMap<String, TreeNode>,
    pub child_to_parent: HashMap<String, String>,
    /// Children sorted by `(created_at, id)`, no duplicates
    pub parent_to_children: HashMap<String, Vec<String>>,
    /// Ids referenced by the indices that have no node yet
    pub pending: BTreeSet<String>,
    /// Ids whose children were fetched before the node itself arrived.
    /// The flag is carried over when the node is created.
    pub attempted_without_node: BTreeSet<String>,
}

impl ThreadTree {
    pub fn new(root_id: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            ..Default::default()
        }
    }

    pub fn node(&self, id: &str) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    pub fn note(&self, id: &str) -> Option<&Note> {
        self.nodes.get(id).map(|n| &n.note)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> Option<&TreeNode> {
        self.nodes.get(&self.root_id)
    }

    pub fn parent_of(&self, id: &str) -> Option<&str> {
        self.child_to_parent.get(id).map(String::as_str)
    }

    pub fn children_of(&self, id: &str) -> &[String] {
        self.parent_to_children
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Other children of the same parent, in thread order
    pub fn siblings(&self, id: &str) -> Vec<&str> {
        match self.parent_of(id) {
            Some(parent) => self
                .children_of(parent)
                .iter()
                .map(String::as_str)
                .filter(|sibling| *sibling != id)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn children_fetch_attempted(&self, id: &str) -> bool {
        match self.nodes.get(id) {
            Some(node) => node.children_fetch_attempted,
            None => self.attempted_without_node.contains(id),
        }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains(id)
    }

    /// Walk up from `id` to the root of this tree (or the first missing link)
    pub fn ancestors(&self, id: &str) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut current = id;
        while let Some(parent) = self.parent_of(current) {
            if chain.contains(&parent) || chain.len() > self.nodes.len() {
                break;
            }
            chain.push(parent);
            current = parent;
        }
        chain
    }
}

/// What a view renders for one parent: computed fresh from a tree snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadView {
    pub parent: Note,
    pub direct_children: Vec<Note>,
    /// parent id -> ordered child ids, for every node within the depth bound
    pub structure: HashMap<String, Vec<String>>,
    /// The parent or one of its direct children still needs a reply fetch
    pub has_unfetched_content: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{id, note};

    fn linked_tree() -> ThreadTree {
        let mut tree = ThreadTree::new(id(1));
        for (n, ts) in [(1, 10), (2, 20), (3, 30), (4, 40)] {
            tree.nodes.insert(id(n), TreeNode::new(note(n, ts, vec![])));
        }
        tree.child_to_parent.insert(id(2), id(1));
        tree.child_to_parent.insert(id(3), id(1));
        tree.child_to_parent.insert(id(4), id(2));
        tree.parent_to_children.insert(id(1), vec![id(2), id(3)]);
        tree.parent_to_children.insert(id(2), vec![id(4)]);
        tree
    }

    #[test]
    fn test_siblings_exclude_self() {
        let tree = linked_tree();
        assert_eq!(tree.siblings(&id(2)), vec![id(3).as_str()]);
        assert!(tree.siblings(&id(1)).is_empty());
        assert!(tree.siblings(&id(4)).is_empty());
    }

    #[test]
    fn test_ancestors_walks_to_root() {
        let tree = linked_tree();
        assert_eq!(tree.ancestors(&id(4)), vec![id(2).as_str(), id(1).as_str()]);
        assert!(tree.ancestors(&id(1)).is_empty());
    }

    #[test]
    fn test_ancestors_stops_on_cycle() {
        let mut tree = linked_tree();
        tree.child_to_parent.insert(id(1), id(4));
        let chain = tree.ancestors(&id(4));
        assert!(chain.len() <= tree.len());
    }

    #[test]
    fn test_fetch_attempted_for_unknown_node() {
        let mut tree = ThreadTree::new(id(1));
        assert!(!tree.children_fetch_attempted(&id(9)));
        tree.attempted_without_node.insert(id(9));
        assert!(tree.children_fetch_attempted(&id(9)));
    }

    #[test]
    fn test_mark_children_fetched() {
        let mut node = TreeNode::new(note(1, 1, vec![]));
        assert!(node.has_unfetched_children);
        node.mark_children_fetched();
        assert!(node.children_fetch_attempted);
        assert!(!node.has_unfetched_children);
    }
}
