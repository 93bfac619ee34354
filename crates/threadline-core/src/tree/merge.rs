use std::collections::BTreeSet;

use crate::config::ThreadPolicy;
use crate::models::note::thread_order;
use crate::models::{Note, ThreadTree, TreeNode};
use crate::resolver::resolve_parent;

/// Merge freshly fetched notes into a tree, returning a new tree.
///
/// `affected_parent_ids` are the nodes whose children were just queried;
/// each is marked `children_fetch_attempted` whether or not anything came
/// back. Notes are deduplicated by id and an existing node is never
/// replaced. The result depends only on the inputs, so merging the same
/// batch twice yields the same tree as merging it once.
pub fn merge_notes_into_tree(
    existing: &ThreadTree,
    new_notes: &[Note],
    affected_parent_ids: &[String],
    policy: &ThreadPolicy,
) -> ThreadTree {
    let mut tree = existing.clone();
    let mut touched_parents: BTreeSet<String> = BTreeSet::new();

    for note in new_notes {
        if !note.is_text_note() || tree.nodes.contains_key(&note.id) {
            continue;
        }

        let mut node = TreeNode::new(note.clone());
        if tree.attempted_without_node.remove(&note.id) {
            node.mark_children_fetched();
        }
        tree.nodes.insert(note.id.clone(), node);

        // The root has no parent inside its own tree
        if note.id == tree.root_id {
            continue;
        }
        if let Some(parent) = resolve_parent(note, policy) {
            tree.child_to_parent.insert(note.id.clone(), parent.clone());
            touched_parents.insert(parent);
        }
    }

    for parent in affected_parent_ids {
        match tree.nodes.get_mut(parent) {
            Some(node) => node.mark_children_fetched(),
            None => {
                tree.attempted_without_node.insert(parent.clone());
            }
        }
    }

    for parent in touched_parents {
        rebuild_children(&mut tree, &parent);
    }

    tree.pending = tree
        .parent_to_children
        .keys()
        .filter(|id| !tree.nodes.contains_key(*id))
        .cloned()
        .collect();

    tree
}

fn rebuild_children(tree: &mut ThreadTree, parent: &str) {
    let mut children: Vec<&Note> = tree
        .child_to_parent
        .iter()
        .filter(|(_, p)| p.as_str() == parent)
        .filter_map(|(child, _)| tree.nodes.get(child))
        .map(|node| &node.note)
        .collect();
    children.sort_by(|a, b| thread_order(a, b));
    children.dedup_by(|a, b| a.id == b.id);

    let ids = children.into_iter().map(|n| n.id.clone()).collect();
    tree.parent_to_children.insert(parent.to_string(), ids);
}
