use std::collections::HashMap;

use crate::models::{ThreadTree, ThreadView};

/// Build the view for `parent_id`, walking at most `max_depth` levels down.
///
/// Always computed from scratch; returns `None` until the parent note is in
/// the tree.
pub fn build_thread_view(tree: &ThreadTree, parent_id: &str, max_depth: usize) -> Option<ThreadView> {
    let parent = tree.note(parent_id)?.clone();

    let direct_children = tree
        .children_of(parent_id)
        .iter()
        .filter_map(|id| tree.note(id))
        .cloned()
        .collect();

    let mut structure: HashMap<String, Vec<String>> = HashMap::new();
    let mut level = vec![parent_id.to_string()];
    for _ in 0..max_depth {
        let mut next = Vec::new();
        for id in &level {
            let children = tree.children_of(id);
            if children.is_empty() || structure.contains_key(id) {
                continue;
            }
            structure.insert(id.clone(), children.to_vec());
            next.extend(children.iter().cloned());
        }
        if next.is_empty() {
            break;
        }
        level = next;
    }

    Some(ThreadView {
        parent,
        direct_children,
        structure,
        has_unfetched_content: !unexplored_ids(tree, parent_id).is_empty(),
    })
}

/// Nodes that must be queried before the view of `parent_id` is complete:
/// the parent itself if its children were never fetched, plus each cached
/// direct child whose own children were never fetched.
pub fn unexplored_ids(tree: &ThreadTree, parent_id: &str) -> Vec<String> {
    let mut ids = Vec::new();
    if !tree.children_fetch_attempted(parent_id) {
        ids.push(parent_id.to_string());
    }
    ids.extend(
        tree.children_of(parent_id)
            .iter()
            .filter(|child| !tree.children_fetch_attempted(child))
            .cloned(),
    );
    ids
}

/// Next BFS level: every child of `level`, explored or not.
///
/// Explored nodes stay in the walk so their unexplored descendants are
/// still reached; callers decide which ids actually need a query.
pub fn child_level(tree: &ThreadTree, level: &[String]) -> Vec<String> {
    let mut next: Vec<String> = Vec::new();
    for id in level {
        for child in tree.children_of(id) {
            if !next.contains(child) {
                next.push(child.clone());
            }
        }
    }
    next
}
