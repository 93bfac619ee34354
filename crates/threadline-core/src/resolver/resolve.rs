//! Parent/child resolution over NIP-10 `e` tags.
//!
//! Resolution order for a note's direct parent:
//! 1. the `reply`-marked reference
//! 2. the `root`-marked reference (a direct reply to the root)
//! 3. with no markers at all, the last `e` tag (deprecated positional scheme),
//!    if [`ThreadPolicy::legacy_positional_parent`] allows it

use std::collections::{BTreeSet, HashMap};

use crate::config::ThreadPolicy;
use crate::models::note::thread_order;
use crate::models::{Marker, Note};
use crate::models::tag_utils::find_marked;

/// Parent -> children lists for parents touched by a batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPatch {
    /// Complete, sorted child list for each parent that gained a child.
    /// Computed over every known note, so it replaces the previous entry.
    pub children: HashMap<String, Vec<String>>,
    /// The incoming notes, echoed back
    pub notes: Vec<Note>,
}

impl ResolvedPatch {
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// Direct parent of a note, if one can be resolved from its tags
pub fn resolve_parent(note: &Note, policy: &ThreadPolicy) -> Option<String> {
    let refs = note.e_tags();

    let parent = find_marked(&refs, &Marker::Reply)
        .or_else(|| find_marked(&refs, &Marker::Root))
        .or_else(|| {
            let unmarked = refs.iter().all(|r| r.marker.is_none());
            if policy.legacy_positional_parent && unmarked {
                refs.last()
            } else {
                None
            }
        })?;

    if parent.id == note.id {
        return None;
    }
    Some(parent.id.clone())
}

/// Root id claimed by the note's own `root` marker
pub fn root_claim(note: &Note) -> Option<String> {
    let refs = note.e_tags();
    find_marked(&refs, &Marker::Root)
        .filter(|r| r.id != note.id)
        .map(|r| r.id.clone())
}

/// Resolve a batch of incoming notes against everything already known.
///
/// Only parents that gained a child from `incoming` appear in the patch; their
/// child lists are recomputed from `known ∪ incoming`.
pub fn resolve_batch(known: &[Note], incoming: &[Note], policy: &ThreadPolicy) -> ResolvedPatch {
    let mut by_id: HashMap<&str, &Note> = HashMap::with_capacity(known.len() + incoming.len());
    for note in known.iter().chain(incoming.iter()) {
        by_id.entry(note.id.as_str()).or_insert(note);
    }

    let affected: BTreeSet<String> = incoming
        .iter()
        .filter(|note| note.is_text_note())
        .filter_map(|note| resolve_parent(note, policy))
        .collect();

    let mut grouped: HashMap<String, Vec<&Note>> = HashMap::new();
    if !affected.is_empty() {
        for note in by_id.values().filter(|note| note.is_text_note()) {
            if let Some(parent) = resolve_parent(note, policy) {
                if affected.contains(&parent) {
                    grouped.entry(parent).or_default().push(note);
                }
            }
        }
    }

    let children = grouped
        .into_iter()
        .map(|(parent, mut notes)| {
            notes.sort_by(|a, b| thread_order(a, b));
            (parent, notes.into_iter().map(|n| n.id.clone()).collect())
        })
        .collect();

    ResolvedPatch {
        children,
        notes: incoming.to_vec(),
    }
}
