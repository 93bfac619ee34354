use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::models::Note;
use crate::resolver::ResolvedPatch;

/// Get current Unix timestamp in seconds
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// UI-facing status flags, independent of the data itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadStatus {
    pub is_loading: bool,
    pub has_more: bool,
    pub last_updated: Option<u64>,
    /// Set only when the thread could not be loaded at all
    pub error: Option<String>,
}

/// Oldest point reached when paging the replies to one parent.
///
/// `until` filters are inclusive, so ids already seen at `last_seen_at` are
/// remembered to drop the overlap on the next page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationFrontier {
    pub last_seen_at: Option<u64>,
    pub seen_ids: HashSet<String>,
    /// The last query stopped before relays ran out of replies
    pub has_more: bool,
}

impl PaginationFrontier {
    /// Advance past `note`; notes must be observed newest first
    pub(crate) fn observe(&mut self, note: &Note) {
        match self.last_seen_at {
            Some(oldest) if note.created_at > oldest => {}
            Some(oldest) if note.created_at == oldest => {
                self.seen_ids.insert(note.id.clone());
            }
            _ => {
                self.last_seen_at = Some(note.created_at);
                self.seen_ids.clear();
                self.seen_ids.insert(note.id.clone());
            }
        }
    }
}

/// Normalized state for one conversation root
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadState {
    pub root_id: String,
    pub notes: HashMap<String, Note>,
    /// parent id -> ordered child ids, as last computed by the resolver
    pub children: HashMap<String, Vec<String>>,
    pub current_parent_id: String,
    pub direct_children: Vec<String>,
    pub status: ThreadStatus,
    /// Reply pagination per parent id
    pub frontiers: HashMap<String, PaginationFrontier>,
}

impl ThreadState {
    fn new(root_id: &str, initial_parent_id: &str) -> Self {
        Self {
            root_id: root_id.to_string(),
            notes: HashMap::new(),
            children: HashMap::new(),
            current_parent_id: initial_parent_id.to_string(),
            direct_children: Vec::new(),
            status: ThreadStatus::default(),
            frontiers: HashMap::new(),
        }
    }

    fn recompute_direct_children(&mut self) {
        self.direct_children = self
            .children
            .get(&self.current_parent_id)
            .cloned()
            .unwrap_or_default();
    }

    fn refresh_has_more(&mut self) {
        self.status.has_more = self
            .frontiers
            .get(&self.current_parent_id)
            .is_some_and(|f| f.has_more);
    }
}

/// Per-root store of notes and resolved child lists.
///
/// Mutations cannot fail. Operations on a root that was never initialized
/// are ignored; errors from fetching are reported through [`ThreadStatus`].
#[derive(Debug, Default)]
pub struct ThreadStore {
    threads: HashMap<String, ThreadState>,
}

impl ThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create state for `root_id` unless it already exists.
    /// Returns true when a new entry was created.
    pub fn init_thread(&mut self, root_id: &str, initial_parent_id: &str) -> bool {
        if self.threads.contains_key(root_id) {
            return false;
        }
        self.threads.insert(
            root_id.to_string(),
            ThreadState::new(root_id, initial_parent_id),
        );
        true
    }

    /// Merge notes by id. Relationship indices are left untouched.
    pub fn ingest_notes(&mut self, root_id: &str, notes: &[Note]) {
        let Some(state) = self.threads.get_mut(root_id) else {
            return;
        };
        for note in notes {
            state.notes.insert(note.id.clone(), note.clone());
        }
    }

    /// Replace child lists for every parent in the patch
    pub fn apply_worker_patch(&mut self, root_id: &str, patch: &ResolvedPatch) {
        let Some(state) = self.threads.get_mut(root_id) else {
            return;
        };
        for (parent, children) in &patch.children {
            state.children.insert(parent.clone(), children.clone());
        }
        state.recompute_direct_children();
        state.status.last_updated = Some(now_secs());
    }

    pub fn set_current_parent_id(&mut self, root_id: &str, parent_id: &str) {
        if let Some(state) = self.threads.get_mut(root_id) {
            state.current_parent_id = parent_id.to_string();
            state.recompute_direct_children();
            state.refresh_has_more();
        }
    }

    pub fn set_loading(&mut self, root_id: &str, is_loading: bool) {
        if let Some(state) = self.threads.get_mut(root_id) {
            state.status.is_loading = is_loading;
        }
    }

    /// Replace the pagination frontier of `parent_id`. `has_more` in the
    /// status follows the frontier of the current parent.
    pub fn record_frontier(&mut self, root_id: &str, parent_id: &str, frontier: PaginationFrontier) {
        if let Some(state) = self.threads.get_mut(root_id) {
            state.frontiers.insert(parent_id.to_string(), frontier);
            state.refresh_has_more();
        }
    }

    pub fn frontier(&self, root_id: &str, parent_id: &str) -> Option<&PaginationFrontier> {
        self.threads.get(root_id)?.frontiers.get(parent_id)
    }

    pub fn set_error(&mut self, root_id: &str, error: Option<String>) {
        if let Some(state) = self.threads.get_mut(root_id) {
            state.status.error = error;
        }
    }

    pub fn remove_thread(&mut self, root_id: &str) -> Option<ThreadState> {
        self.threads.remove(root_id)
    }

    pub fn state(&self, root_id: &str) -> Option<&ThreadState> {
        self.threads.get(root_id)
    }

    pub fn status(&self, root_id: &str) -> Option<ThreadStatus> {
        self.threads.get(root_id).map(|s| s.status.clone())
    }

    pub fn note(&self, root_id: &str, id: &str) -> Option<&Note> {
        self.threads.get(root_id)?.notes.get(id)
    }

    /// Look a note up in any thread
    pub fn find_note(&self, id: &str) -> Option<&Note> {
        self.threads.values().find_map(|state| state.notes.get(id))
    }

    pub fn current_parent_note(&self, root_id: &str) -> Option<&Note> {
        let state = self.threads.get(root_id)?;
        state.notes.get(&state.current_parent_id)
    }

    /// Direct children of the current parent, in thread order
    pub fn direct_children_notes(&self, root_id: &str) -> Vec<&Note> {
        match self.threads.get(root_id) {
            Some(state) => state
                .direct_children
                .iter()
                .filter_map(|id| state.notes.get(id))
                .collect(),
            None => Vec::new(),
        }
    }

    /// All notes known for a root (used as resolver input)
    pub fn known_notes(&self, root_id: &str) -> Vec<Note> {
        self.threads
            .get(root_id)
            .map(|state| state.notes.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn roots(&self) -> Vec<String> {
        self.threads.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThreadPolicy;
    use crate::resolver::resolve_batch;
    use crate::test_support::{id, note, reply_tag, root_tag};

    fn store_with_thread() -> ThreadStore {
        let mut store = ThreadStore::new();
        store.init_thread(&id(1), &id(1));
        store
    }

    #[test]
    fn test_init_thread_preserves_existing_state() {
        let mut store = store_with_thread();
        store.ingest_notes(&id(1), &[note(1, 10, vec![])]);

        assert!(!store.init_thread(&id(1), &id(2)));
        let state = store.state(&id(1)).unwrap();
        assert_eq!(state.notes.len(), 1);
        assert_eq!(state.current_parent_id, id(1));
    }

    #[test]
    fn test_ingest_does_not_touch_children_index() {
        let mut store = store_with_thread();
        store.ingest_notes(&id(1), &[note(1, 10, vec![]), note(2, 20, vec![root_tag(1)])]);

        let state = store.state(&id(1)).unwrap();
        assert_eq!(state.notes.len(), 2);
        assert!(state.children.is_empty());
        assert!(state.direct_children.is_empty());
    }

    #[test]
    fn test_apply_patch_updates_direct_children() {
        let mut store = store_with_thread();
        let notes = vec![
            note(1, 10, vec![]),
            note(2, 30, vec![root_tag(1)]),
            note(3, 20, vec![root_tag(1)]),
        ];
        store.ingest_notes(&id(1), &notes);
        let patch = resolve_batch(&[], &notes, &ThreadPolicy::default());
        store.apply_worker_patch(&id(1), &patch);

        let children: Vec<&str> = store
            .direct_children_notes(&id(1))
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(children, vec![id(3).as_str(), id(2).as_str()]);
        assert!(store.status(&id(1)).unwrap().last_updated.is_some());
    }

    #[test]
    fn test_patch_overwrites_per_parent_entries() {
        let mut store = store_with_thread();
        let mut patch = ResolvedPatch::default();
        patch.children.insert(id(1), vec![id(2)]);
        store.apply_worker_patch(&id(1), &patch);

        patch.children.insert(id(1), vec![id(3), id(2)]);
        store.apply_worker_patch(&id(1), &patch);

        assert_eq!(store.state(&id(1)).unwrap().direct_children, vec![id(3), id(2)]);
    }

    #[test]
    fn test_set_current_parent_recomputes_from_index() {
        let mut store = store_with_thread();
        let notes = vec![
            note(1, 10, vec![]),
            note(2, 20, vec![root_tag(1)]),
            note(3, 30, vec![root_tag(1), reply_tag(2)]),
        ];
        store.ingest_notes(&id(1), &notes);
        store.apply_worker_patch(&id(1), &resolve_batch(&[], &notes, &ThreadPolicy::default()));

        store.set_current_parent_id(&id(1), &id(2));
        assert_eq!(store.current_parent_note(&id(1)).unwrap().id, id(2));
        assert_eq!(store.state(&id(1)).unwrap().direct_children, vec![id(3)]);
    }

    #[test]
    fn test_status_flags_are_independent_of_data() {
        let mut store = store_with_thread();
        store.set_loading(&id(1), true);
        store.record_frontier(
            &id(1),
            &id(1),
            PaginationFrontier {
                has_more: true,
                ..Default::default()
            },
        );
        store.set_error(&id(1), Some("failed to load thread".to_string()));

        let status = store.status(&id(1)).unwrap();
        assert!(status.is_loading);
        assert!(status.has_more);
        assert_eq!(status.error.as_deref(), Some("failed to load thread"));
        assert!(store.state(&id(1)).unwrap().notes.is_empty());
    }

    #[test]
    fn test_unknown_root_is_ignored() {
        let mut store = ThreadStore::new();
        store.ingest_notes(&id(9), &[note(1, 10, vec![])]);
        store.set_loading(&id(9), true);
        assert!(store.state(&id(9)).is_none());
        assert!(store.find_note(&id(1)).is_none());
    }

    #[test]
    fn test_frontier_observes_oldest_note() {
        let mut frontier = PaginationFrontier::default();
        for n in [note(2, 30, vec![]), note(3, 20, vec![]), note(4, 20, vec![])] {
            frontier.observe(&n);
        }
        assert_eq!(frontier.last_seen_at, Some(20));
        assert_eq!(frontier.seen_ids.len(), 2);
        assert!(frontier.seen_ids.contains(&id(3)));
        assert!(frontier.seen_ids.contains(&id(4)));
    }

    #[test]
    fn test_has_more_follows_current_parent() {
        let mut store = store_with_thread();
        store.ingest_notes(&id(1), &[note(50, 500, vec![root_tag(1), reply_tag(2)])]);
        store.record_frontier(
            &id(1),
            &id(2),
            PaginationFrontier {
                last_seen_at: Some(500),
                seen_ids: [id(50)].into_iter().collect(),
                has_more: true,
            },
        );
        // Another parent's frontier does not leak into the root's status
        assert!(!store.status(&id(1)).unwrap().has_more);
        assert!(store.frontier(&id(1), &id(1)).is_none());

        store.set_current_parent_id(&id(1), &id(2));
        assert!(store.status(&id(1)).unwrap().has_more);
        store.set_current_parent_id(&id(1), &id(1));
        assert!(!store.status(&id(1)).unwrap().has_more);
    }
}
