//! Root discovery: find the conversation root for an arbitrary note id.
//!
//! A note's root never changes once published, so complete answers are
//! memoized for the whole session. The memo is bounded and evicts the
//! oldest entries first.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ThreadPolicy;
use crate::fetch::FetchError;
use crate::models::Note;
use crate::resolver::{resolve_parent, root_claim};

/// Note lookup used by the walk: local caches first, then relays.
#[async_trait]
pub trait NoteLookup: Send + Sync {
    /// `Ok(None)` when no source has the note
    async fn lookup(&self, id: &str) -> Result<Option<Note>, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// The walk reached a note with no parent, or a trusted root marker
    Complete(String),
    /// The walk stopped early; `root_id` is the last ancestor that resolved
    Partial { root_id: String, reason: String },
}

impl DiscoveryOutcome {
    pub fn root_id(&self) -> &str {
        match self {
            DiscoveryOutcome::Complete(root_id) => root_id,
            DiscoveryOutcome::Partial { root_id, .. } => root_id,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, DiscoveryOutcome::Complete(_))
    }
}

struct RootMemo {
    roots: HashMap<String, String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RootMemo {
    fn new(capacity: usize) -> Self {
        Self {
            roots: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, id: &str) -> Option<String> {
        self.roots.get(id).cloned()
    }

    fn insert(&mut self, id: String, root_id: String) {
        if self.capacity == 0 {
            return;
        }
        if self.roots.insert(id.clone(), root_id).is_none() {
            self.order.push_back(id);
        }
        while self.roots.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.roots.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

pub struct RootDiscovery {
    memo: Mutex<RootMemo>,
    policy: ThreadPolicy,
    max_walk_depth: usize,
}

impl RootDiscovery {
    pub fn new(policy: ThreadPolicy, max_walk_depth: usize, capacity: usize) -> Self {
        Self {
            memo: Mutex::new(RootMemo::new(capacity)),
            policy,
            max_walk_depth,
        }
    }

    /// Memoized root for `id`, without touching the network
    pub fn cached_root(&self, id: &str) -> Option<String> {
        self.memo.lock().get(id)
    }

    /// Walk ancestors of `id` until a root is found. Never fails: when a
    /// lookup fails midway the last resolved ancestor is returned as a
    /// partial answer, which is not memoized.
    pub async fn discover(&self, id: &str, lookup: &dyn NoteLookup) -> DiscoveryOutcome {
        if let Some(root_id) = self.cached_root(id) {
            return DiscoveryOutcome::Complete(root_id);
        }

        let mut visited: Vec<String> = Vec::new();
        let mut last_resolved: Option<String> = None;
        let mut current = id.to_string();

        for _ in 0..=self.max_walk_depth {
            if let Some(root_id) = self.cached_root(&current) {
                return self.complete(&visited, root_id);
            }
            if visited.contains(&current) {
                return self.partial(id, last_resolved, format!("reply cycle at {}", current));
            }
            visited.push(current.clone());

            let note = match lookup.lookup(&current).await {
                Ok(Some(note)) => note,
                Ok(None) => {
                    return self.partial(id, last_resolved, format!("note {} not found", current));
                }
                Err(e) => {
                    return self.partial(id, last_resolved, format!("lookup of {} failed: {}", current, e));
                }
            };
            last_resolved = Some(note.id.clone());

            if let Some(claimed) = root_claim(&note) {
                if self.policy.trust_root_marker {
                    return self.complete(&visited, claimed);
                }
                match lookup.lookup(&claimed).await {
                    Ok(Some(root)) => return self.complete(&visited, root.id),
                    Ok(None) | Err(_) => {
                        debug!(note = %note.id, root = %claimed, "claimed root unreachable, walking parents");
                    }
                }
            }

            match resolve_parent(&note, &self.policy) {
                Some(parent) => current = parent,
                None => return self.complete(&visited, note.id),
            }
        }

        self.partial(id, last_resolved, "walk depth exceeded".to_string())
    }

    fn complete(&self, visited: &[String], root_id: String) -> DiscoveryOutcome {
        let mut memo = self.memo.lock();
        for id in visited {
            memo.insert(id.clone(), root_id.clone());
        }
        memo.insert(root_id.clone(), root_id.clone());
        DiscoveryOutcome::Complete(root_id)
    }

    fn partial(&self, id: &str, last_resolved: Option<String>, reason: String) -> DiscoveryOutcome {
        let root_id = last_resolved.unwrap_or_else(|| id.to_string());
        warn!(note = %id, root = %root_id, %reason, "root discovery incomplete");
        DiscoveryOutcome::Partial { root_id, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::test_support::{id, note, plain_tag, reply_tag, root_tag};

    struct CountingLookup {
        notes: HashMap<String, Note>,
        failing: Vec<String>,
        calls: AtomicUsize,
    }

    impl CountingLookup {
        fn new(notes: Vec<Note>) -> Self {
            Self {
                notes: notes.into_iter().map(|n| (n.id.clone(), n)).collect(),
                failing: Vec::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NoteLookup for CountingLookup {
        async fn lookup(&self, id: &str) -> Result<Option<Note>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.iter().any(|f| f == id) {
                return Err(FetchError::Relay("connection reset".to_string()));
            }
            Ok(self.notes.get(id).cloned())
        }
    }

    fn discovery() -> RootDiscovery {
        RootDiscovery::new(ThreadPolicy::default(), 32, 100)
    }

    fn thread() -> Vec<Note> {
        vec![
            note(1, 10, vec![]),
            note(2, 20, vec![root_tag(1)]),
            note(4, 40, vec![root_tag(1), reply_tag(2)]),
        ]
    }

    #[tokio::test]
    async fn test_reply_with_root_marker_resolves_to_root() {
        let lookup = CountingLookup::new(thread());
        let outcome = discovery().discover(&id(4), &lookup).await;
        assert_eq!(outcome, DiscoveryOutcome::Complete(id(1)));
    }

    #[tokio::test]
    async fn test_second_discovery_is_memoized() {
        let discovery = discovery();
        let lookup = CountingLookup::new(thread());

        let first = discovery.discover(&id(4), &lookup).await;
        let calls = lookup.calls();
        let second = discovery.discover(&id(4), &lookup).await;

        assert_eq!(first, second);
        assert_eq!(lookup.calls(), calls);
        assert_eq!(discovery.cached_root(&id(1)), Some(id(1)));
    }

    #[tokio::test]
    async fn test_top_level_note_is_its_own_root() {
        let lookup = CountingLookup::new(thread());
        let outcome = discovery().discover(&id(1), &lookup).await;
        assert_eq!(outcome, DiscoveryOutcome::Complete(id(1)));
    }

    #[tokio::test]
    async fn test_unreachable_root_marker_is_trusted() {
        // Root id(1) is not available anywhere
        let lookup = CountingLookup::new(vec![note(2, 20, vec![root_tag(1)])]);
        let outcome = discovery().discover(&id(2), &lookup).await;
        assert_eq!(outcome, DiscoveryOutcome::Complete(id(1)));
        assert_eq!(lookup.calls(), 1);
    }

    #[tokio::test]
    async fn test_untrusted_root_marker_walks_reply_chain() {
        let policy = ThreadPolicy {
            trust_root_marker: false,
            ..ThreadPolicy::default()
        };
        let discovery = RootDiscovery::new(policy, 32, 100);
        // id(4) claims root id(9), which does not exist; its reply parent does
        let lookup = CountingLookup::new(vec![
            note(1, 10, vec![]),
            note(2, 20, vec![plain_tag(1)]),
            note(4, 40, vec![root_tag(9), reply_tag(2)]),
        ]);

        let outcome = discovery.discover(&id(4), &lookup).await;
        assert_eq!(outcome, DiscoveryOutcome::Complete(id(1)));
    }

    #[tokio::test]
    async fn test_legacy_chain_is_walked() {
        let lookup = CountingLookup::new(vec![
            note(1, 10, vec![]),
            note(2, 20, vec![plain_tag(1)]),
            note(3, 30, vec![plain_tag(1), plain_tag(2)]),
        ]);
        let discovery = discovery();
        let outcome = discovery.discover(&id(3), &lookup).await;
        assert_eq!(outcome, DiscoveryOutcome::Complete(id(1)));
        // Every id on the walk shares the answer
        assert_eq!(discovery.cached_root(&id(2)), Some(id(1)));
    }

    #[tokio::test]
    async fn test_failed_ancestor_fetch_returns_last_resolved() {
        let mut lookup = CountingLookup::new(vec![
            note(2, 20, vec![plain_tag(1)]),
            note(3, 30, vec![plain_tag(1), plain_tag(2)]),
        ]);
        lookup.failing.push(id(1));
        let discovery = discovery();

        let outcome = discovery.discover(&id(3), &lookup).await;
        assert_eq!(outcome.root_id(), id(2));
        assert!(!outcome.is_complete());
        assert_eq!(discovery.cached_root(&id(3)), None);
    }

    #[tokio::test]
    async fn test_cycle_stops_the_walk() {
        let lookup = CountingLookup::new(vec![
            note(2, 20, vec![plain_tag(3)]),
            note(3, 30, vec![plain_tag(2)]),
        ]);
        let outcome = discovery().discover(&id(2), &lookup).await;
        assert!(!outcome.is_complete());
        assert_eq!(outcome.root_id(), id(3));
    }

    #[tokio::test]
    async fn test_missing_target_is_partial() {
        let lookup = CountingLookup::new(vec![]);
        let outcome = discovery().discover(&id(5), &lookup).await;
        assert_eq!(outcome.root_id(), id(5));
        assert!(!outcome.is_complete());
    }

    #[test]
    fn test_memo_evicts_oldest_first() {
        let mut memo = RootMemo::new(2);
        memo.insert(id(1), id(1));
        memo.insert(id(2), id(1));
        memo.insert(id(3), id(1));
        assert_eq!(memo.get(&id(1)), None);
        assert_eq!(memo.get(&id(3)), Some(id(1)));
        assert_eq!(memo.roots.len(), 2);
    }
}
