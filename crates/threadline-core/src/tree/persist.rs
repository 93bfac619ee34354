//! Session-scoped persistence for reply trees.
//!
//! Each tree is stored under `thread-tree:<root id>` as a versioned JSON
//! envelope. An envelope is discarded (and removed) on load when:
//! - `TREE_SCHEMA_VERSION` differs from the stored one
//! - the value is missing or corrupt
//! - it is older than the configured maximum age

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::TREE_KEY_PREFIX;
use crate::models::ThreadTree;
use crate::store::thread_store::now_secs;
use crate::store::{KvStore, StorageError};

/// Bump whenever `ThreadTree` or `Note` change shape
pub const TREE_SCHEMA_VERSION: u32 = 1;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TreeEnvelopeRef<'a> {
    schema_version: u32,
    saved_at: u64,
    tree: &'a ThreadTree,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TreeEnvelope {
    schema_version: u32,
    saved_at: u64,
    tree: ThreadTree,
}

/// Just the header, so garbage collection does not decode whole trees
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeHeader {
    schema_version: u32,
    saved_at: u64,
}

pub fn tree_key(root_id: &str) -> String {
    format!("{}{}", TREE_KEY_PREFIX, root_id)
}

#[derive(Clone)]
pub struct TreePersistence {
    store: Arc<dyn KvStore>,
    max_age: Duration,
}

impl TreePersistence {
    pub fn new(store: Arc<dyn KvStore>, max_age: Duration) -> Self {
        Self { store, max_age }
    }

    pub fn save(&self, tree: &ThreadTree) -> Result<(), StorageError> {
        self.save_at(tree, now_secs())
    }

    pub(crate) fn save_at(&self, tree: &ThreadTree, saved_at: u64) -> Result<(), StorageError> {
        let envelope = TreeEnvelopeRef {
            schema_version: TREE_SCHEMA_VERSION,
            saved_at,
            tree,
        };
        let json = serde_json::to_string(&envelope)?;
        self.store.set(&tree_key(&tree.root_id), &json)
    }

    /// Load the tree for `root_id`, or `None` if absent, stale or unreadable.
    pub fn load(&self, root_id: &str) -> Option<ThreadTree> {
        self.load_at(root_id, now_secs())
    }

    pub(crate) fn load_at(&self, root_id: &str, now: u64) -> Option<ThreadTree> {
        let key = tree_key(root_id);
        let json = match self.store.get(&key) {
            Ok(Some(json)) => json,
            Ok(None) => return None,
            Err(e) => {
                warn!(root = %root_id, error = %e, "failed to read persisted tree");
                return None;
            }
        };

        let envelope: TreeEnvelope = match serde_json::from_str(&json) {
            Ok(envelope) => envelope,
            Err(e) => {
                info!(root = %root_id, error = %e, "persisted tree is corrupt, discarding");
                self.discard(&key);
                return None;
            }
        };

        if envelope.schema_version != TREE_SCHEMA_VERSION {
            info!(
                root = %root_id,
                cached = envelope.schema_version,
                current = TREE_SCHEMA_VERSION,
                "persisted tree schema mismatch, discarding"
            );
            self.discard(&key);
            return None;
        }

        if self.is_expired(envelope.saved_at, now) {
            info!(
                root = %root_id,
                age_secs = now.saturating_sub(envelope.saved_at),
                "persisted tree too old, discarding"
            );
            self.discard(&key);
            return None;
        }

        if envelope.tree.root_id != root_id {
            warn!(root = %root_id, stored = %envelope.tree.root_id, "persisted tree root mismatch");
            self.discard(&key);
            return None;
        }

        debug!(root = %root_id, nodes = envelope.tree.len(), "restored persisted tree");
        Some(envelope.tree)
    }

    pub fn remove(&self, root_id: &str) -> Result<(), StorageError> {
        self.store.remove(&tree_key(root_id))
    }

    /// Remove every expired or unreadable tree. Returns how many were removed.
    pub fn collect_garbage(&self) -> Result<usize, StorageError> {
        self.collect_garbage_at(now_secs())
    }

    pub(crate) fn collect_garbage_at(&self, now: u64) -> Result<usize, StorageError> {
        let mut removed = 0;
        for key in self.store.keys()? {
            if !key.starts_with(TREE_KEY_PREFIX) {
                continue;
            }
            let keep = match self.store.get(&key)? {
                Some(json) => match serde_json::from_str::<EnvelopeHeader>(&json) {
                    Ok(header) => {
                        header.schema_version == TREE_SCHEMA_VERSION
                            && !self.is_expired(header.saved_at, now)
                    }
                    Err(_) => false,
                },
                None => true,
            };
            if !keep {
                self.store.remove(&key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "collected expired thread trees");
        }
        Ok(removed)
    }

    fn is_expired(&self, saved_at: u64, now: u64) -> bool {
        now.saturating_sub(saved_at) > self.max_age.as_secs()
    }

    fn discard(&self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            warn!(%key, error = %e, "failed to remove discarded tree");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThreadPolicy;
    use crate::store::{FileKvStore, MemoryKvStore};
    use crate::test_support::{id, note, reply_tag, root_tag};
    use crate::tree::merge::merge_notes_into_tree;

    const HOUR: u64 = 60 * 60;

    fn sample_tree() -> ThreadTree {
        let notes = vec![
            note(1, 10, vec![]),
            note(2, 30, vec![root_tag(1)]),
            note(3, 20, vec![root_tag(1), reply_tag(2)]),
            note(4, 40, vec![root_tag(1), reply_tag(9)]),
        ];
        merge_notes_into_tree(&ThreadTree::new(id(1)), &notes, &[id(1), id(8)], &ThreadPolicy::default())
    }

    fn persistence(store: Arc<dyn KvStore>) -> TreePersistence {
        TreePersistence::new(store, Duration::from_secs(6 * HOUR))
    }

    #[test]
    fn test_restores_identical_structure() {
        let persistence = persistence(Arc::new(MemoryKvStore::new()));
        let tree = sample_tree();
        persistence.save(&tree).unwrap();

        let restored = persistence.load(&id(1)).unwrap();
        assert_eq!(restored, tree);
        assert!(restored.is_pending(&id(9)));
        assert!(restored.children_fetch_attempted(&id(8)));
    }

    #[test]
    fn test_stale_tree_is_discarded_on_load() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let persistence = persistence(store.clone());
        persistence.save_at(&sample_tree(), 1_000).unwrap();

        assert!(persistence.load_at(&id(1), 1_000 + 5 * HOUR).is_some());
        assert!(persistence.load_at(&id(1), 1_000 + 7 * HOUR).is_none());
        assert!(store.get(&tree_key(&id(1))).unwrap().is_none());
    }

    #[test]
    fn test_schema_mismatch_is_discarded() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let persistence = persistence(store.clone());
        persistence.save(&sample_tree()).unwrap();

        let json = store.get(&tree_key(&id(1))).unwrap().unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["schemaVersion"] = serde_json::json!(TREE_SCHEMA_VERSION + 1);
        store.set(&tree_key(&id(1)), &value.to_string()).unwrap();

        assert!(persistence.load(&id(1)).is_none());
        assert!(store.get(&tree_key(&id(1))).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_value_is_discarded() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        store.set(&tree_key(&id(1)), "{not json").unwrap();

        assert!(persistence(store.clone()).load(&id(1)).is_none());
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn test_garbage_collection_removes_only_expired_trees() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let persistence = persistence(store.clone());

        let fresh = sample_tree();
        let stale = ThreadTree::new(id(50));
        persistence.save_at(&fresh, 10 * HOUR).unwrap();
        persistence.save_at(&stale, HOUR).unwrap();
        store.set("unrelated", "kept").unwrap();

        let removed = persistence.collect_garbage_at(10 * HOUR + 60).unwrap();
        assert_eq!(removed, 1);
        assert!(persistence.load_at(&id(1), 10 * HOUR + 60).is_some());
        assert!(store.get(&tree_key(&id(50))).unwrap().is_none());
        assert_eq!(store.get("unrelated").unwrap().as_deref(), Some("kept"));
    }

    #[test]
    fn test_file_backed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let tree = sample_tree();
        {
            let store: Arc<dyn KvStore> = Arc::new(FileKvStore::new(dir.path()).unwrap());
            persistence(store).save(&tree).unwrap();
        }

        let store: Arc<dyn KvStore> = Arc::new(FileKvStore::new(dir.path()).unwrap());
        assert_eq!(persistence(store).load(&id(1)), Some(tree));
    }
}
