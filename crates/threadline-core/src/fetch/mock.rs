use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::relay::{NoteFilter, RelayTransport};
use super::FetchError;
use crate::models::Note;

#[derive(Debug, Clone)]
pub(crate) struct RecordedQuery {
    /// `None` for the unified query
    pub relay: Option<String>,
    pub filter: NoteFilter,
}

/// In-memory relays answering filters like a real relay would: newest
/// first, truncated to `limit`.
pub(crate) struct MockTransport {
    relays: Vec<String>,
    notes: Mutex<HashMap<String, Vec<Note>>>,
    unified_fails: AtomicBool,
    failing_relays: Mutex<HashSet<String>>,
    rejected_refs: Mutex<HashSet<String>>,
    relay_delays: Mutex<HashMap<String, Duration>>,
    unified_delay: Mutex<Option<Duration>>,
    queries: Mutex<Vec<RecordedQuery>>,
}

impl MockTransport {
    pub fn new(relays: &[&str]) -> Self {
        Self {
            relays: relays.iter().map(|r| r.to_string()).collect(),
            notes: Mutex::new(HashMap::new()),
            unified_fails: AtomicBool::new(false),
            failing_relays: Mutex::new(HashSet::new()),
            rejected_refs: Mutex::new(HashSet::new()),
            relay_delays: Mutex::new(HashMap::new()),
            unified_delay: Mutex::new(None),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// One relay holding `notes`
    pub fn single(notes: Vec<Note>) -> Self {
        let transport = Self::new(&["wss://mock.relay"]);
        transport.add_notes("wss://mock.relay", notes);
        transport
    }

    pub fn add_notes(&self, relay: &str, notes: Vec<Note>) {
        self.notes
            .lock()
            .entry(relay.to_string())
            .or_default()
            .extend(notes);
    }

    pub fn fail_unified(&self, fail: bool) {
        self.unified_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_relay(&self, relay: &str) {
        self.failing_relays.lock().insert(relay.to_string());
    }

    /// Every relay rejects reply queries mentioning `id`
    pub fn reject_ref(&self, id: &str) {
        self.rejected_refs.lock().insert(id.to_string());
    }

    fn rejects(&self, filter: &NoteFilter) -> bool {
        let rejected = self.rejected_refs.lock();
        filter.e_refs.iter().any(|r| rejected.contains(r))
    }

    pub fn set_relay_delay(&self, relay: &str, delay: Duration) {
        self.relay_delays.lock().insert(relay.to_string(), delay);
    }

    pub fn set_unified_delay(&self, delay: Duration) {
        *self.unified_delay.lock() = Some(delay);
    }

    pub fn queries(&self) -> Vec<RecordedQuery> {
        self.queries.lock().clone()
    }

    /// Queries that asked for replies (`#e`), in order
    pub fn reply_queries(&self) -> Vec<RecordedQuery> {
        self.queries
            .lock()
            .iter()
            .filter(|q| !q.filter.e_refs.is_empty())
            .cloned()
            .collect()
    }

    pub fn clear_queries(&self) {
        self.queries.lock().clear();
    }

    fn record(&self, relay: Option<&str>, filter: &NoteFilter) {
        self.queries.lock().push(RecordedQuery {
            relay: relay.map(str::to_string),
            filter: filter.clone(),
        });
    }

    fn answer(&self, relay: Option<&str>, filter: &NoteFilter) -> Vec<Note> {
        let notes = self.notes.lock();
        let mut seen = HashSet::new();
        let mut matched: Vec<Note> = notes
            .iter()
            .filter(|(url, _)| relay.map_or(true, |r| r == url.as_str()))
            .flat_map(|(_, notes)| notes.iter())
            .filter(|note| filter.matches(note))
            .filter(|note| seen.insert(note.id.clone()))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }
}

#[async_trait]
impl RelayTransport for MockTransport {
    fn relay_urls(&self) -> Vec<String> {
        self.relays.clone()
    }

    async fn query(&self, filter: &NoteFilter, _timeout: Duration) -> Result<Vec<Note>, FetchError> {
        self.record(None, filter);
        let delay = *self.unified_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unified_fails.load(Ordering::SeqCst) || self.rejects(filter) {
            return Err(FetchError::Relay("unified query unavailable".to_string()));
        }
        Ok(self.answer(None, filter))
    }

    async fn query_relay(
        &self,
        relay: &str,
        filter: &NoteFilter,
        timeout: Duration,
    ) -> Result<Vec<Note>, FetchError> {
        self.record(Some(relay), filter);
        let delay = self.relay_delays.lock().get(relay).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_relays.lock().contains(relay) || self.rejects(filter) {
            return Err(FetchError::RelayTimeout {
                relay: relay.to_string(),
                after: timeout,
            });
        }
        Ok(self.answer(Some(relay), filter))
    }
}
