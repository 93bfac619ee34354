use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, warn};

use super::cancel::CancelSignal;
use super::relay::{NoteFilter, RelayTransport};
use super::FetchError;
use crate::config::EngineConfig;
use crate::constants::MAX_FILTER_REFS;
use crate::models::Note;
use crate::stats::SharedFetchStats;
use crate::store::PaginationFrontier;

/// Replies collected for one BFS level
#[derive(Debug, Clone, Default)]
pub struct ReplyBatch {
    pub notes: Vec<Note>,
    /// The per-level cap stopped pagination before relays ran dry
    pub truncated: bool,
    /// Where paging continues for each parent that was queried
    pub frontiers: HashMap<String, PaginationFrontier>,
    /// Parents whose replies could not be fetched at this level
    pub deferred: Vec<String>,
}

/// Replies for one chunk of parents, paged as a single stream
#[derive(Debug, Default)]
struct ChunkReplies {
    notes: Vec<Note>,
    truncated: bool,
    frontier: PaginationFrontier,
}

/// One page of older replies
#[derive(Debug, Clone, Default)]
pub struct ReplyPage {
    /// Replies not already at the frontier boundary
    pub notes: Vec<Note>,
    /// The frontier advanced past this page
    pub frontier: PaginationFrontier,
}

impl ReplyPage {
    pub fn has_more(&self) -> bool {
        self.frontier.has_more
    }
}

/// Turns reply and id lookups into budgeted relay queries
pub struct ReplyFetcher {
    transport: Arc<dyn RelayTransport>,
    stats: SharedFetchStats,
    unified_timeout: Duration,
    relay_budget: Duration,
    page_size: usize,
    max_per_level: usize,
}

impl ReplyFetcher {
    pub fn new(transport: Arc<dyn RelayTransport>, stats: SharedFetchStats, config: &EngineConfig) -> Self {
        Self {
            transport,
            stats,
            unified_timeout: config.unified_query_timeout(),
            relay_budget: config.relay_budget(),
            page_size: config.page_size.max(1),
            max_per_level: config.max_events_per_level.max(1),
        }
    }

    pub fn transport(&self) -> &Arc<dyn RelayTransport> {
        &self.transport
    }

    /// Fetch notes by id. Ids no relay has are simply absent from the result.
    pub async fn fetch_notes_by_id(&self, ids: &[String], cancel: &CancelSignal) -> Result<Vec<Note>, FetchError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = NoteFilter::by_ids(ids);
        let notes = self.query_with_fallback(&filter, cancel).await?;
        Ok(notes.into_iter().filter(|n| ids.contains(&n.id)).collect())
    }

    /// Every reply referencing one of `parent_ids`, up to the per-level cap.
    ///
    /// Large frontiers are split into chunks queried concurrently, sharing
    /// the cap. A failed chunk leaves its parents in `deferred`; the level
    /// fails only when no chunk succeeds.
    pub async fn fetch_replies(&self, parent_ids: &[String], cancel: &CancelSignal) -> Result<ReplyBatch, FetchError> {
        if parent_ids.is_empty() {
            return Ok(ReplyBatch::default());
        }

        let mut batch = ReplyBatch::default();
        let mut chunks: Vec<&[String]> = parent_ids.chunks(MAX_FILTER_REFS).collect();
        if chunks.len() > self.max_per_level {
            for chunk in chunks.split_off(self.max_per_level) {
                batch.deferred.extend(chunk.iter().cloned());
            }
            batch.truncated = true;
        }
        let chunk_cap = (self.max_per_level / chunks.len()).max(1);

        let results = join_all(
            chunks
                .iter()
                .map(|chunk| self.fetch_reply_chunk(chunk, chunk_cap, cancel)),
        )
        .await;

        let mut seen = HashSet::new();
        let mut first_error = None;
        let mut succeeded = 0;
        for (chunk, result) in chunks.iter().zip(results) {
            let replies = match result {
                Ok(replies) => replies,
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(e) => {
                    warn!(parents = chunk.len(), error = %e, "reply chunk failed, deferring its parents");
                    batch.deferred.extend(chunk.iter().cloned());
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            succeeded += 1;
            batch.truncated |= replies.truncated;
            for parent in chunk.iter() {
                batch.frontiers.insert(parent.clone(), replies.frontier.clone());
            }
            for note in replies.notes {
                if seen.insert(note.id.clone()) {
                    batch.notes.push(note);
                }
            }
        }

        if succeeded == 0 {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        debug!(
            parents = parent_ids.len(),
            replies = batch.notes.len(),
            deferred = batch.deferred.len(),
            "fetched reply level"
        );
        Ok(batch)
    }

    async fn fetch_reply_chunk(
        &self,
        parents: &[String],
        cap: usize,
        cancel: &CancelSignal,
    ) -> Result<ChunkReplies, FetchError> {
        let mut replies = ChunkReplies::default();
        let mut seen = HashSet::new();
        let mut until = None;

        loop {
            cancel.check()?;
            let filter = NoteFilter::replies_to(parents, self.page_size).until(until);
            let page = self.query_with_fallback(&filter, cancel).await?;
            let page_len = page.len();

            let mut added = 0;
            for note in page {
                // Relays occasionally ignore parts of a filter
                if !filter.matches(&note) {
                    continue;
                }
                if seen.contains(&note.id) {
                    continue;
                }
                if replies.notes.len() >= cap {
                    replies.truncated = true;
                    break;
                }
                until = Some(until.map_or(note.created_at, |u: u64| u.min(note.created_at)));
                replies.frontier.observe(&note);
                seen.insert(note.id.clone());
                replies.notes.push(note);
                added += 1;
            }

            if replies.truncated {
                break;
            }
            if replies.notes.len() >= cap {
                replies.truncated = page_len >= self.page_size;
                break;
            }
            // `until` is inclusive, so a page of only known notes means we are done
            if page_len < self.page_size || added == 0 {
                break;
            }
        }
        replies.frontier.has_more = replies.truncated;
        Ok(replies)
    }

    /// One page of replies to `parent_id` older than `frontier`, skipping ids
    /// already seen at its boundary.
    pub async fn fetch_reply_page(
        &self,
        parent_id: &str,
        frontier: &PaginationFrontier,
        cancel: &CancelSignal,
    ) -> Result<ReplyPage, FetchError> {
        let filter = NoteFilter::replies_to(&[parent_id.to_string()], self.page_size).until(frontier.last_seen_at);
        let page = self.query_with_fallback(&filter, cancel).await?;

        let mut next = frontier.clone();
        next.has_more = page.len() >= self.page_size;
        let mut notes = Vec::new();
        for note in page {
            if !filter.matches(&note) || frontier.seen_ids.contains(&note.id) {
                continue;
            }
            next.observe(&note);
            notes.push(note);
        }
        Ok(ReplyPage { notes, frontier: next })
    }

    /// Unified query first; on failure, each relay in turn within its budget.
    ///
    /// Single-relay failures are logged and skipped. Only when no relay
    /// answers at all is an error returned.
    pub async fn query_with_fallback(&self, filter: &NoteFilter, cancel: &CancelSignal) -> Result<Vec<Note>, FetchError> {
        let relays = self.transport.relay_urls();
        if relays.is_empty() {
            return Err(FetchError::NoRelays);
        }
        cancel.check()?;

        let unified = tokio::select! {
            result = self.transport.query(filter, self.unified_timeout) => result,
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        };
        match unified {
            Ok(notes) => {
                self.stats.record_unified_query(notes.len());
                return Ok(notes);
            }
            Err(e) => {
                self.stats.record_relay_failure("all");
                warn!(error = %e, "unified query failed, querying relays one by one");
            }
        }

        let started = Instant::now();
        let total_budget = self.relay_budget * relays.len() as u32;
        let mut merged = Vec::new();
        let mut seen = HashSet::new();
        let mut answered = 0;

        for relay in &relays {
            cancel.check()?;
            let remaining = total_budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                warn!(relay = %relay, "relay budget exhausted, skipping remaining relays");
                break;
            }
            let budget = self.relay_budget.min(remaining);

            let query = tokio::time::timeout(budget, self.transport.query_relay(relay, filter, budget));
            let result = tokio::select! {
                result = query => result.unwrap_or_else(|_| Err(FetchError::RelayTimeout {
                    relay: relay.clone(),
                    after: budget,
                })),
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            };

            match result {
                Ok(notes) => {
                    self.stats.record_relay_query(notes.len());
                    answered += 1;
                    for note in notes {
                        if seen.insert(note.id.clone()) {
                            merged.push(note);
                        }
                    }
                }
                Err(e) => {
                    self.stats.record_relay_failure(relay);
                    warn!(relay = %relay, error = %e, "relay query failed, skipping");
                }
            }
        }

        if answered == 0 {
            return Err(FetchError::Relay("no relay answered".to_string()));
        }
        Ok(merged)
    }
}
