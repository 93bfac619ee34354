use std::time::{Duration, Instant};

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use tracing::{debug, info, warn};

use super::FetchError;
use crate::constants::kinds;
use crate::models::Note;

/// Transport-neutral query: `kinds`, `ids`, `#e`, `limit`, `until`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteFilter {
    pub kinds: Vec<u16>,
    pub ids: Vec<String>,
    /// Values for the `#e` tag filter
    pub e_refs: Vec<String>,
    pub limit: Option<usize>,
    pub until: Option<u64>,
}

impl NoteFilter {
    /// Text notes referencing any of `parents` through an `e` tag
    pub fn replies_to(parents: &[String], limit: usize) -> Self {
        Self {
            kinds: vec![kinds::TEXT_NOTE],
            e_refs: parents.to_vec(),
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn by_ids(ids: &[String]) -> Self {
        Self {
            ids: ids.to_vec(),
            limit: Some(ids.len()),
            ..Default::default()
        }
    }

    pub fn until(mut self, until: Option<u64>) -> Self {
        self.until = until;
        self
    }

    /// Local evaluation, used to apply a filter to cached or mocked notes
    pub fn matches(&self, note: &Note) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&note.kind) {
            return false;
        }
        if !self.ids.is_empty() && !self.ids.contains(&note.id) {
            return false;
        }
        if !self.e_refs.is_empty() && !note.e_tags().iter().any(|r| self.e_refs.contains(&r.id)) {
            return false;
        }
        match self.until {
            Some(until) => note.created_at <= until,
            None => true,
        }
    }

    pub fn to_nostr_filter(&self) -> Result<Filter, FetchError> {
        if self.ids.is_empty() && self.e_refs.is_empty() {
            return Err(FetchError::InvalidFilter(
                "filter needs ids or #e references".to_string(),
            ));
        }

        let mut filter = Filter::new();
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds.iter().map(|k| Kind::from(*k)));
        }
        if !self.ids.is_empty() {
            filter = filter.ids(parse_ids(&self.ids)?);
        }
        if !self.e_refs.is_empty() {
            filter = filter.events(parse_ids(&self.e_refs)?);
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        if let Some(until) = self.until {
            filter = filter.until(Timestamp::from(until));
        }
        Ok(filter)
    }
}

fn parse_ids(ids: &[String]) -> Result<Vec<EventId>, FetchError> {
    ids.iter()
        .map(|id| {
            EventId::from_hex(id)
                .map_err(|e| FetchError::InvalidFilter(format!("bad event id {}: {}", id, e)))
        })
        .collect()
}

/// The relay pool as seen by the fetch layer
#[async_trait]
pub trait RelayTransport: Send + Sync {
    fn relay_urls(&self) -> Vec<String>;

    /// One query fanned out to every relay, results merged by the pool
    async fn query(&self, filter: &NoteFilter, timeout: Duration) -> Result<Vec<Note>, FetchError>;

    /// One query against a single relay
    async fn query_relay(
        &self,
        relay: &str,
        filter: &NoteFilter,
        timeout: Duration,
    ) -> Result<Vec<Note>, FetchError>;
}

/// [`RelayTransport`] over a nostr-sdk [`Client`]
pub struct NostrRelayTransport {
    client: Client,
    relays: Vec<String>,
}

impl NostrRelayTransport {
    pub fn from_client(client: Client, relays: Vec<String>) -> Self {
        Self { client, relays }
    }

    /// Add `relays` to a fresh client and wait until at least one is connected.
    pub async fn connect(relays: &[String], connect_timeout: Duration) -> Result<Self, FetchError> {
        if relays.is_empty() {
            return Err(FetchError::NoRelays);
        }

        let client = Client::builder().build();
        let mut added = Vec::new();
        for url in relays {
            match client.add_relay(url.as_str()).await {
                Ok(_) => added.push(url.clone()),
                Err(e) => warn!(relay = %url, error = %e, "skipping relay"),
            }
        }
        if added.is_empty() {
            return Err(FetchError::NoRelays);
        }

        let start = Instant::now();
        if tokio::time::timeout(connect_timeout, client.connect()).await.is_err() {
            return Err(FetchError::RelayTimeout {
                relay: added.join(","),
                after: connect_timeout,
            });
        }

        let poll_interval = Duration::from_millis(100);
        loop {
            let connected = client
                .relays()
                .await
                .values()
                .filter(|r| r.status() == nostr_sdk::RelayStatus::Connected)
                .count();
            if connected > 0 {
                info!(connected, elapsed = ?start.elapsed(), "relays connected");
                break;
            }
            if start.elapsed() >= connect_timeout {
                return Err(FetchError::RelayTimeout {
                    relay: added.join(","),
                    after: connect_timeout,
                });
            }
            tokio::time::sleep(poll_interval).await;
        }

        Ok(Self {
            client,
            relays: added,
        })
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }
}

fn to_notes(events: Events) -> Vec<Note> {
    events.into_iter().map(|event| Note::from_event(&event)).collect()
}

#[async_trait]
impl RelayTransport for NostrRelayTransport {
    fn relay_urls(&self) -> Vec<String> {
        self.relays.clone()
    }

    async fn query(&self, filter: &NoteFilter, timeout: Duration) -> Result<Vec<Note>, FetchError> {
        let nostr_filter = filter.to_nostr_filter()?;
        let fetched = tokio::time::timeout(timeout, self.client.fetch_events(nostr_filter, timeout)).await;
        match fetched {
            Ok(Ok(events)) => {
                debug!(count = events.len(), "unified query returned");
                Ok(to_notes(events))
            }
            Ok(Err(e)) => Err(FetchError::Relay(e.to_string())),
            Err(_) => Err(FetchError::RelayTimeout {
                relay: "all".to_string(),
                after: timeout,
            }),
        }
    }

    async fn query_relay(
        &self,
        relay: &str,
        filter: &NoteFilter,
        timeout: Duration,
    ) -> Result<Vec<Note>, FetchError> {
        let nostr_filter = filter.to_nostr_filter()?;
        let fetched = tokio::time::timeout(
            timeout,
            self.client.fetch_events_from([relay], nostr_filter, timeout),
        )
        .await;
        match fetched {
            Ok(Ok(events)) => Ok(to_notes(events)),
            Ok(Err(e)) => Err(FetchError::Relay(format!("{}: {}", relay, e))),
            Err(_) => Err(FetchError::RelayTimeout {
                relay: relay.to_string(),
                after: timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{id, note, reply_tag, root_tag};

    #[test]
    fn test_replies_filter_matches_e_refs() {
        let filter = NoteFilter::replies_to(&[id(2)], 50);
        assert!(filter.matches(&note(3, 10, vec![root_tag(1), reply_tag(2)])));
        assert!(!filter.matches(&note(4, 10, vec![root_tag(1)])));

        let mut reaction = note(5, 10, vec![reply_tag(2)]);
        reaction.kind = 7;
        assert!(!filter.matches(&reaction));
    }

    #[test]
    fn test_until_is_inclusive() {
        let filter = NoteFilter::replies_to(&[id(1)], 50).until(Some(20));
        assert!(filter.matches(&note(2, 20, vec![root_tag(1)])));
        assert!(!filter.matches(&note(3, 21, vec![root_tag(1)])));
    }

    #[test]
    fn test_to_nostr_filter() {
        let filter = NoteFilter::replies_to(&[id(1)], 25).until(Some(99));
        let nostr_filter = filter.to_nostr_filter().unwrap();
        assert_eq!(nostr_filter.limit, Some(25));
        assert_eq!(nostr_filter.until, Some(Timestamp::from(99)));

        let json = serde_json::to_value(&nostr_filter).unwrap();
        assert_eq!(json["#e"][0], id(1));
        assert_eq!(json["kinds"][0], 1);
    }

    #[test]
    fn test_invalid_filters_are_rejected() {
        assert!(matches!(
            NoteFilter::default().to_nostr_filter(),
            Err(FetchError::InvalidFilter(_))
        ));
        assert!(matches!(
            NoteFilter::by_ids(&["not-hex".to_string()]).to_nostr_filter(),
            Err(FetchError::InvalidFilter(_))
        ));
    }
}
