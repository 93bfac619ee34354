use std::cmp::Ordering;

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use super::tag_utils::{e_tag_refs, ETagRef};
use crate::constants::kinds;

/// A relay-sourced event projected to the fields threading needs.
///
/// Signature verification happens upstream in the relay pool, so `sig` is
/// not carried. Content is immutable once published: two notes with the same
/// id are the same note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl Note {
    pub fn from_event(event: &Event) -> Self {
        Self {
            id: event.id.to_hex(),
            pubkey: event.pubkey.to_hex(),
            created_at: event.created_at.as_secs(),
            kind: event.kind.as_u16(),
            tags: event
                .tags
                .iter()
                .map(|tag| tag.as_slice().to_vec())
                .collect(),
            content: event.content.clone(),
        }
    }

    /// Only kind:1 text notes are linked into reply trees
    pub fn is_text_note(&self) -> bool {
        self.kind == kinds::TEXT_NOTE
    }

    pub fn e_tags(&self) -> Vec<ETagRef> {
        e_tag_refs(&self.tags)
    }
}

impl From<&Event> for Note {
    fn from(event: &Event) -> Self {
        Note::from_event(event)
    }
}

/// Thread order: `created_at` ascending, id as tiebreak
pub fn thread_order(a: &Note, b: &Note) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}
