//! Tag extraction utilities for NIP-10 thread references
//!
//! NIP-10 format: `["e", <event-id>, <relay-url>, <marker>]`. Some clients omit
//! the relay slot and put the marker at index 2, so both positions are read.
//! Tags that do not carry a well-formed event id are skipped.

/// Relationship marker carried by an `e` tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Root,
    Reply,
    Mention,
    /// Any other non-empty marker word (e.g. client-specific extensions)
    Other(String),
}

impl Marker {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "" => None,
            "root" => Some(Marker::Root),
            "reply" => Some(Marker::Reply),
            "mention" => Some(Marker::Mention),
            other => Some(Marker::Other(other.to_string())),
        }
    }

    fn is_known_word(value: &str) -> bool {
        matches!(value, "root" | "reply" | "mention")
    }
}

/// A parsed `e` tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ETagRef {
    pub id: String,
    pub relay_hint: Option<String>,
    pub marker: Option<Marker>,
}

/// Check that a string is a 32-byte hex event id
pub fn is_event_id(value: &str) -> bool {
    value.len() == 64 && hex::decode(value).is_ok()
}

/// Parse a single tag into an e-tag reference.
/// Returns `None` for non-`e` tags and for malformed ones.
pub fn parse_e_tag(tag: &[String]) -> Option<ETagRef> {
    if tag.first().map(String::as_str) != Some("e") {
        return None;
    }

    let id = tag.get(1)?.trim().to_ascii_lowercase();
    if !is_event_id(&id) {
        return None;
    }

    let slot_2 = tag.get(2).map(String::as_str).unwrap_or("");
    let slot_3 = tag.get(3).map(String::as_str);

    let (relay_hint, marker) = match slot_3 {
        Some(marker) => (non_empty(slot_2), Marker::parse(marker)),
        None if Marker::is_known_word(slot_2) => (None, Marker::parse(slot_2)),
        None => (non_empty(slot_2), None),
    };

    Some(ETagRef {
        id,
        relay_hint,
        marker,
    })
}

/// Extract all well-formed e-tag references, in tag order.
pub fn e_tag_refs(tags: &[Vec<String>]) -> Vec<ETagRef> {
    tags.iter().filter_map(|tag| parse_e_tag(tag)).collect()
}

/// First reference carrying the given marker
pub fn find_marked<'a>(refs: &'a [ETagRef], marker: &Marker) -> Option<&'a ETagRef> {
    refs.iter().find(|r| r.marker.as_ref() == Some(marker))
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const ID_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn tag(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_parse_marker_at_index_3() {
        let parsed = parse_e_tag(&tag(&["e", ID_A, "wss://relay.example.com", "root"])).unwrap();
        assert_eq!(parsed.id, ID_A);
        assert_eq!(parsed.relay_hint.as_deref(), Some("wss://relay.example.com"));
        assert_eq!(parsed.marker, Some(Marker::Root));
    }

    #[test]
    fn test_parse_marker_at_index_2_when_relay_omitted() {
        let parsed = parse_e_tag(&tag(&["e", ID_A, "reply"])).unwrap();
        assert_eq!(parsed.relay_hint, None);
        assert_eq!(parsed.marker, Some(Marker::Reply));
    }

    #[test]
    fn test_relay_only_tag_is_unmarked() {
        let parsed = parse_e_tag(&tag(&["e", ID_A, "wss://relay.example.com"])).unwrap();
        assert_eq!(parsed.marker, None);
        assert_eq!(parsed.relay_hint.as_deref(), Some("wss://relay.example.com"));
    }

    #[test]
    fn test_empty_marker_is_unmarked() {
        let parsed = parse_e_tag(&tag(&["e", ID_A, "", ""])).unwrap();
        assert_eq!(parsed.marker, None);
    }

    #[test]
    fn test_unknown_marker_is_kept() {
        let parsed = parse_e_tag(&tag(&["e", ID_A, "", "skill"])).unwrap();
        assert_eq!(parsed.marker, Some(Marker::Other("skill".to_string())));
    }

    #[test]
    fn test_malformed_tags_are_skipped() {
        let tags = vec![
            tag(&["e"]),
            tag(&["e", ""]),
            tag(&["e", "not-hex"]),
            tag(&["e", &ID_A[..10]]),
            tag(&["p", ID_A]),
            vec![],
            tag(&["e", ID_B, "", "reply"]),
        ];
        let refs = e_tag_refs(&tags);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].id, ID_B);
    }

    #[test]
    fn test_uppercase_ids_are_normalized() {
        let upper = ID_A.to_ascii_uppercase();
        let parsed = parse_e_tag(&tag(&["e", &upper])).unwrap();
        assert_eq!(parsed.id, ID_A);
    }

    #[test]
    fn test_find_marked() {
        let refs = e_tag_refs(&[
            tag(&["e", ID_A, "", "root"]),
            tag(&["e", ID_B, "", "reply"]),
        ]);
        assert_eq!(find_marked(&refs, &Marker::Root).unwrap().id, ID_A);
        assert_eq!(find_marked(&refs, &Marker::Reply).unwrap().id, ID_B);
        assert!(find_marked(&refs, &Marker::Mention).is_none());
    }
}
