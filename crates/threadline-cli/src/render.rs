//! Text and JSON output for the `threadline` binary.

use serde_json::{json, Value};
use threadline_core::discovery::DiscoveryOutcome;
use threadline_core::stats::FetchStats;
use threadline_core::tree::GcReport;
use threadline_core::{FetchReport, Note, ThreadView};

const SHORT_ID_LEN: usize = 8;
const PREVIEW_CHARS: usize = 72;

fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

/// First line of the note, cut to a terminal-friendly width
fn preview(note: &Note) -> String {
    let line = note.content.lines().next().unwrap_or("").trim();
    if line.chars().count() > PREVIEW_CHARS {
        let cut: String = line.chars().take(PREVIEW_CHARS).collect();
        format!("{}…", cut)
    } else {
        line.to_string()
    }
}

fn find_note<'a>(view: &'a ThreadView, id: &str) -> Option<&'a Note> {
    if view.parent.id == id {
        return Some(&view.parent);
    }
    view.direct_children.iter().find(|n| n.id == id)
}

/// Indented reply tree under the view's parent.
///
/// Notes beyond the direct children are only known by id in the view, so
/// deeper levels show the id and reply count.
pub fn render_view(view: &ThreadView) -> String {
    let mut out = format!("{} {}\n", short_id(&view.parent.id), preview(&view.parent));
    render_children(view, &view.parent.id, 1, &mut out);
    if view.has_unfetched_content {
        out.push_str("(more replies not fetched yet)\n");
    }
    out
}

fn render_children(view: &ThreadView, parent_id: &str, depth: usize, out: &mut String) {
    let Some(children) = view.structure.get(parent_id) else {
        return;
    };
    for child in children {
        let indent = "  ".repeat(depth);
        match find_note(view, child) {
            Some(note) => out.push_str(&format!("{}└ {} {}\n", indent, short_id(child), preview(note))),
            None => {
                let replies = view.structure.get(child).map(|c| c.len()).unwrap_or(0);
                out.push_str(&format!("{}└ {} ({} replies)\n", indent, short_id(child), replies));
            }
        }
        render_children(view, child, depth + 1, out);
    }
}

pub fn view_json(view: &ThreadView, report: &FetchReport) -> Value {
    json!({
        "rootId": report.root_id,
        "rootComplete": report.root_complete,
        "parent": view.parent,
        "directChildren": view.direct_children,
        "structure": view.structure,
        "hasUnfetchedContent": view.has_unfetched_content,
        "hasMore": report.has_more,
        "partialError": report.partial_error,
    })
}

pub fn report_summary(report: &FetchReport) -> String {
    let mut summary = format!(
        "root {} · {} notes · {} replies fetched over {} levels",
        short_id(&report.root_id),
        report.nodes,
        report.replies_fetched,
        report.levels
    );
    if !report.root_complete {
        summary.push_str(" · root is a best guess");
    }
    if report.has_more {
        summary.push_str(" · more replies available");
    }
    if let Some(error) = &report.partial_error {
        summary.push_str(&format!(" · partial: {}", error));
    }
    summary
}

pub fn discovery_json(note_id: &str, outcome: &DiscoveryOutcome) -> Value {
    match outcome {
        DiscoveryOutcome::Complete(root_id) => json!({
            "noteId": note_id,
            "rootId": root_id,
            "complete": true,
        }),
        DiscoveryOutcome::Partial { root_id, reason } => json!({
            "noteId": note_id,
            "rootId": root_id,
            "complete": false,
            "reason": reason,
        }),
    }
}

pub fn gc_json(report: &GcReport) -> Value {
    json!({
        "evicted": report.evicted,
        "expired": report.expired,
    })
}

pub fn stats_json(stats: &FetchStats) -> Value {
    let failures: Vec<Value> = stats
        .failures_by_count()
        .into_iter()
        .map(|(relay, count)| json!({ "relay": relay, "failures": count }))
        .collect();
    json!({
        "unifiedQueries": stats.unified_queries,
        "relayQueries": stats.relay_queries,
        "notesReceived": stats.notes_received,
        "fetchesCompleted": stats.fetches_completed,
        "fetchesCancelled": stats.fetches_cancelled,
        "fetchesFailed": stats.fetches_failed,
        "relayFailures": failures,
    })
}
