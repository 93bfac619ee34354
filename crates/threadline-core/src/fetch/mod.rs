//! Relay queries and the fetch state machine.
//!
//! [`relay`] abstracts the relay pool, [`replies`] turns reply queries into
//! budgeted, paginated relay calls, and [`orchestrator`] drives a full
//! thread load from root discovery to a settled tree.

use std::time::Duration;

use crate::resolver::ResolverError;

pub mod cancel;
#[cfg(test)]
pub(crate) mod mock;
pub mod orchestrator;
pub mod relay;
pub mod replies;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use orchestrator::{
    FetchKey, FetchOrchestrator, FetchPhase, FetchReport, FetchRequest, ViewContext,
    LOAD_FAILED_MESSAGE,
};
pub use relay::{NostrRelayTransport, NoteFilter, RelayTransport};
pub use replies::{ReplyBatch, ReplyFetcher, ReplyPage};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("relay {relay} timed out after {after:?}")]
    RelayTimeout { relay: String, after: Duration },
    #[error("relay query failed: {0}")]
    Relay(String),
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("no relays configured")]
    NoRelays,
    #[error("failed to load thread: note {0} is not available")]
    ThreadUnavailable(String),
    #[error("fetch was cancelled")]
    Cancelled,
    #[error(transparent)]
    Resolver(#[from] ResolverError),
}

impl FetchError {
    /// Superseded fetches are expected and never shown as failures
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}
