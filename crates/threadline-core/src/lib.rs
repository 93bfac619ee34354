pub mod config;
pub mod constants;
pub mod discovery;
pub mod events;
pub mod fetch;
pub mod models;
pub mod resolver;
pub mod runtime;
pub mod stats;
pub mod store;
pub mod tree;

pub use config::{EngineConfig, ThreadPolicy};
pub use events::ThreadEvent;
pub use fetch::{FetchError, FetchPhase, FetchReport, NostrRelayTransport, RelayTransport};
pub use models::{Note, ThreadTree, ThreadView, TreeNode};
pub use runtime::{EngineError, ThreadEngine, ViewContext};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::models::Note;

    /// Deterministic 64-char hex id derived from a small number
    pub fn id(n: u32) -> String {
        format!("{:064x}", n)
    }

    pub fn note(n: u32, created_at: u64, tags: Vec<Vec<String>>) -> Note {
        Note {
            id: id(n),
            pubkey: format!("{:064x}", 0xabcdu32),
            created_at,
            kind: 1,
            tags,
            content: format!("note {}", n),
        }
    }

    pub fn root_tag(n: u32) -> Vec<String> {
        vec!["e".into(), id(n), String::new(), "root".into()]
    }

    pub fn reply_tag(n: u32) -> Vec<String> {
        vec!["e".into(), id(n), String::new(), "reply".into()]
    }

    pub fn plain_tag(n: u32) -> Vec<String> {
        vec!["e".into(), id(n)]
    }
}
