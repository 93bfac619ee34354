use crate::fetch::FetchPhase;
use crate::store::ThreadStatus;

/// Change notifications broadcast by [`crate::runtime::ThreadEngine`].
///
/// Events carry ids only; subscribers read the new state through the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadEvent {
    /// A new tree snapshot was installed for the root
    TreeUpdated { root_id: String, nodes: usize },
    StatusChanged { root_id: String, status: ThreadStatus },
    PhaseChanged {
        root_id: String,
        parent_id: String,
        phase: FetchPhase,
    },
}

impl ThreadEvent {
    pub fn root_id(&self) -> &str {
        match self {
            ThreadEvent::TreeUpdated { root_id, .. }
            | ThreadEvent::StatusChanged { root_id, .. }
            | ThreadEvent::PhaseChanged { root_id, .. } => root_id,
        }
    }
}
