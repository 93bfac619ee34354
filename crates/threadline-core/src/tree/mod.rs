pub mod cache;
pub mod merge;
pub mod persist;
pub mod view;

pub use cache::{GcReport, TreeCache};
pub use merge::merge_notes_into_tree;
pub use persist::{TreePersistence, TREE_SCHEMA_VERSION};
pub use view::{build_thread_view, child_level, unexplored_ids};
