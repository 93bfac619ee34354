pub mod note;
pub mod tag_utils;
pub mod thread_tree;

pub use note::Note;
pub use tag_utils::{ETagRef, Marker};
pub use thread_tree::{ThreadTree, ThreadView, TreeNode};
