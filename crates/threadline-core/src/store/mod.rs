pub mod kv;
pub mod thread_store;

pub use kv::{FileKvStore, KvStore, MemoryKvStore, StorageError};
pub use thread_store::{PaginationFrontier, ThreadState, ThreadStatus, ThreadStore};
