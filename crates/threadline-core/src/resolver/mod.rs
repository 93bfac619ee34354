pub mod resolve;
pub mod worker;

pub use resolve::{resolve_batch, resolve_parent, root_claim, ResolvedPatch};
pub use worker::{ResolverError, ResolverWorker};
