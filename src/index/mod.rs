pub mod iterator;
pub mod memory;
pub mod types;

pub use iterator::{DocIterator, IndexResult, IteratorOptions, TermHit};
pub use memory::MemoryIndex;
pub use types::*;

use parking_lot::RwLock;
use std::sync::Arc;

/// Index shared between requests; each execution or cursor read holds the
/// read lock only while it runs.
pub type IndexHandle = Arc<RwLock<MemoryIndex>>;

pub fn shared(index: MemoryIndex) -> IndexHandle {
    Arc::new(RwLock::new(index))
}
