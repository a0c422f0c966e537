mod bag;
mod column;

pub use bag::{BagIter, Phase, SpillableBag};
pub use column::{ColumnIter, SpillableColumn};

use crate::core::SpillError;

/// The surface a memory-pressure coordinator sees. Implementations must
/// tolerate `spill` being called from any thread at any time, concurrently
/// with appends and with an active iterator.
pub trait Spillable: Send + Sync {
    /// Moves whatever can safely leave memory to disk. Returns the number of
    /// elements written by this call.
    fn spill(&self) -> Result<u64, SpillError>;

    /// Advisory estimate of the bytes held in memory.
    fn memory_size(&self) -> u64;
}
