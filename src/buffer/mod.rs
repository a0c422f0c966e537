mod chunked;

pub use chunked::ChunkedBuffer;

use crate::core::SpillError;

/// Destination for slabs leaving a `ChunkedBuffer`, one batch per slab.
pub trait SlabSink<T> {
    fn write_slab(&mut self, items: &[T]) -> Result<(), SpillError>;

    /// Marks the end of a bulk `write_all` stream.
    fn write_end(&mut self) -> Result<(), SpillError>;
}

/// Source of slabs for `ChunkedBuffer::read_all`.
pub trait SlabSource<T> {
    /// Appends the next slab's elements to `out`. Returns `false` at the end
    /// of the stream.
    fn read_slab(&mut self, out: &mut Vec<T>) -> Result<bool, SpillError>;
}
