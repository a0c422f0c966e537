mod fixed;
mod tuple;

use std::io::{Read, Write};

use crate::core::SpillError;

pub use fixed::FixedWidth;
pub use tuple::{Datum, Tuple, TupleCodec};

/// Serializer for whole records held by a `SpillableBag`. The bag never
/// looks inside a record; it only hands it to the codec when spilling and
/// asks for it back when reading a batch from disk.
pub trait RecordCodec: Send + Sync {
    type Record: Send + Sync;

    fn write<W: Write>(&self, out: &mut W, record: &Self::Record) -> Result<(), SpillError>;

    fn read<R: Read>(&self, input: &mut R) -> Result<Self::Record, SpillError>;

    /// Advisory in-memory footprint of one record, used for memory accounting.
    fn memory_size(&self, _record: &Self::Record) -> usize {
        std::mem::size_of::<Self::Record>()
    }
}
