use std::io::{Read, Write};

use bytes::BytesMut;

use crate::buffer::{SlabSink, SlabSource};
use crate::core::SpillError;

use super::format::{BATCH_SENTINEL, BatchEncoding, read_batch_len};
use super::SpillRecord;

/// Appends slabs to a spill file, one batch per slab.
pub struct SpillSink<'a, E> {
    record: &'a mut SpillRecord,
    encoding: &'a E,
}

impl<'a, E> SpillSink<'a, E> {
    pub fn new(record: &'a mut SpillRecord, encoding: &'a E) -> Self {
        Self { record, encoding }
    }
}

impl<T, E: BatchEncoding<T>> SlabSink<T> for SpillSink<'_, E> {
    fn write_slab(&mut self, items: &[T]) -> Result<(), SpillError> {
        let encoding = self.encoding;
        self.record
            .append_batch(items.len(), |buf| encoding.encode_batch(buf, items))
    }

    fn write_end(&mut self) -> Result<(), SpillError> {
        Ok(())
    }
}

/// Writes slabs to an arbitrary stream for bulk persistence.
pub struct StreamSink<'a, W, E> {
    out: &'a mut W,
    encoding: &'a E,
    scratch: BytesMut,
}

impl<'a, W: Write, E> StreamSink<'a, W, E> {
    pub fn new(out: &'a mut W, encoding: &'a E) -> Self {
        Self {
            out,
            encoding,
            scratch: BytesMut::new(),
        }
    }
}

impl<T, W: Write, E: BatchEncoding<T>> SlabSink<T> for StreamSink<'_, W, E> {
    fn write_slab(&mut self, items: &[T]) -> Result<(), SpillError> {
        self.scratch.clear();
        self.encoding.encode_batch(&mut self.scratch, items)?;
        self.out.write_all(&self.scratch)?;
        Ok(())
    }

    fn write_end(&mut self) -> Result<(), SpillError> {
        self.out.write_all(&BATCH_SENTINEL.to_le_bytes())?;
        Ok(())
    }
}

/// Reads sentinel-terminated batches back out of a bulk stream.
pub struct StreamSource<'a, R, E> {
    input: &'a mut R,
    encoding: &'a E,
    slab_capacity: usize,
}

impl<'a, R: Read, E> StreamSource<'a, R, E> {
    pub fn new(input: &'a mut R, encoding: &'a E, slab_capacity: usize) -> Self {
        Self {
            input,
            encoding,
            slab_capacity,
        }
    }
}

impl<T, R: Read, E: BatchEncoding<T>> SlabSource<T> for StreamSource<'_, R, E> {
    fn read_slab(&mut self, out: &mut Vec<T>) -> Result<bool, SpillError> {
        match read_batch_len(self.input, self.slab_capacity)? {
            Some(count) => {
                self.encoding.decode_elements(self.input, count, out)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
