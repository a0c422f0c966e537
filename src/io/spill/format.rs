//! Spill file layout.
//!
//! A spill file is a sequence of batches, each `[count: i32 LE][count elements]`.
//! Column elements are fixed-width and packed back-to-back; bag elements are
//! whatever the record codec emits. Spill files carry no end marker: readers
//! know how many batches are durable from the owning container.
//!
//! The bulk `write_data` stream reuses the same batch layout and terminates
//! with a count of `BATCH_SENTINEL`.

use std::io::Read;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::codec::{FixedWidth, RecordCodec};
use crate::core::SpillError;

pub(crate) const BATCH_SENTINEL: i32 = -1;
pub(crate) const LEN_SIZE: usize = 4; // i32 batch count

/// Encoded size of one full fixed-width batch.
pub(crate) fn fixed_batch_bytes<T: FixedWidth>(slab_capacity: usize) -> u64 {
    (LEN_SIZE + slab_capacity * T::WIDTH) as u64
}

/// Reads a batch header. Returns `None` on the end marker.
pub(crate) fn read_batch_len<R: Read>(
    input: &mut R,
    slab_capacity: usize,
) -> Result<Option<usize>, SpillError> {
    let mut buf = [0u8; LEN_SIZE];
    input.read_exact(&mut buf)?;
    let len = i32::from_le_bytes(buf);
    if len == BATCH_SENTINEL {
        return Ok(None);
    }
    if len < 0 || len as usize > slab_capacity {
        return Err(SpillError::CorruptData(format!(
            "batch length {len} outside 0..={slab_capacity}"
        )));
    }
    Ok(Some(len as usize))
}

/// How one slab of `T` is laid out inside a batch.
pub trait BatchEncoding<T> {
    /// Appends `[count][elements]` to `buf`.
    fn encode_batch(&self, buf: &mut BytesMut, items: &[T]) -> Result<(), SpillError>;

    /// Decodes `count` elements that follow a batch header.
    fn decode_elements<R: Read>(
        &self,
        input: &mut R,
        count: usize,
        out: &mut Vec<T>,
    ) -> Result<(), SpillError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FixedEncoding;

impl<T: FixedWidth> BatchEncoding<T> for FixedEncoding {
    fn encode_batch(&self, buf: &mut BytesMut, items: &[T]) -> Result<(), SpillError> {
        buf.reserve(LEN_SIZE + items.len() * T::WIDTH);
        buf.put_i32_le(items.len() as i32);
        for item in items {
            item.put(buf);
        }
        Ok(())
    }

    fn decode_elements<R: Read>(
        &self,
        input: &mut R,
        count: usize,
        out: &mut Vec<T>,
    ) -> Result<(), SpillError> {
        let mut bytes = vec![0u8; count * T::WIDTH];
        input.read_exact(&mut bytes)?;
        let mut slice = &bytes[..];
        out.reserve(count);
        for _ in 0..count {
            out.push(T::get(&mut slice)?);
        }
        Ok(())
    }
}

/// Records go through the external codec one at a time.
pub struct RecordEncoding<'a, C> {
    codec: &'a C,
}

impl<'a, C> RecordEncoding<'a, C> {
    pub fn new(codec: &'a C) -> Self {
        Self { codec }
    }
}

impl<C: RecordCodec> BatchEncoding<Arc<C::Record>> for RecordEncoding<'_, C> {
    fn encode_batch(
        &self,
        buf: &mut BytesMut,
        items: &[Arc<C::Record>],
    ) -> Result<(), SpillError> {
        buf.put_i32_le(items.len() as i32);
        let mut writer = (&mut *buf).writer();
        for item in items {
            self.codec.write(&mut writer, item)?;
        }
        Ok(())
    }

    fn decode_elements<R: Read>(
        &self,
        input: &mut R,
        count: usize,
        out: &mut Vec<Arc<C::Record>>,
    ) -> Result<(), SpillError> {
        out.reserve(count);
        for _ in 0..count {
            out.push(Arc::new(self.codec.read(input)?));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Datum, TupleCodec};

    #[test]
    fn test_fixed_batch_layout() {
        let mut buf = BytesMut::new();
        FixedEncoding.encode_batch(&mut buf, &[1i32, 2, 3]).unwrap();
        assert_eq!(buf.len(), fixed_batch_bytes::<i32>(3) as usize);
        assert_eq!(&buf[0..4], &3i32.to_le_bytes());
        assert_eq!(&buf[4..8], &1i32.to_le_bytes());

        let mut input = &buf[..];
        let len = read_batch_len(&mut input, 3).unwrap().unwrap();
        let mut out: Vec<i32> = Vec::new();
        FixedEncoding.decode_elements(&mut input, len, &mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
        assert!(input.is_empty());
    }

    #[test]
    fn test_sentinel() {
        let bytes = BATCH_SENTINEL.to_le_bytes();
        assert_eq!(read_batch_len(&mut &bytes[..], 10).unwrap(), None);
    }

    #[test]
    fn test_oversized_batch_is_corrupt() {
        let bytes = 11i32.to_le_bytes();
        let err = read_batch_len(&mut &bytes[..], 10).unwrap_err();
        assert!(matches!(err, SpillError::CorruptData(_)));

        let bytes = (-7i32).to_le_bytes();
        assert!(read_batch_len(&mut &bytes[..], 10).is_err());
    }

    #[test]
    fn test_record_batch() {
        let codec = TupleCodec;
        let encoding = RecordEncoding::new(&codec);
        let rows = vec![
            Arc::new(vec![Datum::Int(1), Datum::Null]),
            Arc::new(vec![Datum::CharArray("x".into())]),
        ];
        let mut buf = BytesMut::new();
        encoding.encode_batch(&mut buf, &rows).unwrap();

        let mut input = &buf[..];
        let len = read_batch_len(&mut input, 8).unwrap().unwrap();
        assert_eq!(len, 2);
        let mut out = Vec::new();
        encoding.decode_elements(&mut input, len, &mut out).unwrap();
        assert_eq!(out, rows);
    }
}
