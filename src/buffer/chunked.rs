use std::collections::VecDeque;

use crate::core::SpillError;

use super::{SlabSink, SlabSource};

// head id + slab capacity + deque and tail headers
const BUFFER_OVERHEAD: u64 = 72;
// Vec header per slab
const SLAB_OVERHEAD: u64 = 24;

/// Append-only sequence of fixed-capacity slabs.
///
/// Slabs live in an arena addressed by a monotonically increasing sequence
/// id: the front slab has id `head_id`, and the slab after id `n` is `n + 1`.
/// Every slab but the tail is full. Spilling pops full slabs off the front,
/// so ids of slabs still in memory never change while they are resident.
#[derive(Debug)]
pub struct ChunkedBuffer<T> {
    full: VecDeque<Vec<T>>,
    tail: Vec<T>,
    head_id: u64,
    slab_capacity: usize,
}

impl<T> ChunkedBuffer<T> {
    pub fn new(slab_capacity: usize) -> Self {
        assert!(slab_capacity > 0, "slab capacity must be positive");
        Self {
            full: VecDeque::new(),
            tail: Vec::with_capacity(slab_capacity),
            head_id: 0,
            slab_capacity,
        }
    }

    pub fn slab_capacity(&self) -> usize {
        self.slab_capacity
    }

    pub fn head_id(&self) -> u64 {
        self.head_id
    }

    /// Number of resident slabs, tail included.
    pub fn slab_count(&self) -> usize {
        self.full.len() + 1
    }

    /// Resident slabs that are complete and eligible for an incremental spill.
    pub fn full_slabs(&self) -> usize {
        self.full.len()
    }

    pub fn tail_len(&self) -> usize {
        self.tail.len()
    }

    /// Elements currently held in memory.
    pub fn len(&self) -> usize {
        self.full.len() * self.slab_capacity + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slab(&self, id: u64) -> Option<&[T]> {
        let idx = id.checked_sub(self.head_id)? as usize;
        match idx.cmp(&self.full.len()) {
            std::cmp::Ordering::Less => Some(&self.full[idx]),
            std::cmp::Ordering::Equal => Some(&self.tail),
            std::cmp::Ordering::Greater => None,
        }
    }

    /// Clones slab `id` from `offset` onwards into `out`. Returns how many
    /// elements were copied, 0 when the slab is not resident.
    pub fn copy_slab_from(&self, id: u64, offset: usize, out: &mut Vec<T>) -> usize
    where
        T: Clone,
    {
        match self.slab(id).and_then(|slab| slab.get(offset..)) {
            Some(rest) => {
                out.extend_from_slice(rest);
                rest.len()
            }
            None => 0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.full.iter().flatten().chain(self.tail.iter())
    }

    pub fn add(&mut self, value: T) {
        if self.tail.len() == self.slab_capacity {
            let filled = std::mem::replace(&mut self.tail, Vec::with_capacity(self.slab_capacity));
            self.full.push_back(filled);
        }
        self.tail.push(value);
    }

    /// Advisory footprint: every resident slab is charged at full capacity.
    pub fn memory_size(&self) -> u64 {
        let slab_bytes = (self.slab_capacity * std::mem::size_of::<T>()) as u64 + SLAB_OVERHEAD;
        BUFFER_OVERHEAD + self.slab_count() as u64 * slab_bytes
    }

    /// Drops every slab and starts over with one empty tail. Ids keep
    /// increasing so stale ids never alias a fresh slab.
    pub fn reset(&mut self) {
        self.head_id += self.slab_count() as u64;
        self.full.clear();
        self.tail = Vec::with_capacity(self.slab_capacity);
    }

    /// Writes every full non-tail slab to `sink` as its own batch, releasing
    /// each one once written. Returns the number of elements written.
    pub fn spill_full_slabs<S: SlabSink<T>>(&mut self, sink: &mut S) -> Result<u64, SpillError> {
        let mut written = 0u64;
        while let Some(slab) = self.full.front() {
            sink.write_slab(slab)?;
            written += slab.len() as u64;
            self.full.pop_front();
            self.head_id += 1;
        }
        Ok(written)
    }

    /// Like `spill_full_slabs`, then also writes the filled prefix of the tail
    /// and resets. Only valid once no further `add` can happen.
    pub fn spill_final<S: SlabSink<T>>(&mut self, sink: &mut S) -> Result<u64, SpillError> {
        let mut written = self.spill_full_slabs(sink)?;
        if !self.tail.is_empty() {
            sink.write_slab(&self.tail)?;
            written += self.tail.len() as u64;
        }
        self.reset();
        Ok(written)
    }

    /// Bulk serialization: every slab with its exact element count, then the
    /// end marker.
    pub fn write_all<S: SlabSink<T>>(&self, sink: &mut S) -> Result<(), SpillError> {
        for slab in &self.full {
            sink.write_slab(slab)?;
        }
        sink.write_slab(&self.tail)?;
        sink.write_end()
    }

    /// Replaces the contents with the slabs read from `source`. Returns the
    /// number of elements read.
    pub fn read_all<S: SlabSource<T>>(&mut self, source: &mut S) -> Result<u64, SpillError> {
        self.reset();
        let mut scratch = Vec::with_capacity(self.slab_capacity);
        let mut read = 0u64;
        while source.read_slab(&mut scratch)? {
            read += scratch.len() as u64;
            for value in scratch.drain(..) {
                self.add(value);
            }
        }
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct VecSink {
        batches: Vec<Vec<i32>>,
        ended: bool,
    }

    impl SlabSink<i32> for VecSink {
        fn write_slab(&mut self, items: &[i32]) -> Result<(), SpillError> {
            self.batches.push(items.to_vec());
            Ok(())
        }

        fn write_end(&mut self) -> Result<(), SpillError> {
            self.ended = true;
            Ok(())
        }
    }

    struct VecSource(std::vec::IntoIter<Vec<i32>>);

    impl SlabSource<i32> for VecSource {
        fn read_slab(&mut self, out: &mut Vec<i32>) -> Result<bool, SpillError> {
            match self.0.next() {
                Some(batch) => {
                    out.extend(batch);
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    fn filled(n: i32, cap: usize) -> ChunkedBuffer<i32> {
        let mut buf = ChunkedBuffer::new(cap);
        for i in 0..n {
            buf.add(i);
        }
        buf
    }

    #[test]
    fn test_add_links_slabs_lazily() {
        let buf = filled(8, 4);
        // The tail is full but no new slab exists until the next add.
        assert_eq!(buf.slab_count(), 2);
        assert_eq!(buf.full_slabs(), 1);
        assert_eq!(buf.tail_len(), 4);

        let buf = filled(9, 4);
        assert_eq!(buf.slab_count(), 3);
        assert_eq!(buf.tail_len(), 1);
        assert_eq!(buf.len(), 9);
        assert_eq!(buf.slab(2), Some(&[8][..]));
    }

    #[test]
    fn test_spill_full_slabs_keeps_tail() {
        let mut buf = filled(10, 4);
        let mut sink = VecSink::default();
        let written = buf.spill_full_slabs(&mut sink).unwrap();

        assert_eq!(written, 8);
        assert_eq!(sink.batches, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]);
        assert_eq!(buf.head_id(), 2);
        assert_eq!(buf.slab(1), None);
        assert_eq!(buf.slab(2), Some(&[8, 9][..]));
        assert!(!sink.ended);
    }

    #[test]
    fn test_spill_final_flushes_tail_and_resets() {
        let mut buf = filled(6, 4);
        let mut sink = VecSink::default();
        assert_eq!(buf.spill_final(&mut sink).unwrap(), 6);
        assert_eq!(sink.batches, vec![vec![0, 1, 2, 3], vec![4, 5]]);
        assert!(buf.is_empty());
        assert_eq!(buf.head_id(), 2);
        assert_eq!(buf.slab(2), Some(&[][..]));
    }

    #[test]
    fn test_spill_final_skips_empty_tail() {
        let mut buf: ChunkedBuffer<i32> = ChunkedBuffer::new(4);
        let mut sink = VecSink::default();
        assert_eq!(buf.spill_final(&mut sink).unwrap(), 0);
        assert!(sink.batches.is_empty());
    }

    #[test]
    fn test_copy_slab_from() {
        let mut buf = filled(6, 4);
        let mut out = vec![];
        assert_eq!(buf.copy_slab_from(0, 1, &mut out), 3);
        assert_eq!(buf.copy_slab_from(1, 0, &mut out), 2);
        assert_eq!(out, vec![1, 2, 3, 4, 5]);

        buf.spill_full_slabs(&mut VecSink::default()).unwrap();
        assert_eq!(buf.copy_slab_from(0, 0, &mut out), 0);
        assert_eq!(buf.copy_slab_from(1, 2, &mut out), 0);
    }

    #[test]
    fn test_memory_size_never_grows_on_spill() {
        let mut buf = filled(25, 4);
        let before = buf.memory_size();
        buf.spill_full_slabs(&mut VecSink::default()).unwrap();
        let after = buf.memory_size();
        assert!(after < before);
        buf.spill_final(&mut VecSink::default()).unwrap();
        assert!(buf.memory_size() <= after);
    }

    #[test]
    fn test_write_all_then_read_all() {
        let buf = filled(10, 4);
        let mut sink = VecSink::default();
        buf.write_all(&mut sink).unwrap();
        assert!(sink.ended);
        assert_eq!(sink.batches.len(), 3);
        assert_eq!(sink.batches[2], vec![8, 9]);

        let mut restored = ChunkedBuffer::new(4);
        restored.add(99);
        let read = restored
            .read_all(&mut VecSource(sink.batches.into_iter()))
            .unwrap();
        assert_eq!(read, 10);
        assert_eq!(restored.iter().copied().collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
        assert_eq!(restored.full_slabs(), 2);
        assert_eq!(restored.tail_len(), 2);
    }
}
