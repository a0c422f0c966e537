use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use log::{debug, info};

use crate::buffer::{ChunkedBuffer, SlabSink};
use crate::codec::RecordCodec;
use crate::conf::SpillConfig;
use crate::container::Spillable;
use crate::core::SpillError;
use crate::io::spill::format::read_batch_len;
use crate::io::spill::{
    BatchEncoding, RecordEncoding, SpillRecord, SpillSink, SpillState, StreamSink, StreamSource,
};

/// Lifecycle of a bag. Only moves forward, and only under the bag lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Building = 0,
    Iterating = 1,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Building,
            _ => Phase::Iterating,
        }
    }
}

struct BagInner<R> {
    buffer: ChunkedBuffer<Arc<R>>,
    spill: Option<SpillRecord>,
    /// Codec-reported footprint of the records still in memory.
    record_bytes: u64,
}

/// Unordered-by-contract, insertion-ordered-in-practice collection of whole
/// records that can be spilled to disk.
///
/// Appends are accepted until the first iterator is created. From then on
/// the content is frozen, so the next spill writes the tail too and marks
/// itself final; every later spill is a no-op.
pub struct SpillableBag<C: RecordCodec> {
    codec: C,
    config: SpillConfig,
    inner: Mutex<BagInner<C::Record>>,
    phase: AtomicU8,
    size: AtomicU64,
    spill_state: SpillState,
    spill_path: OnceLock<PathBuf>,
}

impl<C: RecordCodec> SpillableBag<C> {
    pub fn new(codec: C, config: SpillConfig) -> Result<Self, SpillError> {
        config.validate()?;
        Ok(Self {
            codec,
            inner: Mutex::new(BagInner {
                buffer: ChunkedBuffer::new(config.slab_capacity),
                spill: None,
                record_bytes: 0,
            }),
            config,
            phase: AtomicU8::new(Phase::Building as u8),
            size: AtomicU64::new(0),
            spill_state: SpillState::default(),
            spill_path: OnceLock::new(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, BagInner<C::Record>>, SpillError> {
        self.inner
            .lock()
            .map_err(|_| SpillError::InvariantViolation("bag lock poisoned".into()))
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn spill_state(&self) -> &SpillState {
        &self.spill_state
    }

    pub fn add(&self, record: C::Record) -> Result<(), SpillError> {
        let mut inner = self.lock()?;
        if self.phase() == Phase::Iterating {
            return Err(SpillError::AddAfterIteration);
        }
        inner.record_bytes += self.codec.memory_size(&record) as u64;
        inner.buffer.add(Arc::new(record));
        self.size.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Appends every record under a single lock acquisition. Returns the
    /// number of records added.
    pub fn add_all<I>(&self, records: I) -> Result<u64, SpillError>
    where
        I: IntoIterator<Item = C::Record>,
    {
        let mut inner = self.lock()?;
        if self.phase() == Phase::Iterating {
            return Err(SpillError::AddAfterIteration);
        }
        let mut added = 0u64;
        for record in records {
            inner.record_bytes += self.codec.memory_size(&record) as u64;
            inner.buffer.add(Arc::new(record));
            added += 1;
        }
        self.size.fetch_add(added, Ordering::Release);
        Ok(added)
    }

    /// Spills full slabs. Once iteration has started, also spills the tail
    /// and marks the spill final.
    pub fn spill(&self) -> Result<u64, SpillError> {
        if self.spill_state.final_done() {
            return Ok(0);
        }
        let mut guard = self.lock()?;
        if self.spill_state.final_done() {
            return Ok(0);
        }
        let iterating = self.phase() == Phase::Iterating;
        let inner = &mut *guard;

        let has_work =
            inner.buffer.full_slabs() > 0 || (iterating && inner.buffer.tail_len() > 0);
        if !has_work {
            if iterating {
                // Everything is already on disk, or there never was anything.
                self.spill_state.mark_final();
            }
            return Ok(0);
        }

        let record = match &mut inner.spill {
            Some(record) => record,
            None => {
                let record = SpillRecord::create(&self.config)?;
                let _ = self.spill_path.set(record.path().to_path_buf());
                inner.spill.insert(record)
            }
        };

        let encoding = RecordEncoding::new(&self.codec);
        let mut sink = MeteredSink {
            inner: SpillSink::new(record, &encoding),
            codec: &self.codec,
            released: 0,
        };
        let written = if iterating {
            inner.buffer.spill_final(&mut sink)?
        } else {
            inner.buffer.spill_full_slabs(&mut sink)?
        };
        let released = sink.released;
        inner.record_bytes = inner.record_bytes.saturating_sub(released);

        record.flush()?;
        self.spill_state.publish(record);
        if iterating {
            self.spill_state.mark_final();
            info!(
                "Final spill of bag: {written} records, {} total in {} batches ({} bytes)",
                record.elements_written(),
                record.batch_count(),
                record.bytes_written()
            );
        } else {
            debug!(
                "Spilled {written} bag records, {} on disk in {} batches ({} bytes)",
                record.elements_written(),
                record.batch_count(),
                record.bytes_written()
            );
        }
        Ok(written)
    }

    pub fn memory_size(&self) -> u64 {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.buffer.memory_size() + inner.record_bytes
    }

    /// Freezes the bag and returns an iterator over every record.
    pub fn iterator(&self) -> Result<BagIter<'_, C>, SpillError> {
        {
            let _inner = self.lock()?;
            if self.phase() == Phase::Building {
                self.phase
                    .store(Phase::Iterating as u8, Ordering::Release);
                debug!("Bag frozen with {} records", self.size());
            }
        }
        Ok(BagIter {
            bag: self,
            consumed: 0,
            out: Vec::with_capacity(self.config.slab_capacity),
            out_pos: 0,
            batches_from_file: 0,
            batches_from_memory: 0,
            detected_final: false,
            reader: None,
            failed: false,
        })
    }

    /// Drops every record and the spill file, and reopens the bag for appends.
    pub fn clear(&mut self) {
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.buffer = ChunkedBuffer::new(self.config.slab_capacity);
        inner.spill = None;
        inner.record_bytes = 0;
        *self.phase.get_mut() = Phase::Building as u8;
        *self.size.get_mut() = 0;
        self.spill_state.reset();
        self.spill_path = OnceLock::new();
    }

    /// Serializes every record followed by the true record count.
    pub fn write_data<W: Write>(&self, out: &mut W) -> Result<(), SpillError> {
        let mut inner = self.lock()?;
        let inner = &mut *inner;
        if let Some(record) = &mut inner.spill {
            record.copy_to(out)?;
        }
        let encoding = RecordEncoding::new(&self.codec);
        inner.buffer.write_all(&mut StreamSink::new(out, &encoding))?;
        out.write_all(&(self.size() as i64).to_le_bytes())?;
        Ok(())
    }

    /// Replaces the contents with a stream produced by `write_data`. The
    /// restored bag is frozen for iteration.
    pub fn read_data<R: Read>(&mut self, input: &mut R) -> Result<u64, SpillError> {
        self.clear();
        let capacity = self.config.slab_capacity;
        let codec = &self.codec;
        let inner = self
            .inner
            .get_mut()
            .map_err(|_| SpillError::InvariantViolation("bag lock poisoned".into()))?;
        let encoding = RecordEncoding::new(codec);
        let read = inner
            .buffer
            .read_all(&mut StreamSource::new(input, &encoding, capacity))?;

        let mut count = [0u8; 8];
        input.read_exact(&mut count)?;
        let expected = i64::from_le_bytes(count);
        if expected < 0 || expected as u64 != read {
            return Err(SpillError::CorruptData(format!(
                "bag stream holds {read} records but declares {expected}"
            )));
        }

        inner.record_bytes = inner
            .buffer
            .iter()
            .map(|record| codec.memory_size(record) as u64)
            .sum();
        *self.size.get_mut() = read;
        *self.phase.get_mut() = Phase::Iterating as u8;
        Ok(read)
    }
}

impl<C: RecordCodec> Spillable for SpillableBag<C> {
    fn spill(&self) -> Result<u64, SpillError> {
        SpillableBag::spill(self)
    }

    fn memory_size(&self) -> u64 {
        SpillableBag::memory_size(self)
    }
}

/// Tallies the codec footprint of every record that leaves memory.
struct MeteredSink<'a, S, C> {
    inner: S,
    codec: &'a C,
    released: u64,
}

impl<S, C> SlabSink<Arc<C::Record>> for MeteredSink<'_, S, C>
where
    S: SlabSink<Arc<C::Record>>,
    C: RecordCodec,
{
    fn write_slab(&mut self, items: &[Arc<C::Record>]) -> Result<(), SpillError> {
        self.inner.write_slab(items)?;
        self.released += items
            .iter()
            .map(|record| self.codec.memory_size(record) as u64)
            .sum::<u64>();
        Ok(())
    }

    fn write_end(&mut self) -> Result<(), SpillError> {
        self.inner.write_end()
    }
}

struct FileCursor {
    reader: BufReader<File>,
    next_batch: u64,
}

/// Drains a frozen bag one slab-sized batch at a time.
///
/// Batch `n` in the spill file is slab `n` of the bag, so the cursor only
/// has to count batches. Batches taken from memory are remembered in
/// `batches_from_memory`; once a spill moves them to disk the file reader
/// jumps over their bytes instead of decoding them again.
pub struct BagIter<'a, C: RecordCodec> {
    bag: &'a SpillableBag<C>,
    consumed: u64,
    out: Vec<Arc<C::Record>>,
    out_pos: usize,
    batches_from_file: u64,
    batches_from_memory: u64,
    detected_final: bool,
    reader: Option<FileCursor>,
    failed: bool,
}

impl<C: RecordCodec> BagIter<'_, C> {
    pub fn has_next(&self) -> bool {
        !self.failed && self.consumed < self.bag.size()
    }

    pub fn next_value(&mut self) -> Result<Arc<C::Record>, SpillError> {
        if !self.has_next() {
            return Err(SpillError::Exhausted);
        }
        if self.out_pos == self.out.len() {
            if let Err(e) = self.refill() {
                self.failed = true;
                return Err(e);
            }
        }
        let Some(record) = self.out.get(self.out_pos).cloned() else {
            self.failed = true;
            return Err(SpillError::InvariantViolation(format!(
                "no buffered record after {} of {}",
                self.consumed,
                self.bag.size()
            )));
        };
        self.out_pos += 1;
        self.consumed += 1;
        Ok(record)
    }

    fn batches_seen(&self) -> u64 {
        self.batches_from_file + self.batches_from_memory
    }

    fn refill(&mut self) -> Result<(), SpillError> {
        let bag = self.bag;
        let state = &bag.spill_state;
        loop {
            if self.detected_final {
                return self.fill_from_file();
            }
            if self.batches_seen() < state.flushed_batches() || state.final_done() {
                return self.fill_from_file();
            }

            let inner = bag.lock()?;
            let flushed = state.flushed_batches();
            if self.batches_seen() < flushed || state.final_done() {
                // A spill won the race for the lock.
                drop(inner);
                continue;
            }
            return self.fill_from_memory(&inner.buffer, flushed);
        }
    }

    fn fill_from_memory(
        &mut self,
        buffer: &ChunkedBuffer<Arc<C::Record>>,
        flushed: u64,
    ) -> Result<(), SpillError> {
        let slab_id = buffer.head_id() + (self.batches_seen() - flushed);
        self.out.clear();
        self.out_pos = 0;
        if buffer.copy_slab_from(slab_id, 0, &mut self.out) == 0 {
            return Err(SpillError::InvariantViolation(format!(
                "bag slab {slab_id} is empty or gone (head {})",
                buffer.head_id()
            )));
        }
        self.batches_from_memory += 1;
        Ok(())
    }

    fn fill_from_file(&mut self) -> Result<(), SpillError> {
        // Read the final flag before the batch count: a final spill is
        // published after its batches.
        if !self.detected_final && self.bag.spill_state.final_done() {
            self.detected_final = true;
            debug!(
                "Bag iterator switching to spill file after {} records",
                self.consumed
            );
        }
        if self.batches_from_memory > 0 {
            debug!(
                "Skipping {} bag batches already read from memory",
                self.batches_from_memory
            );
            self.batches_from_file += self.batches_from_memory;
            self.batches_from_memory = 0;
        }

        let batch = self.batches_from_file;
        if batch >= self.bag.spill_state.flushed_batches() {
            return Err(SpillError::InvariantViolation(format!(
                "bag batch {batch} requested but only {} flushed",
                self.bag.spill_state.flushed_batches()
            )));
        }
        self.position_reader(batch)?;
        let Some(cursor) = self.reader.as_mut() else {
            return Err(SpillError::InvariantViolation(
                "bag spill reader missing after positioning".into(),
            ));
        };

        let capacity = self.bag.config.slab_capacity;
        let count = read_batch_len(&mut cursor.reader, capacity)?.ok_or_else(|| {
            SpillError::CorruptData(format!("unexpected end marker at bag batch {batch}"))
        })?;
        self.out.clear();
        self.out_pos = 0;
        RecordEncoding::new(&self.bag.codec).decode_elements(
            &mut cursor.reader,
            count,
            &mut self.out,
        )?;
        cursor.next_batch = batch + 1;
        self.batches_from_file += 1;
        Ok(())
    }

    /// Opens the spill file if needed and seeks to the start of `batch`.
    fn position_reader(&mut self, batch: u64) -> Result<(), SpillError> {
        if self.reader.is_none() {
            let path = self.bag.spill_path.get().ok_or_else(|| {
                SpillError::InvariantViolation("bag batches flushed without a spill file".into())
            })?;
            let file = File::open(path)?;
            self.reader = Some(FileCursor {
                reader: BufReader::with_capacity(self.bag.config.read_buffer_size, file),
                next_batch: 0,
            });
        }
        let Some(cursor) = self.reader.as_mut() else {
            return Ok(());
        };
        if cursor.next_batch == batch {
            return Ok(());
        }

        let offset = {
            let inner = self.bag.lock()?;
            inner
                .spill
                .as_ref()
                .and_then(|record| record.batch_start(batch as usize))
                .ok_or_else(|| {
                    SpillError::InvariantViolation(format!("no offset for bag batch {batch}"))
                })?
        };
        cursor.reader.seek(SeekFrom::Start(offset))?;
        cursor.next_batch = batch;
        Ok(())
    }
}

impl<C: RecordCodec> Iterator for BagIter<'_, C> {
    type Item = Result<Arc<C::Record>, SpillError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }
        Some(self.next_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Datum, Tuple, TupleCodec};
    use tempfile::TempDir;

    fn bag(dir: &TempDir, cap: usize) -> SpillableBag<TupleCodec> {
        SpillableBag::new(
            TupleCodec,
            SpillConfig::in_dir(dir.path()).with_slab_capacity(cap),
        )
        .unwrap()
    }

    fn row(i: i64) -> Tuple {
        vec![Datum::Long(i), Datum::CharArray(format!("row-{i}"))]
    }

    fn ids(it: BagIter<'_, TupleCodec>) -> Vec<i64> {
        it.map(|r| r.unwrap()[0].as_i64().unwrap()).collect()
    }

    #[test]
    fn test_empty_bag_spill_creates_no_file() {
        let dir = TempDir::new().unwrap();
        let b = bag(&dir, 4);
        assert_eq!(b.spill().unwrap(), 0);
        let mut it = b.iterator().unwrap();
        assert!(!it.has_next());
        assert_eq!(it.next_value(), Err(SpillError::Exhausted));
        // Iterating with nothing in memory: final without touching disk.
        assert_eq!(b.spill().unwrap(), 0);
        assert!(b.spill_state().final_done());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_add_after_iteration_rejected() {
        let dir = TempDir::new().unwrap();
        let b = bag(&dir, 4);
        b.add(row(0)).unwrap();
        let _it = b.iterator().unwrap();
        assert_eq!(b.phase(), Phase::Iterating);
        assert_eq!(b.add(row(1)), Err(SpillError::AddAfterIteration));
        assert_eq!(b.add_all(vec![row(2)]), Err(SpillError::AddAfterIteration));
        assert_eq!(b.size(), 1);
    }

    #[test]
    fn test_spill_before_iteration_keeps_tail() {
        let dir = TempDir::new().unwrap();
        let b = bag(&dir, 4);
        b.add_all((0..10).map(row)).unwrap();
        assert_eq!(b.spill().unwrap(), 8);
        assert!(!b.spill_state().final_done());
        assert_eq!(ids(b.iterator().unwrap()), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_spill_during_iteration_is_final_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let b = bag(&dir, 4);
        b.add_all((0..14).map(row)).unwrap();
        assert_eq!(b.spill().unwrap(), 12);

        let mut it = b.iterator().unwrap();
        let mut seen = vec![];
        for _ in 0..5 {
            seen.push(it.next_value().unwrap()[0].as_i64().unwrap());
        }
        // Only the tail is left in memory.
        assert_eq!(b.spill().unwrap(), 2);
        assert!(b.spill_state().final_done());
        assert_eq!(b.spill().unwrap(), 0);

        seen.extend(ids(it));
        assert_eq!(seen, (0..14).collect::<Vec<_>>());
    }

    #[test]
    fn test_final_spill_skips_batches_read_from_memory() {
        let dir = TempDir::new().unwrap();
        let b = bag(&dir, 3);
        b.add_all((0..10).map(row)).unwrap();

        let mut it = b.iterator().unwrap();
        let mut seen = vec![];
        // Two slabs from memory, plus one record of the third.
        for _ in 0..7 {
            seen.push(it.next_value().unwrap()[0].as_i64().unwrap());
        }
        assert_eq!(b.spill().unwrap(), 10);
        assert_eq!(b.spill_state().flushed_batches(), 4);

        seen.extend(ids(it));
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_memory_size_tracks_records() {
        let dir = TempDir::new().unwrap();
        let b = bag(&dir, 8);
        let empty = b.memory_size();
        b.add_all((0..100).map(row)).unwrap();
        let full = b.memory_size();
        assert!(full > empty);
        b.spill().unwrap();
        assert!(b.memory_size() < full);
    }

    #[test]
    fn test_write_data_read_data() {
        let dir = TempDir::new().unwrap();
        let b = bag(&dir, 4);
        b.add_all((0..9).map(row)).unwrap();
        b.spill().unwrap();
        b.add(row(9)).unwrap();

        let mut bytes = Vec::new();
        b.write_data(&mut bytes).unwrap();

        let mut restored = bag(&dir, 4);
        assert_eq!(restored.read_data(&mut &bytes[..]).unwrap(), 10);
        assert_eq!(restored.phase(), Phase::Iterating);
        assert_eq!(restored.add(row(10)), Err(SpillError::AddAfterIteration));
        assert_eq!(ids(restored.iterator().unwrap()), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_read_data_rejects_wrong_count() {
        let dir = TempDir::new().unwrap();
        let b = bag(&dir, 4);
        b.add_all((0..3).map(row)).unwrap();
        let mut bytes = Vec::new();
        b.write_data(&mut bytes).unwrap();
        let len = bytes.len();
        bytes[len - 8..].copy_from_slice(&7i64.to_le_bytes());

        let mut restored = bag(&dir, 4);
        assert!(matches!(
            restored.read_data(&mut &bytes[..]),
            Err(SpillError::CorruptData(_))
        ));
    }

    #[test]
    fn test_truncated_spill_file_fails_and_fuses() {
        let dir = TempDir::new().unwrap();
        let b = bag(&dir, 4);
        b.add_all((0..10).map(row)).unwrap();
        b.spill().unwrap();
        let path = b.spill_path.get().unwrap().clone();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(6)
            .unwrap();

        let mut it = b.iterator().unwrap();
        assert!(matches!(it.next(), Some(Err(SpillError::IoError(_)))));
        assert!(it.next().is_none());
        assert!(!it.has_next());
    }

    #[test]
    fn test_spill_into_missing_dir_is_io_error() {
        let dir = TempDir::new().unwrap();
        let b = SpillableBag::new(
            TupleCodec,
            SpillConfig::in_dir(dir.path().join("gone")).with_slab_capacity(4),
        )
        .unwrap();
        b.add_all((0..10).map(row)).unwrap();
        assert!(matches!(b.spill(), Err(SpillError::IoError(_))));
        assert!(!b.spill_state().final_done());
        assert_eq!(b.spill_state().flushed_batches(), 0);
    }

    #[test]
    fn test_clear_reopens_bag() {
        let dir = TempDir::new().unwrap();
        let mut b = bag(&dir, 2);
        b.add_all((0..5).map(row)).unwrap();
        b.spill().unwrap();
        drop(b.iterator().unwrap());
        let path = b.spill_path.get().unwrap().clone();

        b.clear();
        assert!(!path.exists());
        assert_eq!(b.phase(), Phase::Building);
        assert_eq!(b.size(), 0);
        b.add(row(7)).unwrap();
        assert_eq!(ids(b.iterator().unwrap()), vec![7]);
    }
}
