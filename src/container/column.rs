use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use log::debug;

use crate::buffer::ChunkedBuffer;
use crate::codec::FixedWidth;
use crate::conf::SpillConfig;
use crate::container::Spillable;
use crate::core::SpillError;
use crate::io::spill::format::{fixed_batch_bytes, read_batch_len};
use crate::io::spill::{
    BatchEncoding, FixedEncoding, SpillRecord, SpillSink, SpillState, StreamSink, StreamSource,
};

struct ColumnInner<T> {
    buffer: ChunkedBuffer<T>,
    spill: Option<SpillRecord>,
}

/// Single-typed column that can be spilled to disk incrementally.
///
/// One producer appends, a background thread may call `spill` at any time,
/// and one iterator may drain the column concurrently with both. Only full
/// slabs are ever spilled, so the column can be spilled repeatedly without
/// knowing whether more appends will follow.
pub struct SpillableColumn<T: FixedWidth> {
    config: SpillConfig,
    inner: Mutex<ColumnInner<T>>,
    size: AtomicU64,
    spill_state: SpillState,
    spill_path: OnceLock<PathBuf>,
}

impl<T: FixedWidth> SpillableColumn<T> {
    pub fn new(config: SpillConfig) -> Result<Self, SpillError> {
        config.validate()?;
        Ok(Self {
            inner: Mutex::new(ColumnInner {
                buffer: ChunkedBuffer::new(config.slab_capacity),
                spill: None,
            }),
            config,
            size: AtomicU64::new(0),
            spill_state: SpillState::default(),
            spill_path: OnceLock::new(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, ColumnInner<T>>, SpillError> {
        self.inner
            .lock()
            .map_err(|_| SpillError::InvariantViolation("column lock poisoned".into()))
    }

    pub fn add(&self, value: T) -> Result<(), SpillError> {
        let mut inner = self.lock()?;
        inner.buffer.add(value);
        self.size.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Total number of values ever added.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn spill_state(&self) -> &SpillState {
        &self.spill_state
    }

    /// Writes every full slab to the spill file. The partially filled tail
    /// always stays in memory.
    pub fn spill(&self) -> Result<u64, SpillError> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        if inner.buffer.full_slabs() == 0 {
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

        let written = inner
            .buffer
            .spill_full_slabs(&mut SpillSink::new(record, &FixedEncoding))?;
        record.flush()?;
        self.spill_state.publish(record);
        debug!(
            "Spilled {written} column values, {} on disk in {} batches ({} bytes)",
            record.elements_written(),
            record.batch_count(),
            record.bytes_written()
        );
        Ok(written)
    }

    pub fn memory_size(&self) -> u64 {
        match self.inner.lock() {
            Ok(inner) => inner.buffer.memory_size(),
            Err(poisoned) => poisoned.into_inner().buffer.memory_size(),
        }
    }

    /// Drops every value and the spill file.
    pub fn clear(&mut self) {
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.buffer = ChunkedBuffer::new(self.config.slab_capacity);
        inner.spill = None;
        *self.size.get_mut() = 0;
        self.spill_state.reset();
        self.spill_path = OnceLock::new();
    }

    pub fn iterator(&self) -> ColumnIter<'_, T> {
        ColumnIter {
            column: self,
            consumed: 0,
            position: 0,
            out: Vec::with_capacity(self.config.slab_capacity),
            out_pos: 0,
            memory: None,
            reader: None,
            failed: false,
        }
    }

    /// Serializes every value, spilled or not, as sentinel-terminated batches.
    pub fn write_data<W: Write>(&self, out: &mut W) -> Result<(), SpillError> {
        let mut inner = self.lock()?;
        let inner = &mut *inner;
        if let Some(record) = &mut inner.spill {
            record.copy_to(out)?;
        }
        inner
            .buffer
            .write_all(&mut StreamSink::new(out, &FixedEncoding))
    }

    /// Replaces the contents with a stream produced by `write_data`.
    pub fn read_data<R: Read>(&mut self, input: &mut R) -> Result<u64, SpillError> {
        self.clear();
        let capacity = self.config.slab_capacity;
        let inner = self
            .inner
            .get_mut()
            .map_err(|_| SpillError::InvariantViolation("column lock poisoned".into()))?;
        let read = inner
            .buffer
            .read_all(&mut StreamSource::new(input, &FixedEncoding, capacity))?;
        *self.size.get_mut() = read;
        Ok(read)
    }
}

impl<T: FixedWidth> Spillable for SpillableColumn<T> {
    fn spill(&self) -> Result<u64, SpillError> {
        SpillableColumn::spill(self)
    }

    fn memory_size(&self) -> u64 {
        SpillableColumn::memory_size(self)
    }
}

#[derive(Debug, Clone, Copy)]
struct MemoryCursor {
    /// `flushed_elements` when this cursor was positioned.
    synced_flush: u64,
    slab_id: u64,
    offset: usize,
}

struct FileCursor {
    reader: BufReader<File>,
    /// Batch the reader is positioned at the start of.
    next_batch: u64,
}

/// Drains a column in insertion order while appends and spills continue.
///
/// `position` counts values pulled from either source. Values below
/// `flushed_elements` are on disk; values at or above it are in memory,
/// with the buffer's head slab holding value `flushed_elements`. A spill
/// between two refills moves values the iterator already took from memory
/// onto disk, so every refill first decides which side `position` falls on.
pub struct ColumnIter<'a, T: FixedWidth> {
    column: &'a SpillableColumn<T>,
    consumed: u64,
    position: u64,
    out: Vec<T>,
    out_pos: usize,
    memory: Option<MemoryCursor>,
    reader: Option<FileCursor>,
    failed: bool,
}

impl<T: FixedWidth> ColumnIter<'_, T> {
    pub fn has_next(&self) -> bool {
        !self.failed && self.consumed < self.column.size()
    }

    pub fn next_value(&mut self) -> Result<T, SpillError> {
        if !self.has_next() {
            return Err(SpillError::Exhausted);
        }
        if self.out_pos == self.out.len() {
            if let Err(e) = self.refill() {
                self.failed = true;
                return Err(e);
            }
        }
        let value = self.out.get(self.out_pos).copied().ok_or_else(|| {
            self.failed = true;
            SpillError::InvariantViolation(format!(
                "no buffered value at position {} although {} remain",
                self.consumed,
                self.column.size() - self.consumed
            ))
        })?;
        self.out_pos += 1;
        self.consumed += 1;
        Ok(value)
    }

    fn refill(&mut self) -> Result<(), SpillError> {
        let column = self.column;
        loop {
            let flushed = column.spill_state.flushed_elements();
            if self.position < flushed {
                return self.fill_from_file();
            }

            let inner = column.lock()?;
            // Re-check under the lock: a spill may have landed since the
            // unlocked read, and spills only publish while holding the lock.
            let flushed = column.spill_state.flushed_elements();
            if self.position < flushed {
                drop(inner);
                continue;
            }
            return self.fill_from_memory(&inner.buffer, flushed);
        }
    }

    fn fill_from_memory(
        &mut self,
        buffer: &ChunkedBuffer<T>,
        flushed: u64,
    ) -> Result<(), SpillError> {
        let capacity = buffer.slab_capacity();
        let cursor = match self.memory {
            Some(cursor) if cursor.synced_flush == flushed => {
                if cursor.offset == capacity {
                    MemoryCursor {
                        slab_id: cursor.slab_id + 1,
                        offset: 0,
                        ..cursor
                    }
                } else {
                    cursor
                }
            }
            _ => {
                // First memory read, or a spill moved the head since the
                // cursor was placed.
                let skip = self.position - flushed;
                MemoryCursor {
                    synced_flush: flushed,
                    slab_id: buffer.head_id() + skip / capacity as u64,
                    offset: (skip % capacity as u64) as usize,
                }
            }
        };

        self.out.clear();
        let copied = buffer.copy_slab_from(cursor.slab_id, cursor.offset, &mut self.out);
        if copied == 0 {
            return Err(SpillError::InvariantViolation(format!(
                "memory slab {} has no value at offset {} (head {})",
                cursor.slab_id,
                cursor.offset,
                buffer.head_id()
            )));
        }

        self.out_pos = 0;
        self.position += copied as u64;
        self.memory = Some(MemoryCursor {
            offset: cursor.offset + copied,
            ..cursor
        });
        Ok(())
    }

    fn fill_from_file(&mut self) -> Result<(), SpillError> {
        if self.memory.take().is_some() {
            debug!(
                "Column iterator switching to spill file at value {}",
                self.position
            );
        }
        let capacity = self.column.config.slab_capacity;
        let batch = self.position / capacity as u64;
        let within = (self.position % capacity as u64) as usize;

        let cursor = match &mut self.reader {
            Some(cursor) => cursor,
            None => {
                let path = self.column.spill_path.get().ok_or_else(|| {
                    SpillError::InvariantViolation("values flushed without a spill file".into())
                })?;
                let file = File::open(path)?;
                self.reader.insert(FileCursor {
                    reader: BufReader::with_capacity(self.column.config.read_buffer_size, file),
                    next_batch: 0,
                })
            }
        };
        if cursor.next_batch != batch {
            cursor
                .reader
                .seek(SeekFrom::Start(batch * fixed_batch_bytes::<T>(capacity)))?;
        }

        let count = read_batch_len(&mut cursor.reader, capacity)?.ok_or_else(|| {
            SpillError::CorruptData(format!("unexpected end marker at batch {batch}"))
        })?;
        if count != capacity {
            return Err(SpillError::CorruptData(format!(
                "column batch {batch} holds {count} values, expected {capacity}"
            )));
        }
        if within > 0 {
            // Values before `within` were already delivered from memory.
            cursor.reader.seek_relative((within * T::WIDTH) as i64)?;
        }

        self.out.clear();
        FixedEncoding.decode_elements(&mut cursor.reader, count - within, &mut self.out)?;
        cursor.next_batch = batch + 1;
        self.out_pos = 0;
        self.position += (count - within) as u64;
        Ok(())
    }
}

impl<T: FixedWidth> Iterator for ColumnIter<'_, T> {
    type Item = Result<T, SpillError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }
        Some(self.next_value())
    }
}
