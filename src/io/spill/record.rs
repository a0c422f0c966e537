use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use bytes::BytesMut;
use log::info;
use tempfile::NamedTempFile;

use crate::conf::SpillConfig;
use crate::core::SpillError;

/// Bookkeeping for one container's spill file.
///
/// Only ever appended to. The file is private to the owning container and is
/// removed when the record is dropped.
#[derive(Debug)]
pub struct SpillRecord {
    file: NamedTempFile,
    writer: BufWriter<File>,
    scratch: BytesMut,
    bytes_written: u64,
    elements_written: u64,
    /// Byte offset just past each batch, in write order.
    batch_ends: Vec<u64>,
}

impl SpillRecord {
    pub fn create(config: &SpillConfig) -> Result<Self, SpillError> {
        let file = tempfile::Builder::new()
            .prefix("spill-")
            .suffix(".bin")
            .tempfile_in(&config.spill_dir)
            .map_err(|e| {
                SpillError::IoError(format!(
                    "creating spill file in {}: {e}",
                    config.spill_dir.display()
                ))
            })?;
        let writer = BufWriter::with_capacity(config.write_buffer_size, file.reopen()?);
        info!("Created spill file {}", file.path().display());
        Ok(Self {
            file,
            writer,
            scratch: BytesMut::new(),
            bytes_written: 0,
            elements_written: 0,
            batch_ends: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Appends one batch. `encode` fills a scratch buffer with the batch
    /// bytes, header included.
    pub fn append_batch<F>(&mut self, elements: usize, encode: F) -> Result<(), SpillError>
    where
        F: FnOnce(&mut BytesMut) -> Result<(), SpillError>,
    {
        self.scratch.clear();
        encode(&mut self.scratch)?;
        self.writer.write_all(&self.scratch)?;
        self.bytes_written += self.scratch.len() as u64;
        self.elements_written += elements as u64;
        self.batch_ends.push(self.bytes_written);
        Ok(())
    }

    /// Pushes buffered batches to the file so independent readers see them.
    pub fn flush(&mut self) -> Result<(), SpillError> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn batch_count(&self) -> usize {
        self.batch_ends.len()
    }

    /// Byte offset where batch `idx` begins. `idx == batch_count()` gives the
    /// current end of file.
    pub fn batch_start(&self, idx: usize) -> Option<u64> {
        match idx {
            0 => Some(0),
            _ => self.batch_ends.get(idx - 1).copied(),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn elements_written(&self) -> u64 {
        self.elements_written
    }

    /// Copies every flushed batch to `out`.
    pub fn copy_to<W: Write>(&mut self, out: &mut W) -> Result<u64, SpillError> {
        self.flush()?;
        let mut reader = BufReader::new(File::open(self.path())?);
        let copied = std::io::copy(&mut reader, out)?;
        if copied != self.bytes_written {
            return Err(SpillError::CorruptData(format!(
                "spill file {} holds {copied} bytes, expected {}",
                self.path().display(),
                self.bytes_written
            )));
        }
        Ok(copied)
    }
}
