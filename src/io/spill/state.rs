use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::SpillRecord;

/// Lock-free view of how much of a container is durably on disk.
///
/// Single writer: the container's spill path, while holding the container
/// lock and only after the spill writer has been flushed. Readers may load
/// without the lock; values only grow until the container is cleared.
#[derive(Debug, Default)]
pub struct SpillState {
    flushed_elements: AtomicU64,
    flushed_batches: AtomicU64,
    final_done: AtomicBool,
}

impl SpillState {
    pub fn flushed_elements(&self) -> u64 {
        self.flushed_elements.load(Ordering::Acquire)
    }

    pub fn flushed_batches(&self) -> u64 {
        self.flushed_batches.load(Ordering::Acquire)
    }

    pub fn final_done(&self) -> bool {
        self.final_done.load(Ordering::Acquire)
    }

    pub(crate) fn publish(&self, record: &SpillRecord) {
        self.flushed_elements
            .store(record.elements_written(), Ordering::Release);
        self.flushed_batches
            .store(record.batch_count() as u64, Ordering::Release);
    }

    pub(crate) fn mark_final(&self) {
        self.final_done.store(true, Ordering::Release);
    }

    pub(crate) fn reset(&mut self) {
        *self.flushed_elements.get_mut() = 0;
        *self.flushed_batches.get_mut() = 0;
        *self.final_done.get_mut() = false;
    }
}
