//! Write paths of the block store.
//!
//! [`DirectSink`] writes straight to the store files and makes them durable
//! on commit. [`JournalSink`] routes every write through the journal, keeps
//! unapplied block contents in the dirty table and lets the flusher apply
//! them after each commit.

use std::sync::Arc;

use bytes::Bytes;
use vireo_core::SynchronizationBarrier;

use super::allocation::MetadataWrite;
use super::dirty::DirtyBlockTable;
use super::files::StoreFiles;
use crate::error::StorageResult;
use crate::journal::{Journal, JournalStats};

/// Destination of store mutations.
pub(crate) trait BlockSink: Send + Sync + std::fmt::Debug {
    /// Read one full block.
    fn read_block(&self, handle: i32, buf: &mut [u8]) -> StorageResult<()>;

    /// Write one full block.
    fn write_block(&self, handle: i32, data: Bytes) -> StorageResult<()>;

    /// Persist allocation table changes.
    fn write_metadata(&self, writes: &[MetadataWrite]) -> StorageResult<()>;

    /// Grow the store files.
    fn extend(&self, block_size: u32, old_block_count: u32, new_block_count: u32) -> StorageResult<()>;

    /// Join `barrier` to the next durability point.
    fn commit(&self, barrier: &Arc<SynchronizationBarrier>);

    /// Push buffered writes towards disk without committing.
    fn flush(&self) -> StorageResult<()>;

    /// Whether producers should slow down.
    fn needs_throttling(&self) -> bool {
        false
    }

    /// Journal statistics, if journaling.
    fn journal_stats(&self) -> Option<JournalStats> {
        None
    }

    /// Make everything durable and release resources.
    fn close(&self) -> StorageResult<()>;
}

/// Writes go straight to the store files.
#[derive(Debug)]
pub(crate) struct DirectSink {
    files: Arc<StoreFiles>,
}

impl DirectSink {
    pub fn new(files: Arc<StoreFiles>) -> Self {
        Self { files }
    }
}

impl BlockSink for DirectSink {
    fn read_block(&self, handle: i32, buf: &mut [u8]) -> StorageResult<()> {
        self.files.read_block(handle, buf)
    }

    fn write_block(&self, handle: i32, data: Bytes) -> StorageResult<()> {
        self.files.write_block(handle, 0, &data)
    }

    fn write_metadata(&self, writes: &[MetadataWrite]) -> StorageResult<()> {
        for write in writes {
            match write {
                MetadataWrite::Int { offset, value } => self.files.write_table(*offset, &value.to_be_bytes())?,
                MetadataWrite::Block { offset, bytes } => self.files.write_table(*offset, bytes)?,
            }
        }
        Ok(())
    }

    fn extend(&self, _block_size: u32, _old_block_count: u32, new_block_count: u32) -> StorageResult<()> {
        self.files.resize(new_block_count)
    }

    fn commit(&self, barrier: &Arc<SynchronizationBarrier>) {
        barrier.add_party();
        match self.files.sync() {
            Ok(()) => barrier.release(),
            Err(e) => barrier.fail(e.to_string()),
        }
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        self.files.sync()
    }
}

/// Writes go through the journal.
#[derive(Debug)]
pub(crate) struct JournalSink {
    files: Arc<StoreFiles>,
    dirty: Arc<DirtyBlockTable>,
    journal: Journal,
}

impl JournalSink {
    pub fn new(files: Arc<StoreFiles>, dirty: Arc<DirtyBlockTable>, journal: Journal) -> Self {
        Self { files, dirty, journal }
    }
}

impl BlockSink for JournalSink {
    fn read_block(&self, handle: i32, buf: &mut [u8]) -> StorageResult<()> {
        match self.dirty.get(handle) {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                buf[n..].fill(0);
                Ok(())
            },
            None => self.files.read_block(handle, buf),
        }
    }

    fn write_block(&self, handle: i32, data: Bytes) -> StorageResult<()> {
        self.journal.write_data_block(handle, 0, data).map(|_| ())
    }

    fn write_metadata(&self, writes: &[MetadataWrite]) -> StorageResult<()> {
        for write in writes {
            match write {
                MetadataWrite::Int { offset, value } => self.journal.write_metadata(*offset, *value)?,
                MetadataWrite::Block { offset, bytes } => {
                    self.journal.write_metadata_block(*offset, Bytes::copy_from_slice(bytes))?
                },
            };
        }
        Ok(())
    }

    fn extend(&self, block_size: u32, old_block_count: u32, new_block_count: u32) -> StorageResult<()> {
        self.journal.extend_store(block_size, old_block_count, new_block_count).map(|_| ())
    }

    fn commit(&self, barrier: &Arc<SynchronizationBarrier>) {
        self.journal.commit(barrier);
    }

    fn flush(&self) -> StorageResult<()> {
        self.journal.flush()
    }

    fn needs_throttling(&self) -> bool {
        self.journal.needs_throttling()
    }

    fn journal_stats(&self) -> Option<JournalStats> {
        Some(self.journal.stats())
    }

    fn close(&self) -> StorageResult<()> {
        self.journal.close()
    }
}
