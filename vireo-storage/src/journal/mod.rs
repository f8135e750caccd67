//! Write-ahead journal.
//!
//! Store mutations are appended as [`JournalRecord`]s and handed to a
//! dedicated flusher thread through a channel. The flusher batches records
//! into the current journal file, and on commit writes a commit marker,
//! syncs, releases the waiting barriers, then applies the committed records
//! to the store files. Journal files are retired once everything they hold
//! has been applied.
//!
//! Producers that outpace the flusher block once more than
//! `max_unflushed_journal_size` bytes are queued, and a commit is forced
//! once `max_uncommitted_store_size` bytes accumulate without one.

mod file;
mod flusher;
mod record;
mod recovery;
mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};
use vireo_core::{DestinationDescriptor, StorageSyncMethod, SynchronizationBarrier};

pub use file::{
    read_journal_file, JournalDirectory, JournalFileWriter, JournalListing, JOURNAL_HEADER_SIZE, RECYCLED_SUFFIX,
};
pub use record::{decode as decode_record, DecodeOutcome, JournalRecord};
pub use recovery::{JournalRecovery, RecoveryReport};
pub use stats::JournalStats;

use crate::block::{DirtyBlockTable, StoreFiles};
use crate::error::{StorageError, StorageResult};
use flusher::Flusher;
use stats::JournalMetrics;

const THROTTLE_POLL: Duration = Duration::from_millis(50);

/// Journal tuning derived from a destination descriptor.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Store name, used to name journal files
    pub store_name: String,
    /// Rotate once the current file reaches this many bytes
    pub max_journal_size: u64,
    /// Write buffered records once this many bytes accumulate
    pub max_write_batch_size: u64,
    /// Block producers above this many queued bytes
    pub max_unflushed_journal_size: u64,
    /// Force a commit above this many uncommitted bytes
    pub max_uncommitted_store_size: u64,
    /// Sync method for journal files
    pub sync_method: StorageSyncMethod,
    /// Preallocate journal files and recycle retired ones
    pub pre_allocate_files: bool,
}

impl From<&DestinationDescriptor> for JournalConfig {
    fn from(descriptor: &DestinationDescriptor) -> Self {
        Self {
            store_name: descriptor.name.clone(),
            max_journal_size: descriptor.max_journal_size,
            max_write_batch_size: descriptor.max_write_batch_size,
            max_unflushed_journal_size: descriptor.max_unflushed_journal_size,
            max_uncommitted_store_size: descriptor.max_uncommitted_store_size,
            sync_method: descriptor.sync_method,
            pre_allocate_files: descriptor.pre_allocate_files,
        }
    }
}

pub(crate) enum JournalCommand {
    Append { sequence: u64, record: JournalRecord },
    Flush,
    Commit(Arc<SynchronizationBarrier>),
    Shutdown,
}

/// State shared between producers and the flusher thread.
#[derive(Debug)]
pub(crate) struct JournalShared {
    pub config: JournalConfig,
    pub files: Arc<StoreFiles>,
    pub dirty: Arc<DirtyBlockTable>,
    pub metrics: JournalMetrics,
    pub failure: Mutex<Option<String>>,
    pub commit_requested: AtomicBool,
    drain_lock: Mutex<()>,
    drained: Condvar,
}

impl JournalShared {
    pub fn fail(&self, reason: String) {
        tracing::error!(store = %self.config.store_name, %reason, "Journal failed");
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(reason);
        }
        drop(failure);
        self.metrics.unflushed_bytes.store(0, Ordering::Relaxed);
        self.notify_drained();
    }

    pub fn notify_drained(&self) {
        let _guard = self.drain_lock.lock();
        self.drained.notify_all();
    }

    fn check(&self) -> StorageResult<()> {
        match &*self.failure.lock() {
            Some(reason) => Err(StorageError::journal("append", reason.clone())),
            None => Ok(()),
        }
    }

    fn needs_throttling(&self) -> bool {
        self.metrics.unflushed_bytes.load(Ordering::Relaxed) > self.config.max_unflushed_journal_size
    }
}

/// Write-ahead journal of one block store.
#[derive(Debug)]
pub struct Journal {
    shared: Arc<JournalShared>,
    sender: Mutex<Option<(u64, Sender<JournalCommand>)>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Journal {
    /// Start a journal writing to file `first_sequence` onwards.
    ///
    /// # Errors
    /// Returns an error if the first journal file cannot be created or the
    /// flusher thread cannot be spawned.
    pub fn open(
        config: JournalConfig,
        directory: JournalDirectory,
        files: Arc<StoreFiles>,
        dirty: Arc<DirtyBlockTable>,
        first_sequence: u64,
    ) -> StorageResult<Self> {
        directory.ensure_folder()?;
        let preallocate = config.pre_allocate_files.then_some(config.max_journal_size);
        let writer = JournalFileWriter::create(&directory, first_sequence, None, preallocate)?;

        let shared = Arc::new(JournalShared {
            config,
            files,
            dirty,
            metrics: JournalMetrics::default(),
            failure: Mutex::new(None),
            commit_requested: AtomicBool::new(false),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
        });

        let (sender, receiver) = channel::unbounded();
        let flusher = Flusher::new(Arc::clone(&shared), receiver, directory, writer);
        let handle = thread::Builder::new()
            .name(format!("vireo-journal-{}", shared.config.store_name))
            .spawn(move || flusher.run())
            .map_err(|e| StorageError::journal("spawn flusher", e.to_string()))?;

        tracing::info!(store = %shared.config.store_name, first_sequence, "Journal started");
        Ok(Self {
            shared,
            sender: Mutex::new(Some((1, sender))),
            flusher: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }

    /// Append a record. Returns its sequence number.
    ///
    /// Blocks while the flusher is behind by more than
    /// `max_unflushed_journal_size` bytes.
    ///
    /// # Errors
    /// Returns [`StorageError::Journal`] if the journal failed or is closed.
    pub fn append(&self, record: JournalRecord) -> StorageResult<u64> {
        self.append_then(record, |_| {}, |_| {})
    }

    /// Append a record, running `before_send` with its sequence number
    /// before the flusher can see it and `on_failure` if the send fails.
    fn append_then(
        &self,
        record: JournalRecord,
        before_send: impl FnOnce(u64),
        on_failure: impl FnOnce(u64),
    ) -> StorageResult<u64> {
        self.shared.check()?;
        let size = record.framed_len() as u64;
        let sequence = {
            let mut sender = self.sender.lock();
            let Some((next, tx)) = sender.as_mut() else {
                return Err(StorageError::journal("append", "journal is closed"));
            };
            let sequence = *next;
            before_send(sequence);
            self.shared.metrics.unflushed_bytes.fetch_add(size, Ordering::Relaxed);
            self.shared.metrics.uncommitted_bytes.fetch_add(size, Ordering::Relaxed);
            if tx.send(JournalCommand::Append { sequence, record }).is_err() {
                on_failure(sequence);
                return Err(StorageError::journal("append", "flusher stopped"));
            }
            *next += 1;
            sequence
        };
        self.shared.metrics.records_appended.fetch_add(1, Ordering::Relaxed);
        self.shared.metrics.bytes_appended.fetch_add(size, Ordering::Relaxed);

        if self.shared.metrics.uncommitted_bytes.load(Ordering::Relaxed) >= self.shared.config.max_uncommitted_store_size
            && !self.shared.commit_requested.swap(true, Ordering::AcqRel)
        {
            tracing::debug!(store = %self.shared.config.store_name, "Forcing commit of uncommitted journal data");
            self.send(JournalCommand::Commit(Arc::new(SynchronizationBarrier::new())))?;
        }
        self.throttle()?;
        Ok(sequence)
    }

    /// Journal a data block write. The block contents enter the dirty table
    /// before the record reaches the flusher, so applying the record always
    /// finds the entry it has to evict.
    ///
    /// # Errors
    /// See [`append`](Self::append).
    pub fn write_data_block(&self, handle: i32, offset: u32, data: Bytes) -> StorageResult<u64> {
        let dirty = &self.shared.dirty;
        let cached = data.clone();
        self.append_then(
            JournalRecord::DataBlock { handle, offset, data },
            |sequence| dirty.put(handle, cached, sequence),
            |sequence| {
                dirty.evict_applied(handle, sequence);
            },
        )
    }

    /// Journal an allocation table integer write.
    ///
    /// # Errors
    /// See [`append`](Self::append).
    pub fn write_metadata(&self, offset: u64, value: i32) -> StorageResult<u64> {
        self.append(JournalRecord::MetaData { offset, value })
    }

    /// Journal an allocation table block write.
    ///
    /// # Errors
    /// See [`append`](Self::append).
    pub fn write_metadata_block(&self, offset: u64, data: Bytes) -> StorageResult<u64> {
        self.append(JournalRecord::MetaDataBlock { offset, data })
    }

    /// Journal a store extension.
    ///
    /// # Errors
    /// See [`append`](Self::append).
    pub fn extend_store(&self, block_size: u32, old_block_count: u32, new_block_count: u32) -> StorageResult<u64> {
        self.append(JournalRecord::ExtendStore { block_size, old_block_count, new_block_count })
    }

    /// Ask the flusher to write buffered records without waiting for a commit.
    ///
    /// # Errors
    /// Returns [`StorageError::Journal`] if the journal is closed.
    pub fn flush(&self) -> StorageResult<()> {
        self.send(JournalCommand::Flush)
    }

    /// Join `barrier` to the next commit wave. The barrier is released once
    /// every record appended so far is durable, or failed if that fails.
    pub fn commit(&self, barrier: &Arc<SynchronizationBarrier>) {
        barrier.add_party();
        if let Err(e) = self.shared.check() {
            barrier.fail(e.to_string());
            return;
        }
        if let Err(e) = self.send(JournalCommand::Commit(Arc::clone(barrier))) {
            barrier.fail(e.to_string());
        }
    }

    /// Whether queued bytes exceed `max_unflushed_journal_size`.
    #[must_use]
    pub fn needs_throttling(&self) -> bool {
        self.shared.needs_throttling()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> JournalStats {
        self.shared.metrics.stats()
    }

    /// Commit everything, stop the flusher and retire every journal file.
    ///
    /// # Errors
    /// Returns [`StorageError::Journal`] if the final commit failed.
    pub fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let barrier = Arc::new(SynchronizationBarrier::new());
        self.commit(&barrier);
        let committed = barrier.wait();

        if let Some((_, sender)) = self.sender.lock().take() {
            let _ = sender.send(JournalCommand::Shutdown);
        }
        if let Some(handle) = self.flusher.lock().take() {
            if handle.join().is_err() {
                return Err(StorageError::journal("close", "flusher thread panicked"));
            }
        }
        tracing::info!(store = %self.shared.config.store_name, "Journal closed");
        committed.map_err(|e| StorageError::journal("close", e.to_string()))?;
        self.shared.check()
    }

    fn send(&self, command: JournalCommand) -> StorageResult<()> {
        match self.sender.lock().as_ref() {
            Some((_, tx)) => tx.send(command).map_err(|_| StorageError::journal("send", "flusher stopped")),
            None => Err(StorageError::journal("send", "journal is closed")),
        }
    }

    fn throttle(&self) -> StorageResult<()> {
        if !self.shared.needs_throttling() {
            return Ok(());
        }
        self.shared.metrics.throttle_waits.fetch_add(1, Ordering::Relaxed);
        self.flush()?;
        let mut guard = self.shared.drain_lock.lock();
        while self.shared.needs_throttling() {
            self.shared.check()?;
            let _ = self.shared.drained.wait_for(&mut guard, THROTTLE_POLL);
        }
        drop(guard);
        self.shared.check()
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                tracing::warn!(store = %self.shared.config.store_name, error = %e, "Journal close on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::AllocationTable;
    use tempfile::TempDir;

    #[test]
    fn test_forced_commits_leave_no_stale_dirty_blocks() {
        let dir = TempDir::new().unwrap();
        let mut descriptor = DestinationDescriptor::new("forced", dir.path());
        descriptor.block_size = 16;
        descriptor.initial_block_count = 4;
        descriptor.use_journal = true;
        descriptor.max_uncommitted_store_size = 1;

        let (files, _) = StoreFiles::open(&descriptor).unwrap();
        files.initialize(&AllocationTable::new(16, 4)).unwrap();
        let files = Arc::new(files);
        let dirty = Arc::new(DirtyBlockTable::new());
        let journal = Journal::open(
            JournalConfig::from(&descriptor),
            JournalDirectory::new(descriptor.effective_journal_folder(), "forced"),
            Arc::clone(&files),
            Arc::clone(&dirty),
            1,
        )
        .unwrap();

        for round in 0u8..64 {
            let handle = i32::from(round % 4);
            journal.write_data_block(handle, 0, Bytes::from(vec![round; 16])).unwrap();
        }
        journal.close().unwrap();

        assert!(dirty.is_empty(), "every applied record evicted its dirty block");
        for handle in 0..4 {
            let mut buf = [0u8; 16];
            files.read_block(handle, &mut buf).unwrap();
            assert_eq!(buf, [60 + handle as u8; 16]);
        }
    }
}
