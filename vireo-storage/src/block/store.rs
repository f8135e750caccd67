//! Block store facade.
//!
//! A [`BlockStore`] keeps variable-length entries in fixed-size blocks. The
//! allocation table is mirrored in memory behind a read-write lock; writes
//! reach disk through either the direct or the journaling sink, chosen by
//! the descriptor's `use_journal` flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use vireo_core::{DestinationDescriptor, SynchronizationBarrier};

use super::allocation::{AllocationTable, NO_BLOCK};
use super::dirty::DirtyBlockTable;
use super::files::StoreFiles;
use super::integrity::{check_integrity, IntegrityReport};
use super::locks::BlockLocks;
use super::sink::{BlockSink, DirectSink, JournalSink};
use crate::error::{StorageError, StorageResult};
use crate::journal::{Journal, JournalConfig, JournalDirectory, JournalRecovery, JournalStats, RecoveryReport};

/// Persistent store of variable-length entries addressed by block handles.
#[derive(Debug)]
pub struct BlockStore {
    descriptor: DestinationDescriptor,
    table: RwLock<AllocationTable>,
    locks: Mutex<BlockLocks>,
    sink: Box<dyn BlockSink>,
    recovery: Option<RecoveryReport>,
    closed: AtomicBool,
}

impl BlockStore {
    /// Open or create the store described by `descriptor`.
    ///
    /// With journaling enabled, committed journal records left by a crash
    /// are replayed first. The allocation table then goes through the
    /// integrity check before the store accepts any operation.
    ///
    /// # Errors
    /// Returns [`StorageError::Core`] for an invalid descriptor,
    /// [`StorageError::StoreCorrupted`] if the integrity check fails, and
    /// [`StorageError::Io`] on file system failures.
    pub fn open(descriptor: DestinationDescriptor) -> StorageResult<Self> {
        descriptor.validate()?;
        let name = descriptor.name.clone();
        let (files, created) = StoreFiles::open(&descriptor)?;
        let files = Arc::new(files);

        let journal_directory = descriptor
            .use_journal
            .then(|| JournalDirectory::new(descriptor.effective_journal_folder(), name.clone()));

        let mut recovery = None;
        if let Some(directory) = &journal_directory {
            if created {
                discard_stale_journal(directory, &name)?;
            } else {
                recovery = Some(JournalRecovery::new(directory, &files).run()?);
            }
        }

        let mut table = if created {
            let table = AllocationTable::new(descriptor.block_size, descriptor.initial_block_count);
            files.initialize(&table)?;
            table
        } else {
            AllocationTable::decode(&name, &files.read_table()?, descriptor.block_size)?
        };
        let pending = table.take_metadata_writes();
        if !created && !pending.is_empty() {
            files.resize(table.block_count())?;
            DirectSink::new(Arc::clone(&files)).write_metadata(&pending)?;
            files.sync()?;
        }

        let report = check_integrity(&name, &table)?;
        tracing::info!(
            store = %name,
            created,
            blocks = table.block_count(),
            used = report.used_blocks,
            entries = report.entries,
            journal = descriptor.use_journal,
            "Block store opened"
        );

        let sink: Box<dyn BlockSink> = match journal_directory {
            Some(directory) => {
                let dirty = Arc::new(DirtyBlockTable::new());
                let first_sequence = recovery.as_ref().map_or(1, |r| r.next_file_sequence);
                let journal = Journal::open(
                    JournalConfig::from(&descriptor),
                    directory,
                    Arc::clone(&files),
                    Arc::clone(&dirty),
                    first_sequence,
                )?;
                Box::new(JournalSink::new(files, dirty, journal))
            },
            None => Box::new(DirectSink::new(files)),
        };

        Ok(Self {
            locks: Mutex::new(BlockLocks::new(table.block_count())),
            table: RwLock::new(table),
            descriptor,
            sink,
            recovery,
            closed: AtomicBool::new(false),
        })
    }

    /// Store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Descriptor the store was opened with.
    #[must_use]
    pub const fn descriptor(&self) -> &DestinationDescriptor {
        &self.descriptor
    }

    /// Outcome of journal recovery at open, if it ran.
    #[must_use]
    pub const fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    /// Block size in bytes.
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.descriptor.block_size
    }

    /// Current number of blocks.
    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.table.read().block_count()
    }

    /// Store `payload` as a new entry at the end of the store.
    ///
    /// # Errors
    /// Returns [`StorageError::StoreFull`] if not enough blocks are free and
    /// the store cannot grow.
    pub fn store(&self, payload: &[u8]) -> StorageResult<i32> {
        self.ensure_open()?;
        check_payload(payload)?;
        let mut table = self.table.write();
        let n = table.blocks_needed(payload.len());
        self.ensure_free(&mut table, n)?;
        let blocks = table.allocate(self.name(), self.descriptor.max_block_count, n)?;
        if let Err(e) = self.write_payload(&blocks, payload) {
            table.return_unlinked(&blocks);
            return Err(e);
        }
        table.append_entry(&blocks, payload.len());
        if let Err(e) = self.persist_metadata(&mut table) {
            if let Err(undo) = table.remove_entry(self.name(), blocks[0]) {
                tracing::warn!(store = %self.name(), error = %undo, "Cannot unlink entry after failed store");
            }
            return Err(e);
        }
        Ok(blocks[0])
    }

    /// Replace the contents of the entry at `handle`, keeping its position.
    /// Returns the handle of the entry, which changes when the new payload
    /// needs a different number of blocks. A lock moves with the entry.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidHandle`] if `handle` is not an entry.
    pub fn replace(&self, handle: i32, payload: &[u8]) -> StorageResult<i32> {
        self.ensure_open()?;
        check_payload(payload)?;
        let mut table = self.table.write();
        check_entry(&table, handle)?;
        let old = table.entry_blocks(self.name(), handle)?;
        let n = table.blocks_needed(payload.len());

        if n == old.len() {
            self.write_payload(&old, payload)?;
            table.set_allocated_size(handle, payload.len());
            self.persist_metadata(&mut table)?;
            return Ok(handle);
        }

        self.ensure_free(&mut table, n)?;
        let old_size = table.get(handle).map_or(0, |r| r.allocated_size) as usize;
        let blocks = table.allocate(self.name(), self.descriptor.max_block_count, n)?;
        if let Err(e) = self.write_payload(&blocks, payload) {
            table.return_unlinked(&blocks);
            return Err(e);
        }
        table.splice_entry(self.name(), handle, &blocks, payload.len())?;
        self.locks.lock().transfer(handle, blocks[0]);
        if let Err(e) = self.persist_metadata(&mut table) {
            // Old blocks still hold the previous payload; put them back in place.
            table.reclaim(&old);
            match table.splice_entry(self.name(), blocks[0], &old, old_size) {
                Ok(_) => self.locks.lock().transfer(blocks[0], handle),
                Err(undo) => tracing::warn!(store = %self.name(), error = %undo, "Cannot restore entry after failed replace"),
            }
            return Err(e);
        }
        Ok(blocks[0])
    }

    /// Contents of the entry at `handle`.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidHandle`] if `handle` is not an entry.
    pub fn retrieve(&self, handle: i32) -> StorageResult<Bytes> {
        self.ensure_open()?;
        let table = self.table.read();
        check_entry(&table, handle)?;
        let blocks = table.entry_blocks(self.name(), handle)?;
        let size = table.get(handle).map_or(0, |r| r.allocated_size) as usize;
        let block_size = self.block_size() as usize;
        if size > blocks.len() * block_size {
            return Err(StorageError::corrupted(self.name(), format!("entry {handle} claims {size} bytes")));
        }

        let mut out = BytesMut::zeroed(blocks.len() * block_size);
        for (chunk, &block) in out.chunks_mut(block_size).zip(&blocks) {
            self.sink.read_block(block, chunk)?;
        }
        out.truncate(size);
        Ok(out.freeze())
    }

    /// Delete the entry at `handle`. Returns the handle of the preceding
    /// entry, or `-1` if it was the first.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidHandle`] if `handle` is not an entry.
    pub fn delete(&self, handle: i32) -> StorageResult<i32> {
        self.ensure_open()?;
        let mut table = self.table.write();
        check_entry(&table, handle)?;
        let (_, previous) = table.remove_entry(self.name(), handle)?;
        self.locks.lock().clear(handle);
        self.persist_metadata(&mut table)?;
        Ok(previous)
    }

    /// Handle of the first entry, or `-1`.
    ///
    /// # Errors
    /// Returns [`StorageError::Closed`] if the store is closed.
    pub fn first(&self) -> StorageResult<i32> {
        self.ensure_open()?;
        Ok(self.table.read().first_block())
    }

    /// Handle of the last entry, or `-1`.
    ///
    /// # Errors
    /// Returns [`StorageError::StoreCorrupted`] if the chain is broken.
    pub fn last(&self) -> StorageResult<i32> {
        self.ensure_open()?;
        self.table.read().last_entry(self.name())
    }

    /// Handle of the entry after `handle`, or `-1`.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidHandle`] if `handle` is not an entry.
    pub fn next(&self, handle: i32) -> StorageResult<i32> {
        self.ensure_open()?;
        let table = self.table.read();
        check_entry(&table, handle)?;
        table.next_entry(self.name(), handle)
    }

    /// Handle of the entry before `handle`, or `-1`.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidHandle`] if `handle` is not an entry.
    pub fn previous(&self, handle: i32) -> StorageResult<i32> {
        self.ensure_open()?;
        let table = self.table.read();
        check_entry(&table, handle)?;
        table.previous_entry(self.name(), handle)
    }

    /// Handles of every entry, first to last.
    ///
    /// # Errors
    /// Returns [`StorageError::StoreCorrupted`] if the chain is broken.
    pub fn handles(&self) -> StorageResult<Vec<i32>> {
        self.ensure_open()?;
        let table = self.table.read();
        let mut handles = Vec::with_capacity(table.entry_count());
        let mut current = table.first_block();
        while current != NO_BLOCK {
            handles.push(current);
            current = table.next_entry(self.name(), current)?;
        }
        Ok(handles)
    }

    /// Number of entries.
    #[must_use]
    pub fn size(&self) -> usize {
        self.table.read().entry_count()
    }

    /// Lock the entry at `handle`.
    ///
    /// # Errors
    /// Returns [`StorageError::AlreadyLocked`] if it is locked.
    pub fn lock(&self, handle: i32) -> StorageResult<()> {
        self.validate_lock_handle(handle)?;
        self.locks.lock().lock(handle)
    }

    /// Unlock the entry at `handle`.
    ///
    /// # Errors
    /// Returns [`StorageError::NotLocked`] if it is not locked.
    pub fn unlock(&self, handle: i32) -> StorageResult<()> {
        self.validate_lock_handle(handle)?;
        self.locks.lock().unlock(handle)
    }

    /// Whether the entry at `handle` is locked.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidHandle`] in safe mode for handles that
    /// are not entries.
    pub fn is_locked(&self, handle: i32) -> StorageResult<bool> {
        self.validate_lock_handle(handle)?;
        Ok(self.locks.lock().is_locked(handle))
    }

    /// Allocate a single-block empty entry.
    ///
    /// # Errors
    /// Returns [`StorageError::StoreFull`] if no block can be found.
    pub fn allocate(&self) -> StorageResult<i32> {
        self.store(&[])
    }

    /// Overwrite the raw contents of one block.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidArgument`] if `data` exceeds the block
    /// size, [`StorageError::InvalidHandle`] if the block is not allocated.
    pub fn write_block(&self, handle: i32, data: &[u8]) -> StorageResult<()> {
        self.ensure_open()?;
        if data.len() > self.block_size() as usize {
            return Err(StorageError::InvalidArgument {
                reason: format!("{} bytes do not fit a {} byte block", data.len(), self.block_size()),
            });
        }
        let table = self.table.read();
        check_used(&table, handle)?;
        self.sink.write_block(handle, padded_block(data, self.block_size() as usize))
    }

    /// Raw contents of one block.
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidHandle`] if the block is not allocated.
    pub fn read_block(&self, handle: i32) -> StorageResult<Bytes> {
        self.ensure_open()?;
        let table = self.table.read();
        check_used(&table, handle)?;
        let mut buf = BytesMut::zeroed(self.block_size() as usize);
        self.sink.read_block(handle, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Grow the store to `new_block_count` blocks. Smaller counts are a no-op.
    ///
    /// # Errors
    /// Returns [`StorageError::StoreFull`] beyond `max_block_count`.
    pub fn extend(&self, new_block_count: u32) -> StorageResult<()> {
        self.ensure_open()?;
        let mut table = self.table.write();
        if new_block_count <= table.block_count() {
            return Ok(());
        }
        if new_block_count > self.descriptor.max_block_count {
            return Err(self.full(&table, (new_block_count - table.block_count()) as usize));
        }
        self.extend_locked(&mut table, new_block_count)?;
        self.persist_metadata(&mut table)
    }

    /// Used blocks as a percentage of the current block count.
    #[must_use]
    pub fn store_usage(&self) -> f64 {
        let table = self.table.read();
        percentage(table.used_count(), table.block_count())
    }

    /// Used blocks as a percentage of the maximum block count.
    #[must_use]
    pub fn absolute_store_usage(&self) -> f64 {
        percentage(self.table.read().used_count(), self.descriptor.max_block_count)
    }

    /// Make every change so far durable and wait for it.
    ///
    /// # Errors
    /// Returns [`StorageError::Journal`] if the commit failed.
    pub fn commit_changes(&self) -> StorageResult<()> {
        let barrier = Arc::new(SynchronizationBarrier::new());
        self.commit_changes_with(&barrier)?;
        barrier.wait().map_err(|e| StorageError::journal("commit", e.to_string()))
    }

    /// Join `barrier` to this store's next durability point without
    /// waiting. One barrier may span several stores.
    ///
    /// # Errors
    /// Returns [`StorageError::Closed`] if the store is closed.
    pub fn commit_changes_with(&self, barrier: &Arc<SynchronizationBarrier>) -> StorageResult<()> {
        self.ensure_open()?;
        self.sink.commit(barrier);
        Ok(())
    }

    /// Push buffered writes towards disk without committing.
    ///
    /// # Errors
    /// Returns [`StorageError::Journal`] if the journal is closed.
    pub fn flush(&self) -> StorageResult<()> {
        self.sink.flush()
    }

    /// Whether the journal is behind and producers should slow down.
    #[must_use]
    pub fn needs_throttling(&self) -> bool {
        self.sink.needs_throttling()
    }

    /// Journal statistics, `None` without journaling.
    #[must_use]
    pub fn journal_stats(&self) -> Option<JournalStats> {
        self.sink.journal_stats()
    }

    /// Re-run the allocation table integrity check.
    ///
    /// # Errors
    /// Returns [`StorageError::StoreCorrupted`] on the first violation.
    pub fn check_integrity(&self) -> StorageResult<IntegrityReport> {
        check_integrity(self.name(), &self.table.read())
    }

    /// Commit and release the store. Later operations fail with
    /// [`StorageError::Closed`].
    ///
    /// # Errors
    /// Returns the error of the final commit.
    pub fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _table = self.table.write();
        self.sink.close()?;
        tracing::info!(store = %self.name(), "Block store closed");
        Ok(())
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed { name: self.name().to_owned() });
        }
        Ok(())
    }

    fn validate_lock_handle(&self, handle: i32) -> StorageResult<()> {
        if self.descriptor.safe_mode {
            check_entry(&self.table.read(), handle)?;
        }
        Ok(())
    }

    fn ensure_free(&self, table: &mut AllocationTable, needed: usize) -> StorageResult<()> {
        let free = table.free_count();
        if free >= needed {
            return Ok(());
        }
        let deficit = needed - free;
        let count = table.block_count();
        let max = self.descriptor.max_block_count;
        if self.descriptor.auto_extend_amount == 0 || count >= max {
            return Err(self.full(table, deficit));
        }
        let grow = (self.descriptor.auto_extend_amount as usize).max(deficit);
        let target = (count as usize + grow).min(max as usize) as u32;
        if ((target - count) as usize) < deficit {
            return Err(self.full(table, deficit));
        }
        self.extend_locked(table, target)
    }

    fn extend_locked(&self, table: &mut AllocationTable, new_block_count: u32) -> StorageResult<()> {
        let old = table.block_count();
        self.sink.extend(self.block_size(), old, new_block_count)?;
        table.extend(new_block_count);
        self.locks.lock().resize(new_block_count);
        tracing::debug!(store = %self.name(), old, new = new_block_count, "Extended block store");
        Ok(())
    }

    fn write_payload(&self, blocks: &[i32], payload: &[u8]) -> StorageResult<()> {
        let block_size = self.block_size() as usize;
        for (i, &handle) in blocks.iter().enumerate() {
            let start = (i * block_size).min(payload.len());
            let end = ((i + 1) * block_size).min(payload.len());
            self.sink.write_block(handle, padded_block(&payload[start..end], block_size))?;
        }
        Ok(())
    }

    fn persist_metadata(&self, table: &mut AllocationTable) -> StorageResult<()> {
        let writes = table.take_metadata_writes();
        if writes.is_empty() {
            return Ok(());
        }
        self.sink.write_metadata(&writes).map_err(|e| {
            table.requeue(&writes);
            e
        })
    }

    fn full(&self, table: &AllocationTable, requested: usize) -> StorageError {
        StorageError::StoreFull {
            name: self.name().to_owned(),
            block_count: table.block_count(),
            max_block_count: self.descriptor.max_block_count,
            requested,
        }
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(store = %self.name(), error = %e, "Block store close on drop failed");
        }
    }
}

fn discard_stale_journal(directory: &JournalDirectory, name: &str) -> StorageResult<()> {
    let listing = directory.scan()?;
    for path in listing.active.iter().map(|(_, p)| p).chain(&listing.recycled) {
        tracing::warn!(store = name, path = %path.display(), "Removing journal file of a missing store");
        std::fs::remove_file(path).map_err(|e| StorageError::io("delete journal", path, e))?;
    }
    Ok(())
}

fn check_payload(payload: &[u8]) -> StorageResult<()> {
    if i32::try_from(payload.len()).is_err() {
        return Err(StorageError::InvalidArgument { reason: format!("payload of {} bytes", payload.len()) });
    }
    Ok(())
}

fn check_entry(table: &AllocationTable, handle: i32) -> StorageResult<()> {
    match table.get(handle) {
        None => Err(StorageError::InvalidHandle { handle, reason: "out of range" }),
        Some(record) if !record.is_start() => Err(StorageError::InvalidHandle { handle, reason: "not an entry" }),
        Some(_) => Ok(()),
    }
}

fn check_used(table: &AllocationTable, handle: i32) -> StorageResult<()> {
    match table.get(handle) {
        None => Err(StorageError::InvalidHandle { handle, reason: "out of range" }),
        Some(record) if !record.is_used() => Err(StorageError::InvalidHandle { handle, reason: "free block" }),
        Some(_) => Ok(()),
    }
}

fn padded_block(data: &[u8], block_size: usize) -> Bytes {
    let mut block = BytesMut::zeroed(block_size);
    block[..data.len()].copy_from_slice(data);
    block.freeze()
}

fn percentage(used: usize, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 * 100.0 / f64::from(total)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::AtomicBool;

    use tempfile::TempDir;

    use super::*;
    use crate::block::MetadataWrite;

    #[derive(Debug, Default)]
    struct Faults {
        blocks: AtomicBool,
        metadata: AtomicBool,
    }

    /// Direct sink whose writes can be made to fail.
    #[derive(Debug)]
    struct FaultySink {
        inner: DirectSink,
        faults: Arc<Faults>,
    }

    fn disk_full(operation: &'static str) -> StorageError {
        StorageError::io(operation, Path::new("faulty"), std::io::Error::other("disk full"))
    }

    impl BlockSink for FaultySink {
        fn read_block(&self, handle: i32, buf: &mut [u8]) -> StorageResult<()> {
            self.inner.read_block(handle, buf)
        }

        fn write_block(&self, handle: i32, data: Bytes) -> StorageResult<()> {
            if self.faults.blocks.load(Ordering::Acquire) {
                return Err(disk_full("write block"));
            }
            self.inner.write_block(handle, data)
        }

        fn write_metadata(&self, writes: &[MetadataWrite]) -> StorageResult<()> {
            if self.faults.metadata.load(Ordering::Acquire) {
                return Err(disk_full("write table"));
            }
            self.inner.write_metadata(writes)
        }

        fn extend(&self, block_size: u32, old_block_count: u32, new_block_count: u32) -> StorageResult<()> {
            self.inner.extend(block_size, old_block_count, new_block_count)
        }

        fn commit(&self, barrier: &Arc<SynchronizationBarrier>) {
            self.inner.commit(barrier);
        }

        fn flush(&self) -> StorageResult<()> {
            self.inner.flush()
        }

        fn close(&self) -> StorageResult<()> {
            self.inner.close()
        }
    }

    fn faulty_store(dir: &TempDir) -> (BlockStore, Arc<Faults>) {
        let mut descriptor = DestinationDescriptor::new("faulty", dir.path());
        descriptor.block_size = 16;
        descriptor.initial_block_count = 8;
        descriptor.use_journal = false;
        let (files, _) = StoreFiles::open(&descriptor).unwrap();
        let table = AllocationTable::new(descriptor.block_size, descriptor.initial_block_count);
        files.initialize(&table).unwrap();
        let faults = Arc::new(Faults::default());
        let sink = FaultySink { inner: DirectSink::new(Arc::new(files)), faults: Arc::clone(&faults) };
        let store = BlockStore {
            locks: Mutex::new(BlockLocks::new(table.block_count())),
            table: RwLock::new(table),
            descriptor,
            sink: Box::new(sink),
            recovery: None,
            closed: AtomicBool::new(false),
        };
        (store, faults)
    }

    #[test]
    fn test_failed_block_write_returns_blocks() {
        let dir = TempDir::new().unwrap();
        let (store, faults) = faulty_store(&dir);
        let kept = store.store(b"kept").unwrap();

        faults.blocks.store(true, Ordering::Release);
        assert!(matches!(store.store(&[7u8; 40]), Err(StorageError::Io { .. })));
        assert!(matches!(store.replace(kept, &[7u8; 40]), Err(StorageError::Io { .. })));
        faults.blocks.store(false, Ordering::Release);

        assert_eq!(store.size(), 1);
        assert_eq!(store.table.read().used_count(), 1);
        assert_eq!(store.check_integrity().unwrap().used_blocks, 1);
        assert_eq!(&store.retrieve(kept).unwrap()[..], b"kept");
    }

    #[test]
    fn test_failed_metadata_write_unlinks_entry() {
        let dir = TempDir::new().unwrap();
        let (store, faults) = faulty_store(&dir);
        let first = store.store(b"first").unwrap();

        faults.metadata.store(true, Ordering::Release);
        assert!(store.store(b"lost").is_err());
        assert!(store.replace(first, &[1u8; 40]).is_err());
        faults.metadata.store(false, Ordering::Release);

        assert_eq!(store.handles().unwrap(), vec![first]);
        assert_eq!(store.table.read().used_count(), 1);
        assert_eq!(&store.retrieve(first).unwrap()[..], b"first");

        let second = store.store(b"second").unwrap();
        store.close().unwrap();
        let reopened = BlockStore::open(store.descriptor().clone()).unwrap();
        assert_eq!(reopened.handles().unwrap(), vec![first, second]);
        assert_eq!(&reopened.retrieve(second).unwrap()[..], b"second");
    }

    #[test]
    fn test_closed_store_rejects_navigation() {
        let dir = TempDir::new().unwrap();
        let (store, _) = faulty_store(&dir);
        let handle = store.store(b"x").unwrap();
        store.close().unwrap();

        assert!(matches!(store.first(), Err(StorageError::Closed { .. })));
        assert!(matches!(store.last(), Err(StorageError::Closed { .. })));
        assert!(matches!(store.next(handle), Err(StorageError::Closed { .. })));
        assert!(matches!(store.previous(handle), Err(StorageError::Closed { .. })));
        assert!(matches!(store.handles(), Err(StorageError::Closed { .. })));
    }
}
