//! Flusher thread: batches records into journal files, turns commit
//! requests into durable commit waves and applies committed records to the
//! store files.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use crossbeam::channel::{Receiver, TryRecvError};
use vireo_core::SynchronizationBarrier;

use super::file::{JournalDirectory, JournalFileWriter};
use super::record::JournalRecord;
use super::{JournalCommand, JournalShared};
use crate::error::{StorageError, StorageResult};

pub(crate) struct Flusher {
    shared: Arc<JournalShared>,
    receiver: Receiver<JournalCommand>,
    directory: JournalDirectory,
    writer: JournalFileWriter,
    /// Rotated files whose records are not applied yet
    retained: Vec<(u64, PathBuf)>,
    /// Retired files available for reuse
    recycled: Vec<PathBuf>,
    buffer: BytesMut,
    unapplied: Vec<(u64, JournalRecord)>,
    last_sequence: u64,
}

impl Flusher {
    pub fn new(
        shared: Arc<JournalShared>,
        receiver: Receiver<JournalCommand>,
        directory: JournalDirectory,
        writer: JournalFileWriter,
    ) -> Self {
        Self {
            shared,
            receiver,
            directory,
            writer,
            retained: Vec::new(),
            recycled: Vec::new(),
            buffer: BytesMut::new(),
            unapplied: Vec::new(),
            last_sequence: 0,
        }
    }

    pub fn run(mut self) {
        tracing::debug!(store = %self.shared.config.store_name, "Journal flusher running");
        while let Ok(command) = self.receiver.recv() {
            if self.shared.failure.lock().is_some() {
                match command {
                    JournalCommand::Commit(barrier) => barrier.fail("journal failed"),
                    JournalCommand::Shutdown => break,
                    _ => {},
                }
                continue;
            }

            let outcome = match command {
                JournalCommand::Append { sequence, record } => self.buffer_record(sequence, record).map(|()| false),
                JournalCommand::Flush => self.write_buffer().map(|()| false),
                JournalCommand::Commit(barrier) => self.commit_wave(vec![barrier]),
                JournalCommand::Shutdown => Ok(true),
            };
            match outcome {
                Ok(false) => {},
                Ok(true) => {
                    if let Err(e) = self.shutdown() {
                        self.shared.fail(e.to_string());
                    }
                    break;
                },
                Err(e) => self.shared.fail(e.to_string()),
            }
        }
        tracing::debug!(store = %self.shared.config.store_name, "Journal flusher stopped");
    }

    fn buffer_record(&mut self, sequence: u64, record: JournalRecord) -> StorageResult<()> {
        record.encode(self.writer.sequence(), &mut self.buffer);
        self.unapplied.push((sequence, record));
        self.last_sequence = sequence;
        if self.buffer.len() as u64 >= self.shared.config.max_write_batch_size {
            self.write_buffer()?;
        }
        Ok(())
    }

    fn write_buffer(&mut self) -> StorageResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let written = self.buffer.len() as u64;
        self.writer.append(&self.buffer)?;
        self.buffer.clear();
        self.shared.metrics.batches_written.fetch_add(1, Ordering::Relaxed);
        self.shared.metrics.unflushed_bytes.fetch_sub(written, Ordering::Relaxed);
        self.shared.notify_drained();

        if self.writer.position() >= self.shared.config.max_journal_size {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> StorageResult<()> {
        let next = self.writer.sequence() + 1;
        let recycled = if self.shared.config.pre_allocate_files { self.recycled.pop() } else { None };
        let preallocate = self.shared.config.pre_allocate_files.then_some(self.shared.config.max_journal_size);
        let writer = JournalFileWriter::create(&self.directory, next, recycled, preallocate)?;
        let old = std::mem::replace(&mut self.writer, writer);
        old.sync(self.shared.config.sync_method)?;
        self.retained.push((old.sequence(), old.path().to_path_buf()));
        self.shared.metrics.rotations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(store = %self.shared.config.store_name, sequence = next, "Rotated journal file");
        Ok(())
    }

    /// Commit every record received so far, joining any further commit
    /// requests already queued into the same wave. Returns whether a
    /// shutdown request was drained along the way.
    fn commit_wave(&mut self, mut barriers: Vec<Arc<SynchronizationBarrier>>) -> StorageResult<bool> {
        let started = Instant::now();
        let mut shutdown = false;
        loop {
            match self.receiver.try_recv() {
                Ok(JournalCommand::Append { sequence, record }) => {
                    if let Err(e) = self.buffer_record(sequence, record) {
                        fail_all(&barriers, &e.to_string());
                        return Err(e);
                    }
                },
                Ok(JournalCommand::Commit(barrier)) => barriers.push(barrier),
                Ok(JournalCommand::Flush) => {},
                Ok(JournalCommand::Shutdown) => {
                    shutdown = true;
                    break;
                },
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        let records = self.unapplied.len();
        if let Err(e) = self.make_durable() {
            fail_all(&barriers, &e.to_string());
            return Err(e);
        }
        for barrier in &barriers {
            barrier.release();
        }
        self.apply()?;
        self.shared.metrics.record_commit(barriers.len(), records, started.elapsed());
        Ok(shutdown)
    }

    fn make_durable(&mut self) -> StorageResult<()> {
        self.write_buffer()?;
        if self.unapplied.is_empty() {
            return Ok(());
        }
        let mut marker = BytesMut::new();
        JournalRecord::Commit { last_sequence: self.last_sequence }.encode(self.writer.sequence(), &mut marker);
        self.writer.append(&marker)?;
        self.writer.sync(self.shared.config.sync_method)
    }

    /// Apply committed records to the store files, sync them, evict the
    /// matching dirty blocks and retire fully applied journal files.
    fn apply(&mut self) -> StorageResult<()> {
        if self.unapplied.is_empty() {
            self.shared.commit_requested.store(false, Ordering::Release);
            return Ok(());
        }
        let files = &self.shared.files;
        let mut applied_bytes = 0u64;
        for (_, record) in &self.unapplied {
            applied_bytes += record.framed_len() as u64;
            record.apply_to(files)?;
        }
        files.sync()?;

        for (sequence, record) in self.unapplied.drain(..) {
            if let JournalRecord::DataBlock { handle, .. } = record {
                self.shared.dirty.evict_applied(handle, sequence);
            }
        }
        let metrics = &self.shared.metrics;
        let _ = metrics
            .uncommitted_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(applied_bytes)));
        self.shared.commit_requested.store(false, Ordering::Release);

        for (sequence, path) in std::mem::take(&mut self.retained) {
            self.retire(sequence, path)?;
        }
        Ok(())
    }

    fn retire(&mut self, sequence: u64, path: PathBuf) -> StorageResult<()> {
        if self.shared.config.pre_allocate_files {
            let target = self.directory.recycled_path(sequence);
            fs::rename(&path, &target).map_err(|e| StorageError::io("recycle journal", &path, e))?;
            self.recycled.push(target);
        } else {
            fs::remove_file(&path).map_err(|e| StorageError::io("delete journal", &path, e))?;
        }
        self.shared.metrics.files_retired.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Final commit, then remove every journal file: a cleanly closed store
    /// needs no recovery.
    fn shutdown(&mut self) -> StorageResult<()> {
        if !self.unapplied.is_empty() || !self.buffer.is_empty() {
            self.make_durable()?;
            self.apply()?;
        }
        for (_, path) in std::mem::take(&mut self.retained) {
            fs::remove_file(&path).map_err(|e| StorageError::io("delete journal", &path, e))?;
        }
        for path in self.recycled.drain(..) {
            fs::remove_file(&path).map_err(|e| StorageError::io("delete journal", &path, e))?;
        }
        let current = self.writer.path().to_path_buf();
        fs::remove_file(&current).map_err(|e| StorageError::io("delete journal", &current, e))
    }
}

fn fail_all(barriers: &[Arc<SynchronizationBarrier>], reason: &str) {
    for barrier in barriers {
        barrier.fail(reason);
    }
}
