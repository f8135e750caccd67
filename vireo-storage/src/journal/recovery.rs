//! Startup replay of journal files into the store files.
//!
//! Files are read oldest first. Records are buffered and applied only when a
//! commit marker is reached, so anything after the last marker is dropped.
//! Within a file, reading stops at the first torn or checksum-failing
//! record; a preallocated or recycled file always ends that way.

use std::fs;

use super::file::{read_journal_file, JournalDirectory};
use super::record::{decode, DecodeOutcome, JournalRecord};
use crate::block::StoreFiles;
use crate::error::{StorageError, StorageResult};

/// Outcome of a recovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Journal files examined
    pub files_scanned: usize,
    /// Commit markers replayed
    pub commits: usize,
    /// Records applied to the store files
    pub records_applied: usize,
    /// Records dropped because no commit marker followed them
    pub records_discarded: usize,
    /// Block count after the last replayed extension, if any
    pub recovered_block_count: Option<u32>,
    /// Sequence the next journal file should use
    pub next_file_sequence: u64,
}

impl RecoveryReport {
    /// Whether anything was replayed.
    #[must_use]
    pub const fn replayed(&self) -> bool {
        self.records_applied > 0
    }
}

/// Replays the journal of one store.
#[derive(Debug)]
pub struct JournalRecovery<'a> {
    directory: &'a JournalDirectory,
    files: &'a StoreFiles,
}

impl<'a> JournalRecovery<'a> {
    /// Recovery of `files` from the journal in `directory`.
    #[must_use]
    pub const fn new(directory: &'a JournalDirectory, files: &'a StoreFiles) -> Self {
        Self { directory, files }
    }

    /// Replay committed records, then delete every journal file.
    ///
    /// # Errors
    /// Returns [`StorageError::Io`] if a journal file cannot be read or
    /// deleted, or a store file cannot be written.
    pub fn run(&self) -> StorageResult<RecoveryReport> {
        let listing = self.directory.scan()?;
        for path in &listing.recycled {
            fs::remove_file(path).map_err(|e| StorageError::io("delete recycled journal", path, e))?;
        }

        let mut report = RecoveryReport {
            files_scanned: listing.active.len(),
            next_file_sequence: listing.active.last().map_or(1, |(sequence, _)| sequence + 1),
            ..RecoveryReport::default()
        };
        if listing.active.is_empty() {
            return Ok(report);
        }

        let store = self.files.name();
        let mut pending: Vec<JournalRecord> = Vec::new();
        for (sequence, path) in &listing.active {
            let Some(body) = read_journal_file(path, *sequence)? else {
                tracing::warn!(store, path = %path.display(), "Skipping journal file with invalid header");
                continue;
            };
            let mut input = &body[..];
            loop {
                match decode(*sequence, input) {
                    DecodeOutcome::Record(JournalRecord::Commit { .. }, used) => {
                        self.apply(&mut pending, &mut report)?;
                        report.commits += 1;
                        input = &input[used..];
                    },
                    DecodeOutcome::Record(record, used) => {
                        pending.push(record);
                        input = &input[used..];
                    },
                    DecodeOutcome::End => break,
                    DecodeOutcome::Invalid(reason) => {
                        tracing::debug!(store, sequence, reason, "Journal file ends with unreadable bytes");
                        break;
                    },
                }
            }
        }
        report.records_discarded = pending.len();

        if report.replayed() {
            self.files.sync()?;
        }
        for (_, path) in &listing.active {
            fs::remove_file(path).map_err(|e| StorageError::io("delete journal", path, e))?;
        }

        tracing::info!(
            store,
            files = report.files_scanned,
            commits = report.commits,
            applied = report.records_applied,
            discarded = report.records_discarded,
            "Journal recovery complete"
        );
        Ok(report)
    }

    fn apply(&self, pending: &mut Vec<JournalRecord>, report: &mut RecoveryReport) -> StorageResult<()> {
        for record in pending.drain(..) {
            record.apply_to(self.files)?;
            if let JournalRecord::ExtendStore { new_block_count, .. } = record {
                report.recovered_block_count = Some(new_block_count);
            }
            report.records_applied += 1;
        }
        Ok(())
    }
}
