//! Journal counters and their snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Live counters updated by the journal and its flusher.
#[derive(Debug, Default)]
pub(crate) struct JournalMetrics {
    pub records_appended: AtomicU64,
    pub bytes_appended: AtomicU64,
    pub batches_written: AtomicU64,
    pub commits: AtomicU64,
    pub barriers_released: AtomicU64,
    pub records_applied: AtomicU64,
    pub rotations: AtomicU64,
    pub files_retired: AtomicU64,
    pub throttle_waits: AtomicU64,
    pub unflushed_bytes: AtomicU64,
    pub uncommitted_bytes: AtomicU64,
    commit_time: Mutex<Duration>,
}

impl JournalMetrics {
    pub fn record_commit(&self, barriers: usize, records: usize, duration: Duration) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.barriers_released.fetch_add(barriers as u64, Ordering::Relaxed);
        self.records_applied.fetch_add(records as u64, Ordering::Relaxed);
        *self.commit_time.lock() += duration;
    }

    pub fn stats(&self) -> JournalStats {
        let commits = self.commits.load(Ordering::Relaxed);
        let total = *self.commit_time.lock();
        JournalStats {
            records_appended: self.records_appended.load(Ordering::Relaxed),
            bytes_appended: self.bytes_appended.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            commits,
            barriers_released: self.barriers_released.load(Ordering::Relaxed),
            records_applied: self.records_applied.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            files_retired: self.files_retired.load(Ordering::Relaxed),
            throttle_waits: self.throttle_waits.load(Ordering::Relaxed),
            unflushed_bytes: self.unflushed_bytes.load(Ordering::Relaxed),
            uncommitted_bytes: self.uncommitted_bytes.load(Ordering::Relaxed),
            average_commit_time: if commits > 0 {
                total / u32::try_from(commits).unwrap_or(u32::MAX)
            } else {
                Duration::ZERO
            },
        }
    }
}

/// Snapshot of journal statistics
#[derive(Debug, Clone, Default)]
pub struct JournalStats {
    /// Records handed to the journal
    pub records_appended: u64,
    /// Framed bytes handed to the journal
    pub bytes_appended: u64,
    /// Write batches issued to journal files
    pub batches_written: u64,
    /// Commit waves completed
    pub commits: u64,
    /// Barrier parties released by those waves
    pub barriers_released: u64,
    /// Records applied to the store files
    pub records_applied: u64,
    /// Journal file rotations
    pub rotations: u64,
    /// Journal files deleted or recycled
    pub files_retired: u64,
    /// Times a producer blocked on backpressure
    pub throttle_waits: u64,
    /// Bytes enqueued but not yet written to a journal file
    pub unflushed_bytes: u64,
    /// Bytes written since the last commit
    pub uncommitted_bytes: u64,
    /// Mean duration of a commit wave
    pub average_commit_time: Duration,
}

impl JournalStats {
    /// Average number of barriers released per commit wave.
    #[must_use]
    pub fn group_commit_factor(&self) -> f64 {
        if self.commits == 0 {
            0.0
        } else {
            self.barriers_released as f64 / self.commits as f64
        }
    }
}
