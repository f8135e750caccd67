//! Journal file naming, headers and the append-only writer.
//!
//! Active files are named `<store>.jnl.<sequence>`; retired files kept for
//! reuse get an extra `.recycled` suffix and are ignored by recovery.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use vireo_core::StorageSyncMethod;

use crate::error::{StorageError, StorageResult};

/// Magic bytes opening every journal file.
pub const JOURNAL_MAGIC: &[u8; 4] = b"VJNL";
/// Format version written in the header.
pub const JOURNAL_VERSION: u32 = 1;
/// Size of the journal file header.
pub const JOURNAL_HEADER_SIZE: u64 = 16;
/// Suffix of retired files kept for reuse.
pub const RECYCLED_SUFFIX: &str = "recycled";

/// Journal files found on disk.
#[derive(Debug, Default)]
pub struct JournalListing {
    /// Active files, oldest first
    pub active: Vec<(u64, PathBuf)>,
    /// Retired files available for reuse
    pub recycled: Vec<PathBuf>,
}

/// Naming scheme of the journal files of one store.
#[derive(Debug, Clone)]
pub struct JournalDirectory {
    folder: PathBuf,
    base: String,
}

impl JournalDirectory {
    /// Journal files of store `base` inside `folder`.
    #[must_use]
    pub fn new(folder: impl Into<PathBuf>, base: impl Into<String>) -> Self {
        Self { folder: folder.into(), base: base.into() }
    }

    /// Folder holding the files.
    #[must_use]
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Path of active file `sequence`.
    #[must_use]
    pub fn file_path(&self, sequence: u64) -> PathBuf {
        self.folder.join(format!("{}.jnl.{sequence:010}", self.base))
    }

    /// Path of file `sequence` once retired for reuse.
    #[must_use]
    pub fn recycled_path(&self, sequence: u64) -> PathBuf {
        self.folder.join(format!("{}.jnl.{sequence:010}.{RECYCLED_SUFFIX}", self.base))
    }

    /// Create the folder if needed.
    ///
    /// # Errors
    /// Returns [`StorageError::Io`] on failure.
    pub fn ensure_folder(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.folder).map_err(|e| StorageError::io("create folder", &self.folder, e))
    }

    /// List the journal files of this store.
    ///
    /// # Errors
    /// Returns [`StorageError::Io`] if the folder cannot be read.
    pub fn scan(&self) -> StorageResult<JournalListing> {
        let mut listing = JournalListing::default();
        if !self.folder.exists() {
            return Ok(listing);
        }
        let prefix = format!("{}.jnl.", self.base);
        let entries = fs::read_dir(&self.folder).map_err(|e| StorageError::io("scan", &self.folder, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io("scan", &self.folder, e))?;
            let file_name = entry.file_name();
            let Some(rest) = file_name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
                continue;
            };
            match rest.split_once('.') {
                Some((_, suffix)) if suffix == RECYCLED_SUFFIX => listing.recycled.push(entry.path()),
                Some(_) => {},
                None => {
                    if let Ok(sequence) = rest.parse::<u64>() {
                        listing.active.push((sequence, entry.path()));
                    }
                },
            }
        }
        listing.active.sort_by_key(|(sequence, _)| *sequence);
        listing.recycled.sort();
        Ok(listing)
    }
}

/// Read the body of journal file `sequence`, after validating its header.
/// Returns `None` when the header is missing or names another sequence.
///
/// # Errors
/// Returns [`StorageError::Io`] if the file cannot be read.
pub fn read_journal_file(path: &Path, sequence: u64) -> StorageResult<Option<Vec<u8>>> {
    let mut raw = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut raw))
        .map_err(|e| StorageError::io("read journal", path, e))?;
    if (raw.len() as u64) < JOURNAL_HEADER_SIZE || &raw[..4] != JOURNAL_MAGIC {
        return Ok(None);
    }
    let mut header = &raw[4..JOURNAL_HEADER_SIZE as usize];
    let version = header.get_u32();
    let file_sequence = header.get_u64();
    if version != JOURNAL_VERSION || file_sequence != sequence {
        return Ok(None);
    }
    raw.drain(..JOURNAL_HEADER_SIZE as usize);
    Ok(Some(raw))
}

/// Append-only writer of one journal file.
#[derive(Debug)]
pub struct JournalFileWriter {
    sequence: u64,
    path: PathBuf,
    file: File,
    position: u64,
}

impl JournalFileWriter {
    /// Create file `sequence`, reusing `recycled` when given. With
    /// `preallocate`, fresh files are grown to that many bytes up front.
    ///
    /// # Errors
    /// Returns [`StorageError::Io`] on failure.
    pub fn create(
        directory: &JournalDirectory,
        sequence: u64,
        recycled: Option<PathBuf>,
        preallocate: Option<u64>,
    ) -> StorageResult<Self> {
        let path = directory.file_path(sequence);
        let reused = match recycled {
            Some(old) => fs::rename(&old, &path).is_ok(),
            None => false,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(!reused)
            .open(&path)
            .map_err(|e| StorageError::io("create journal", &path, e))?;
        if let (false, Some(size)) = (reused, preallocate) {
            file.set_len(size).map_err(|e| StorageError::io("preallocate journal", &path, e))?;
        }

        let mut writer = Self { sequence, path, file, position: 0 };
        let mut header = BytesMut::with_capacity(JOURNAL_HEADER_SIZE as usize);
        header.put_slice(JOURNAL_MAGIC);
        header.put_u32(JOURNAL_VERSION);
        header.put_u64(sequence);
        writer.append(&header)?;
        tracing::debug!(path = %writer.path.display(), sequence, reused, "Opened journal file");
        Ok(writer)
    }

    /// File sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// File path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far, header included.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Append bytes at the current position.
    ///
    /// # Errors
    /// Returns [`StorageError::Io`] on failure.
    pub fn append(&mut self, bytes: &[u8]) -> StorageResult<()> {
        self.file
            .seek(SeekFrom::Start(self.position))
            .and_then(|_| self.file.write_all(bytes))
            .map_err(|e| StorageError::io("append journal", &self.path, e))?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Flush to stable storage per `method`.
    ///
    /// # Errors
    /// Returns [`StorageError::Io`] on failure.
    pub fn sync(&self, method: StorageSyncMethod) -> StorageResult<()> {
        let result = match method {
            StorageSyncMethod::SyncAll => self.file.sync_all(),
            StorageSyncMethod::SyncData => self.file.sync_data(),
            StorageSyncMethod::None => Ok(()),
        };
        result.map_err(|e| StorageError::io("sync journal", &self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::record::{decode, DecodeOutcome, JournalRecord};
    use tempfile::TempDir;

    #[test]
    fn test_scan_orders_and_separates_recycled() {
        let dir = TempDir::new().unwrap();
        let journal = JournalDirectory::new(dir.path(), "orders");
        for sequence in [3u64, 1, 2] {
            fs::write(journal.file_path(sequence), b"").unwrap();
        }
        fs::write(journal.recycled_path(0), b"").unwrap();
        fs::write(dir.path().join("other.jnl.0000000001"), b"").unwrap();

        let listing = journal.scan().unwrap();
        let sequences: Vec<u64> = listing.active.iter().map(|(s, _)| *s).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(listing.recycled, vec![journal.recycled_path(0)]);
    }

    #[test]
    fn test_recycled_file_content_is_not_replayed() {
        let dir = TempDir::new().unwrap();
        let journal = JournalDirectory::new(dir.path(), "q");

        let mut old = JournalFileWriter::create(&journal, 1, None, Some(4096)).unwrap();
        let mut buf = BytesMut::new();
        JournalRecord::Commit { last_sequence: 1 }.encode(1, &mut buf);
        old.append(&buf).unwrap();
        drop(old);
        fs::rename(journal.file_path(1), journal.recycled_path(1)).unwrap();

        let fresh = JournalFileWriter::create(&journal, 2, Some(journal.recycled_path(1)), None).unwrap();
        assert_eq!(fresh.position(), JOURNAL_HEADER_SIZE);
        drop(fresh);

        let body = read_journal_file(&journal.file_path(2), 2).unwrap().unwrap();
        assert!(matches!(decode(2, &body), DecodeOutcome::Invalid(_)));
        assert!(read_journal_file(&journal.file_path(2), 1).unwrap().is_none());
    }
}
