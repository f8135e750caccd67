//! Allocation table and data file handles.
//!
//! Each file sits behind its own mutex so a seek and the following read or
//! write happen as one step.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use vireo_core::{DestinationDescriptor, StorageSyncMethod};

use super::allocation::{table_file_len, AllocationTable};
use crate::error::{StorageError, StorageResult};

/// Extension of the allocation table file.
pub const ALLOCATION_TABLE_EXTENSION: &str = "allocationTable";
/// Extension of the data file.
pub const DATA_FILE_EXTENSION: &str = "data";

#[derive(Debug)]
struct Handle {
    path: PathBuf,
    file: Mutex<File>,
}

impl Handle {
    fn open(path: PathBuf) -> StorageResult<(Self, bool)> {
        let created = !path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StorageError::io("open", &path, e))?;
        Ok((Self { path, file: Mutex::new(file) }, created))
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(bytes))
            .map_err(|e| StorageError::io("write", &self.path, e))
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| StorageError::io("read", &self.path, e))
    }

    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let mut file = self.file.lock();
        let mut buf = Vec::new();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_end(&mut buf))
            .map_err(|e| StorageError::io("read", &self.path, e))?;
        Ok(buf)
    }

    fn len(&self) -> StorageResult<u64> {
        self.file
            .lock()
            .metadata()
            .map(|m| m.len())
            .map_err(|e| StorageError::io("stat", &self.path, e))
    }

    fn grow_to(&self, len: u64) -> StorageResult<()> {
        let file = self.file.lock();
        let current = file.metadata().map_err(|e| StorageError::io("stat", &self.path, e))?.len();
        if len > current {
            file.set_len(len).map_err(|e| StorageError::io("extend", &self.path, e))?;
        }
        Ok(())
    }

    fn sync(&self, method: StorageSyncMethod) -> StorageResult<()> {
        let file = self.file.lock();
        let result = match method {
            StorageSyncMethod::SyncAll => file.sync_all(),
            StorageSyncMethod::SyncData => file.sync_data(),
            StorageSyncMethod::None => Ok(()),
        };
        result.map_err(|e| StorageError::io("sync", &self.path, e))
    }
}

/// The two files backing one block store.
#[derive(Debug)]
pub struct StoreFiles {
    name: String,
    block_size: u32,
    sync_method: StorageSyncMethod,
    table: Handle,
    data: Handle,
}

impl StoreFiles {
    /// Open (creating if needed) the files of `descriptor`. Returns whether
    /// the allocation table had to be created.
    ///
    /// # Errors
    /// Returns [`StorageError::Io`] on any file system failure.
    pub fn open(descriptor: &DestinationDescriptor) -> StorageResult<(Self, bool)> {
        fs::create_dir_all(&descriptor.data_folder)
            .map_err(|e| StorageError::io("create folder", &descriptor.data_folder, e))?;
        let (table, created) = Handle::open(Self::table_path(descriptor))?;
        let (data, _) = Handle::open(Self::data_path(descriptor))?;
        let files = Self {
            name: descriptor.name.clone(),
            block_size: descriptor.block_size,
            sync_method: descriptor.sync_method,
            table,
            data,
        };
        let created = created || files.table.len()? == 0;
        Ok((files, created))
    }

    /// Path of the allocation table file.
    #[must_use]
    pub fn table_path(descriptor: &DestinationDescriptor) -> PathBuf {
        descriptor.data_folder.join(format!("{}.{ALLOCATION_TABLE_EXTENSION}", descriptor.name))
    }

    /// Path of the data file.
    #[must_use]
    pub fn data_path(descriptor: &DestinationDescriptor) -> PathBuf {
        descriptor.data_folder.join(format!("{}.{DATA_FILE_EXTENSION}", descriptor.name))
    }

    /// Store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Data file path.
    #[must_use]
    pub fn data_file(&self) -> &Path {
        &self.data.path
    }

    /// Block size in bytes.
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Write a freshly built table and size the data file to match.
    ///
    /// # Errors
    /// Returns [`StorageError::Io`] on failure.
    pub fn initialize(&self, table: &AllocationTable) -> StorageResult<()> {
        self.table.write_at(0, &table.encode_all())?;
        self.resize(table.block_count())?;
        self.sync()
    }

    /// Raw allocation table contents.
    ///
    /// # Errors
    /// Returns [`StorageError::Io`] on failure.
    pub fn read_table(&self) -> StorageResult<Vec<u8>> {
        self.table.read_all()
    }

    /// Write raw allocation table bytes.
    ///
    /// # Errors
    /// Returns [`StorageError::Io`] on failure.
    pub fn write_table(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        self.table.write_at(offset, bytes)
    }

    /// Write raw data bytes at `offset` within block `handle`.
    ///
    /// # Errors
    /// Returns [`StorageError::Io`] on failure.
    pub fn write_block(&self, handle: i32, offset: u32, bytes: &[u8]) -> StorageResult<()> {
        self.data.write_at(self.block_offset(handle) + u64::from(offset), bytes)
    }

    /// Read one full block into `buf`.
    ///
    /// # Errors
    /// Returns [`StorageError::Io`] on failure.
    pub fn read_block(&self, handle: i32, buf: &mut [u8]) -> StorageResult<()> {
        self.data.read_at(self.block_offset(handle), buf)
    }

    /// Grow both files to hold `block_count` blocks. Never shrinks.
    ///
    /// # Errors
    /// Returns [`StorageError::Io`] on failure.
    pub fn resize(&self, block_count: u32) -> StorageResult<()> {
        self.table.grow_to(table_file_len(block_count))?;
        self.data.grow_to(u64::from(block_count) * u64::from(self.block_size))
    }

    /// Flush both files to stable storage per the configured sync method.
    ///
    /// # Errors
    /// Returns [`StorageError::Io`] on failure.
    pub fn sync(&self) -> StorageResult<()> {
        self.data.sync(self.sync_method)?;
        self.table.sync(self.sync_method)
    }

    fn block_offset(&self, handle: i32) -> u64 {
        u64::from(handle.unsigned_abs()) * u64::from(self.block_size)
    }
}
