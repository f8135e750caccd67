//! Write-back cache of block contents whose journal records have not yet
//! been applied to the data file.
//!
//! Reads consult this table before the data file. An entry is evicted only
//! once the flusher has applied the exact record that produced it; a newer
//! write to the same block supersedes the older record and stays cached.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;

#[derive(Debug)]
struct DirtyBlock {
    data: Bytes,
    sequence: u64,
}

/// Map from block handle to its latest unapplied contents.
#[derive(Debug, Default)]
pub struct DirtyBlockTable {
    blocks: Mutex<HashMap<i32, DirtyBlock>>,
}

impl DirtyBlockTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the contents written by journal record `sequence`.
    pub fn put(&self, handle: i32, data: Bytes, sequence: u64) {
        self.blocks.lock().insert(handle, DirtyBlock { data, sequence });
    }

    /// Cached contents of `handle`.
    #[must_use]
    pub fn get(&self, handle: i32) -> Option<Bytes> {
        self.blocks.lock().get(&handle).map(|b| b.data.clone())
    }

    /// Drop `handle` if its cached contents came from record `sequence` or
    /// an older one. Returns whether it was evicted.
    pub fn evict_applied(&self, handle: i32, sequence: u64) -> bool {
        let mut blocks = self.blocks.lock();
        match blocks.get(&handle) {
            Some(block) if block.sequence <= sequence => {
                blocks.remove(&handle);
                true
            },
            _ => false,
        }
    }

    /// Number of cached blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }
}
