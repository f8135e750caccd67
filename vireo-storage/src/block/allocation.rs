//! Allocation table: per-block metadata mirrored in memory.
//!
//! On disk the table is a 12-byte header followed by one fixed-size record
//! per block:
//!
//! ```text
//! header: [block_count: i32][block_size: i32][first_block: i32]
//! record: [flags: u8][allocated_size: i32][previous: i32][next: i32]
//! ```
//!
//! Every used block belongs to one global doubly linked chain. An entry is a
//! contiguous run of that chain from a `START` block to an `END` block; a
//! single-block entry carries both flags. `allocated_size` is stored on the
//! `START` block and holds the payload length of the whole entry.
//!
//! The table never touches files itself. Mutations mark records dirty and
//! [`AllocationTable::take_metadata_writes`] turns them into byte-exact
//! writes for the active sink.

use std::collections::BTreeSet;

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

use crate::error::{StorageError, StorageResult};

/// Size of the allocation table header in bytes.
pub const AT_HEADER_SIZE: u64 = 12;
/// Size of one allocation table record in bytes.
pub const AT_RECORD_SIZE: u64 = 13;
/// Link value meaning "no block".
pub const NO_BLOCK: i32 = -1;

/// Byte offset of the `block_count` header field.
pub const HEADER_BLOCK_COUNT_OFFSET: u64 = 0;
/// Byte offset of the `block_size` header field.
pub const HEADER_BLOCK_SIZE_OFFSET: u64 = 4;
/// Byte offset of the `first_block` header field.
pub const HEADER_FIRST_BLOCK_OFFSET: u64 = 8;

bitflags! {
    /// Allocation state of a block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u8 {
        /// Block belongs to an entry
        const USED = 0x01;
        /// First block of an entry
        const START = 0x02;
        /// Last block of an entry
        const END = 0x04;
    }
}

/// One allocation table record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtRecord {
    /// Allocation flags
    pub flags: BlockFlags,
    /// Payload length of the entry, meaningful on `START` blocks
    pub allocated_size: i32,
    /// Previous block in the global chain
    pub previous: i32,
    /// Next block in the global chain
    pub next: i32,
}

impl AtRecord {
    /// Record of an unallocated block.
    pub const FREE: Self =
        Self { flags: BlockFlags::empty(), allocated_size: 0, previous: NO_BLOCK, next: NO_BLOCK };

    /// Whether the block is in use.
    #[must_use]
    pub const fn is_used(&self) -> bool {
        self.flags.contains(BlockFlags::USED)
    }

    /// Whether the block starts an entry.
    #[must_use]
    pub const fn is_start(&self) -> bool {
        self.flags.contains(BlockFlags::USED.union(BlockFlags::START))
    }

    /// Whether the block ends an entry.
    #[must_use]
    pub const fn is_end(&self) -> bool {
        self.flags.contains(BlockFlags::END)
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.flags.bits());
        buf.put_i32(self.allocated_size);
        buf.put_i32(self.previous);
        buf.put_i32(self.next);
    }

    fn decode(mut raw: &[u8]) -> Self {
        Self {
            flags: BlockFlags::from_bits_truncate(raw.get_u8()),
            allocated_size: raw.get_i32(),
            previous: raw.get_i32(),
            next: raw.get_i32(),
        }
    }
}

/// Byte-exact update of the allocation table file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataWrite {
    /// One header integer
    Int {
        /// File offset
        offset: u64,
        /// New value
        value: i32,
    },
    /// One or more contiguous records
    Block {
        /// File offset
        offset: u64,
        /// Encoded bytes
        bytes: Vec<u8>,
    },
}

/// File offset of the record of `handle`.
#[must_use]
pub const fn record_offset(handle: i32) -> u64 {
    AT_HEADER_SIZE + handle as u64 * AT_RECORD_SIZE
}

/// Expected allocation table file length for `block_count` blocks.
#[must_use]
pub const fn table_file_len(block_count: u32) -> u64 {
    AT_HEADER_SIZE + block_count as u64 * AT_RECORD_SIZE
}

/// In-memory allocation table.
#[derive(Debug, Clone)]
pub struct AllocationTable {
    block_size: u32,
    records: Vec<AtRecord>,
    first_block: i32,
    last_block: i32,
    free: BTreeSet<i32>,
    entry_count: usize,
    dirty_records: BTreeSet<i32>,
    dirty_block_count: bool,
    dirty_first_block: bool,
}

impl AllocationTable {
    /// Create an empty table. Every header field and record is dirty.
    #[must_use]
    pub fn new(block_size: u32, block_count: u32) -> Self {
        let count = block_count as i32;
        Self {
            block_size,
            records: vec![AtRecord::FREE; block_count as usize],
            first_block: NO_BLOCK,
            last_block: NO_BLOCK,
            free: (0..count).collect(),
            entry_count: 0,
            dirty_records: (0..count).collect(),
            dirty_block_count: true,
            dirty_first_block: true,
        }
    }

    /// Rebuild the table from the raw allocation table file.
    ///
    /// When the header block count disagrees with the number of records the
    /// file actually holds, the smaller of the two is adopted and the header
    /// is marked dirty so it gets rewritten.
    ///
    /// # Errors
    /// Returns [`StorageError::StoreCorrupted`] if the header is missing, the
    /// block size differs from `expected_block_size`, or the used chain
    /// cannot be walked.
    pub fn decode(name: &str, raw: &[u8], expected_block_size: u32) -> StorageResult<Self> {
        if (raw.len() as u64) < AT_HEADER_SIZE {
            return Err(StorageError::corrupted(name, "allocation table header truncated"));
        }
        let mut header = &raw[..AT_HEADER_SIZE as usize];
        let header_count = header.get_i32();
        let block_size = header.get_i32();
        let first_block = header.get_i32();

        if block_size != expected_block_size as i32 {
            return Err(StorageError::corrupted(
                name,
                format!("block size {block_size} does not match descriptor {expected_block_size}"),
            ));
        }

        let available = ((raw.len() as u64 - AT_HEADER_SIZE) / AT_RECORD_SIZE) as usize;
        let block_count = usize::try_from(header_count).unwrap_or(0).min(available);
        let dirty_block_count = block_count as i64 != i64::from(header_count);
        if dirty_block_count {
            tracing::warn!(
                store = name,
                header_count,
                recovered_count = block_count,
                "Adopting recovered block count"
            );
        }

        let body = &raw[AT_HEADER_SIZE as usize..];
        let records: Vec<AtRecord> = body
            .chunks_exact(AT_RECORD_SIZE as usize)
            .take(block_count)
            .map(AtRecord::decode)
            .collect();

        let free = records
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_used())
            .map(|(i, _)| i as i32)
            .collect();

        let mut table = Self {
            block_size: expected_block_size,
            records,
            first_block,
            last_block: NO_BLOCK,
            free,
            entry_count: 0,
            dirty_records: BTreeSet::new(),
            dirty_block_count,
            dirty_first_block: false,
        };
        table.rebuild_chain_summary(name)?;
        Ok(table)
    }

    fn rebuild_chain_summary(&mut self, name: &str) -> StorageResult<()> {
        let mut last = NO_BLOCK;
        let mut entries = 0usize;
        let mut current = self.first_block;
        let mut steps = 0usize;
        while current != NO_BLOCK {
            let record = self
                .get(current)
                .ok_or_else(|| StorageError::corrupted(name, format!("chain points at missing block {current}")))?;
            if record.is_start() {
                entries += 1;
            }
            last = current;
            current = record.next;
            steps += 1;
            if steps > self.records.len() {
                return Err(StorageError::corrupted(name, "cycle in used block chain"));
            }
        }
        self.last_block = last;
        self.entry_count = entries;
        Ok(())
    }

    /// Block size in bytes.
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Total number of blocks.
    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.records.len() as u32
    }

    /// Number of free blocks.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of used blocks.
    #[must_use]
    pub fn used_count(&self) -> usize {
        self.records.len() - self.free.len()
    }

    /// Number of live entries.
    #[must_use]
    pub const fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Head of the used chain.
    #[must_use]
    pub const fn first_block(&self) -> i32 {
        self.first_block
    }

    /// Tail of the used chain.
    #[must_use]
    pub const fn last_block(&self) -> i32 {
        self.last_block
    }

    /// Record of `handle`, `None` when out of range.
    #[must_use]
    pub fn get(&self, handle: i32) -> Option<&AtRecord> {
        usize::try_from(handle).ok().and_then(|i| self.records.get(i))
    }

    /// All records in handle order.
    #[must_use]
    pub fn records(&self) -> &[AtRecord] {
        &self.records
    }

    /// Number of blocks needed for a payload of `len` bytes.
    #[must_use]
    pub fn blocks_needed(&self, len: usize) -> usize {
        len.div_ceil(self.block_size as usize).max(1)
    }

    /// Grow the table to `new_count` blocks. New blocks are free.
    pub fn extend(&mut self, new_count: u32) {
        let old = self.records.len() as i32;
        let new = new_count as i32;
        if new <= old {
            return;
        }
        self.records.resize(new_count as usize, AtRecord::FREE);
        self.free.extend(old..new);
        self.dirty_records.extend(old..new);
        self.dirty_block_count = true;
    }

    /// Take `n` free blocks, lowest handles first.
    ///
    /// # Errors
    /// Returns [`StorageError::StoreFull`] when fewer than `n` blocks are free.
    pub fn allocate(&mut self, name: &str, max_block_count: u32, n: usize) -> StorageResult<Vec<i32>> {
        if self.free.len() < n {
            return Err(StorageError::StoreFull {
                name: name.to_owned(),
                block_count: self.block_count(),
                max_block_count,
                requested: n - self.free.len(),
            });
        }
        let mut blocks = Vec::with_capacity(n);
        for _ in 0..n {
            if let Some(handle) = self.free.pop_first() {
                blocks.push(handle);
            }
        }
        Ok(blocks)
    }

    /// Give back blocks taken by [`allocate`](Self::allocate) that were never
    /// linked into an entry.
    pub fn return_unlinked(&mut self, blocks: &[i32]) {
        for &handle in blocks {
            if self.get(handle).is_some_and(|r| !r.is_used()) {
                self.free.insert(handle);
            }
        }
    }

    /// Take the specific free `blocks` back out of the free set.
    pub fn reclaim(&mut self, blocks: &[i32]) {
        for handle in blocks {
            self.free.remove(handle);
        }
    }

    /// Mark the targets of `writes` dirty again after the sink rejected them.
    pub fn requeue(&mut self, writes: &[MetadataWrite]) {
        for write in writes {
            match write {
                MetadataWrite::Int { offset: HEADER_FIRST_BLOCK_OFFSET, .. } => self.dirty_first_block = true,
                MetadataWrite::Int { .. } => self.dirty_block_count = true,
                MetadataWrite::Block { offset, bytes } => {
                    let first = (offset - AT_HEADER_SIZE) / AT_RECORD_SIZE;
                    let count = bytes.len() as u64 / AT_RECORD_SIZE;
                    self.dirty_records.extend((first..first + count).map(|h| h as i32));
                },
            }
        }
    }

    /// Link freshly allocated `blocks` as a new entry at the tail of the chain.
    pub fn append_entry(&mut self, blocks: &[i32], payload_len: usize) {
        let tail = self.last_block;
        self.write_entry_records(blocks, payload_len, tail, NO_BLOCK);
        match self.first_block {
            NO_BLOCK => self.set_first_block(blocks[0]),
            _ => self.set_link(tail, None, Some(blocks[0])),
        }
        self.last_block = *blocks.last().unwrap_or(&tail);
        self.entry_count += 1;
    }

    /// Replace the entry starting at `start` with `blocks` at the same
    /// position in the chain. Returns the blocks of the old entry, now free.
    ///
    /// # Errors
    /// Propagates chain walking errors.
    pub fn splice_entry(
        &mut self,
        name: &str,
        start: i32,
        blocks: &[i32],
        payload_len: usize,
    ) -> StorageResult<Vec<i32>> {
        let old = self.entry_blocks(name, start)?;
        let before = self.records[start as usize].previous;
        let old_end = *old.last().unwrap_or(&start);
        let after = self.records[old_end as usize].next;

        self.release_blocks(&old);
        self.write_entry_records(blocks, payload_len, before, after);
        let new_end = *blocks.last().unwrap_or(&blocks[0]);
        self.relink(before, blocks[0], new_end, after);
        Ok(old)
    }

    /// Update the payload length of the entry starting at `start`.
    pub fn set_allocated_size(&mut self, start: i32, payload_len: usize) {
        self.records[start as usize].allocated_size = payload_len as i32;
        self.dirty_records.insert(start);
    }

    /// Unlink and free the entry starting at `start`. Returns its blocks and
    /// the start of the preceding entry (or [`NO_BLOCK`]).
    ///
    /// # Errors
    /// Propagates chain walking errors.
    pub fn remove_entry(&mut self, name: &str, start: i32) -> StorageResult<(Vec<i32>, i32)> {
        let blocks = self.entry_blocks(name, start)?;
        let before = self.records[start as usize].previous;
        let end = *blocks.last().unwrap_or(&start);
        let after = self.records[end as usize].next;
        let previous_entry = self.entry_start_of(name, before)?;

        self.release_blocks(&blocks);
        match (before, after) {
            (NO_BLOCK, NO_BLOCK) => {
                self.set_first_block(NO_BLOCK);
                self.last_block = NO_BLOCK;
            },
            (NO_BLOCK, next) => {
                self.set_first_block(next);
                self.set_link(next, Some(NO_BLOCK), None);
            },
            (prev, NO_BLOCK) => {
                self.set_link(prev, None, Some(NO_BLOCK));
                self.last_block = prev;
            },
            (prev, next) => {
                self.set_link(prev, None, Some(next));
                self.set_link(next, Some(prev), None);
            },
        }
        self.entry_count -= 1;
        Ok((blocks, previous_entry))
    }

    /// Blocks of the entry starting at `start`, in chain order.
    ///
    /// # Errors
    /// Returns [`StorageError::StoreCorrupted`] if the walk leaves the table,
    /// hits an unused block, or does not reach an `END` block.
    pub fn entry_blocks(&self, name: &str, start: i32) -> StorageResult<Vec<i32>> {
        let mut blocks = Vec::new();
        let mut current = start;
        loop {
            let record = self
                .get(current)
                .filter(|r| r.is_used())
                .ok_or_else(|| StorageError::corrupted(name, format!("entry {start} reaches unused block {current}")))?;
            blocks.push(current);
            if record.is_end() {
                return Ok(blocks);
            }
            if blocks.len() > self.records.len() {
                return Err(StorageError::corrupted(name, format!("entry {start} never ends")));
            }
            current = record.next;
        }
    }

    /// Walk back from `block` to the start of the entry it belongs to.
    ///
    /// # Errors
    /// Returns [`StorageError::StoreCorrupted`] if no `START` block is found.
    pub fn entry_start_of(&self, name: &str, block: i32) -> StorageResult<i32> {
        let mut current = block;
        let mut steps = 0usize;
        while current != NO_BLOCK {
            let record = self
                .get(current)
                .ok_or_else(|| StorageError::corrupted(name, format!("chain points at missing block {current}")))?;
            if record.is_start() {
                return Ok(current);
            }
            current = record.previous;
            steps += 1;
            if steps > self.records.len() {
                return Err(StorageError::corrupted(name, "cycle in used block chain"));
            }
        }
        Ok(NO_BLOCK)
    }

    /// Start of the entry following the one at `start`.
    ///
    /// # Errors
    /// Propagates chain walking errors.
    pub fn next_entry(&self, name: &str, start: i32) -> StorageResult<i32> {
        let blocks = self.entry_blocks(name, start)?;
        let end = *blocks.last().unwrap_or(&start);
        Ok(self.records[end as usize].next)
    }

    /// Start of the entry preceding the one at `start`.
    ///
    /// # Errors
    /// Propagates chain walking errors.
    pub fn previous_entry(&self, name: &str, start: i32) -> StorageResult<i32> {
        match self.get(start) {
            Some(record) => self.entry_start_of(name, record.previous),
            None => Ok(NO_BLOCK),
        }
    }

    /// Start of the last entry.
    ///
    /// # Errors
    /// Propagates chain walking errors.
    pub fn last_entry(&self, name: &str) -> StorageResult<i32> {
        self.entry_start_of(name, self.last_block)
    }

    /// Drain pending changes as file writes: header fields first, then
    /// records coalesced into contiguous runs.
    pub fn take_metadata_writes(&mut self) -> Vec<MetadataWrite> {
        let mut writes = Vec::new();
        if self.dirty_block_count {
            writes.push(MetadataWrite::Int { offset: HEADER_BLOCK_COUNT_OFFSET, value: self.block_count() as i32 });
            writes.push(MetadataWrite::Int { offset: HEADER_BLOCK_SIZE_OFFSET, value: self.block_size as i32 });
            self.dirty_block_count = false;
        }
        if self.dirty_first_block {
            writes.push(MetadataWrite::Int { offset: HEADER_FIRST_BLOCK_OFFSET, value: self.first_block });
            self.dirty_first_block = false;
        }

        let dirty = std::mem::take(&mut self.dirty_records);
        let mut run_start = NO_BLOCK;
        let mut run = BytesMut::new();
        let mut expected_next = NO_BLOCK;
        for handle in dirty {
            if handle != expected_next && !run.is_empty() {
                writes.push(MetadataWrite::Block { offset: record_offset(run_start), bytes: run.split().to_vec() });
            }
            if run.is_empty() {
                run_start = handle;
            }
            self.records[handle as usize].encode(&mut run);
            expected_next = handle + 1;
        }
        if !run.is_empty() {
            writes.push(MetadataWrite::Block { offset: record_offset(run_start), bytes: run.to_vec() });
        }
        writes
    }

    /// Encode the whole table as it should appear on disk.
    #[must_use]
    pub fn encode_all(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(table_file_len(self.block_count()) as usize);
        buf.put_i32(self.block_count() as i32);
        buf.put_i32(self.block_size as i32);
        buf.put_i32(self.first_block);
        for record in &self.records {
            record.encode(&mut buf);
        }
        buf.to_vec()
    }

    fn write_entry_records(&mut self, blocks: &[i32], payload_len: usize, before: i32, after: i32) {
        let n = blocks.len();
        for (i, &handle) in blocks.iter().enumerate() {
            let mut flags = BlockFlags::USED;
            if i == 0 {
                flags |= BlockFlags::START;
            }
            if i == n - 1 {
                flags |= BlockFlags::END;
            }
            self.records[handle as usize] = AtRecord {
                flags,
                allocated_size: if i == 0 { payload_len as i32 } else { 0 },
                previous: if i == 0 { before } else { blocks[i - 1] },
                next: if i == n - 1 { after } else { blocks[i + 1] },
            };
            self.dirty_records.insert(handle);
        }
    }

    fn relink(&mut self, before: i32, start: i32, end: i32, after: i32) {
        if before == NO_BLOCK {
            self.set_first_block(start);
        } else {
            self.set_link(before, None, Some(start));
        }
        if after == NO_BLOCK {
            self.last_block = end;
        } else {
            self.set_link(after, Some(end), None);
        }
    }

    fn release_blocks(&mut self, blocks: &[i32]) {
        for &handle in blocks {
            self.records[handle as usize] = AtRecord::FREE;
            self.dirty_records.insert(handle);
            self.free.insert(handle);
        }
    }

    fn set_link(&mut self, handle: i32, previous: Option<i32>, next: Option<i32>) {
        let record = &mut self.records[handle as usize];
        if let Some(previous) = previous {
            record.previous = previous;
        }
        if let Some(next) = next {
            record.next = next;
        }
        self.dirty_records.insert(handle);
    }

    fn set_first_block(&mut self, handle: i32) {
        self.first_block = handle;
        self.dirty_first_block = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn chain(table: &AllocationTable) -> Vec<i32> {
        let mut out = Vec::new();
        let mut current = table.first_block();
        while current != NO_BLOCK {
            out.push(current);
            current = table.get(current).unwrap().next;
        }
        out
    }

    fn store(table: &mut AllocationTable, len: usize) -> i32 {
        let n = table.blocks_needed(len);
        let blocks = table.allocate("t", 1000, n).unwrap();
        table.append_entry(&blocks, len);
        blocks[0]
    }

    #[test]
    fn test_append_and_walk() {
        let mut table = AllocationTable::new(16, 8);
        let a = store(&mut table, 10);
        let b = store(&mut table, 40);
        assert_eq!(table.entry_count(), 2);
        assert_eq!(table.entry_blocks("t", b).unwrap(), vec![1, 2, 3]);
        assert_eq!(table.next_entry("t", a).unwrap(), b);
        assert_eq!(table.previous_entry("t", b).unwrap(), a);
        assert_eq!(table.last_entry("t").unwrap(), b);
        assert_eq!(chain(&table), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_remove_middle_entry() {
        let mut table = AllocationTable::new(16, 8);
        let a = store(&mut table, 1);
        let b = store(&mut table, 20);
        let c = store(&mut table, 1);

        let (freed, previous) = table.remove_entry("t", b).unwrap();
        assert_eq!(freed, vec![1, 2]);
        assert_eq!(previous, a);
        assert_eq!(table.next_entry("t", a).unwrap(), c);
        assert_eq!(table.previous_entry("t", c).unwrap(), a);
        assert_eq!(table.free_count(), 6);
    }

    #[test]
    fn test_splice_keeps_position() {
        let mut table = AllocationTable::new(16, 8);
        let a = store(&mut table, 1);
        let b = store(&mut table, 1);
        let c = store(&mut table, 1);

        let blocks = table.allocate("t", 1000, 2).unwrap();
        let old = table.splice_entry("t", b, &blocks, 30).unwrap();
        assert_eq!(old, vec![b]);
        assert_eq!(table.next_entry("t", a).unwrap(), blocks[0]);
        assert_eq!(table.next_entry("t", blocks[0]).unwrap(), c);
        assert_eq!(table.get(blocks[0]).unwrap().allocated_size, 30);
    }

    #[test]
    fn test_encode_decode() {
        let mut table = AllocationTable::new(32, 4);
        store(&mut table, 50);
        store(&mut table, 3);
        let raw = table.encode_all();
        assert_eq!(raw.len() as u64, table_file_len(4));

        let decoded = AllocationTable::decode("t", &raw, 32).unwrap();
        assert_eq!(decoded.records(), table.records());
        assert_eq!(decoded.entry_count(), 2);
        assert_eq!(decoded.last_block(), table.last_block());
        assert!(AllocationTable::decode("t", &raw, 64).is_err());
    }

    #[test]
    fn test_decode_adopts_recovered_count() {
        let table = AllocationTable::new(32, 4);
        let mut raw = table.encode_all();
        raw.truncate(table_file_len(3) as usize);
        let mut decoded = AllocationTable::decode("t", &raw, 32).unwrap();
        assert_eq!(decoded.block_count(), 3);
        let writes = decoded.take_metadata_writes();
        assert!(writes.contains(&MetadataWrite::Int { offset: HEADER_BLOCK_COUNT_OFFSET, value: 3 }));
    }

    #[test]
    fn test_metadata_writes_coalesce() {
        let mut table = AllocationTable::new(16, 4);
        let writes = table.take_metadata_writes();
        let blocks: Vec<_> = writes.iter().filter(|w| matches!(w, MetadataWrite::Block { .. })).collect();
        assert_eq!(blocks.len(), 1);
        assert!(table.take_metadata_writes().is_empty());
    }

    proptest! {
        #[test]
        fn test_used_set_tracks_allocations(ops in proptest::collection::vec((any::<bool>(), 0usize..40), 1..60)) {
            let mut table = AllocationTable::new(16, 64);
            let mut live: Vec<(i32, Vec<i32>)> = Vec::new();
            for (alloc, size) in ops {
                if alloc || live.is_empty() {
                    let n = table.blocks_needed(size);
                    if table.free_count() < n {
                        continue;
                    }
                    let blocks = table.allocate("t", 64, n).unwrap();
                    table.append_entry(&blocks, size);
                    live.push((blocks[0], blocks));
                } else {
                    let (start, blocks) = live.remove(size % live.len());
                    let (freed, _) = table.remove_entry("t", start).unwrap();
                    prop_assert_eq!(freed, blocks);
                }
            }

            let expected: BTreeSet<i32> = live.iter().flat_map(|(_, b)| b.iter().copied()).collect();
            let used: BTreeSet<i32> = table
                .records()
                .iter()
                .enumerate()
                .filter(|(_, r)| r.is_used())
                .map(|(i, _)| i as i32)
                .collect();
            prop_assert_eq!(&used, &expected);
            prop_assert_eq!(chain(&table).into_iter().collect::<BTreeSet<_>>(), expected);
            prop_assert_eq!(table.entry_count(), live.len());
            prop_assert_eq!(table.used_count() + table.free_count(), 64);
        }
    }
}
