//! Allocation table consistency check, run on every open.

use std::collections::HashSet;

use super::allocation::{AllocationTable, NO_BLOCK};
use crate::error::{StorageError, StorageResult};

/// Summary of a successful check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Blocks on the used chain
    pub used_blocks: usize,
    /// Blocks not in use
    pub free_blocks: usize,
    /// Entries on the used chain
    pub entries: usize,
}

/// Walk the used chain and cross-check it against every record.
///
/// Verifies that the chain only visits used blocks, that its back links
/// mirror its forward links, that it has no cycle, that entries are
/// properly delimited by `START` and `END` flags, and that every used block
/// is reachable so used plus free equals the block count.
///
/// # Errors
/// Returns [`StorageError::StoreCorrupted`] describing the first violation.
pub fn check_integrity(name: &str, table: &AllocationTable) -> StorageResult<IntegrityReport> {
    let block_count = table.block_count() as usize;
    let mut visited = HashSet::with_capacity(table.used_count());
    let mut entries = 0usize;
    let mut in_entry = false;
    let mut previous = NO_BLOCK;
    let mut current = table.first_block();

    while current != NO_BLOCK {
        let record = table
            .get(current)
            .ok_or_else(|| StorageError::corrupted(name, format!("chain points outside the table at {current}")))?;
        if !record.is_used() {
            return Err(StorageError::corrupted(name, format!("chain visits free block {current}")));
        }
        if !visited.insert(current) {
            return Err(StorageError::corrupted(name, format!("cycle in used chain at block {current}")));
        }
        if record.previous != previous {
            return Err(StorageError::corrupted(
                name,
                format!("block {current} links back to {} instead of {previous}", record.previous),
            ));
        }

        if record.is_start() {
            if in_entry {
                return Err(StorageError::corrupted(name, format!("entry starting at {current} nests in another")));
            }
            if record.allocated_size < 0 {
                return Err(StorageError::corrupted(name, format!("negative size at block {current}")));
            }
            entries += 1;
            in_entry = true;
        } else if !in_entry {
            return Err(StorageError::corrupted(name, format!("block {current} is outside of any entry")));
        }
        if record.is_end() {
            in_entry = false;
        }

        previous = current;
        current = record.next;
    }

    if in_entry {
        return Err(StorageError::corrupted(name, "last entry has no end block"));
    }
    if previous != table.last_block() {
        return Err(StorageError::corrupted(name, "chain tail does not match the recorded last block"));
    }

    let used_flags = table.records().iter().filter(|r| r.is_used()).count();
    if used_flags != visited.len() {
        return Err(StorageError::corrupted(
            name,
            format!("{} used blocks are not reachable from the chain", used_flags - visited.len().min(used_flags)),
        ));
    }
    let free_blocks = block_count - used_flags;
    if visited.len() + free_blocks != block_count {
        return Err(StorageError::corrupted(name, "used and free blocks do not add up to the block count"));
    }

    Ok(IntegrityReport { used_blocks: visited.len(), free_blocks, entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::allocation::{AtRecord, BlockFlags, AT_HEADER_SIZE, AT_RECORD_SIZE};

    fn populated() -> AllocationTable {
        let mut table = AllocationTable::new(16, 8);
        for len in [4, 40, 1] {
            let blocks = table.allocate("t", 8, table.blocks_needed(len)).unwrap();
            table.append_entry(&blocks, len);
        }
        table
    }

    fn patch(table: &AllocationTable, handle: i32, record: AtRecord) -> AllocationTable {
        let mut raw = table.encode_all();
        let offset = (AT_HEADER_SIZE + handle as u64 * AT_RECORD_SIZE) as usize;
        raw[offset] = record.flags.bits();
        raw[offset + 1..offset + 5].copy_from_slice(&record.allocated_size.to_be_bytes());
        raw[offset + 5..offset + 9].copy_from_slice(&record.previous.to_be_bytes());
        raw[offset + 9..offset + 13].copy_from_slice(&record.next.to_be_bytes());
        AllocationTable::decode("t", &raw, 16).unwrap()
    }

    #[test]
    fn test_consistent_table_passes() {
        let report = check_integrity("t", &populated()).unwrap();
        assert_eq!(report, IntegrityReport { used_blocks: 5, free_blocks: 3, entries: 3 });
    }

    #[test]
    fn test_orphan_used_block_fails() {
        let table = populated();
        let orphan = AtRecord { flags: BlockFlags::all(), allocated_size: 1, previous: NO_BLOCK, next: NO_BLOCK };
        let err = check_integrity("t", &patch(&table, 7, orphan)).unwrap_err();
        assert!(matches!(err, StorageError::StoreCorrupted { .. }));
    }

    #[test]
    fn test_broken_back_link_fails() {
        let table = populated();
        let mut record = *table.get(1).unwrap();
        record.previous = 5;
        assert!(check_integrity("t", &patch(&table, 1, record)).is_err());
    }
}
