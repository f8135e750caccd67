//! In-memory block lock set. Locks are never persisted: a reopened store
//! starts with every block unlocked.

use bitvec::vec::BitVec;

use crate::error::{StorageError, StorageResult};

/// One bit per block.
#[derive(Debug, Default)]
pub struct BlockLocks {
    bits: BitVec,
    locked: usize,
}

impl BlockLocks {
    /// Lock set sized for `block_count` blocks, all unlocked.
    #[must_use]
    pub fn new(block_count: u32) -> Self {
        Self { bits: BitVec::repeat(false, block_count as usize), locked: 0 }
    }

    /// Grow to `block_count` blocks.
    pub fn resize(&mut self, block_count: u32) {
        if block_count as usize > self.bits.len() {
            self.bits.resize(block_count as usize, false);
        }
    }

    /// Lock `handle`.
    ///
    /// # Errors
    /// Returns [`StorageError::AlreadyLocked`] if the lock is held.
    pub fn lock(&mut self, handle: i32) -> StorageResult<()> {
        let index = self.index(handle)?;
        if self.bits[index] {
            return Err(StorageError::AlreadyLocked { handle });
        }
        self.bits.set(index, true);
        self.locked += 1;
        Ok(())
    }

    /// Unlock `handle`.
    ///
    /// # Errors
    /// Returns [`StorageError::NotLocked`] if the lock is not held.
    pub fn unlock(&mut self, handle: i32) -> StorageResult<()> {
        let index = self.index(handle)?;
        if !self.bits[index] {
            return Err(StorageError::NotLocked { handle });
        }
        self.bits.set(index, false);
        self.locked -= 1;
        Ok(())
    }

    /// Clear the lock of `handle` whether or not it is held.
    pub fn clear(&mut self, handle: i32) {
        if let Ok(index) = self.index(handle) {
            if self.bits[index] {
                self.bits.set(index, false);
                self.locked -= 1;
            }
        }
    }

    /// Move the lock state of `from` to `to`.
    pub fn transfer(&mut self, from: i32, to: i32) {
        if from == to || !self.is_locked(from) {
            return;
        }
        self.clear(from);
        if let Ok(index) = self.index(to) {
            self.bits.set(index, true);
            self.locked += 1;
        }
    }

    /// Whether `handle` is locked. Out-of-range handles are never locked.
    #[must_use]
    pub fn is_locked(&self, handle: i32) -> bool {
        self.index(handle).is_ok_and(|i| self.bits[i])
    }

    /// Number of locked blocks.
    #[must_use]
    pub const fn locked_count(&self) -> usize {
        self.locked
    }

    fn index(&self, handle: i32) -> StorageResult<usize> {
        usize::try_from(handle)
            .ok()
            .filter(|&i| i < self.bits.len())
            .ok_or(StorageError::InvalidHandle { handle, reason: "outside of the lock table" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_discipline() {
        let mut locks = BlockLocks::new(4);
        locks.lock(2).unwrap();
        assert!(locks.is_locked(2));
        assert!(matches!(locks.lock(2), Err(StorageError::AlreadyLocked { handle: 2 })));
        locks.unlock(2).unwrap();
        assert!(matches!(locks.unlock(2), Err(StorageError::NotLocked { handle: 2 })));
        assert_eq!(locks.locked_count(), 0);
    }

    #[test]
    fn test_range_and_transfer() {
        let mut locks = BlockLocks::new(2);
        assert!(matches!(locks.lock(5), Err(StorageError::InvalidHandle { .. })));
        locks.resize(8);
        locks.lock(5).unwrap();
        locks.transfer(5, 7);
        assert!(!locks.is_locked(5));
        assert!(locks.is_locked(7));
        assert_eq!(locks.locked_count(), 1);
    }
}
